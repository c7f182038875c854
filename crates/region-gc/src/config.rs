//! Collector configuration.

use std::num::NonZeroUsize;

use crate::error::GcError;
use crate::oop::WORD_SIZE;

/// Capacity (in slots) of each marking task queue.
pub const MARK_QUEUE_SIZE: usize = 1 << 14;

/// Spin/yield/sleep schedule used while a worker waits in termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationConfig {
    /// Upper bound on busy-wait iterations before a yield.
    pub hard_spin_limit: u32,
    /// Spin limit starts at `hard_spin_limit >> hard_spin_ratio` and doubles.
    pub hard_spin_ratio: u32,
    /// Yields before the worker starts sleeping.
    pub yields_before_sleep: u32,
    /// Sleep duration in milliseconds once yields are exhausted.
    pub sleep_millis: u64,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            hard_spin_limit: 4096,
            hard_spin_ratio: 10,
            yields_before_sleep: 5000,
            sleep_millis: 1,
        }
    }
}

/// Configuration for a [`GcEngine`](crate::GcEngine).
///
/// Build with [`GcConfig::default`] and adjust with the setters; the engine
/// validates the result when it is created.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Bytes committed at startup.
    pub initial_heap_bytes: usize,
    /// Bytes reserved; the heap never grows beyond this.
    pub max_heap_bytes: usize,
    /// Region size in bytes, a power of two.
    pub region_bytes: usize,
    /// Number of concurrent marking workers.
    pub parallel_workers: usize,
    /// Elements of a reference array scanned per slice.
    pub obj_array_stride: usize,
    /// Card size in bytes for liveness accounting, a power of two.
    pub card_bytes: usize,
    /// Total overflow-stack entries allowed before marking restarts.
    pub mark_stack_limit: usize,
    /// Termination protocol tuning.
    pub termination: TerminationConfig,
    /// Consult a task's local finger before the global one.
    pub use_local_finger: bool,
    /// Cross-check marking against a single-threaded trace at remark.
    pub verify_marking: bool,
    /// Shrink the heap after a full compaction when more than this
    /// percentage of committed capacity is free.
    pub max_free_ratio: u8,
}

impl Default for GcConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        Self {
            initial_heap_bytes: 8 << 20,
            max_heap_bytes: 64 << 20,
            region_bytes: 1 << 20,
            parallel_workers: workers.min(4),
            obj_array_stride: 2048,
            card_bytes: 512,
            mark_stack_limit: 4 << 20,
            termination: TerminationConfig::default(),
            use_local_finger: true,
            verify_marking: false,
            max_free_ratio: 70,
        }
    }
}

impl GcConfig {
    /// Set the initial and maximum heap size.
    #[must_use]
    pub const fn with_heap_bytes(mut self, initial: usize, max: usize) -> Self {
        self.initial_heap_bytes = initial;
        self.max_heap_bytes = max;
        self
    }

    /// Set the region size.
    #[must_use]
    pub const fn with_region_bytes(mut self, bytes: usize) -> Self {
        self.region_bytes = bytes;
        self
    }

    /// Set the number of marking workers (at least one).
    #[must_use]
    pub const fn with_parallel_workers(mut self, workers: usize) -> Self {
        self.parallel_workers = if workers < 1 { 1 } else { workers };
        self
    }

    /// Set the array slicing stride.
    #[must_use]
    pub const fn with_obj_array_stride(mut self, stride: usize) -> Self {
        self.obj_array_stride = stride;
        self
    }

    /// Set the card size.
    #[must_use]
    pub const fn with_card_bytes(mut self, bytes: usize) -> Self {
        self.card_bytes = bytes;
        self
    }

    /// Set the overflow budget that triggers a marking restart.
    #[must_use]
    pub const fn with_mark_stack_limit(mut self, limit: usize) -> Self {
        self.mark_stack_limit = limit;
        self
    }

    /// Set the termination schedule.
    #[must_use]
    pub const fn with_termination(mut self, termination: TerminationConfig) -> Self {
        self.termination = termination;
        self
    }

    /// Enable or disable the local-finger fast path.
    #[must_use]
    pub const fn with_local_finger(mut self, enabled: bool) -> Self {
        self.use_local_finger = enabled;
        self
    }

    /// Enable or disable marking verification at remark.
    #[must_use]
    pub const fn with_verify_marking(mut self, enabled: bool) -> Self {
        self.verify_marking = enabled;
        self
    }

    /// Set the free-capacity percentage above which the heap shrinks.
    #[must_use]
    pub const fn with_max_free_ratio(mut self, percent: u8) -> Self {
        self.max_free_ratio = percent;
        self
    }

    /// Region size in heap words.
    #[must_use]
    pub const fn region_words(&self) -> usize {
        self.region_bytes / WORD_SIZE
    }

    /// Number of regions the reservation holds.
    #[must_use]
    pub const fn max_regions(&self) -> usize {
        self.max_heap_bytes.div_ceil(self.region_bytes)
    }

    /// Number of regions committed at startup.
    #[must_use]
    pub const fn initial_regions(&self) -> usize {
        self.initial_heap_bytes.div_ceil(self.region_bytes)
    }

    /// Check the configuration for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<(), GcError> {
        let page = sys_alloc::page_size();
        if !self.region_bytes.is_power_of_two() || self.region_bytes < page {
            return Err(GcError::InvalidConfig(format!(
                "region_bytes {} must be a power of two of at least the page size {page}",
                self.region_bytes
            )));
        }
        if self.max_heap_bytes == 0 || self.max_heap_bytes < self.region_bytes {
            return Err(GcError::InvalidConfig(format!(
                "max_heap_bytes {} must hold at least one region",
                self.max_heap_bytes
            )));
        }
        if u32::try_from(self.max_regions()).is_err() {
            return Err(GcError::InvalidConfig("too many regions".to_owned()));
        }
        if self.initial_heap_bytes > self.max_heap_bytes {
            return Err(GcError::InvalidConfig(format!(
                "initial_heap_bytes {} exceeds max_heap_bytes {}",
                self.initial_heap_bytes, self.max_heap_bytes
            )));
        }
        if self.parallel_workers == 0 {
            return Err(GcError::InvalidConfig(
                "parallel_workers must be at least 1".to_owned(),
            ));
        }
        if self.obj_array_stride == 0 {
            return Err(GcError::InvalidConfig(
                "obj_array_stride must be positive".to_owned(),
            ));
        }
        if !self.card_bytes.is_power_of_two() || self.card_bytes < WORD_SIZE {
            return Err(GcError::InvalidConfig(format!(
                "card_bytes {} must be a power of two of at least one word",
                self.card_bytes
            )));
        }
        if self.mark_stack_limit == 0 {
            return Err(GcError::InvalidConfig(
                "mark_stack_limit must be positive".to_owned(),
            ));
        }
        if self.max_free_ratio > 100 {
            return Err(GcError::InvalidConfig(format!(
                "max_free_ratio {} is not a percentage",
                self.max_free_ratio
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = GcConfig::default();
        config.validate().unwrap();
        assert!(config.parallel_workers >= 1 && config.parallel_workers <= 4);
        assert_eq!(config.max_regions(), 64);
        assert_eq!(config.initial_regions(), 8);
    }

    #[test]
    fn test_rejects_bad_region_size() {
        let config = GcConfig::default().with_region_bytes(3 << 20);
        assert!(matches!(config.validate(), Err(GcError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_initial_above_max() {
        let config = GcConfig::default().with_heap_bytes(16 << 20, 8 << 20);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_workers_clamped_to_one() {
        let config = GcConfig::default().with_parallel_workers(0);
        assert_eq!(config.parallel_workers, 1);
    }

    #[test]
    fn test_rejects_bad_card_size() {
        assert!(GcConfig::default().with_card_bytes(100).validate().is_err());
        assert!(GcConfig::default().with_card_bytes(4).validate().is_err());
    }
}
