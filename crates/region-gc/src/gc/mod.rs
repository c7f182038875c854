//! Collector internals.
//!
//! - [`marker`] and [`mark_task`]: concurrent, work-stealing marking
//! - [`worklist`] and [`terminator`]: task queues and the termination protocol
//! - [`compact`]: the serial four-phase full compaction
//! - [`satb`] and [`safepoint`]: barrier buffers and mutator/pause exclusion

pub mod compact;
pub mod mark;
pub mod mark_task;
pub mod marker;
pub mod safepoint;
pub mod satb;
pub mod terminator;
pub mod worklist;

pub use compact::{
    shrink_to_free_ratio, CompactAll, CompactionPolicy, CompactionSummary, LiveThresholdPolicy,
    MarkSweepCompactor,
};
pub use mark_task::{StepOutcome, TaskStats};
pub use marker::{CleanupSummary, CmTaskQueue, CmTaskQueueSet, ConcurrentMark, RegionClaim};
pub use safepoint::{MutatorGuard, Safepoint, SafepointGuard};
pub use satb::SatbMarkQueueSet;
pub use terminator::{ParallelTaskTerminator, TerminatorTerminator};
pub use worklist::{
    GenericTaskQueue, MarkTaskEntry, OverflowTaskQueue, PeekableQueues, StealableQueue,
    TaskElement, TaskQueueSet,
};
