//! A region-based garbage collection engine.
//!
//! `region-gc` manages a heap of synthetic, self-describing objects split
//! into fixed-size regions. It provides two collectors:
//!
//! - **Concurrent marking**: a snapshot-at-the-beginning tracer whose
//!   workers claim regions with a shared finger, balance load by work
//!   stealing, and record per-region and per-card liveness. Completed cycles
//!   free regions and humongous objects with no live data.
//! - **Full compaction**: a stop-the-world four-phase mark-sweep-compact
//!   that slides live objects down and rewrites every reference.
//!
//! # Quick Start
//!
//! ```
//! use region_gc::{GcConfig, GcEngine, ObjectShape, RootKind};
//!
//! let config = GcConfig::default()
//!     .with_region_bytes(64 * 1024)
//!     .with_heap_bytes(256 * 1024, 4 << 20);
//! let engine = GcEngine::create(config).unwrap();
//!
//! // A two-element list held by one root.
//! let node = ObjectShape::Instance { refs: 1, prims: 1 };
//! let head = engine.allocate(node).unwrap();
//! let root = engine.roots().add(RootKind::ThreadStack, Some(head));
//! let tail = engine.allocate(node).unwrap();
//! let head = engine.roots().get(root).unwrap();
//! engine.write_ref(head, 0, Some(tail));
//!
//! engine.start_marking_cycle().unwrap();
//! engine.wait_for_marking();
//! assert!(engine.is_marked_in_last_cycle(tail));
//! ```
//!
//! # Object model
//!
//! Every object starts with a mark word and a klass word describing its
//! [`ObjectShape`]. Instances carry reference words then primitive words;
//! arrays carry a length word then their elements. Objects larger than
//! half a region are humongous and get dedicated regions.
//!
//! # Threads
//!
//! [`GcEngine`] is `Send + Sync`. Mutator operations may run from any
//! number of threads; each one briefly holds a shared safepoint guard that
//! pauses exclude.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

#[cfg(not(target_pointer_width = "64"))]
compile_error!("region-gc requires a 64-bit target");

pub mod config;
mod engine;
pub mod error;
pub mod gc;
pub mod heap;
pub mod metrics;
pub mod oop;
pub mod roots;
mod telemetry;
pub mod verify;

pub use config::{GcConfig, TerminationConfig};
pub use engine::GcEngine;
pub use error::GcError;
pub use gc::{CompactAll, CompactionPolicy, LiveThresholdPolicy, MarkTaskEntry};
pub use metrics::{FullGcMetrics, GlobalMetrics, MarkMetrics, MarkOutcome};
pub use oop::{Address, ObjectShape};
pub use roots::{
    OopClosure, RootClosures, RootEnumerator, RootHandle, RootKind, RootParity, RootSet,
    SoftRefPolicy,
};
pub use telemetry::{next_gc_id, GcId, GcPhase};
