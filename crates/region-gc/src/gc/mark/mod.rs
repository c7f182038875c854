//! Marking data structures: bitmaps, liveness accounting and array slicing.

pub mod bitmap;
pub mod liveness;
pub mod slicer;

pub use bitmap::{AtomicBitmap, MarkBitmap, MarkedObjects};
pub use liveness::{CardGeometry, LivenessAccounting, TaskLiveness};
pub use slicer::ObjArraySlicer;
