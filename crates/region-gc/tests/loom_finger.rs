//! Loom model of the handshake between a task greying an object and another
//! task claiming the region that holds it.
//!
//! The marker sets the object's bit, fences, then reads the global finger
//! and pushes only if the object is below it. The claimer advances the
//! finger past the region, fences, then sweeps the region's bits. The
//! object must end up either pushed or swept.

use std::sync::Arc;

use loom::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};

const REGION_START: usize = 0x1000;
const REGION_END: usize = 0x2000;
const OBJ: usize = 0x1400;
const OBJ_BIT: u64 = 1 << 5;

struct Model {
    finger: AtomicUsize,
    bitmap_word: AtomicU64,
}

/// A thread outside the region greys `OBJ`.
fn grey(model: &Model) -> bool {
    let prev = model.bitmap_word.fetch_or(OBJ_BIT, Ordering::AcqRel);
    assert_eq!(prev & OBJ_BIT, 0);
    fence(Ordering::SeqCst);
    OBJ < model.finger.load(Ordering::Acquire)
}

/// A thread claims the region at the finger and sweeps it.
fn claim_and_sweep(model: &Model) -> bool {
    let claimed = model
        .finger
        .compare_exchange(REGION_START, REGION_END, Ordering::AcqRel, Ordering::Acquire)
        .is_ok();
    assert!(claimed);
    fence(Ordering::SeqCst);
    model.bitmap_word.load(Ordering::Acquire) & OBJ_BIT != 0
}

#[test]
#[ignore = "loom test - run with cargo test loom_finger --release"]
fn test_greyed_object_is_pushed_or_swept() {
    loom::model(|| {
        let model = Arc::new(Model {
            finger: AtomicUsize::new(REGION_START),
            bitmap_word: AtomicU64::new(0),
        });

        let claimer = loom::thread::spawn({
            let model = Arc::clone(&model);
            move || claim_and_sweep(&model)
        });
        let pushed = grey(&model);
        let swept = claimer.join().unwrap();

        assert!(pushed || swept, "object neither pushed nor swept");
    });
}
