//! Loom tests for the termination protocol's offer/withdraw counter.

use std::sync::Arc;

use region_gc::gc::worklist::{GenericTaskQueue, TaskQueueSet};
use region_gc::gc::ParallelTaskTerminator;
use region_gc::TerminationConfig;

type Queues = TaskQueueSet<GenericTaskQueue<u64, 8>>;

fn no_wait() -> TerminationConfig {
    TerminationConfig {
        hard_spin_limit: 0,
        hard_spin_ratio: 0,
        yields_before_sleep: 0,
        sleep_millis: 0,
    }
}

/// Two workers that both want out either both finish or both withdraw;
/// once every worker has offered, nobody may withdraw.
#[test]
#[ignore = "loom test - run with cargo test loom_terminator_withdraw --release"]
fn test_withdraw_never_splits_the_team() {
    loom::model(|| {
        let queues = Arc::new(Queues::new(2, GenericTaskQueue::new));
        let terminator = Arc::new(ParallelTaskTerminator::new(2, queues, no_wait()));

        let other = loom::thread::spawn({
            let terminator = Arc::clone(&terminator);
            move || terminator.offer_termination(Some(&|| true))
        });
        let mine = terminator.offer_termination(Some(&|| true));
        let theirs = other.join().unwrap();

        assert_eq!(mine, theirs);
        let expected = if mine { 2 } else { 0 };
        assert_eq!(terminator.offered(), expected);
    });
}

/// Work appearing in the queue set pulls a waiting worker back.
#[test]
#[ignore = "loom test - run with cargo test loom_terminator_peek --release"]
fn test_visible_work_withdraws_offer() {
    loom::model(|| {
        let queues = Arc::new(Queues::new(2, GenericTaskQueue::new));
        let terminator = Arc::new(ParallelTaskTerminator::new(
            2,
            Arc::clone(&queues),
            no_wait(),
        ));

        let producer = loom::thread::spawn({
            let queues = Arc::clone(&queues);
            move || assert!(queues.queue(1).push(9))
        });
        producer.join().unwrap();

        assert!(!terminator.offer_termination(None));
        assert_eq!(terminator.offered(), 0);
        assert_eq!(queues.queue(1).pop_global(), Some(9));
    });
}
