//! Exercises the shutdown coordinator directly against real forked children,
//! bypassing `Supervisor` (and its installed signal handlers) so the test
//! process itself is never asked to exit.

use std::rc::Rc;
use std::time::Duration;

use forkyard::bucket::{BucketId, BucketRegistry, ChildInput, WorkId};
use forkyard::child::ChildTable;
use forkyard::config::SupervisorConfig;
use forkyard::{dispatcher, shutdown};

#[test]
fn shutdown_reaps_cooperative_children_promptly() {
    let bucket_id = BucketId::default_bucket();
    let mut buckets: BucketRegistry<u64, u64> = BucketRegistry::new();
    buckets.add_bucket(bucket_id.clone());
    let mut children: ChildTable<u64> = ChildTable::new();

    let child_run: Rc<forkyard::bucket::ChildRunFn<u64, u64>> = Rc::new(|_input, handle| {
        // Cooperative: poll for the exit request instead of sleeping blindly.
        for _ in 0..100 {
            if handle.received_exit_request() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        Some(1)
    });

    for _ in 0..3 {
        let (record, _dispatched) = dispatcher::dispatch_one::<u64, u64>(
            &bucket_id,
            ChildInput::Batch(vec![1]),
            WorkId(String::new()),
            Some(child_run.clone()),
            None,
            None,
            &[],
        )
        .unwrap();
        children.insert(record);
    }

    assert_eq!(children.count_active(None), 3);

    let mut config = SupervisorConfig::default();
    config.children_max_timeout = Duration::from_secs(10);

    let _ = shutdown::run(&mut children, &mut buckets, &config);

    assert_eq!(children.count_active(None), 0, "shutdown should have reaped every child");
}

#[test]
fn shutdown_force_kills_stragglers_past_the_deadline() {
    let bucket_id = BucketId::default_bucket();
    let mut buckets: BucketRegistry<u64, u64> = BucketRegistry::new();
    buckets.add_bucket(bucket_id.clone());
    let mut children: ChildTable<u64> = ChildTable::new();

    // Ignores SIGINT entirely; only the force-kill at the deadline removes it.
    let child_run: Rc<forkyard::bucket::ChildRunFn<u64, u64>> = Rc::new(|_input, _handle| {
        std::thread::sleep(Duration::from_secs(30));
        Some(1)
    });

    let (record, _dispatched) = dispatcher::dispatch_one::<u64, u64>(
        &bucket_id,
        ChildInput::Batch(vec![1]),
        WorkId(String::new()),
        Some(child_run),
        None,
        None,
        &[],
    )
    .unwrap();
    children.insert(record);

    let mut config = SupervisorConfig::default();
    config.children_max_timeout = Duration::from_secs(2);

    let result = shutdown::run(&mut children, &mut buckets, &config);
    assert!(result.is_err(), "stragglers past the deadline should surface DeadlineExceeded");

    assert_eq!(children.count_active(None), 0, "straggler should have been force-killed");
}
