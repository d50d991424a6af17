//! End-to-end scenarios driven entirely through the public `Supervisor` API:
//! batched blocking dispatch, single-item identifiers, a persistent worker
//! pool, a timeout violator, and helper respawn.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use forkyard::{BucketId, RunTimeLimit, Supervisor};

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    loop {
        if check() {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn blocking_dispatch_batches_items_across_several_children() {
    let supervisor: Supervisor<u64, u64> = Supervisor::new().unwrap();
    let bucket = BucketId::default_bucket();

    supervisor.set_max_children(&bucket, 2).unwrap();
    supervisor.set_max_work_per_child(&bucket, 3).unwrap();

    let forks = Rc::new(RefCell::new(0u32));
    let forks_cb = forks.clone();
    supervisor
        .register_parent_fork(&bucket, Rc::new(move |_pid, _id| *forks_cb.borrow_mut() += 1))
        .unwrap();

    supervisor
        .register_child_run(
            &bucket,
            Rc::new(|input, _handle| match input {
                forkyard::ChildInput::Batch(items) => Some(items.iter().sum()),
                forkyard::ChildInput::Single(_, item) => Some(item),
                forkyard::ChildInput::Persistent(item) => Some(item),
            }),
        )
        .unwrap();

    for n in 0..7u64 {
        supervisor.add_work(&bucket, n);
    }

    supervisor.process_work(true, Some(&bucket), false).unwrap();

    // 7 items at <= 3 per child: batches of 3, 3, 1 -> three forks.
    assert_eq!(*forks.borrow(), 3);

    let total: u64 = supervisor.get_all_results(&bucket).into_iter().sum();
    assert_eq!(total, (0..7u64).sum());
    assert_eq!(supervisor.work_running(Some(&bucket)), 0);
}

#[test]
fn single_work_item_tracks_identified_work() {
    let supervisor: Supervisor<u64, u64> = Supervisor::new().unwrap();
    let bucket = BucketId::default_bucket();

    supervisor.set_single_work_item(&bucket, true).unwrap();
    supervisor.set_max_children(&bucket, 1).unwrap();
    supervisor
        .register_child_run(
            &bucket,
            Rc::new(|input, _handle| match input {
                forkyard::ChildInput::Single(_, item) => Some(item * 10),
                _ => None,
            }),
        )
        .unwrap();

    let id_a = forkyard::WorkId("a".into());
    let id_b = forkyard::WorkId("b".into());
    supervisor.add_identified_work(&bucket, id_a.clone(), 1);
    supervisor.add_identified_work(&bucket, id_b.clone(), 2);

    assert!(supervisor.is_work_running(&bucket, &id_a));
    assert!(!supervisor.is_work_running(&bucket, &forkyard::WorkId("nonexistent".into())));

    supervisor.process_work(true, Some(&bucket), false).unwrap();

    let mut results = supervisor.get_all_results(&bucket);
    results.sort_unstable();
    assert_eq!(results, vec![10, 20]);
    assert!(!supervisor.is_work_running(&bucket, &id_a));
}

#[test]
fn persistent_bucket_keeps_pool_filled_with_same_payload() {
    let supervisor: Supervisor<u64, u64> = Supervisor::new().unwrap();
    let bucket = BucketId::default_bucket();

    supervisor.set_persistent_mode(&bucket, true).unwrap();
    supervisor.set_max_children(&bucket, 2).unwrap();
    supervisor.set_persistent_data(&bucket, 42);
    supervisor
        .register_child_run(
            &bucket,
            Rc::new(|input, _handle| match input {
                forkyard::ChildInput::Persistent(item) => Some(item),
                _ => None,
            }),
        )
        .unwrap();

    supervisor.process_work(false, Some(&bucket), false).unwrap();
    assert_eq!(supervisor.work_running(Some(&bucket)), 2);

    wait_until(Duration::from_secs(5), || {
        supervisor.tick();
        supervisor.has_result(&bucket)
    });

    let results: Vec<u64> = supervisor.get_all_results(&bucket);
    assert!(results.iter().all(|&v| v == 42));
}

#[test]
fn overrunning_child_is_killed_by_housekeeping() {
    let supervisor: Supervisor<u64, u64> = Supervisor::new().unwrap();
    let bucket = BucketId::default_bucket();

    supervisor.set_max_children(&bucket, 1).unwrap();
    supervisor.set_child_max_run_time(&bucket, 1).unwrap();
    supervisor
        .register_child_run(
            &bucket,
            Rc::new(|_input, _handle| {
                std::thread::sleep(Duration::from_secs(30));
                Some(1u64)
            }),
        )
        .unwrap();

    supervisor.add_work(&bucket, 0);
    supervisor.process_work(false, Some(&bucket), false).unwrap();
    assert_eq!(supervisor.work_running(Some(&bucket)), 1);

    let reaped = wait_until(Duration::from_secs(10), || {
        supervisor.tick();
        supervisor.work_running(Some(&bucket)) == 0
    });

    assert!(reaped, "overrunning child should have been killed and reaped");
    assert!(supervisor.get_all_results(&bucket).is_empty());
}

#[test]
fn helper_process_respawns_after_exit() {
    let supervisor: Supervisor<u64, u64> = Supervisor::new().unwrap();
    let bucket = BucketId::default_bucket();

    let pid = supervisor
        .helper_process_spawn(
            &bucket,
            forkyard::WorkId("helper".into()),
            Rc::new(|_handle| None),
            true,
        )
        .unwrap();

    let respawned = wait_until(Duration::from_secs(10), || {
        supervisor.tick();
        supervisor
            .active_pids(Some(&bucket))
            .into_iter()
            .any(|p| p != pid)
    });

    assert!(respawned, "helper should have respawned under a new pid");
}

#[test]
fn child_max_run_time_zero_resolves_to_immediate_deadline() {
    assert_eq!(RunTimeLimit::from_seconds(0), RunTimeLimit::Immediate);
    assert_eq!(RunTimeLimit::from_seconds(-1), RunTimeLimit::Unlimited);
    assert!(matches!(RunTimeLimit::from_seconds(5), RunTimeLimit::Bounded(_)));
}
