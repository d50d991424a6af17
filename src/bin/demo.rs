//! A small CLI harness exercising `forkyard::Supervisor` end to end: queues
//! a batch of integer "jobs" onto the default bucket, forks workers to
//! square them, and prints whatever comes back.

use std::rc::Rc;

use forkyard::{BucketId, Severity, Supervisor};
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "forkyard-demo", about = "Demo of a forking work-dispatch supervisor")]
struct Opt {
    /// Number of integer jobs to enqueue.
    #[structopt(long, default_value = "7")]
    jobs: u32,

    /// Maximum children running at once.
    #[structopt(long, default_value = "2")]
    max_children: u32,

    /// Jobs handed to a single child before it exits.
    #[structopt(long, default_value = "3")]
    batch_size: u32,
}

fn main() -> forkyard::Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let supervisor: Supervisor<u64, u64> = Supervisor::new()?;
    supervisor.register_logging(
        Severity::Info,
        Rc::new(|severity, message| println!("[{:?}] {}", severity, message)),
    );

    let bucket = BucketId::default_bucket();
    supervisor.set_max_children(&bucket, opt.max_children)?;
    supervisor.set_max_work_per_child(&bucket, opt.batch_size)?;

    supervisor.register_child_run(
        &bucket,
        Rc::new(|input, _handle| match input {
            forkyard::ChildInput::Batch(items) => {
                let sum: u64 = items.iter().map(|n| n * n).sum();
                Some(sum)
            }
            forkyard::ChildInput::Single(_, item) => Some(item * item),
            forkyard::ChildInput::Persistent(item) => Some(item * item),
        }),
    )?;

    supervisor.register_parent_fork(
        &bucket,
        Rc::new(|pid, id| println!("forked pid={} for work id={}", pid, id)),
    )?;

    supervisor.register_parent_results(&bucket, Rc::new(|result: u64| println!("result: {}", result)))?;

    for n in 0..opt.jobs as u64 {
        supervisor.add_work(&bucket, n);
    }

    supervisor.process_work(true, Some(&bucket), false)?;

    for result in supervisor.get_all_results(&bucket) {
        println!("stored result: {}", result);
    }

    Ok(())
}
