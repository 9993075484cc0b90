//! Sleep demo
//!
//! Launches a batch of coroutines that sleep for different intervals
//! on a small worker pool. All of them overlap: total wall time tracks
//! the longest sleep, not the sum.
//!
//! Usage:
//!     cargo run --release -p sleep-demo

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use fibra::{hook, Scheduler, SchedulerConfig};

const TASKS: usize = 12;

fn main() {
    let mut sched = Scheduler::new(
        "sleep-demo",
        SchedulerConfig::from_env().num_workers(2),
    )
    .expect("scheduler setup failed");
    sched.start().expect("scheduler start failed");
    let stop = sched.stop_handle();

    let start = Instant::now();
    let done = Arc::new(AtomicUsize::new(0));

    for i in 0..TASKS {
        let done = Arc::clone(&done);
        let ms = 100 + (i as u64 % 4) * 100;
        sched.add_task(
            move || {
                hook::sleep_ms(ms);
                println!(
                    "task {:2} slept {}ms, woke at {:?}",
                    i,
                    ms,
                    start.elapsed()
                );
                done.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
    }

    sched.add_task(
        move || {
            while done.load(Ordering::SeqCst) < TASKS {
                hook::sleep_ms(10);
            }
            println!("all {} sleeps done in {:?}", TASKS, start.elapsed());
            stop.stop();
        },
        None,
    );

    sched.wait().expect("scheduler wait failed");
}
