use std::{
    hint::black_box,
    num::NonZeroUsize,
    sync::{ atomic::{ AtomicUsize, Ordering }, Arc },
    time::Instant,
};

use pinloop::{ Error, PinnedExecutor };
use rand::Rng;

fn fib(n: u128) -> u128 {
    (0..n).fold((0, 1), |(a, b), _| (b, a + b)).0
}

fn main() -> Result<(), Error> {
    env_logger::init();

    let tasks: usize = std::env::var("PINLOOP_TASKS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1_000_000);
    let cores = std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1);

    let executors = (0..cores).map(PinnedExecutor::new).collect::<Result<Vec<_>, _>>()?;
    for executor in &executors {
        if let Err(err) = executor.affinity_outcome() {
            log::warn!("core {}: {}", executor.core_id(), err);
        }
    }

    let completed = Arc::new(AtomicUsize::new(0));
    let schedulers: Vec<_> = executors.iter().map(PinnedExecutor::scheduler).collect();
    let mut rng = rand::thread_rng();
    let start = Instant::now();

    for _ in 0..tasks {
        let n: u128 = rng.gen_range(64..=150);
        let completed = completed.clone();
        let scheduler = &schedulers[rng.gen_range(0..schedulers.len())];
        let submitted = scheduler.schedule(move || {
            black_box(fib(n));
            completed.fetch_add(1, Ordering::Relaxed);
        });
        if submitted.is_err() {
            log::error!("executor shut down while submitting");
            break;
        }
    }

    // Dropping drains every queue before joining.
    drop(schedulers);
    drop(executors);

    println!(
        "{} tasks on {} pinned threads in {:?}",
        completed.load(Ordering::Relaxed),
        cores,
        start.elapsed()
    );
    Ok(())
}
