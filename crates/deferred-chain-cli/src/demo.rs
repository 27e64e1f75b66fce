//! Demonstration chains. Each prints its stages to stdout in firing order.

use std::time::Duration;

use deferred_chain::{DeferredChain, RunStats, Scheduler, SchedulerRef};
use tracing::info;

use crate::error::CliResult;

/// Drop `ball` into a three-step machine once `delay` has passed.
pub async fn rube_goldberg(
    scheduler: &Scheduler,
    ball: String,
    delay: Duration,
) -> CliResult<RunStats> {
    let start = DeferredChain::<String>::new(scheduler);

    start
        .then(|ball| {
            println!("step1: {ball}");
            ball
        })
        .then(|ball| {
            println!("step2: {ball}");
            ball
        })
        .then(|ball| {
            println!("step3: {ball}");
            ball
        });

    scheduler.resolve_after(&start, ball, delay);
    info!(?delay, "Machine armed");

    Ok(scheduler.run().await?)
}

/// Intermediate results gathered by [`compose`].
#[derive(Debug, Clone)]
struct Steps {
    step1: String,
    step2: String,
}

fn step1(scheduler: &SchedulerRef) -> DeferredChain<String> {
    scheduler.resolved("step1".to_string())
}

fn step2(scheduler: &SchedulerRef) -> DeferredChain<String> {
    scheduler.resolved("step2".to_string())
}

/// Combine two deferred steps by threading an accumulator through the
/// chain rather than stashing results in a shared variable.
pub async fn compose(scheduler: &Scheduler) -> CliResult<RunStats> {
    let handle = scheduler.downgrade();

    step1(&handle)
        .then_chain(move |first| {
            step2(&handle).then(move |second| Steps {
                step1: first,
                step2: second,
            })
        })
        .then(|steps| println!("{}{}", steps.step1, steps.step2));

    Ok(scheduler.run().await?)
}

/// The same composition written as sequential `await`s.
pub async fn sequential(scheduler: &Scheduler, delay: Duration) -> CliResult<RunStats> {
    let handle = scheduler.downgrade();

    let joined = scheduler.spawn(async move {
        let first = step1(&handle).await;
        handle.sleep(delay).await;
        let second = step2(&handle).await;
        format!("{first}{second}")
    });
    joined.then(|joined| println!("{joined}"));

    Ok(scheduler.run().await?)
}

/// Two chains resolved back to back; their links alternate on the shared
/// queue.
pub async fn interleave(scheduler: &Scheduler) -> CliResult<RunStats> {
    let x = DeferredChain::<&'static str>::new(scheduler);
    let y = DeferredChain::<&'static str>::new(scheduler);

    for (chain, name) in [(&x, "x"), (&y, "y")] {
        chain
            .then(move |v| {
                println!("{name}1: {v}");
                v
            })
            .then(move |v| {
                println!("{name}2: {v}");
                v
            });
    }

    x.resolve("first");
    y.resolve("second");

    Ok(scheduler.run().await?)
}
