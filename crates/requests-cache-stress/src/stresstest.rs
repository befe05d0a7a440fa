use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use requests_cache::config::Config;
use requests_cache::http::HttpCache;

use crate::workloads::{Outcome, WorkloadsConfig, prepare_payload, process_payload};

#[derive(Default)]
struct Outcomes {
    durations: DDSketch,
    http_errors: usize,
    timeouts: usize,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let cache = HttpCache::from_config(config.cache, &config.http)
        .context("failed to create request cache")?;
    let cache = Arc::new(cache);

    // initialize workloads
    let workloads = workloads
        .workloads
        .iter()
        .map(|workload| -> Result<_> {
            Ok((workload.concurrency, Arc::new(prepare_payload(workload)?)))
        })
        .collect::<Result<Vec<_>>>()?;

    // warmup: run each workload once to make sure connections are established
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(_, payload)| {
            let cache = Arc::clone(&cache);
            let payload = Arc::clone(payload);
            tokio::spawn(async move { process_payload(&cache, &payload).await })
        });

        for result in futures::future::join_all(futures).await {
            result.context("warmup task panicked")??;
        }

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // clear the warmup results so that the workloads start out cold
    cache.cache().clear();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, payload) in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let cache = Arc::clone(&cache);

        let task = tokio::spawn(async move {
            let outcomes = Arc::new(Mutex::new(Outcomes::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let payload = Arc::clone(&payload);
                        let cache = Arc::clone(&cache);
                        let outcomes = Arc::clone(&outcomes);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let future = async move {
                            let outcome = process_payload(&cache, &payload).await;

                            let mut outcomes = outcomes.lock().unwrap();
                            outcomes.durations.add(task_start.elapsed().as_secs_f64());
                            match outcome {
                                Ok(Outcome::Success) => {}
                                Ok(Outcome::HttpError) | Err(_) => outcomes.http_errors += 1,
                                Ok(Outcome::Timeout) => outcomes.timeouts += 1,
                            }

                            drop(permit);
                        };

                        tokio::spawn(future.bind_hub(hub));
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let outcomes = std::mem::take(&mut *outcomes.lock().unwrap());
            (concurrency, outcomes)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, outcomes) = task.context("workload task panicked")?;
        let Outcomes {
            durations,
            http_errors,
            timeouts,
        } = outcomes;

        let ops = durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");
        println!("  errors: {http_errors}; timeouts: {timeouts}");

        if ops == 0 {
            continue;
        }
        let quantile = |q| durations.quantile(q).ok().flatten().unwrap_or_default();
        let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
        let p50 = Duration::from_secs_f64(quantile(0.5));
        let p90 = Duration::from_secs_f64(quantile(0.9));
        let p99 = Duration::from_secs_f64(quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    println!();
    let stats = cache.cache().stats();
    println!(
        "Cache stats: {}",
        serde_json::to_string_pretty(&stats).context("failed to serialize cache stats")?
    );

    Ok(())
}
