use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sketches_ddsketch::DDSketch;
use tokio::runtime::Handle;

use slotloader_service::config::{CacheConfig, Config};
use slotloader_service::{Coordinator, RequestOutcome, SlotId};

use crate::workloads::{SimulatedLoader, Workload, WorkloadsConfig};

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
    load_pool: Handle,
) -> Result<()> {
    let start = Instant::now();
    let deadline = tokio::time::Instant::from_std(start + duration);

    // every workload gets its own coordinator, driven by its own task
    let tasks = workloads.workloads.into_iter().map(|workload| {
        let cache_config = config.cache.clone();
        let load_pool = load_pool.clone();
        tokio::spawn(run_workload(workload, cache_config, load_pool, deadline))
    });

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let stats = task.context("workload task panicked")??;
        stats.print(i, duration);
    }

    Ok(())
}

#[derive(Default)]
struct Stats {
    slots: usize,
    requests: usize,
    hits: usize,
    started: usize,
    coalesced: usize,
    completions: usize,
    failures: usize,
    cache_entries: usize,
    cache_weight: u64,
    max_weight: u64,
    load_durations: DDSketch,
}

impl Stats {
    fn record(&mut self, outcome: RequestOutcome) {
        self.requests += 1;
        match outcome {
            RequestOutcome::CacheHit => self.hits += 1,
            RequestOutcome::LoadStarted => self.started += 1,
            RequestOutcome::AlreadyLoading => self.coalesced += 1,
        }
    }

    fn print(&self, i: usize, duration: Duration) {
        let ops_ps = self.requests as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} (slots: {}): {} requests, {ops_ps:.2} requests/s",
            self.slots, self.requests
        );
        println!(
            "  hits: {}; started: {}; coalesced: {}; completions: {}; failures: {}",
            self.hits, self.started, self.coalesced, self.completions, self.failures
        );
        println!(
            "  cache: {} entries; weight: {}/{}",
            self.cache_entries, self.cache_weight, self.max_weight
        );

        if self.load_durations.count() > 0 {
            let p50 = quantile(&self.load_durations, 0.5);
            let p90 = quantile(&self.load_durations, 0.9);
            let p99 = quantile(&self.load_durations, 0.99);
            println!("  time to resource: p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        }
    }
}

fn quantile(sketch: &DDSketch, q: f64) -> Duration {
    sketch
        .quantile(q)
        .ok()
        .flatten()
        .map(Duration::from_secs_f64)
        .unwrap_or_default()
}

async fn run_workload(
    workload: Workload,
    cache_config: CacheConfig,
    load_pool: Handle,
    deadline: tokio::time::Instant,
) -> Result<Stats> {
    let failures = Arc::new(AtomicUsize::new(0));
    let failure_counter = Arc::clone(&failures);

    let mut coordinator = Coordinator::builder(SimulatedLoader::new(&workload), Vec::new())
        .config(&cache_config)
        .weigher(|_key, resource| resource.len() as u64)
        .on_failure(move |_key, _err| {
            failure_counter.fetch_add(1, Ordering::Relaxed);
        })
        .build(load_pool);

    let slots: Vec<SlotId> = (0..workload.slots)
        .map(|_| coordinator.create_slot())
        .collect();
    let mut rng = StdRng::from_os_rng();
    let mut stats = Stats {
        slots: workload.slots,
        ..Default::default()
    };
    // slots waiting for a load, and since when
    let mut loading: HashMap<SlotId, Instant> = HashMap::new();

    // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    loop {
        // keep roughly one load per slot in flight
        for _ in 0..workload.slots {
            if coordinator.pending() >= workload.slots {
                break;
            }
            let slot = slots[rng.random_range(0..slots.len())];
            let key = rng.random_range(0..workload.keys);

            let outcome = coordinator.request_load(key, slot)?;
            match outcome {
                RequestOutcome::LoadStarted => {
                    loading.insert(slot, Instant::now());
                }
                RequestOutcome::CacheHit => {
                    loading.remove(&slot);
                }
                RequestOutcome::AlreadyLoading => {}
            }
            stats.record(outcome);
        }

        tokio::select! {
            processed = coordinator.next_completion() => {
                if processed {
                    stats.completions += 1;
                } else {
                    tokio::task::yield_now().await;
                }
            }
            _ = &mut sleep => {
                break;
            }
        }

        loading.retain(|slot, since| {
            if coordinator.slot_task_state(*slot).is_some() {
                return true;
            }
            stats.load_durations.add(since.elapsed().as_secs_f64());
            false
        });
    }

    // wait for outstanding loads, so the cache stats include them
    while coordinator.next_completion().await {
        stats.completions += 1;
    }

    let cache = coordinator.cache();
    stats.cache_entries = cache.len();
    stats.cache_weight = cache.weight();
    stats.max_weight = cache.max_weight();
    stats.failures = failures.load(Ordering::Relaxed);

    tracing::debug!(?coordinator, "Finished workload");
    Ok(stats)
}
