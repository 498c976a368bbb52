//! Worker process body: a single-process cooperative scheduler running
//! virtual-user tasks on one OS thread, emitting `RequestMetric`s into its
//! ring buffer and heartbeats into the same mmap region.
//!
//! Spawns tasks, tracks a join set, and shuts down on signal, generalized
//! from a fixed task count to a scale-up/scale-down virtual-user model.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{build_client, ClientConfig, LoadClient};
use crate::errors::CoreError;
use crate::label_registry::{label_mailbox_path, LabelMailboxWriter};
use crate::rate_limiter::RateLimiter;
use crate::ring_buffer::RingBufferProducer;
use crate::scenario::ScenarioDescriptor;

/// Heartbeat cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(250);

/// Command-poll cadence. Must be well under the scheduler's tick interval so
/// a worker observes a new target no later than one tick interval after it
/// was produced.
const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct WorkerConfig {
    pub worker_id: u8,
    pub ring_path: PathBuf,
    pub scenario: Arc<ScenarioDescriptor>,
    pub client_config: ClientConfig,
    pub rate_limit_rps: f64,
    pub rate_limit_burst: f64,
    pub initial_target: u32,
}

/// Runs one worker process to completion. Returns once a stop command has
/// been observed and every virtual user has wound down through its own
/// teardown.
pub async fn run_worker(config: WorkerConfig) -> Result<(), CoreError> {
    let worker_id = config.worker_id;
    let build = build_client(&config.client_config)?;

    let producer = Arc::new(
        RingBufferProducer::create(&config.ring_path, worker_id)
            .map_err(|e| CoreError::fatal(format!("worker {worker_id}: ring buffer create failed: {e}")))?,
    );

    let mailbox_path = label_mailbox_path(&config.ring_path);
    let label_writer = Arc::new(std::sync::Mutex::new(
        LabelMailboxWriter::create(&mailbox_path)
            .map_err(|e| CoreError::fatal(format!("worker {worker_id}: label mailbox create failed: {e}")))?,
    ));

    let producer_for_sink = producer.clone();
    let (label_tx, mut label_rx) = crate::label_registry::label_channel();

    let on_complete: crate::client::MetricSink = Arc::new(move |metric| {
        producer_for_sink.push(&metric);
    });

    let http_client = LoadClient::new(
        build.client,
        config.scenario.base_url.clone(),
        worker_id,
        on_complete,
        label_tx,
    );

    // Forwards registrations from the in-process label channel (fed by
    // every `LoadClient` clone) into the cross-process mailbox file.
    tokio::task::spawn_local(async move {
        while let Some(label) = label_rx.recv().await {
            let mut writer = label_writer.lock().unwrap();
            if let Err(e) = writer.write(&label) {
                warn!(error = %e, "failed to append label to mailbox");
            }
        }
    });

    let rate_limiter = RateLimiter::new(config.rate_limit_rps, config.rate_limit_burst);

    let (target_tx, target_rx) = watch::channel(config.initial_target);
    let (stop_tx, stop_rx) = watch::channel(false);

    let running_count = Arc::new(AtomicU32::new(0));

    let command_task = {
        let producer = producer.clone();
        let running_count = running_count.clone();
        tokio::task::spawn_local(async move {
            let mut last_generation = 0u32;
            let mut heartbeat_tick = tokio::time::interval(HEARTBEAT_INTERVAL);
            let mut command_tick = tokio::time::interval(COMMAND_POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = heartbeat_tick.tick() => {
                        let unix_ms = SystemTime::now()
                            .duration_since(SystemTime::UNIX_EPOCH)
                            .unwrap_or_default()
                            .as_millis() as u64;
                        producer.heartbeat(unix_ms);
                        producer.set_active_users(running_count.load(Ordering::Relaxed));
                    }
                    _ = command_tick.tick() => {
                        if let Some((target, stop, generation)) = producer.poll_command(last_generation) {
                            last_generation = generation;
                            let _ = target_tx.send(target);
                            if stop {
                                let _ = stop_tx.send(true);
                                return;
                            }
                        }
                    }
                }
            }
        })
    };

    let next_index = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::new();
    spawn_to_target(
        &config.scenario,
        &http_client,
        &rate_limiter,
        &target_rx,
        &stop_rx,
        &next_index,
        &running_count,
        config.initial_target,
        &mut handles,
    );

    // Reconciliation loop: watches for target changes and spawns new
    // virtual users to reach a higher target. Scale-down needs no explicit
    // action here — each virtual user checks its own index against the
    // current target at the top of its loop and exits on its own (LIFO,
    // since the highest-indexed tasks were spawned last and are the first
    // to see `index >= target`).
    let mut target_watch = target_rx.clone();
    let mut stop_watch = stop_rx.clone();
    loop {
        tokio::select! {
            changed = target_watch.changed() => {
                if changed.is_err() {
                    break;
                }
                let target = *target_watch.borrow();
                let spawned = next_index.load(Ordering::Relaxed) as u32;
                if target > spawned {
                    spawn_to_target(
                        &config.scenario,
                        &http_client,
                        &rate_limiter,
                        &target_rx,
                        &stop_rx,
                        &next_index,
                        &running_count,
                        target,
                        &mut handles,
                    );
                }
            }
            changed = stop_watch.changed() => {
                if changed.is_err() || *stop_watch.borrow() {
                    break;
                }
            }
        }
    }

    for handle in handles {
        let _ = handle.await;
    }
    command_task.abort();

    info!(worker_id, "worker shut down cleanly");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn spawn_to_target(
    scenario: &Arc<ScenarioDescriptor>,
    client: &LoadClient,
    rate_limiter: &RateLimiter,
    target_rx: &watch::Receiver<u32>,
    stop_rx: &watch::Receiver<bool>,
    next_index: &Arc<AtomicU64>,
    running_count: &Arc<AtomicU32>,
    target: u32,
    handles: &mut Vec<tokio::task::JoinHandle<()>>,
) {
    loop {
        let index = next_index.load(Ordering::Relaxed);
        if index >= target as u64 {
            break;
        }
        next_index.store(index + 1, Ordering::Relaxed);
        running_count.fetch_add(1, Ordering::Relaxed);

        let scenario = scenario.clone();
        let client = client.clone();
        let rate_limiter = rate_limiter.clone();
        let target_rx = target_rx.clone();
        let stop_rx = stop_rx.clone();
        let running_count = running_count.clone();

        handles.push(tokio::task::spawn_local(async move {
            run_virtual_user(index, scenario, client, rate_limiter, target_rx, stop_rx).await;
            running_count.fetch_sub(1, Ordering::Relaxed);
        }));
    }
}

/// One virtual user's lifetime: setup once, then loop { pick a weighted
/// task, run it, think } until this task's own index is no longer below the
/// current target or a stop has been requested, then teardown once.
async fn run_virtual_user(
    index: u64,
    scenario: Arc<ScenarioDescriptor>,
    client: LoadClient,
    rate_limiter: RateLimiter,
    target_rx: watch::Receiver<u32>,
    stop_rx: watch::Receiver<bool>,
) {
    let mut rng = rand::thread_rng();

    if let Some(setup) = &scenario.setup {
        setup(client.clone()).await;
    }

    loop {
        if *stop_rx.borrow() || index >= *target_rx.borrow() as u64 {
            break;
        }

        rate_limiter.acquire().await;

        let task = scenario.select_task(&mut rng);
        (task.run)(client.clone()).await;

        if *stop_rx.borrow() {
            break;
        }

        let think = scenario.think_time.sample(&mut rng);
        if think > Duration::ZERO {
            tokio::time::sleep(think).await;
        }
    }

    if let Some(teardown) = &scenario.teardown {
        teardown(client).await;
    }

    debug!(index, "virtual user exited");
}

/// Waits up to `grace_period` for `handles` to finish on their own (via the
/// stop watch each virtual user already observes), then abandons
/// stragglers without forcing a panic. Used by any in-process embedding of
/// a worker; the subprocess path relies on SIGTERM/SIGKILL escalation at
/// the OS process level instead.
pub async fn await_with_grace_period(handles: Vec<tokio::task::JoinHandle<()>>, grace_period: Duration) {
    let deadline = Instant::now() + grace_period;
    for handle in handles {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if tokio::time::timeout(remaining, handle).await.is_err() {
            warn!("virtual user did not finish within grace period; abandoning");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::build_client;
    use crate::scenario::{Task, ThinkTime};
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn local_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn virtual_users_scale_down_when_target_drops() {
        let rt = local_runtime();
        let local = tokio::task::LocalSet::new();
        local.block_on(&rt, async {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(5)))
                .mount(&server)
                .await;

            let hits = Arc::new(AtomicUsize::new(0));
            let hits_clone = hits.clone();
            let task = Task::new("ping", 1, move |client| {
                let hits = hits_clone.clone();
                Box::pin(async move {
                    hits.fetch_add(1, Ordering::Relaxed);
                    let _ = client.get("/", "ping").await;
                })
            });

            let scenario = Arc::new(
                ScenarioDescriptor::new("s", server.uri(), vec![task])
                    .unwrap()
                    .with_think_time(ThinkTime::fixed(Duration::from_millis(1))),
            );

            let dir = tempdir().unwrap();
            let ring_path = dir.path().join("ring0");
            let producer = Arc::new(RingBufferProducer::create(&ring_path, 0).unwrap());
            let on_complete: crate::client::MetricSink = Arc::new(move |_m| {});
            let (label_tx, _label_rx) = crate::label_registry::label_channel();
            let build = build_client(&ClientConfig::default()).unwrap();
            let client = LoadClient::new(build.client, server.uri(), 0, on_complete, label_tx);
            let rate_limiter = RateLimiter::new(0.0, 0.0);

            let (target_tx, target_rx) = watch::channel(3u32);
            let (_stop_tx, stop_rx) = watch::channel(false);

            let next_index = Arc::new(AtomicU64::new(0));
            let running_count = Arc::new(AtomicU32::new(0));
            let mut handles = Vec::new();
            spawn_to_target(
                &scenario,
                &client,
                &rate_limiter,
                &target_rx,
                &stop_rx,
                &next_index,
                &running_count,
                3,
                &mut handles,
            );
            assert_eq!(handles.len(), 3);
            assert_eq!(running_count.load(Ordering::Relaxed), 3);

            target_tx.send(0).unwrap();
            for handle in handles {
                tokio::time::timeout(Duration::from_secs(2), handle)
                    .await
                    .expect("virtual user should exit once target drops to 0")
                    .unwrap();
            }

            assert_eq!(running_count.load(Ordering::Relaxed), 0);
            drop(producer);
        });
    }
}
