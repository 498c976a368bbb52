//! Coordinator: spawns the worker fleet, drives the scheduler,
//! redistributes concurrency on worker failure, and owns the `TestResult`.
//!
//! Builds clients, spawns tasks, waits on a shutdown signal, assembles a
//! summary — generalized from a single in-process task pool to a fleet of
//! OS worker processes coordinated over the ring-buffer command channel.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::errors::CoreError;
use crate::metrics_model::{MetricSnapshot, TestResult, WorkerFailureEvent};
use crate::scheduler::Scheduler;

/// A worker is declared failed once its heartbeat is stale by this long.
const HEARTBEAT_STALE_THRESHOLD: Duration = Duration::from_secs(5);

/// How long the coordinator waits for a freshly-spawned worker to create
/// its ring-buffer file before giving up.
const RING_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const RING_OPEN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a restarted worker's ring-buffer file is given to reappear
/// before the restart itself is declared failed.
const RESTART_RING_OPEN_TIMEOUT: Duration = Duration::from_millis(500);
const RESTART_RING_OPEN_POLL_INTERVAL: Duration = Duration::from_millis(20);

struct WorkerSlot {
    id: u8,
    child: Child,
    ring_path: PathBuf,
    healthy: bool,
    /// Whether this worker id has already used its one permitted restart.
    /// A second failure of a worker that already carries this flag aborts
    /// the run rather than restarting again.
    restarted: bool,
}

/// Runs the whole fleet for one load test and returns the completed
/// `TestResult`. `spawn_worker` builds (but does not run) the `Command`
/// this process's binary should re-invoke itself with to act as worker
/// `id`, writing its ring buffer to `ring_path`. Workers receive only a
/// path and resolve the scenario independently.
pub async fn run<F, S>(
    config: &Config,
    ring_dir: &Path,
    spawn_worker: F,
    mut on_snapshot: S,
) -> Result<TestResult, CoreError>
where
    F: Fn(u8, &Path) -> std::io::Result<Command>,
    S: FnMut(MetricSnapshot),
{
    let start = SystemTime::now();
    let mut test_result = TestResult::new(config.scenario_name.clone(), config.pattern.describe(), start);

    let mut slots = Vec::with_capacity(config.worker_count);
    for id in 0..config.worker_count as u8 {
        let ring_path = ring_dir.join(format!("worker-{id}.ring"));
        let mut command = spawn_worker(id, &ring_path)
            .map_err(|e| CoreError::fatal(format!("failed to build worker {id} command: {e}")))?;
        let child = command
            .spawn()
            .map_err(|e| CoreError::fatal(format!("failed to spawn worker {id}: {e}")))?;
        slots.push(WorkerSlot {
            id,
            child,
            ring_path,
            healthy: true,
            restarted: false,
        });
    }

    let ring_paths: Vec<PathBuf> = slots.iter().map(|s| s.ring_path.clone()).collect();
    let mut aggregator = open_aggregator_with_retry(&ring_paths).await?;

    let scheduler = Scheduler::new(config.pattern.clone(), config.test_duration, config.tick_interval);

    let mut failure_reason: Option<String> = None;
    let (abort_tx, abort_rx) = watch::channel(false);
    let tick_run = run_ticks(
        &scheduler,
        &mut aggregator,
        &mut slots,
        &spawn_worker,
        &abort_tx,
        config.min_workers,
        &mut test_result,
        &mut on_snapshot,
        &mut failure_reason,
    );

    tokio::select! {
        _ = tick_run => {}
        _ = wait_for_shutdown_signal() => {
            info!("shutdown signal received, stopping workers gracefully");
            for i in 0..slots.len() {
                aggregator.send_command(i, 0, true);
            }
            let grace = tokio::time::sleep(config.grace_period);
            tokio::select! {
                _ = grace => {}
                _ = wait_for_shutdown_signal() => {
                    warn!("second shutdown signal received, forcing termination");
                }
            }
            failure_reason = Some("run cancelled by shutdown signal".to_string());
        }
        _ = wait_for_abort(abort_rx) => {
            warn!("worker restart policy exceeded, aborting run");
            for i in 0..slots.len() {
                aggregator.send_command(i, 0, true);
            }
            if failure_reason.is_none() {
                failure_reason = Some("a worker failed twice; the one-restart-per-worker policy was exceeded".to_string());
            }
        }
    }

    for slot in &mut slots {
        let _ = slot.child.start_kill();
        let _ = slot.child.wait().await;
    }

    let elapsed = config.test_duration.as_secs_f64();
    let active_users: u32 = slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.healthy)
        .map(|(i, _)| aggregator.active_users(i))
        .sum();
    let cumulative = aggregator.cumulative_snapshot(elapsed, config.pattern.target_at(elapsed), active_users);
    test_result.finish(SystemTime::now(), cumulative);
    test_result.failure_reason = failure_reason;

    Ok(test_result)
}

async fn wait_for_abort(mut abort_rx: watch::Receiver<bool>) {
    loop {
        if *abort_rx.borrow() {
            return;
        }
        if abort_rx.changed().await.is_err() {
            // Sender dropped without ever signalling abort: block forever so
            // this branch never "wins" the surrounding `select!` spuriously.
            std::future::pending::<()>().await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_ticks<F, S>(
    scheduler: &Scheduler,
    aggregator: &mut Aggregator,
    slots: &mut Vec<WorkerSlot>,
    spawn_worker: &F,
    abort_tx: &watch::Sender<bool>,
    min_workers: usize,
    test_result: &mut TestResult,
    on_snapshot: &mut S,
    failure_reason: &mut Option<String>,
) where
    F: Fn(u8, &Path) -> std::io::Result<Command>,
    S: FnMut(MetricSnapshot),
{
    let run_start = Instant::now();
    scheduler
        .run(|tick| {
            let heartbeats: Vec<Option<u64>> = (0..slots.len()).map(|i| aggregator.heartbeat_unix_ms(i)).collect();
            check_worker_health(slots, aggregator, spawn_worker, &heartbeats, test_result, run_start, abort_tx);

            let healthy_indices: Vec<usize> = slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.healthy)
                .map(|(i, _)| i)
                .collect();

            if healthy_indices.len() < min_workers && failure_reason.is_none() {
                *failure_reason = Some(format!(
                    "healthy worker count {} dropped below configured minimum {}",
                    healthy_indices.len(),
                    min_workers
                ));
            }

            let shares = distribute_share(tick.target_concurrency, healthy_indices.len());
            for (share, &slot_index) in shares.iter().zip(healthy_indices.iter()) {
                aggregator.send_command(slot_index, *share, false);
            }

            let active_users: u32 = healthy_indices.iter().map(|&i| aggregator.active_users(i)).sum();
            let snapshot = aggregator.tick(tick.elapsed.as_secs_f64(), tick.target_concurrency, active_users);
            test_result.push_snapshot(snapshot.clone());
            on_snapshot(snapshot);
        })
        .await;
}

/// `share_i = target // w + (1 if i < target % w else 0)`, applied over
/// whatever set of workers is currently healthy.
fn distribute_share(target: u32, worker_count: usize) -> Vec<u32> {
    if worker_count == 0 {
        return Vec::new();
    }
    let w = worker_count as u32;
    let base = target / w;
    let remainder = target % w;
    (0..worker_count).map(|i| base + if (i as u32) < remainder { 1 } else { 0 }).collect()
}

/// Declares a worker failed if its process has exited, or if its
/// heartbeat (read by the caller from the aggregator) is stale by more
/// than `HEARTBEAT_STALE_THRESHOLD`. A worker's first failure is
/// recovered by respawning it under the same id and ring path; a second
/// failure of a worker that has already used its restart aborts the run.
fn check_worker_health<F>(
    slots: &mut [WorkerSlot],
    aggregator: &mut Aggregator,
    spawn_worker: &F,
    heartbeats_unix_ms: &[Option<u64>],
    test_result: &mut TestResult,
    run_start: Instant,
    abort_tx: &watch::Sender<bool>,
) where
    F: Fn(u8, &Path) -> std::io::Result<Command>,
{
    let now_unix_ms = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    for (index, slot) in slots.iter_mut().enumerate() {
        if !slot.healthy {
            continue;
        }

        let failure_reason = if matches!(slot.child.try_wait(), Ok(Some(_))) {
            Some("process exited")
        } else if let Some(Some(heartbeat)) = heartbeats_unix_ms.get(index) {
            if *heartbeat > 0 && now_unix_ms.saturating_sub(*heartbeat) > HEARTBEAT_STALE_THRESHOLD.as_millis() as u64 {
                Some("heartbeat stale")
            } else {
                None
            }
        } else {
            None
        };

        let Some(reason) = failure_reason else { continue };
        slot.healthy = false;
        error!(worker_id = slot.id, reason, "worker failed");

        if slot.restarted {
            test_result.record_worker_failure(WorkerFailureEvent {
                worker_id: slot.id,
                elapsed_secs: run_start.elapsed().as_secs_f64(),
                reason: reason.to_string(),
                restarted: false,
            });
            error!(worker_id = slot.id, "worker failed a second time; restart policy exceeded");
            let _ = abort_tx.send(true);
            continue;
        }

        match restart_worker(slot, aggregator, index, spawn_worker) {
            Ok(()) => {
                slot.healthy = true;
                slot.restarted = true;
                test_result.record_worker_failure(WorkerFailureEvent {
                    worker_id: slot.id,
                    elapsed_secs: run_start.elapsed().as_secs_f64(),
                    reason: reason.to_string(),
                    restarted: true,
                });
                info!(worker_id = slot.id, "worker restarted after failure");
            }
            Err(e) => {
                warn!(worker_id = slot.id, error = %e, "worker restart failed");
                test_result.record_worker_failure(WorkerFailureEvent {
                    worker_id: slot.id,
                    elapsed_secs: run_start.elapsed().as_secs_f64(),
                    reason: reason.to_string(),
                    restarted: false,
                });
                let _ = abort_tx.send(true);
            }
        }
    }
}

/// Re-spawns a failed worker under its existing id and ring path, then
/// waits briefly for the new process to re-create its ring-buffer file
/// before re-opening it in the aggregator.
fn restart_worker<F>(
    slot: &mut WorkerSlot,
    aggregator: &mut Aggregator,
    worker_index: usize,
    spawn_worker: &F,
) -> std::io::Result<()>
where
    F: Fn(u8, &Path) -> std::io::Result<Command>,
{
    let _ = slot.child.start_kill();

    let mut command = spawn_worker(slot.id, &slot.ring_path)?;
    let child = command.spawn()?;
    slot.child = child;

    let deadline = std::time::Instant::now() + RESTART_RING_OPEN_TIMEOUT;
    loop {
        match aggregator.replace_worker(worker_index, &slot.ring_path) {
            Ok(()) => return Ok(()),
            Err(e) => {
                if std::time::Instant::now() >= deadline {
                    return Err(e);
                }
                std::thread::sleep(RESTART_RING_OPEN_POLL_INTERVAL);
            }
        }
    }
}

async fn open_aggregator_with_retry(ring_paths: &[PathBuf]) -> Result<Aggregator, CoreError> {
    let deadline = Instant::now() + RING_OPEN_TIMEOUT;
    loop {
        match Aggregator::open(ring_paths) {
            Ok(aggregator) => return Ok(aggregator),
            Err(e) => {
                if Instant::now() >= deadline {
                    return Err(CoreError::fatal(format!(
                        "timed out waiting for worker ring buffers to appear: {e}"
                    )));
                }
                tokio::time::sleep(RING_OPEN_POLL_INTERVAL).await;
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribute_share_assigns_remainder_to_earlier_indices() {
        assert_eq!(distribute_share(10, 3), vec![4, 3, 3]);
        assert_eq!(distribute_share(9, 3), vec![3, 3, 3]);
        assert_eq!(distribute_share(0, 3), vec![0, 0, 0]);
        assert_eq!(distribute_share(5, 0), Vec::<u32>::new());
    }

    #[test]
    fn distribute_share_single_worker_gets_everything() {
        assert_eq!(distribute_share(42, 1), vec![42]);
    }
}
