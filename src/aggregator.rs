//! Aggregator: drains every worker's ring buffer once per tick, folds
//! latencies into tick-local and cumulative HDR histograms, and produces a
//! `MetricSnapshot`.
//!
//! Follows a drain-then-reset tick shape, with HDR bookkeeping and
//! per-endpoint isolation layered on top.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::time::SystemTime;

use tracing::warn;

use crate::errors::ErrorCategory;
use crate::hdr::LatencyHistogram;
use crate::label_registry::{LabelMailboxReader, LabelRegistry};
use crate::metrics_model::{EndpointSnapshot, MetricSnapshot, RequestMetric};
use crate::ring_buffer::RingBufferConsumer;

struct EndpointState {
    tick_histogram: LatencyHistogram,
    cumulative_histogram: LatencyHistogram,
    requests_total: u64,
    errors_total: u64,
    requests_tick: u64,
    errors_tick: u64,
}

impl EndpointState {
    fn new() -> Self {
        Self {
            tick_histogram: LatencyHistogram::new(),
            cumulative_histogram: LatencyHistogram::new(),
            requests_total: 0,
            errors_total: 0,
            requests_tick: 0,
            errors_tick: 0,
        }
    }

    fn reset_tick(&mut self) {
        self.tick_histogram.reset();
        self.requests_tick = 0;
        self.errors_tick = 0;
    }
}

struct WorkerHandle {
    consumer: RingBufferConsumer,
    label_reader: LabelMailboxReader,
}

/// Owns every worker's ring buffer and the cumulative/tick-local latency
/// state; driven once per scheduler tick by the coordinator.
pub struct Aggregator {
    workers: Vec<WorkerHandle>,
    registry: LabelRegistry,
    endpoints: HashMap<u64, EndpointState>,

    global_tick: LatencyHistogram,
    global_cumulative: LatencyHistogram,

    total_requests: u64,
    total_errors: u64,
    dropped_records: u64,
    label_collisions_seen: u64,
}

impl Aggregator {
    /// Opens a `RingBufferConsumer` and a `LabelMailboxReader` for every
    /// worker's ring-buffer path.
    pub fn open(ring_paths: &[impl AsRef<Path>]) -> std::io::Result<Self> {
        let mut workers = Vec::with_capacity(ring_paths.len());
        for path in ring_paths {
            let path = path.as_ref();
            let consumer = RingBufferConsumer::open(path)?;
            let label_reader = LabelMailboxReader::new(&crate::label_registry::label_mailbox_path(path));
            workers.push(WorkerHandle { consumer, label_reader });
        }
        Ok(Self {
            workers,
            registry: LabelRegistry::new(),
            endpoints: HashMap::new(),
            global_tick: LatencyHistogram::new(),
            global_cumulative: LatencyHistogram::new(),
            total_requests: 0,
            total_errors: 0,
            dropped_records: 0,
            label_collisions_seen: 0,
        })
    }

    /// Worker-health view: the most recent heartbeat timestamp (unix ms)
    /// reported by worker at index `i`.
    pub fn heartbeat_unix_ms(&self, worker_index: usize) -> Option<u64> {
        self.workers.get(worker_index).map(|w| w.consumer.heartbeat_unix_ms())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// The live virtual-user count worker at index `i` last published,
    /// `0` if the index is out of range.
    pub fn active_users(&self, worker_index: usize) -> u32 {
        self.workers.get(worker_index).map(|w| w.consumer.active_users()).unwrap_or(0)
    }

    /// Re-opens the ring buffer and label mailbox for worker at index `i`
    /// after it has been restarted under a new process but at the same
    /// path.
    pub fn replace_worker(&mut self, worker_index: usize, ring_path: &Path) -> std::io::Result<()> {
        let consumer = RingBufferConsumer::open(ring_path)?;
        let label_reader = LabelMailboxReader::new(&crate::label_registry::label_mailbox_path(ring_path));
        if let Some(worker) = self.workers.get_mut(worker_index) {
            *worker = WorkerHandle { consumer, label_reader };
        }
        Ok(())
    }

    /// Publishes a scale/stop command to worker at index `i`.
    pub fn send_command(&self, worker_index: usize, target_concurrency: u32, stop_requested: bool) {
        if let Some(worker) = self.workers.get(worker_index) {
            worker.consumer.send_command(target_concurrency, stop_requested);
        }
    }

    /// Runs one aggregation tick: drain every worker, record into
    /// tick-local and cumulative histograms, tally counters, then build and
    /// return the snapshot, resetting tick-local state before returning.
    pub fn tick(&mut self, elapsed_secs: f64, target_concurrency: u32, active_users: u32) -> MetricSnapshot {
        for worker in &mut self.workers {
            for label in worker.label_reader.poll() {
                self.registry.register(&label.name, label.method);
            }
        }

        let mut errors_by_status: HashMap<u16, u64> = HashMap::new();
        let mut errors_by_category: HashMap<String, u64> = HashMap::new();
        let mut requests_this_tick = 0u64;
        let mut errors_this_tick = 0u64;
        let mut dropped_this_tick = 0u64;

        for worker in &mut self.workers {
            let (records, dropped) = worker.consumer.drain();
            dropped_this_tick += dropped;
            for metric in records {
                requests_this_tick += 1;
                let is_error = !matches!(metric.error_category, ErrorCategory::None);
                if is_error {
                    errors_this_tick += 1;
                    if metric.status_code > 0 {
                        *errors_by_status.entry(metric.status_code).or_insert(0) += 1;
                    }
                    *errors_by_category.entry(metric.error_category.label().to_string()).or_insert(0) += 1;
                }

                self.global_tick.record_value(metric.latency_ms as f64);
                self.global_cumulative.record_value(metric.latency_ms as f64);

                self.record_endpoint(&metric, is_error);
            }
        }

        self.dropped_records += dropped_this_tick;
        self.total_requests += requests_this_tick;
        self.total_errors += errors_this_tick;
        self.label_collisions_seen = self.registry.collisions();

        let endpoints = self.build_endpoint_snapshots();

        let snapshot = MetricSnapshot {
            wall_timestamp_unix_secs: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64(),
            elapsed_secs,
            target_concurrency,
            active_users,

            total_requests: self.total_requests,
            requests_this_tick,
            requests_per_second: requests_this_tick as f64,

            p50_ms: nan_to_none(self.global_tick.get_percentile(50.0)),
            p75_ms: nan_to_none(self.global_tick.get_percentile(75.0)),
            p90_ms: nan_to_none(self.global_tick.get_percentile(90.0)),
            p95_ms: nan_to_none(self.global_tick.get_percentile(95.0)),
            p99_ms: nan_to_none(self.global_tick.get_percentile(99.0)),
            p999_ms: nan_to_none(self.global_tick.get_percentile(99.9)),
            latency_min_ms: nan_to_none(self.global_tick.min()),
            latency_max_ms: nan_to_none(self.global_tick.max()),
            latency_avg_ms: nan_to_none(self.global_tick.mean()),

            total_errors: self.total_errors,
            errors_this_tick,
            error_rate: if requests_this_tick > 0 {
                errors_this_tick as f64 / requests_this_tick as f64
            } else {
                0.0
            },
            errors_by_status,
            errors_by_category,

            endpoints,
            dropped_records: dropped_this_tick,
            label_collisions: self.label_collisions_seen,
        };

        self.global_tick.reset();
        for endpoint in self.endpoints.values_mut() {
            endpoint.reset_tick();
        }

        snapshot
    }

    /// Builds a final snapshot from the cumulative (never-reset) state, for
    /// `TestResult::finish`.
    pub fn cumulative_snapshot(&self, elapsed_secs: f64, target_concurrency: u32, active_users: u32) -> MetricSnapshot {
        let endpoints = self
            .endpoints
            .iter()
            .map(|(hash, state)| {
                let name = self
                    .registry
                    .resolve(*hash)
                    .map(|l| l.name.clone())
                    .unwrap_or_else(|| format!("unknown:{hash:x}"));
                (
                    name,
                    EndpointSnapshot {
                        requests: state.requests_total,
                        rps: if elapsed_secs > 0.0 {
                            state.requests_total as f64 / elapsed_secs
                        } else {
                            0.0
                        },
                        p50_ms: nan_to_none(state.cumulative_histogram.get_percentile(50.0)),
                        p95_ms: nan_to_none(state.cumulative_histogram.get_percentile(95.0)),
                        p99_ms: nan_to_none(state.cumulative_histogram.get_percentile(99.0)),
                        errors: state.errors_total,
                        error_rate: if state.requests_total > 0 {
                            state.errors_total as f64 / state.requests_total as f64
                        } else {
                            0.0
                        },
                    },
                )
            })
            .collect();

        MetricSnapshot {
            wall_timestamp_unix_secs: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64(),
            elapsed_secs,
            target_concurrency,
            active_users,
            total_requests: self.total_requests,
            requests_this_tick: 0,
            requests_per_second: if elapsed_secs > 0.0 {
                self.total_requests as f64 / elapsed_secs
            } else {
                0.0
            },
            p50_ms: nan_to_none(self.global_cumulative.get_percentile(50.0)),
            p75_ms: nan_to_none(self.global_cumulative.get_percentile(75.0)),
            p90_ms: nan_to_none(self.global_cumulative.get_percentile(90.0)),
            p95_ms: nan_to_none(self.global_cumulative.get_percentile(95.0)),
            p99_ms: nan_to_none(self.global_cumulative.get_percentile(99.0)),
            p999_ms: nan_to_none(self.global_cumulative.get_percentile(99.9)),
            latency_min_ms: nan_to_none(self.global_cumulative.min()),
            latency_max_ms: nan_to_none(self.global_cumulative.max()),
            latency_avg_ms: nan_to_none(self.global_cumulative.mean()),
            total_errors: self.total_errors,
            errors_this_tick: 0,
            error_rate: if self.total_requests > 0 {
                self.total_errors as f64 / self.total_requests as f64
            } else {
                0.0
            },
            errors_by_status: HashMap::new(),
            errors_by_category: HashMap::new(),
            endpoints,
            dropped_records: self.dropped_records,
            label_collisions: self.label_collisions_seen,
        }
    }

    /// Records one metric's latency and counters against its endpoint,
    /// isolated with `catch_unwind` so a bug in per-endpoint bookkeeping
    /// never drops the rest of the tick.
    fn record_endpoint(&mut self, metric: &RequestMetric, is_error: bool) {
        let endpoints = &mut self.endpoints;
        let result = catch_unwind(AssertUnwindSafe(|| {
            let state = endpoints.entry(metric.name_hash).or_insert_with(EndpointState::new);
            state.tick_histogram.record_value(metric.latency_ms as f64);
            state.cumulative_histogram.record_value(metric.latency_ms as f64);
            state.requests_total += 1;
            state.requests_tick += 1;
            if is_error {
                state.errors_total += 1;
                state.errors_tick += 1;
            }
        }));
        if result.is_err() {
            warn!(name_hash = metric.name_hash, "per-endpoint aggregation panicked; tick continues");
        }
    }

    fn build_endpoint_snapshots(&self) -> HashMap<String, EndpointSnapshot> {
        self.endpoints
            .iter()
            .map(|(hash, state)| {
                let name = self
                    .registry
                    .resolve(*hash)
                    .map(|l| l.name.clone())
                    .unwrap_or_else(|| format!("unknown:{hash:x}"));
                (
                    name,
                    EndpointSnapshot {
                        requests: state.requests_tick,
                        rps: state.requests_tick as f64,
                        p50_ms: nan_to_none(state.tick_histogram.get_percentile(50.0)),
                        p95_ms: nan_to_none(state.tick_histogram.get_percentile(95.0)),
                        p99_ms: nan_to_none(state.tick_histogram.get_percentile(99.0)),
                        errors: state.errors_tick,
                        error_rate: if state.requests_tick > 0 {
                            state.errors_tick as f64 / state.requests_tick as f64
                        } else {
                            0.0
                        },
                    },
                )
            })
            .collect()
    }
}

fn nan_to_none(v: f64) -> Option<f64> {
    if v.is_nan() {
        None
    } else {
        Some(v)
    }
}
