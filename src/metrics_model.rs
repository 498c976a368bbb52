//! Data model: `RequestMetric`, `EndpointLabel`, `MetricSnapshot`, and
//! `TestResult`. `MetricSnapshot` and `TestResult` derive `Serialize` /
//! `Deserialize` so JSON round-trips are identity modulo floating-point
//! tolerance.

use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::errors::ErrorCategory;

/// One HTTP method, encoded as a small enum for the on-wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Method {
    Get = 0,
    Post = 1,
    Put = 2,
    Patch = 3,
    Delete = 4,
    Head = 5,
    Options = 6,
}

impl Method {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Method::Get,
            1 => Method::Post,
            2 => Method::Put,
            3 => Method::Patch,
            4 => Method::Delete,
            5 => Method::Head,
            _ => Method::Options,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

/// FNV-1a over a registered endpoint label, matching the wire hash.
pub fn fnv1a_hash(name: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for byte in name.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// One completed HTTP attempt, as produced by a worker. Mirrors the 32-byte
/// wire record exactly; see `ring_buffer::Slot` for the packed form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestMetric {
    pub timestamp: f64,
    pub name_hash: u64,
    pub method: Method,
    pub status_code: u16,
    pub latency_ms: f32,
    pub content_length: u32,
    pub worker_id: u8,
    pub error_category: ErrorCategory,
}

impl RequestMetric {
    /// Validates the invariant relating `status_code` and
    /// `error_category`.
    pub fn is_well_formed(&self) -> bool {
        if self.status_code > 0 {
            matches!(
                self.error_category,
                ErrorCategory::None | ErrorCategory::Status4xx | ErrorCategory::Status5xx
            )
        } else {
            !matches!(self.error_category, ErrorCategory::None)
        }
    }
}

/// A registered, human-readable endpoint name, deduplicated by the
/// aggregator. `hash` collisions between distinct names are resolved by
/// suffixing the second name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointLabel {
    pub hash: u64,
    pub name: String,
    pub method: Method,
}

/// Per-endpoint rollup inside a `MetricSnapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    pub requests: u64,
    pub rps: f64,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub errors: u64,
    pub error_rate: f64,
}

/// One second of aggregated metrics. Produced by the aggregator,
/// appended to `TestResult`, and delivered to `on_snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub wall_timestamp_unix_secs: f64,
    pub elapsed_secs: f64,
    pub target_concurrency: u32,
    pub active_users: u32,

    pub total_requests: u64,
    pub requests_this_tick: u64,
    pub requests_per_second: f64,

    pub p50_ms: Option<f64>,
    pub p75_ms: Option<f64>,
    pub p90_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub p999_ms: Option<f64>,
    pub latency_min_ms: Option<f64>,
    pub latency_max_ms: Option<f64>,
    pub latency_avg_ms: Option<f64>,

    pub total_errors: u64,
    pub errors_this_tick: u64,
    pub error_rate: f64,
    pub errors_by_status: HashMap<u16, u64>,
    pub errors_by_category: HashMap<String, u64>,

    pub endpoints: HashMap<String, EndpointSnapshot>,

    /// Ring-buffer records lost to overflow this tick, across all workers.
    pub dropped_records: u64,
    /// Distinct endpoint-hash collisions observed so far.
    pub label_collisions: u64,
}

/// Metadata about a worker failure observed during the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerFailureEvent {
    pub worker_id: u8,
    pub elapsed_secs: f64,
    pub reason: String,
    pub restarted: bool,
}

/// The full record of one run. Owned by the coordinator; the
/// aggregator only appends through `TestResult::push_snapshot`, never
/// mutates existing entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub scenario_name: String,
    pub pattern_description: String,
    pub start_unix_secs: f64,
    pub end_unix_secs: f64,
    pub duration_secs: f64,
    pub snapshots: Vec<MetricSnapshot>,
    pub cumulative: Option<MetricSnapshot>,
    pub worker_failures: Vec<WorkerFailureEvent>,
    pub failure_reason: Option<String>,
}

impl TestResult {
    pub fn new(scenario_name: String, pattern_description: String, start: SystemTime) -> Self {
        let start_unix_secs = start
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Self {
            scenario_name,
            pattern_description,
            start_unix_secs,
            end_unix_secs: start_unix_secs,
            duration_secs: 0.0,
            snapshots: Vec::new(),
            cumulative: None,
            worker_failures: Vec::new(),
            failure_reason: None,
        }
    }

    /// Append-only: the aggregator is the only writer, and it only ever adds
    /// new snapshots, never edits past ones.
    pub fn push_snapshot(&mut self, snapshot: MetricSnapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn finish(&mut self, end: SystemTime, cumulative: MetricSnapshot) {
        self.end_unix_secs = end
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        self.duration_secs = (self.end_unix_secs - self.start_unix_secs).max(0.0);
        self.cumulative = Some(cumulative);
    }

    pub fn record_worker_failure(&mut self, event: WorkerFailureEvent) {
        self.worker_failures.push(event);
    }
}
