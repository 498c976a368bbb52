//! LoadForge: an HTTP load-testing engine built around a load-pattern
//! scheduler, a multi-process worker fleet, a lock-free shared-memory
//! metrics pipeline, and streaming HDR percentile aggregation.
//!
//! The binary entry point (`main.rs`) wires these modules into a
//! coordinator process and a worker-subprocess mode; this crate exposes the
//! pieces so they can be exercised independently in tests or embedded
//! elsewhere.

pub mod aggregator;
pub mod client;
pub mod config;
pub mod connection_pool;
pub mod coordinator;
pub mod errors;
pub mod hdr;
pub mod label_registry;
pub mod metrics;
pub mod metrics_model;
pub mod pattern;
pub mod rate_limiter;
pub mod report;
pub mod ring_buffer;
pub mod scenario;
pub mod scheduler;
pub mod utils;
pub mod worker;
