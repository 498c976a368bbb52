//! Error taxonomy for the core pipeline.
//!
//! Two distinct things are categorized here: `ErrorCategory`, the small
//! per-request enum recorded into every `RequestMetric`, and `CoreError`,
//! the kinds of error the pipeline itself can raise. The former is data;
//! the latter is control flow.

use std::fmt;
use thiserror::Error;

/// Per-request error classification, matching the on-wire `error_category`
/// byte. Numeric values are part of the wire contract and must not be
/// reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCategory {
    None = 0,
    Connect = 1,
    Timeout = 2,
    Tls = 3,
    Read = 4,
    Write = 5,
    Status4xx = 6,
    Status5xx = 7,
    Other = 8,
}

impl ErrorCategory {
    /// Categorize a completed HTTP response by status code.
    ///
    /// Returns `None` (the variant, i.e. success) for 2xx/3xx. Maintains the
    /// invariant that `status_code > 0` pairs only with categories in
    /// `{0, 6, 7}`.
    pub fn from_status_code(status_code: u16) -> Self {
        match status_code {
            200..=399 => ErrorCategory::None,
            400..=499 => ErrorCategory::Status4xx,
            500..=599 => ErrorCategory::Status5xx,
            _ => ErrorCategory::Other,
        }
    }

    /// Categorize a `reqwest::Error` raised before a response was received.
    /// Always one of `{1..5, 8}`.
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            ErrorCategory::Timeout
        } else if error.is_connect() {
            ErrorCategory::Connect
        } else if error.is_body() || error.is_decode() {
            ErrorCategory::Read
        } else if error.is_request() {
            ErrorCategory::Write
        } else {
            let msg = error.to_string().to_lowercase();
            if msg.contains("certificate") || msg.contains("tls") || msg.contains("ssl") {
                ErrorCategory::Tls
            } else if msg.contains("timeout") {
                ErrorCategory::Timeout
            } else if msg.contains("dns") || msg.contains("resolve") || msg.contains("connect") {
                ErrorCategory::Connect
            } else {
                ErrorCategory::Other
            }
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => ErrorCategory::None,
            1 => ErrorCategory::Connect,
            2 => ErrorCategory::Timeout,
            3 => ErrorCategory::Tls,
            4 => ErrorCategory::Read,
            5 => ErrorCategory::Write,
            6 => ErrorCategory::Status4xx,
            7 => ErrorCategory::Status5xx,
            _ => ErrorCategory::Other,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::None => "none",
            ErrorCategory::Connect => "connect",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Tls => "tls",
            ErrorCategory::Read => "read",
            ErrorCategory::Write => "write",
            ErrorCategory::Status4xx => "status_4xx",
            ErrorCategory::Status5xx => "status_5xx",
            ErrorCategory::Other => "other",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Errors the core pipeline itself can raise, as distinct from per-request
/// transport failures (which are data, never propagated).
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("worker {worker_id} failed: {reason}")]
    WorkerFailure { worker_id: u8, reason: String },

    #[error("ring buffer overflow on worker {worker_id}: {dropped} records dropped")]
    AggregatorOverflow { worker_id: u8, dropped: u64 },

    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        CoreError::Configuration(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        CoreError::Fatal(msg.into())
    }
}
