//! Run configuration (ambient stack): environment-variable loading for
//! everything the core pipeline needs to start a run — target URL, load
//! pattern, worker topology, rate limiting, and the HTTP client.
//!
//! Built around `Config::from_env()` / `env_required` / `env_parse_or`
//! helpers and a validate-then-build flow, extended with the pattern/worker/
//! rate-limit settings a multi-process load-generation core needs beyond a
//! single-process RPS/concurrency model.

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::client::ClientConfig;
use crate::pattern::Pattern;
use crate::utils::parse_duration_string;

/// Configuration errors with descriptive messages.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("invalid duration format for {var}: {message}")]
    InvalidDuration { var: String, message: String },

    #[error("URL validation failed: {0}")]
    InvalidUrl(String),

    #[error("invalid pattern spec: {0}")]
    InvalidPattern(String),

    #[error("target concurrency {target} exceeds configured maximum {max}")]
    ConcurrencyExceedsMaximum { target: u32, max: u32 },
}

/// Run configuration for the load-generation core: every component's
/// inputs collected in one place.
#[derive(Debug, Clone)]
pub struct Config {
    pub scenario_name: String,
    pub target_url: String,

    pub pattern: Pattern,
    pub test_duration: Duration,
    pub tick_interval: Duration,

    /// Upper bound a pattern's target concurrency must never exceed; a
    /// pattern that samples above this at any tick is rejected with
    /// `ConfigurationError`.
    pub max_concurrency: u32,

    pub worker_count: usize,
    pub min_workers: usize,
    pub grace_period: Duration,

    pub request_timeout: Duration,
    pub rate_limit_rps: f64,
    pub rate_limit_burst: f64,

    pub think_time_min: Duration,
    pub think_time_max: Duration,

    pub custom_headers: Option<String>,
    pub metrics_port: Option<u16>,
    pub report_path: Option<String>,
}

fn env_required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.into()))
}

fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_duration_or(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    match env::var(name) {
        Ok(val) => parse_duration_string(&val).map_err(|message| ConfigError::InvalidDuration {
            var: name.into(),
            message,
        }),
        Err(_) => Ok(default),
    }
}

/// Parses a compact pattern spec, e.g. `constant(50)`, `ramp(0,100,30)`,
/// `step(10,5,2,3)`, `spike(5,50,3)`, `diurnal(10,110,86400)`. Composite
/// patterns are not representable in the env-var surface — build them in
/// code against `Pattern::Composite` directly.
pub fn parse_pattern_spec(spec: &str) -> Result<Pattern, ConfigError> {
    let spec = spec.trim();
    let (kind, args) = spec
        .split_once('(')
        .ok_or_else(|| ConfigError::InvalidPattern(format!("expected 'kind(args)', got '{spec}'")))?;
    let args = args
        .strip_suffix(')')
        .ok_or_else(|| ConfigError::InvalidPattern(format!("unterminated args in '{spec}'")))?;
    let parts: Vec<&str> = if args.trim().is_empty() {
        Vec::new()
    } else {
        args.split(',').map(str::trim).collect()
    };

    let parse_u32 = |s: &str| -> Result<u32, ConfigError> {
        s.parse()
            .map_err(|_| ConfigError::InvalidPattern(format!("expected an integer, got '{s}'")))
    };
    let parse_i32 = |s: &str| -> Result<i32, ConfigError> {
        s.parse()
            .map_err(|_| ConfigError::InvalidPattern(format!("expected an integer, got '{s}'")))
    };
    let parse_f64 = |s: &str| -> Result<f64, ConfigError> {
        s.parse()
            .map_err(|_| ConfigError::InvalidPattern(format!("expected a number, got '{s}'")))
    };

    match (kind.to_lowercase().as_str(), parts.as_slice()) {
        ("constant", [n]) => Ok(Pattern::Constant(parse_u32(n)?)),
        ("ramp", [start, end, dur]) => Ok(Pattern::Ramp {
            start: parse_u32(start)?,
            end: parse_u32(end)?,
            ramp_duration: parse_f64(dur)?,
        }),
        ("step", [start, step_size, step_duration, steps]) => Ok(Pattern::Step {
            start: parse_u32(start)?,
            step_size: parse_i32(step_size)?,
            step_duration: parse_f64(step_duration)?,
            steps: parse_u32(steps)?,
        }),
        ("spike", [base, spike_users, spike_duration]) => Ok(Pattern::Spike {
            base: parse_u32(base)?,
            spike_users: parse_u32(spike_users)?,
            spike_duration: parse_f64(spike_duration)?,
        }),
        ("diurnal", [min, max, period]) => Ok(Pattern::Diurnal {
            min: parse_u32(min)?,
            max: parse_u32(max)?,
            period: parse_f64(period)?,
        }),
        (other, _) => Err(ConfigError::InvalidPattern(format!(
            "unknown pattern kind '{other}', or wrong argument count"
        ))),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let target_url = env_required("TARGET_URL")?;
        let scenario_name = env::var("SCENARIO_NAME").unwrap_or_else(|_| "default".to_string());

        let pattern_spec = env::var("PATTERN").unwrap_or_else(|_| "constant(10)".to_string());
        let pattern = parse_pattern_spec(&pattern_spec)?;

        let test_duration = env_duration_or("TEST_DURATION", Duration::from_secs(2 * 60 * 60))?;
        let tick_interval = env_duration_or("TICK_INTERVAL", Duration::from_secs(1))?;

        let max_concurrency: u32 = env_parse_or("MAX_CONCURRENCY", 100_000)?;

        let default_workers = num_cpus::get().max(1);
        let worker_count: usize = env_parse_or("WORKER_COUNT", default_workers)?;
        let min_workers: usize = env_parse_or("MIN_WORKERS", 1)?;

        let grace_period = env_duration_or("GRACE_PERIOD", Duration::from_secs(5))?;
        let request_timeout = env_duration_or("REQUEST_TIMEOUT", Duration::from_secs(30))?;

        let rate_limit_rps: f64 = env_parse_or("RATE_LIMIT_RPS", 0.0)?;
        let rate_limit_burst: f64 = env_parse_or("RATE_LIMIT_BURST", rate_limit_rps.max(1.0))?;

        let think_time_min = env_duration_or("THINK_TIME_MIN", Duration::ZERO)?;
        let think_time_max = env_duration_or("THINK_TIME_MAX", think_time_min)?;

        let custom_headers = env::var("CUSTOM_HEADERS").ok();
        let metrics_port: Option<u16> = match env::var("METRICS_PORT") {
            Ok(v) => Some(v.parse().map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
                var: "METRICS_PORT".into(),
                message: e.to_string(),
            })?),
            Err(_) => None,
        };
        let report_path = env::var("REPORT_PATH").ok();

        let config = Config {
            scenario_name,
            target_url,
            pattern,
            test_duration,
            tick_interval,
            max_concurrency,
            worker_count,
            min_workers,
            grace_period,
            request_timeout,
            rate_limit_rps,
            rate_limit_burst,
            think_time_min,
            think_time_max,
            custom_headers,
            metrics_port,
            report_path,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration for consistency and rejects a pattern that
    /// exceeds `max_concurrency` at any sampled tick.
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.target_url.starts_with("http://") && !self.target_url.starts_with("https://") {
            return Err(ConfigError::InvalidUrl(
                "TARGET_URL must start with http:// or https://".into(),
            ));
        }

        if self.worker_count == 0 {
            return Err(ConfigError::InvalidValue {
                var: "WORKER_COUNT".into(),
                message: "must be greater than 0".into(),
            });
        }

        if self.min_workers == 0 || self.min_workers > self.worker_count {
            return Err(ConfigError::InvalidValue {
                var: "MIN_WORKERS".into(),
                message: "must be between 1 and WORKER_COUNT".into(),
            });
        }

        if self.tick_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                var: "TICK_INTERVAL".into(),
                message: "must be greater than 0".into(),
            });
        }

        let peak = self
            .pattern
            .sample_ticks(self.test_duration.as_secs_f64(), self.tick_interval.as_secs_f64())
            .into_iter()
            .map(|(_, target)| target)
            .max()
            .unwrap_or(0);
        if peak > self.max_concurrency {
            return Err(ConfigError::ConcurrencyExceedsMaximum {
                target: peak,
                max: self.max_concurrency,
            });
        }

        Ok(())
    }

    /// Creates a default `Config` for testing purposes.
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Config {
            scenario_name: "test".into(),
            target_url: "https://example.com".into(),
            pattern: Pattern::Constant(10),
            test_duration: Duration::from_secs(60),
            tick_interval: Duration::from_secs(1),
            max_concurrency: 100_000,
            worker_count: 2,
            min_workers: 1,
            grace_period: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            rate_limit_rps: 0.0,
            rate_limit_burst: 1.0,
            think_time_min: Duration::ZERO,
            think_time_max: Duration::ZERO,
            custom_headers: None,
            metrics_port: None,
            report_path: None,
        }
    }

    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            request_timeout: Some(self.request_timeout),
            custom_headers: self.custom_headers.clone(),
            pool_config: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "TARGET_URL",
        "SCENARIO_NAME",
        "PATTERN",
        "TEST_DURATION",
        "TICK_INTERVAL",
        "MAX_CONCURRENCY",
        "WORKER_COUNT",
        "MIN_WORKERS",
        "GRACE_PERIOD",
        "REQUEST_TIMEOUT",
        "RATE_LIMIT_RPS",
        "RATE_LIMIT_BURST",
        "THINK_TIME_MIN",
        "THINK_TIME_MAX",
        "CUSTOM_HEADERS",
        "METRICS_PORT",
        "REPORT_PATH",
    ];

    fn clear_env_vars() {
        for var in ALL_VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn defaults_with_minimal_config() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        env::set_var("TARGET_URL", "https://example.com");

        let config = Config::from_env().unwrap();
        assert_eq!(config.target_url, "https://example.com");
        assert!(matches!(config.pattern, Pattern::Constant(10)));
        assert_eq!(config.test_duration, Duration::from_secs(7200));
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.min_workers, 1);

        clear_env_vars();
    }

    #[test]
    fn missing_target_url_returns_error() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(ref v)) if v == "TARGET_URL"));
        clear_env_vars();
    }

    #[test]
    fn invalid_url_format_returns_error() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        env::set_var("TARGET_URL", "not-a-url");
        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::InvalidUrl(_))));
        clear_env_vars();
    }

    #[test]
    fn ramp_pattern_parses() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        env::set_var("TARGET_URL", "https://example.com");
        env::set_var("PATTERN", "ramp(0,100,30)");

        let config = Config::from_env().unwrap();
        match config.pattern {
            Pattern::Ramp { start, end, ramp_duration } => {
                assert_eq!(start, 0);
                assert_eq!(end, 100);
                assert_eq!(ramp_duration, 30.0);
            }
            other => panic!("expected Ramp, got {other:?}"),
        }
        clear_env_vars();
    }

    #[test]
    fn step_pattern_parses() {
        let pattern = parse_pattern_spec("step(10,5,2,3)").unwrap();
        match pattern {
            Pattern::Step { start, step_size, step_duration, steps } => {
                assert_eq!(start, 10);
                assert_eq!(step_size, 5);
                assert_eq!(step_duration, 2.0);
                assert_eq!(steps, 3);
            }
            other => panic!("expected Step, got {other:?}"),
        }
    }

    #[test]
    fn unknown_pattern_kind_is_rejected() {
        assert!(parse_pattern_spec("bogus(1,2)").is_err());
    }

    #[test]
    fn concurrency_exceeding_maximum_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        env::set_var("TARGET_URL", "https://example.com");
        env::set_var("PATTERN", "constant(500)");
        env::set_var("MAX_CONCURRENCY", "100");

        let result = Config::from_env();
        assert!(matches!(
            result,
            Err(ConfigError::ConcurrencyExceedsMaximum { target: 500, max: 100 })
        ));
        clear_env_vars();
    }

    #[test]
    fn zero_worker_count_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        env::set_var("TARGET_URL", "https://example.com");
        env::set_var("WORKER_COUNT", "0");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::InvalidValue { ref var, .. }) if var == "WORKER_COUNT"));
        clear_env_vars();
    }

    #[test]
    fn min_workers_greater_than_worker_count_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();
        env::set_var("TARGET_URL", "https://example.com");
        env::set_var("WORKER_COUNT", "2");
        env::set_var("MIN_WORKERS", "5");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::InvalidValue { ref var, .. }) if var == "MIN_WORKERS"));
        clear_env_vars();
    }

    #[test]
    fn to_client_config_maps_timeout_and_headers() {
        let mut config = Config::for_testing();
        config.request_timeout = Duration::from_secs(15);
        config.custom_headers = Some("X-Test:1".into());
        let client_config = config.to_client_config();
        assert_eq!(client_config.request_timeout, Some(Duration::from_secs(15)));
        assert_eq!(client_config.custom_headers.as_deref(), Some("X-Test:1"));
    }
}
