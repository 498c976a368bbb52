//! Binary entry point: a single executable that acts as the coordinator
//! process by default, and re-execs itself as a worker subprocess when the
//! coordinator's `spawn_worker` closure sets `LOADFORGE_WORKER_ID` /
//! `LOADFORGE_RING_PATH` in the child's environment. Workers receive a path
//! and resolve the scenario independently; no opaque object crosses the
//! process boundary.
//!
//! Reads env config, builds a client, registers Prometheus metrics, and
//! runs the load, split into the two process roles the fleet model
//! requires.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::process::Command;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use loadforge::config::Config;
use loadforge::coordinator;
use loadforge::errors::CoreError;
use loadforge::report;
use loadforge::scenario::{ScenarioDescriptor, Task, ThinkTime};
use loadforge::worker::{self, WorkerConfig};

const WORKER_ID_VAR: &str = "LOADFORGE_WORKER_ID";
const RING_PATH_VAR: &str = "LOADFORGE_RING_PATH";

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let config = Config::from_env()?;

    if let (Ok(worker_id), Ok(ring_path)) = (env::var(WORKER_ID_VAR), env::var(RING_PATH_VAR)) {
        let worker_id: u8 = worker_id
            .parse()
            .map_err(|e| CoreError::fatal(format!("invalid {WORKER_ID_VAR}: {e}")))?;
        return run_worker_mode(config, worker_id, PathBuf::from(ring_path)).await;
    }

    run_coordinator_mode(config).await
}

/// Builds the single hardcoded scenario both process roles resolve
/// independently from `config.target_url`. A real scenario-authoring
/// surface is out of scope; this exercises the full pipeline against one
/// GET endpoint.
fn build_scenario(config: &Config) -> Result<Arc<ScenarioDescriptor>, CoreError> {
    let task = Task::new("root", 1, |client| {
        Box::pin(async move {
            let _ = client.get("/", "root").await;
        })
    });

    let scenario = ScenarioDescriptor::new(config.scenario_name.clone(), config.target_url.clone(), vec![task])?
        .with_think_time(ThinkTime {
            min: config.think_time_min,
            max: config.think_time_max,
        });

    Ok(Arc::new(scenario))
}

async fn run_worker_mode(
    config: Config,
    worker_id: u8,
    ring_path: PathBuf,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!(worker_id, ring_path = %ring_path.display(), "starting in worker mode");
    let scenario = build_scenario(&config)?;

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            let worker_config = WorkerConfig {
                worker_id,
                ring_path,
                scenario,
                client_config: config.to_client_config(),
                rate_limit_rps: config.rate_limit_rps,
                rate_limit_burst: config.rate_limit_burst,
                initial_target: 0,
            };
            worker::run_worker(worker_config).await
        })
        .await?;

    Ok(())
}

async fn run_coordinator_mode(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loadforge::metrics::register_metrics()?;
    if let Some(port) = config.metrics_port {
        // `Registry` wraps its collector list in an `Arc`, so cloning the
        // default registry here still shares everything `register_metrics`
        // just registered into it.
        let registry = Arc::new(std::sync::Mutex::new(prometheus::default_registry().clone()));
        tokio::spawn(loadforge::metrics::start_metrics_server(port, registry));
    }

    // Built once up front purely to surface construction errors (e.g. an
    // empty task list) before spawning any worker process.
    build_scenario(&config)?;

    let exe = env::current_exe()
        .map_err(|e| CoreError::fatal(format!("failed to resolve current executable: {e}")))?;

    let ring_dir =
        tempfile::tempdir().map_err(|e| CoreError::fatal(format!("failed to create ring directory: {e}")))?;
    let ring_dir_path = ring_dir.path().to_path_buf();

    info!(
        scenario = %config.scenario_name,
        pattern = %config.pattern.describe(),
        workers = config.worker_count,
        "starting in coordinator mode"
    );

    let spawn_config = config.clone();
    let result = coordinator::run(
        &config,
        &ring_dir_path,
        move |id, ring_path| {
            let mut command = Command::new(&exe);
            command
                .env(WORKER_ID_VAR, id.to_string())
                .env(RING_PATH_VAR, ring_path)
                .env("TARGET_URL", &spawn_config.target_url)
                .env("SCENARIO_NAME", &spawn_config.scenario_name)
                .env(
                    "REQUEST_TIMEOUT",
                    format!("{}s", spawn_config.request_timeout.as_secs()),
                )
                .kill_on_drop(true);
            if let Some(headers) = &spawn_config.custom_headers {
                command.env("CUSTOM_HEADERS", headers);
            }
            Ok(command)
        },
        |snapshot| {
            info!(
                elapsed = snapshot.elapsed_secs,
                target = snapshot.target_concurrency,
                active = snapshot.active_users,
                rps = snapshot.requests_per_second,
                p95_ms = ?snapshot.p95_ms,
                errors = snapshot.errors_this_tick,
                "tick"
            );
            loadforge::metrics::observe_snapshot(&snapshot);
        },
    )
    .await?;

    if let Some(reason) = &result.failure_reason {
        error!(reason, "run ended with a failure reason");
    }

    if let Some(path) = &config.report_path {
        report::write_json(&result, std::path::Path::new(path))
            .map_err(|e| CoreError::fatal(format!("failed to write report to {path}: {e}")))?;
        info!(path, "wrote final report");
    }

    info!(
        total_requests = result.cumulative.as_ref().map(|c| c.total_requests).unwrap_or(0),
        duration_secs = result.duration_secs,
        "run complete"
    );

    Ok(())
}
