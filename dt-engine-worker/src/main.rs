//! dt-engine-worker — background worker process: applies pending metadata
//! migrations, then runs the scheduler tick loop alongside a priority-poll
//! worker loop (spec §4.7, §4.9), serving `/metrics` and `/health` over
//! `axum`. The reference implementation ran this same logic inside
//! Postgres as a `BackgroundWorker` (`src/scheduler.rs`); here it is a
//! plain `tokio` binary against a standalone metadata database.

mod metrics_prometheus;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use dt_engine_core::config::Config;
use dt_engine_core::coordinator::Coordinator;
use dt_engine_core::executor::RefreshExecutor;
use dt_engine_core::lake::{LakeClient, PostgresLake};
use dt_engine_core::metadata::{MetadataStore, PostgresMetadataStore};
use dt_engine_core::metrics::MetricsSink;
use dt_engine_core::migrate;
use dt_engine_core::scheduler::{Scheduler, WorkerLoop};
use tokio::net::TcpListener;
use tokio_postgres::{Client, NoTls};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use metrics_prometheus::PrometheusMetrics;

#[derive(Parser, Debug)]
#[command(name = "dt-engine-worker", about = "Background worker for the dynamic table refresh engine")]
struct Cli {
    /// Path to a TOML config file (spec §6.4). Missing file falls back to
    /// defaults.
    #[arg(long, env = "DT_ENGINE_CONFIG", default_value = "config.toml")]
    config: PathBuf,
}

async fn connect(url: &str) -> Result<Client, tokio_postgres::Error> {
    let (client, connection) = tokio_postgres::connect(url, NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!(error = %e, "postgres connection task ended");
        }
    });
    Ok(client)
}

fn load_config(path: &PathBuf) -> Config {
    match std::fs::read_to_string(path) {
        Ok(raw) => Config::from_toml_str(&raw).unwrap_or_else(|e| {
            warn!(error = %e, path = %path.display(), "invalid config file, falling back to defaults");
            Config::default()
        }),
        Err(_) => {
            info!(path = %path.display(), "no config file found, using defaults");
            Config::default()
        }
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn metrics_handler(State(metrics): State<Arc<PrometheusMetrics>>) -> String {
    metrics.render()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config);
    let worker_id = if cfg.worker_id.is_empty() { uuid::Uuid::new_v4().to_string() } else { cfg.worker_id.clone() };

    let metadata_client = match connect(&cfg.metadata_url).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to connect to metadata store");
            std::process::exit(1);
        }
    };

    if let Err(e) = migrate::run(&metadata_client, std::path::Path::new(&cfg.migrations_dir)).await {
        error!(error = %e, "failed to apply metadata migrations");
        std::process::exit(1);
    }

    let lake_client = match connect(cfg.lake_url()).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to connect to lake");
            std::process::exit(1);
        }
    };

    if let Err(e) = migrate::run(&lake_client, std::path::Path::new(&cfg.migrations_dir)).await {
        error!(error = %e, "failed to apply lake migrations");
        std::process::exit(1);
    }

    let metadata: Arc<dyn MetadataStore> = Arc::new(PostgresMetadataStore::new(metadata_client));
    let lake: Arc<dyn LakeClient> = Arc::new(PostgresLake::new(lake_client, "dt_engine_changes"));
    let prom = Arc::new(PrometheusMetrics::new());
    let metrics: Arc<dyn MetricsSink> = prom.clone();

    let executor = Arc::new(RefreshExecutor::new(metadata.clone(), lake.clone()));
    let coordinator = Arc::new(Coordinator::new(
        metadata.clone(),
        lake.clone(),
        executor.clone(),
        cfg.poll_interval(),
        cfg.coordinator_wait_timeout(),
    ));

    let scheduler = Scheduler::new(metadata.clone(), cfg.claim_timeout(), cfg.subtask_retry_max, metrics.clone());
    let worker_loop = Arc::new(WorkerLoop::new(
        metadata.clone(),
        lake.clone(),
        executor.clone(),
        coordinator.clone(),
        worker_id.clone(),
        cfg.poll_interval(),
        cfg.heartbeat_interval(),
        cfg.claim_timeout(),
        cfg.refresh_timeout(),
        cfg.total_workers,
        metrics.clone(),
    ));

    let shutdown = CancellationToken::new();

    let http_shutdown = shutdown.clone();
    let http_bind = cfg.http_bind.clone();
    let http_prom = prom.clone();
    let http_task = tokio::spawn(async move {
        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(http_prom);
        let listener = match TcpListener::bind(&http_bind).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, addr = %http_bind, "failed to bind health/metrics listener");
                return;
            }
        };
        info!(addr = %http_bind, "serving /health and /metrics");
        let _ = axum::serve(listener, app).with_graceful_shutdown(async move { http_shutdown.cancelled().await }).await;
    });

    let tick_shutdown = shutdown.clone();
    let poll_interval = cfg.poll_interval();
    let tick_task = tokio::spawn(async move {
        loop {
            if tick_shutdown.is_cancelled() {
                return;
            }
            if let Err(e) = scheduler.tick().await {
                warn!(error = %e, "scheduler tick failed");
            }
            tokio::select! {
                _ = tick_shutdown.cancelled() => return,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    });

    let poll_shutdown = shutdown.clone();
    let poll_task = tokio::spawn(async move { worker_loop.run(poll_shutdown).await });

    wait_for_shutdown_signal().await;
    info!(worker_id = %worker_id, "shutdown signal received, draining in-flight work");
    shutdown.cancel();

    let _ = tokio::join!(http_task, tick_task, poll_task);
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing a SIGTERM handler should not fail");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
