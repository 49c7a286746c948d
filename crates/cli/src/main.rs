#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, ValueEnum};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use xposer_apply::KubeApplier;
use xposer_controller::{Context, Controller, ControllerConfig, SyncFailurePolicy};
use xposer_queue::QueueConfig;

#[derive(Parser, Debug)]
#[command(name = "xposer", version, about = "Expose labelled Deployments through Services and Ingresses")]
struct Cli {
    /// Path to a kubeconfig file (falls back to in-cluster config)
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Watch a single namespace instead of the whole cluster
    #[arg(long, env = "XPOSER_NAMESPACE")]
    namespace: Option<String>,

    /// Number of reconcile workers
    #[arg(long, env = "XPOSER_WORKERS", default_value_t = 1)]
    workers: usize,

    /// How long to wait for the initial Deployment listing
    #[arg(long, env = "XPOSER_SYNC_TIMEOUT_SECS", default_value_t = 60)]
    sync_timeout_secs: u64,

    /// What to do if the initial listing does not complete
    #[arg(long, env = "XPOSER_ON_SYNC_FAILURE", value_enum, default_value_t = OnSyncFailure::Abort)]
    on_sync_failure: OnSyncFailure,

    /// Upper bound for a single create call
    #[arg(long, env = "XPOSER_APPLY_TIMEOUT_SECS", default_value_t = 10)]
    apply_timeout_secs: u64,

    /// Transient failures per workload before the item is dropped
    #[arg(long, env = "XPOSER_MAX_REQUEUES", default_value_t = 5)]
    max_requeues: u32,

    /// First retry delay
    #[arg(long, env = "XPOSER_BACKOFF_BASE_MS", default_value_t = 5)]
    backoff_base_ms: u64,

    /// Retry delay ceiling
    #[arg(long, env = "XPOSER_BACKOFF_MAX_SECS", default_value_t = 1000)]
    backoff_max_secs: u64,

    /// Re-enqueue every cached Deployment this often (0 disables)
    #[arg(long, env = "XPOSER_RESYNC_SECS", default_value_t = 600)]
    resync_secs: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OnSyncFailure { Abort, Continue }

impl From<OnSyncFailure> for SyncFailurePolicy {
    fn from(v: OnSyncFailure) -> Self {
        match v {
            OnSyncFailure::Abort => SyncFailurePolicy::Abort,
            OnSyncFailure::Continue => SyncFailurePolicy::Continue,
        }
    }
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers.max(1),
            sync_timeout: Duration::from_secs(self.sync_timeout_secs),
            on_sync_failure: self.on_sync_failure.into(),
            apply_timeout: Duration::from_secs(self.apply_timeout_secs),
            max_requeues: self.max_requeues,
            resync: Duration::from_secs(self.resync_secs),
            queue: QueueConfig {
                backoff_base: Duration::from_millis(self.backoff_base_ms),
                backoff_max: Duration::from_secs(self.backoff_max_secs),
            },
        }
    }
}

fn init_tracing() {
    let env = std::env::var("XPOSER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

/// Parse the exporter listen address. Unset or blank means no exporter.
fn metrics_addr(raw: Option<&str>) -> Result<Option<SocketAddr>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(addr) => addr
            .parse::<SocketAddr>()
            .map(Some)
            .with_context(|| format!("invalid XPOSER_METRICS_ADDR {addr:?}; expected host:port")),
        None => Ok(None),
    }
}

fn init_metrics() -> Result<()> {
    let raw = std::env::var("XPOSER_METRICS_ADDR").ok();
    let Some(sock) = metrics_addr(raw.as_deref())? else {
        return Ok(());
    };
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(sock)
        .install()
        .context("installing Prometheus exporter")?;
    info!(addr = %sock, "Prometheus metrics exporter listening");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("received ctrl-c");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics()?;
    let cli = Cli::parse();
    let config = cli.controller_config();
    info!(ns = ?cli.namespace, workers = config.workers, "xposer starting");

    let client = xposer_kubehub::client(cli.kubeconfig.as_deref()).await.context("building Kubernetes client")?;
    let (tx, rx) = mpsc::channel(1024);
    let (cache, watcher) = xposer_kubehub::start_watcher(client.clone(), cli.namespace.as_deref(), tx);
    let applier = KubeApplier::new(client);
    let ctx = Context::new(Arc::new(cache), Arc::new(applier), config);

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut run = tokio::spawn(Controller::new(ctx).run(rx, stop_rx));

    let result = tokio::select! {
        res = &mut run => res,
        sig = shutdown_signal() => {
            if let Err(e) = sig {
                error!(error = %e, "signal handling failed; shutting down");
            }
            let _ = stop_tx.send(true);
            run.await
        }
    };
    watcher.abort();

    match result.context("controller task panicked")? {
        Ok(()) => {
            info!("xposer stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "controller failed");
            Err(e.into())
        }
    }
}
