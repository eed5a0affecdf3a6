//! netscope_agent: samples bandwidth, latency and link health into a
//! snapshot store and records each run under the history directory.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use netscope_agent::latency::DEFAULT_PROBE_TARGET;
use netscope_agent::state::DEFAULT_HISTORY_CAPACITY;
use netscope_agent::status::spawn_status_reporter;
use netscope_agent::types::format_speed;
use netscope_agent::{api, Engine, EngineConfig, SpeedtestMode};

/// Network telemetry agent.
#[derive(Debug, Parser)]
#[command(name = "netscope_agent", version, about)]
struct Cli {
    /// Interface to monitor (default: every non-loopback interface).
    #[arg(long, env = "NETSCOPE_INTERFACE")]
    interface: Option<String>,

    /// Root directory for session folders.
    #[arg(long, env = "NETSCOPE_HISTORY_DIR", default_value = "History")]
    history_dir: PathBuf,

    /// Warn when download drops under this many Mbps.
    #[arg(short, long, env = "NETSCOPE_THRESHOLD", default_value_t = 1.0)]
    threshold: f64,

    /// Seconds between full snapshot saves.
    #[arg(short, long, env = "NETSCOPE_SAVE_INTERVAL", default_value_t = 300)]
    save_interval: u64,

    /// History points kept in memory.
    #[arg(long, env = "NETSCOPE_HISTORY_CAPACITY", default_value_t = DEFAULT_HISTORY_CAPACITY)]
    history_capacity: usize,

    #[arg(long, env = "NETSCOPE_SPEEDTEST_MODE", value_enum, default_value_t = SpeedtestMode::Periodic)]
    speedtest_mode: SpeedtestMode,

    /// Length of the startup upload test in seconds (0 disables it).
    #[arg(long, env = "NETSCOPE_UPLOAD_TEST_SECS", default_value_t = 10)]
    upload_test_secs: u64,

    /// host:port whose TCP handshake time is the latency probe.
    #[arg(long, env = "NETSCOPE_PROBE_TARGET", default_value = DEFAULT_PROBE_TARGET)]
    probe_target: String,

    /// Skip geo lookup, upload test and speed test.
    #[arg(long, env = "NETSCOPE_NO_NETWORK_TESTS")]
    no_network_tests: bool,

    /// Serve the snapshot over HTTP/WebSocket on this address.
    #[arg(long, env = "NETSCOPE_LISTEN")]
    listen: Option<SocketAddr>,

    /// Require ?token=<token> on the snapshot API.
    #[arg(long, env = "NETSCOPE_TOKEN")]
    token: Option<String>,

    /// Seconds between status lines.
    #[arg(long, env = "NETSCOPE_STATUS_SECS", default_value_t = 10)]
    status_secs: u64,

    /// Logging verbosity (trace, debug, info, warn, error). RUST_LOG wins.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> EngineConfig {
        EngineConfig {
            interface: self.interface,
            history_dir: self.history_dir,
            threshold_mbps: self.threshold,
            save_interval: Duration::from_secs(self.save_interval),
            history_capacity: self.history_capacity,
            speedtest_mode: self.speedtest_mode,
            upload_test: Duration::from_secs(self.upload_test_secs),
            probe_target: self.probe_target,
            offline: self.no_network_tests,
            listen: self.listen,
            token: self.token,
            status_interval: Duration::from_secs(self.status_secs),
            ..EngineConfig::default()
        }
        .normalized()
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => EnvFilter::try_new(&cli.log_level)
            .with_context(|| format!("invalid log level: {}", cli.log_level))?,
    };
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    let config = cli.into_config();
    info!(version = env!("CARGO_PKG_VERSION"), "starting netscope_agent");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(config))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

async fn run(config: EngineConfig) -> Result<()> {
    // Bind before starting the engine so a bad address fails fast.
    let listener = match config.listen {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding snapshot API on {addr}"))?,
        ),
        None => None,
    };

    let engine = Engine::start_system(config.clone())
        .await
        .context("starting telemetry engine")?;
    let store = engine.store();

    let aux = CancellationToken::new();
    let status = spawn_status_reporter(store.clone(), config.threshold_mbps, config.status_interval, aux.clone());
    let api_task = listener.map(|l| tokio::spawn(api::serve(l, store.clone(), config.token.clone(), aux.clone())));

    shutdown_signal().await;

    aux.cancel();
    let report = engine.shutdown(config.shutdown_grace).await;
    let _ = status.await;
    if let Some(task) = api_task {
        match task.await {
            Ok(Err(e)) => warn!(error = %e, "snapshot API stopped with error"),
            Err(e) => warn!(error = %e, "snapshot API task failed"),
            Ok(Ok(())) => {}
        }
    }

    let snap = store.read_current();
    info!(
        rows = report.rows_written,
        snapshots = report.full_writes,
        peak_download = %format_speed(snap.top_download_bps),
        peak_upload = %format_speed(snap.top_upload_bps),
        "netscope_agent stopped"
    );
    Ok(())
}
