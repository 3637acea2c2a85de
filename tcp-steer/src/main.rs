//! tcp-steer: transparent stateless TCP load balancer.
//!
//! Inspects every inbound frame before the normal protocol stack, and
//! rewrites the IPv4 destination of TCP flows targeting monitored ports to a
//! round-robin-selected backend, repairing the header checksum in place.
//! Two data-path renditions behind one config key:
//!   - xdp:       the decision core runs as an XDP program in the kernel
//!                (fastest; requires root and a compiled eBPF ELF)
//!   - userspace: the same core over an AF_PACKET socket with worker
//!                threads (portable; no verifier involved)
//!
//! The daemon is the control plane either way: it owns the backend pool,
//! the listener set, and the stats surface; the data path only reads them.

mod config;
mod engine;
mod metrics;
mod stats;
mod userspace;
mod xdp_manager;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use config::{Config, SteerMode};
use engine::SteerState;
use metrics::MetricsState;
use userspace::UserspaceForwarder;
use xdp_manager::XdpManager;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "tcp-steer",
    about = "Transparent stateless TCP load balancer with an XDP fast path",
    version
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Path to the compiled XDP eBPF program ELF binary.
    /// Required when using xdp mode.
    #[arg(long, default_value = "tcp-steer-ebpf-xdp")]
    xdp_program: PathBuf,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "starting tcp-steer"
    );

    // Load and validate config
    let config = Config::load(&cli.config).context("loading configuration")?;
    info!(
        interface = %config.interface,
        mode = ?config.mode,
        listeners = config.listeners.len(),
        backends = config.backends.len(),
        "configuration loaded"
    );

    // --- Initialize the configured data path ---
    let xdp_manager: Arc<Mutex<Option<XdpManager>>> = Arc::new(Mutex::new(None));
    let mut forwarder: Option<UserspaceForwarder> = None;
    let mut userspace_stats: Vec<Arc<engine::SteerStats>> = Vec::new();

    match config.mode {
        SteerMode::Xdp => {
            let ebpf_bytes = std::fs::read(&cli.xdp_program).with_context(|| {
                format!(
                    "reading XDP eBPF program from {}. Build it with: cargo xtask build-ebpf-xdp",
                    cli.xdp_program.display()
                )
            })?;

            let mut mgr = XdpManager::load(&ebpf_bytes).context("loading XDP eBPF program")?;
            mgr.setup(&config).context("setting up XDP data path")?;

            *xdp_manager.lock().await = Some(mgr);
            info!("XDP data path initialized");
        }
        SteerMode::Userspace => {
            // The daemon is the control plane: populate the shared state the
            // workers read.
            let state = Arc::new(SteerState::new());
            for &port in &config.listeners {
                state.add_listener(port);
            }
            for (i, backend) in config.backends.iter().enumerate() {
                state.set_backend(i, *backend);
            }

            let fwd = UserspaceForwarder::start(&config, state)
                .context("starting userspace forwarder")?;
            userspace_stats = fwd.stats.clone();
            forwarder = Some(fwd);
            info!("userspace data path initialized");
        }
    }

    let metrics_state = MetricsState {
        xdp_manager: xdp_manager.clone(),
        userspace_stats: Arc::new(userspace_stats),
    };

    // --- Start periodic stats reporter ---
    let stats_handle = if config.stats_interval_secs > 0 {
        let state = metrics_state.clone();
        let interval = Duration::from_secs(config.stats_interval_secs);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                for (path, snap) in state.collect().await {
                    info!(
                        path,
                        processed = snap.processed,
                        redirected = snap.redirected,
                        passed = snap.passed,
                        aborted = snap.aborted,
                        "stats"
                    );
                }
            }
        }))
    } else {
        None
    };

    // --- Start metrics server ---
    let metrics_handle = if config.metrics.enabled {
        let metrics_config = config.metrics.clone();
        let state = metrics_state.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = metrics::serve_metrics(&metrics_config, state).await {
                error!(error = %e, "metrics server error");
            }
        }))
    } else {
        None
    };

    // --- Wait for shutdown signal ---
    info!("tcp-steer is running. Press Ctrl+C to stop.");

    shutdown_signal().await;

    info!("shutdown signal received, cleaning up...");

    // --- Graceful shutdown ---

    if let Some(handle) = stats_handle {
        handle.abort();
    }

    if let Some(handle) = metrics_handle {
        handle.abort();
    }

    if let Some(fwd) = forwarder {
        fwd.shutdown();
    }

    if let Some(mgr) = xdp_manager.lock().await.take() {
        if let Err(e) = mgr.detach() {
            warn!(error = %e, "error detaching XDP program");
        }
    }

    info!("tcp-steer stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Signal Handling
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
