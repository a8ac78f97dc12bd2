//! Outreach worker
//!
//! Single-binary service that:
//! 1. Loads config and builds the execution core once
//! 2. Serves /health and /metrics on the admin listener
//! 3. Runs one processing pass (`--once`) or polls until SIGINT/SIGTERM
//! 4. Closes every pooled connection on the way out

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use outreach_worker::admin::{AdminState, build_router};
use outreach_worker::{Config, Mode, Runtime};

/// Command-line flags. Unknown arguments are ignored.
#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<String>,
    once: bool,
}

fn parse_args(args: &[String]) -> Args {
    Args {
        config: args
            .iter()
            .position(|a| a == "--config")
            .and_then(|i| args.get(i + 1))
            .cloned(),
        once: args.iter().any(|a| a == "--once"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON output, LOG_LEVEL then RUST_LOG then info
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting outreach-worker");

    // Recorder must exist before any component emits metrics
    let prometheus = outreach_worker::metrics::install_recorder()
        .context("failed to install Prometheus recorder")?;

    let argv: Vec<String> = std::env::args().collect();
    let args = parse_args(&argv);

    let config_path = Config::resolve_path(args.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");
    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    if args.once {
        config.worker.mode = Mode::Once;
    }

    info!(
        mode = ?config.worker.mode,
        workers = config.worker.workers,
        batch_size = config.worker.batch_size,
        poll_interval_secs = config.worker.poll_interval_secs,
        persistent = config.storage.database_url.is_some(),
        services = config.rate_limits.len(),
        "configuration loaded"
    );

    let runtime = Arc::new(
        Runtime::build(config)
            .await
            .context("failed to build worker runtime")?,
    );

    let (stop_tx, stop_rx) = watch::channel(false);

    let admin = match runtime.config().worker.admin_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| outreach_worker::Error::Bind { addr, source })?;
            let app = build_router(
                AdminState {
                    runtime: runtime.clone(),
                    prometheus,
                },
                runtime.config().worker.admin_max_connections,
            );
            let mut admin_stop = stop_rx.clone();
            info!(addr = %addr, "admin listener ready");
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = admin_stop.wait_for(|stop| *stop).await;
                    })
                    .await
            }))
        }
        None => None,
    };

    match runtime.config().worker.mode {
        Mode::Once => {
            let report = runtime.run_once().await.context("processing pass failed")?;
            info!(
                fetched = report.fetched,
                completed = report.completed,
                retried = report.retried,
                deferred = report.deferred,
                failed = report.failed,
                "run-once pass finished"
            );
        }
        Mode::Continuous => {
            let signal_tx = stop_tx.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                let _ = signal_tx.send(true);
            });
            runtime.run(stop_rx).await;
        }
    }

    let _ = stop_tx.send(true);
    if let Some(handle) = admin {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "admin server error during shutdown"),
            Err(e) => error!(error = %e, "admin server task panicked"),
        }
    }

    runtime.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT. A handler that cannot be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
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

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_config_and_once() {
        let args = parse_args(&argv(&["outreach-worker", "--config", "/etc/w.toml", "--once"]));
        assert_eq!(
            args,
            Args {
                config: Some("/etc/w.toml".into()),
                once: true,
            }
        );
    }

    #[test]
    fn defaults_without_flags() {
        assert_eq!(parse_args(&argv(&["outreach-worker"])), Args::default());
    }

    #[test]
    fn dangling_config_flag_is_ignored() {
        assert_eq!(parse_args(&argv(&["outreach-worker", "--config"])).config, None);
    }
}
