//! vigild — the Vigil daemon.
//!
//! Single binary that assembles the monitoring engine:
//! - State store (redb)
//! - Probe scheduler + per-service pipelines
//! - Recovery executor
//! - Notification dispatcher
//! - REST API + Prometheus metrics
//!
//! # Usage
//!
//! ```text
//! vigild run --config /etc/vigil/vigil.toml --port 9100
//! vigild check --config /etc/vigil/vigil.toml
//! ```
//!
//! `SIGHUP` re-reads the config file; an invalid file is rejected and the
//! running configuration stays in place.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use vigil_core::{Settings, VigilConfig};
use vigil_engine::Engine;

#[derive(Parser)]
#[command(name = "vigild", about = "Vigil monitoring and auto-recovery daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine and the API server.
    Run {
        /// Path to vigil.toml.
        #[arg(long, default_value = "/etc/vigil/vigil.toml")]
        config: PathBuf,

        /// Overrides `engine.data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// API port.
        #[arg(long, default_value = "9100")]
        port: u16,
    },
    /// Validate a config file and print the services it defines.
    Check {
        #[arg(long, default_value = "/etc/vigil/vigil.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            data_dir,
            port,
        } => run(config, data_dir, port).await,
        Command::Check { config } => check(&config),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,vigil=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_settings(path: &Path, data_dir: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = VigilConfig::load(path)
        .with_context(|| format!("loading {}", path.display()))?;
    if let Some(dir) = data_dir {
        settings.engine.data_dir = dir.to_path_buf();
    }
    Ok(settings)
}

fn check(config: &Path) -> anyhow::Result<()> {
    let settings = load_settings(config, None)?;
    println!("{}: ok", config.display());
    for spec in &settings.services {
        println!(
            "  {:<20} {:<8} every {:?}, unhealthy after {}, {} recovery action(s)",
            spec.id,
            spec.probe.kind(),
            spec.interval,
            spec.failure_threshold,
            spec.recovery.actions.len()
        );
    }
    Ok(())
}

async fn run(config: PathBuf, data_dir: Option<PathBuf>, port: u16) -> anyhow::Result<()> {
    info!("Vigil daemon starting");

    let settings = load_settings(&config, data_dir.as_deref())?;
    info!(
        config = %config.display(),
        data_dir = %settings.engine.data_dir.display(),
        services = settings.services.len(),
        channels = settings.notify.channels.len(),
        "configuration loaded"
    );

    // ── Engine ─────────────────────────────────────────────────

    let engine = Arc::new(Engine::builder(settings).build()?);
    engine.start().await?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reload_handle = tokio::spawn(reload_on_hangup(
        engine.clone(),
        config,
        data_dir,
        shutdown_rx,
    ));

    // ── API server ─────────────────────────────────────────────

    let router = vigil_api::build_router(engine.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = reload_handle.await;
    engine.shutdown().await;

    info!("Vigil daemon stopped");
    Ok(())
}

/// Apply the config file again on every SIGHUP until shutdown.
#[cfg(unix)]
async fn reload_on_hangup(
    engine: Arc<Engine>,
    config: PathBuf,
    data_dir: Option<PathBuf>,
    mut shutdown: watch::Receiver<bool>,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "SIGHUP reload unavailable");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!(config = %config.display(), "SIGHUP received, reloading");
                match load_settings(&config, data_dir.as_deref()) {
                    Ok(settings) => {
                        engine.reload(settings).await;
                    }
                    Err(e) => {
                        error!(error = ?e, "reload rejected, keeping current configuration");
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(
    _engine: Arc<Engine>,
    _config: PathBuf,
    _data_dir: Option<PathBuf>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = shutdown.changed().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_is_valid() {
        let settings = VigilConfig::parse(include_str!("../../../vigil.example.toml"))
            .unwrap()
            .resolve()
            .unwrap();
        assert_eq!(settings.services.len(), 3);
        assert_eq!(settings.notify.channels.len(), 2);
        let worker = &settings.services[2];
        assert_eq!(worker.recovery.actions.len(), 2);
        assert_eq!(worker.recovery.max_attempts, 2);
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "vigild",
            "--log-json",
            "run",
            "--config",
            "/tmp/vigil.toml",
            "--data-dir",
            "/tmp/state",
            "--port",
            "9200",
        ])
        .unwrap();
        assert!(cli.log_json);
        match cli.command {
            Command::Run {
                config,
                data_dir,
                port,
            } => {
                assert_eq!(config, PathBuf::from("/tmp/vigil.toml"));
                assert_eq!(data_dir, Some(PathBuf::from("/tmp/state")));
                assert_eq!(port, 9200);
            }
            Command::Check { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn data_dir_flag_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(&path, "[engine]\ndata_dir = \"/from/file\"\n").unwrap();

        let settings = load_settings(&path, None).unwrap();
        assert_eq!(settings.engine.data_dir, PathBuf::from("/from/file"));
        let settings = load_settings(&path, Some(Path::new("/from/flag"))).unwrap();
        assert_eq!(settings.engine.data_dir, PathBuf::from("/from/flag"));
    }
}
