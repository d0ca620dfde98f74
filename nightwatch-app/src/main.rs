//! Nightwatch operational binary.
//!
//! ```text
//! nightwatch run [--config PATH] [--mock-sensors] [--force-setup]
//! nightwatch calibrate <detector>
//! nightwatch test-alert <severity>
//! ```
//!
//! Exit codes: 0 clean exit, 2 invalid configuration, 3 hardware init
//! failure, 4 unexpected fatal error.

mod stream;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use nightwatch_core::clock::SystemClock;
use nightwatch_core::{
    calibrate_detector, AlertLevel, Config, ControlRequest, DetectorId, NightwatchEngine,
    NightwatchError,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: u8 = 2;
const EXIT_HARDWARE: u8 = 3;
const EXIT_FATAL: u8 = 4;

#[derive(Parser)]
#[command(name = "nightwatch", version, about = "Non-contact vital-signs and anomaly monitor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the monitoring pipeline.
    Run {
        /// Configuration file (default: NIGHTWATCH_CONFIG or /etc/nightwatch/config.yaml).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Substitute deterministic synthetic sensors for all hardware.
        #[arg(long)]
        mock_sensors: bool,
        /// Discard learned baselines and start calibration from scratch.
        #[arg(long)]
        force_setup: bool,
        /// Bind address of the local stream endpoint.
        #[arg(long, default_value = "127.0.0.1:5380")]
        stream_addr: String,
    },
    /// Run a detector's calibration pass and persist the result.
    Calibrate {
        /// Detector id: audio | capacitive.
        detector: String,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Fire a synthetic alert through the full delivery path.
    TestAlert {
        /// warning | critical
        severity: String,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            match e.downcast_ref::<NightwatchError>() {
                Some(NightwatchError::Config(_)) => ExitCode::from(EXIT_CONFIG),
                Some(NightwatchError::HardwareInit(_)) => ExitCode::from(EXIT_HARDWARE),
                Some(NightwatchError::UnknownDetector(_)) => ExitCode::from(EXIT_CONFIG),
                _ => ExitCode::from(EXIT_FATAL),
            }
        }
    }
}

fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Run {
            config,
            mock_sensors,
            force_setup,
            stream_addr,
        } => {
            let mut config = Config::load(config.as_deref())?;
            if mock_sensors {
                config.mock_sensors = true;
            }
            init_tracing(&config.system.log_level);
            if force_setup {
                reset_baselines(&config);
            }
            runtime()?.block_on(run(config, stream_addr))
        }
        Command::Calibrate { detector, config } => {
            let config = Config::load(config.as_deref())?;
            init_tracing(&config.system.log_level);
            let id: DetectorId = detector
                .parse()
                .map_err(NightwatchError::UnknownDetector)?;
            let params = runtime()?.block_on(calibrate_detector(&config, id))?;
            for (key, value) in params {
                println!("{key}: {value:.6}");
            }
            Ok(())
        }
        Command::TestAlert { severity, config } => {
            let config = Config::load(config.as_deref())?;
            init_tracing(&config.system.log_level);
            let severity: AlertLevel = severity
                .parse()
                .map_err(NightwatchError::Config)?;
            runtime()?.block_on(test_alert(config, severity))
        }
    }
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

/// `NIGHTWATCH_LOG_LEVEL` / `RUST_LOG` override the configured level.
fn init_tracing(config_level: &str) {
    let level = std::env::var("NIGHTWATCH_LOG_LEVEL")
        .ok()
        .unwrap_or_else(|| config_level.to_string());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("nightwatch={level},warn")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn reset_baselines(config: &Config) {
    let dir = config.system.data_dir.join("baselines");
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => info!(?dir, "baselines cleared for fresh setup"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => error!(?dir, error = %e, "could not clear baselines"),
    }
}

async fn run(config: Config, stream_addr: String) -> anyhow::Result<()> {
    let engine = Arc::new(NightwatchEngine::new(config, SystemClock::shared()));

    // Stream endpoint for the (external) dashboard bridge.
    let stream_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        if let Err(e) = stream::serve(stream_addr, stream_engine).await {
            error!(error = %e, "stream endpoint failed");
        }
    });

    // Graceful stop on SIGINT/SIGTERM.
    let signal_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        signal_engine.stop();
    });

    engine.run().await?;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Fire a test alert into a short-lived engine so the local alarm and any
/// configured push provider actually exercise delivery.
async fn test_alert(config: Config, severity: AlertLevel) -> anyhow::Result<()> {
    let engine = Arc::new(NightwatchEngine::new(config, SystemClock::shared()));
    let run_engine = Arc::clone(&engine);
    let runner = tokio::spawn(async move { run_engine.run().await });

    // Let the notifier task come up before publishing.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let reply = engine.handle_control(ControlRequest::TestAlert { severity });
    println!("{reply}");

    // Leave time for push retries before tearing down.
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    engine.stop();
    let _ = runner.await;
    Ok(())
}
