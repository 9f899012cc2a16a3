//! NCNN Manager - Main entry point

use anyhow::Result;
use clap::{Parser, ValueEnum};
use ncnn_manager::{
    SystemProcessRunner, TracingProgressSink, UpscaleMode, Upscaler, config::ManagerConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "ncnn-manager")]
#[command(about = "NCNN Upscaler Orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input image (or directory in batch mode)
    #[arg(short, long)]
    input: PathBuf,

    /// Output image (or directory in batch mode)
    #[arg(short, long)]
    output: PathBuf,

    /// Source ESRGAN model file, or a pre-converted `.ncnn` directory
    #[arg(short, long)]
    model: PathBuf,

    /// Display mode; batch suppresses per-tile progress
    #[arg(long, value_enum, default_value_t = Mode::Single)]
    mode: Mode,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    log_format: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Single,
    Preview,
    Batch,
}

impl From<Mode> for UpscaleMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Single => UpscaleMode::Single,
            Mode::Preview => UpscaleMode::Preview,
            Mode::Batch => UpscaleMode::Batch,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
    }

    tracing::info!("Starting NCNN Manager");

    let config = ManagerConfig::load(cli.config)?;
    config.validate()?;

    tracing::info!(
        model_root = ?config.model_root,
        bin_root = ?config.bin_root,
        gpus = %config.gpus,
        debug_mode = config.cmd_debug_mode,
        "Configuration loaded"
    );

    let runner = Arc::new(SystemProcessRunner::new(config.poll_interval()));
    let sink = Arc::new(TracingProgressSink);
    let upscaler = Arc::new(Upscaler::new(config, runner, sink));

    let run = {
        let upscaler = upscaler.clone();
        let (input, output, model) = (cli.input.clone(), cli.output.clone(), cli.model.clone());
        let mode = cli.mode.into();
        tokio::spawn(async move { upscaler.run(&input, &output, &model, mode).await })
    };

    tokio::select! {
        result = run => {
            let stats = result??;
            tracing::info!(
                scale = stats.scale,
                lines_seen = stats.lines_seen,
                last_progress = ?stats.last_progress,
                "Upscale finished"
            );
        }
        _ = shutdown_signal() => {
            tracing::warn!("Interrupted, killing live tool process");
            upscaler.abort().await;
            std::process::exit(130);
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
