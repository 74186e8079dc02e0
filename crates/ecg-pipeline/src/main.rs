//! ECG Monitor - acquisition pipeline against a serial device or the simulator

use anyhow::{bail, Context, Result};
use clap::Parser;
use ecg_pipeline::{LogSink, Pipeline, PipelineConfig, PipelineHandle};
use ecg_simulation::{DeviceConfig, SimulatedDevice};
use std::path::PathBuf;
use tokio::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ecg-monitor")]
#[command(about = "Real-time ECG acquisition, filtering and classification")]
#[command(version)]
struct CliArgs {
    /// Pipeline configuration (JSON); defaults are used when omitted
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Serial device node of the acquisition board, e.g. /dev/ttyACM0
    #[arg(long, value_name = "PATH", conflicts_with = "simulate")]
    device: Option<PathBuf>,

    /// Record from the built-in simulated device
    #[arg(long)]
    simulate: bool,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long, value_name = "SECONDS")]
    duration_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    let config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    let drain_grace = config.drain_grace();

    let handle = if let Some(path) = &args.device {
        let port = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        info!(device = %path.display(), "using serial device");
        let (reader, writer) = tokio::io::split(port);
        Pipeline::spawn(config, reader, writer, None, LogSink)?
    } else if args.simulate {
        let device = SimulatedDevice::new(DeviceConfig::default())?;
        let (transport, _device_task) = device.spawn();
        info!("using simulated device");
        let (reader, writer) = tokio::io::split(transport);
        Pipeline::spawn(config, reader, writer, None, LogSink)?
    } else {
        bail!("either --device <PATH> or --simulate is required");
    };

    let session = handle.start_recording().await?;
    info!(session, "recording; press Ctrl-C to stop");

    wait_for_stop(args.duration_secs).await;
    stop_and_drain(&handle, drain_grace).await;

    handle.shutdown();
    let report = handle.join().await?;
    info!(
        packets = report.acquisition.queue.emitted,
        windows = report.inference.windows,
        sessions = report.inference.sessions_finalized,
        dropped_windows = report.filter.errors,
        desync_events = report.acquisition.frames.desync_events,
        "ECG monitor finished"
    );
    Ok(())
}

async fn wait_for_stop(duration_secs: Option<u64>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    match duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = ctrl_c => info!("Ctrl-C received"),
                _ = tokio::time::sleep(Duration::from_secs(secs)) => info!(secs, "recording time elapsed"),
            }
        }
        None => {
            ctrl_c.await;
            info!("Ctrl-C received");
        }
    }
}

/// Stop the recording and give in-flight windows time to reach the sink
async fn stop_and_drain(handle: &PipelineHandle, drain_grace: Duration) {
    match handle.stop_recording().await {
        Ok(Some(session)) => {
            info!(session, "recording stopped, draining");
            tokio::time::sleep(drain_grace).await;
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "failed to stop recording"),
    }
}
