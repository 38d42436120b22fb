//! Iris: camera frames republished as shared I420 and ARGB buffers

use std::thread;

use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use iris::capture::{FeatureControl, FrameDimensions, FrameSource, SyntheticSource, V4l2Source};
use iris::pipeline::{self, AcquisitionReport, StopToken};
use iris::{Config, SourceKind};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;

    let config = Config::load()?;

    let default_filter = if config.verbose { "iris=debug" } else { "iris=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Iris launching...");
    config.validate()?;

    let report = match config.capture.source {
        SourceKind::V4l2 => run(V4l2Source::open(&config.capture)?, &config).await?,
        SourceKind::Synthetic => {
            let dims = FrameDimensions::new(config.capture.width, config.capture.height)?;
            let source = SyntheticSource::bars(dims, config.capture.format)
                .paced(config.capture.freq);
            run(source, &config).await?
        }
    };

    if report.dropped > 0 {
        warn!("{} frames dropped during the run", report.dropped);
    }
    info!("Iris shutting down");
    Ok(())
}

async fn run<S>(source: S, config: &Config) -> Result<AcquisitionReport>
where
    S: FrameSource + FeatureControl + 'static,
{
    let (mut acquisition, _publisher) = pipeline::initialize(source, config)?;

    let stop = StopToken::new();
    let loop_stop = stop.clone();
    let pin_core = config.pipeline.pin_core;

    // Acquisition gets a dedicated thread: fetch blocks, conversion is CPU-bound.
    let handle = thread::Builder::new()
        .name("acquisition".into())
        .spawn(move || {
            if let Some(id) = pin_core {
                if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                    warn!("Could not pin acquisition thread to core {}", id);
                }
            }
            acquisition.run(&loop_stop)
        })?;

    let signal_stop = stop.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, stopping after the current frame"),
            Err(e) => error!("Failed to listen for interrupt: {}", e),
        }
        signal_stop.stop();
    });

    let report = tokio::task::spawn_blocking(move || handle.join())
        .await?
        .map_err(|_| eyre!("acquisition thread panicked"))??;
    Ok(report)
}
