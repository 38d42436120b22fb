pub mod acquisition;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, instrument};

use crate::capture::{apply_features, FeatureControl, FrameSource};
use crate::publish::Publisher;
use crate::{Config, Result};

pub use acquisition::{Acquisition, AcquisitionReport, AcquisitionStats, LoopState};

/// Cooperative stop request shared between the signal handler and the loop.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Resolve dimensions, configure the device, create both outputs and start
/// streaming. Any failure here ends the run before the first frame.
#[instrument(skip_all)]
pub fn initialize<S>(mut source: S, config: &Config) -> Result<(Acquisition<S>, Arc<Publisher>)>
where
    S: FrameSource + FeatureControl,
{
    let dims = source.query_frame_dimensions()?;
    info!("Frame dimensions resolved to {}", dims);

    apply_features(&mut source, &config.capture.features)?;

    let publisher = Arc::new(Publisher::create(dims, &config.output)?);
    let acquisition = Acquisition::new(source, Arc::clone(&publisher), &config.pipeline)?
        .with_rate_hint(config.capture.freq);
    Ok((acquisition, publisher))
}
