//! Acquisition loop: fetch, convert, publish, repeat.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use tracing::{debug, info, instrument, warn};

use crate::capture::{FetchError, FrameDimensions, FrameSource, PixelFormat, Timestamp};
use crate::convert;
use crate::pipeline::StopToken;
use crate::publish::{Output, Publisher};
use crate::{Error, PipelineConfig, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Initializing,
    Streaming,
    Retrying,
    Stopping,
    Stopped,
}

/// Live counters, readable from any thread while the loop runs.
#[derive(Debug, Default)]
pub struct AcquisitionStats {
    published: AtomicU64,
    dropped: AtomicU64,
    retries: AtomicU64,
}

impl AcquisitionStats {
    pub fn snapshot(&self) -> AcquisitionReport {
        AcquisitionReport {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionReport {
    pub published: u64,
    pub dropped: u64,
    pub retries: u64,
}

/// Compares the delivered frame rate against the configured hint.
struct RateMonitor {
    hint: Option<f32>,
    window_start: Instant,
    frames: u32,
}

impl RateMonitor {
    const WINDOW: Duration = Duration::from_secs(1);

    fn new(hint: Option<f32>) -> Self {
        Self {
            hint,
            window_start: Instant::now(),
            frames: 0,
        }
    }

    fn record(&mut self) {
        self.frames += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed < Self::WINDOW {
            return;
        }

        let fps = self.frames as f32 / elapsed.as_secs_f32();
        debug!("Delivering {:.1} fps", fps);
        if let Some(hint) = self.hint {
            if fps < hint * 0.5 {
                warn!("Device delivers {:.1} fps, well below the {:.1} fps hint", fps, hint);
            }
        }
        self.window_start = Instant::now();
        self.frames = 0;
    }
}

/// Owns the device stream and the raw frame buffer for one run.
pub struct Acquisition<S: FrameSource> {
    source: S,
    publisher: Arc<Publisher>,
    dims: FrameDimensions,
    format: PixelFormat,
    raw: Vec<u8>,
    raw_len: usize,
    i420: Vec<u8>,
    max_attempts: u32,
    state: LoopState,
    stats: Arc<CachePadded<AcquisitionStats>>,
    rate: RateMonitor,
}

impl<S: FrameSource> Acquisition<S> {
    /// Size buffers from the source, check them against the publisher and
    /// start the device stream.
    #[instrument(skip_all)]
    pub fn new(mut source: S, publisher: Arc<Publisher>, config: &PipelineConfig) -> Result<Self> {
        let dims = source.query_frame_dimensions()?;
        if dims != publisher.dimensions() {
            return Err(Error::DimensionMismatch {
                source_dims: dims.to_string(),
                output_dims: publisher.dimensions().to_string(),
            });
        }

        let format = source.pixel_format();
        let raw_len = format.frame_len(dims);
        let device_len = source.frame_len()?;
        if device_len < raw_len {
            return Err(Error::UnsupportedFormat(format!(
                "{:?} {} needs {} bytes per frame, device reports {}",
                format, dims, raw_len, device_len
            )));
        }

        source.start_stream()?;
        info!("Acquiring {} {:?} frames", dims, format);

        Ok(Self {
            source,
            publisher,
            dims,
            format,
            raw: vec![0u8; device_len],
            raw_len,
            i420: vec![0u8; dims.i420_len()],
            max_attempts: config.max_fetch_attempts.max(1),
            state: LoopState::Initializing,
            stats: Arc::new(CachePadded::new(AcquisitionStats::default())),
            rate: RateMonitor::new(None),
        })
    }

    /// Report when delivery falls far below `freq` frames per second.
    pub fn with_rate_hint(mut self, freq: f32) -> Self {
        self.rate = RateMonitor::new((freq > 0.0).then_some(freq));
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> Arc<CachePadded<AcquisitionStats>> {
        Arc::clone(&self.stats)
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    /// Stream until `stop` is raised or the device fails for good.
    ///
    /// The stop token is looked at once per cycle, before the fetch; a
    /// fetch already in flight is allowed to finish and be published.
    pub fn run(&mut self, stop: &StopToken) -> Result<AcquisitionReport> {
        self.enter(LoopState::Streaming);

        let result = loop {
            if stop.is_stopped() {
                info!("Stop requested");
                break Ok(());
            }
            if let Err(e) = self.cycle() {
                break Err(e);
            }
        };

        self.enter(LoopState::Stopping);
        if let Err(e) = self.source.stop_stream() {
            warn!("Failed to stop device stream: {}", e);
        }
        self.raw = Vec::new();
        self.enter(LoopState::Stopped);

        let report = self.stats.snapshot();
        info!(
            "Acquisition finished: {} published, {} dropped, {} retries",
            report.published, report.dropped, report.retries
        );
        result.map(|()| report)
    }

    fn cycle(&mut self) -> Result<()> {
        let Some(len) = self.fetch_with_retry()? else {
            return Ok(());
        };
        let ts = Timestamp::now();
        let started = Instant::now();

        convert::to_i420_into(&self.raw[..len], self.dims, self.format, &mut self.i420);
        {
            let mut guard = self.publisher.begin_write(Output::I420);
            guard.set_timestamp(ts);
            guard.write(&self.i420);
        }
        {
            // Derived from the I420 just published, not from the raw frame.
            let mut guard = self.publisher.begin_write(Output::Argb);
            guard.set_timestamp(ts);
            convert::to_argb_into(&self.i420, self.dims, guard.pixels_mut());
        }
        self.publisher.notify(Output::I420);
        self.publisher.notify(Output::Argb);

        self.stats.published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("iris_frames_published").increment(1);
        metrics::histogram!("iris_cycle_time_us").record(started.elapsed().as_micros() as f64);
        self.rate.record();
        Ok(())
    }

    /// `Ok(None)` means the frame was dropped after the bounded retries.
    fn fetch_with_retry(&mut self) -> Result<Option<usize>> {
        for attempt in 1..=self.max_attempts {
            match self.source.fetch_frame(&mut self.raw) {
                Ok(len) if len >= self.raw_len => {
                    self.enter(LoopState::Streaming);
                    return Ok(Some(self.raw_len));
                }
                Ok(len) => debug!(attempt, "Short frame: {} of {} bytes", len, self.raw_len),
                Err(FetchError::Transient(reason)) => debug!(attempt, "Fetch failed: {}", reason),
                Err(FetchError::Fatal(reason)) => return Err(Error::DeviceFatal(reason)),
            }

            if attempt < self.max_attempts {
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("iris_fetch_retries").increment(1);
                self.enter(LoopState::Retrying);
            }
        }

        warn!("Dropped frame after {} attempts", self.max_attempts);
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("iris_frames_dropped").increment(1);
        self.enter(LoopState::Streaming);
        Ok(None)
    }

    fn enter(&mut self, next: LoopState) {
        if self.state != next {
            debug!("{:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}
