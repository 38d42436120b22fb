//! Deterministic stand-in camera for running without hardware.

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use tracing::info;

use crate::capture::control::{Feature, FeatureControl, FeatureFlags};
use crate::capture::frame::{FrameDimensions, PixelFormat};
use crate::capture::source::{FetchError, FrameSource, StreamState};
use crate::{Error, Result};

/// BT.601 limited-range colour bars: white, yellow, cyan, green, magenta, red, blue, black.
const BARS: [[u8; 3]; 8] = [
    [235, 128, 128],
    [210, 16, 146],
    [170, 166, 16],
    [145, 54, 34],
    [106, 202, 222],
    [81, 90, 240],
    [41, 240, 110],
    [16, 128, 128],
];

#[derive(Debug, Clone, Copy)]
enum Pattern {
    Solid([u8; 3]),
    /// Colour bars shifted one pair of pixels per frame.
    Bars,
}

pub struct SyntheticSource {
    dims: FrameDimensions,
    format: PixelFormat,
    pattern: Pattern,
    interval: Option<Duration>,
    state: StreamState,
    sequence: u64,
    last_frame: Option<Instant>,
    values: HashMap<Feature, i64>,
    auto: HashMap<Feature, bool>,
    interruptions: u32,
}

impl SyntheticSource {
    /// Every pixel carries the given `[y, u, v]`.
    pub fn solid(dims: FrameDimensions, format: PixelFormat, yuv: [u8; 3]) -> Self {
        Self::with_pattern(dims, format, Pattern::Solid(yuv))
    }

    pub fn bars(dims: FrameDimensions, format: PixelFormat) -> Self {
        Self::with_pattern(dims, format, Pattern::Bars)
    }

    fn with_pattern(dims: FrameDimensions, format: PixelFormat, pattern: Pattern) -> Self {
        Self {
            dims,
            format,
            pattern,
            interval: None,
            state: StreamState::Stopped,
            sequence: 0,
            last_frame: None,
            values: HashMap::new(),
            auto: HashMap::new(),
            interruptions: 0,
        }
    }

    /// Deliver frames no faster than `freq` per second, like a real sensor.
    pub fn paced(mut self, freq: f32) -> Self {
        if freq > 0.0 {
            self.interval = Some(Duration::from_secs_f32(1.0 / freq));
        }
        self
    }

    pub fn feature_value(&self, feature: Feature) -> Option<i64> {
        self.values.get(&feature).copied()
    }

    pub fn feature_auto(&self, feature: Feature) -> bool {
        self.auto.get(&feature).copied().unwrap_or(false)
    }

    /// How many times the stream was stopped while it was running.
    pub fn stream_interruptions(&self) -> u32 {
        self.interruptions
    }

    fn yuv_at(&self, x: usize) -> [u8; 3] {
        match self.pattern {
            Pattern::Solid(yuv) => yuv,
            Pattern::Bars => {
                let bar_width = (self.dims.width() as usize / BARS.len()).max(2);
                let shifted = x + 2 * self.sequence as usize;
                BARS[(shifted / bar_width) % BARS.len()]
            }
        }
    }

    fn render(&self, buffer: &mut [u8]) {
        let w = self.dims.width() as usize;
        let h = self.dims.height() as usize;
        let half = w / 2;

        for row in 0..h {
            for pair in 0..half {
                // chroma is shared by both pixels of the pair
                let [y0, u, v] = self.yuv_at(pair * 2);
                let [y1, _, _] = self.yuv_at(pair * 2 + 1);
                match self.format {
                    PixelFormat::I422 => {
                        let luma = w * h;
                        let chroma = half * h;
                        buffer[row * w + pair * 2] = y0;
                        buffer[row * w + pair * 2 + 1] = y1;
                        buffer[luma + row * half + pair] = u;
                        buffer[luma + chroma + row * half + pair] = v;
                    }
                    PixelFormat::Yuyv => {
                        let at = (row * w + pair * 2) * 2;
                        buffer[at..at + 4].copy_from_slice(&[y0, u, y1, v]);
                    }
                    PixelFormat::Uyvy => {
                        let at = (row * w + pair * 2) * 2;
                        buffer[at..at + 4].copy_from_slice(&[u, y0, v, y1]);
                    }
                }
            }
        }
    }
}

impl FrameSource for SyntheticSource {
    fn query_frame_dimensions(&self) -> Result<FrameDimensions> {
        Ok(self.dims)
    }

    fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    fn stream_state(&self) -> StreamState {
        self.state
    }

    fn start_stream(&mut self) -> Result<()> {
        if self.state != StreamState::Started {
            info!("Synthetic {} {:?} stream started", self.dims, self.format);
        }
        self.state = StreamState::Started;
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<()> {
        if self.state == StreamState::Started {
            self.interruptions += 1;
        }
        self.state = StreamState::Stopped;
        self.last_frame = None;
        Ok(())
    }

    fn fetch_frame(&mut self, buffer: &mut [u8]) -> Result<usize, FetchError> {
        if self.state != StreamState::Started {
            return Err(FetchError::Fatal("stream not started".into()));
        }
        let len = self.format.frame_len(self.dims);
        if buffer.len() < len {
            return Err(FetchError::Fatal(format!(
                "buffer holds {} bytes, frame needs {}",
                buffer.len(),
                len
            )));
        }

        if let (Some(interval), Some(last)) = (self.interval, self.last_frame) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }

        self.render(&mut buffer[..len]);
        self.sequence += 1;
        self.last_frame = Some(Instant::now());
        Ok(len)
    }
}

impl FeatureControl for SyntheticSource {
    fn feature_flags(&self, feature: Feature) -> FeatureFlags {
        let bits = match feature {
            Feature::Exposure => {
                FeatureFlags::PRESENT
                    | FeatureFlags::MANUAL
                    | FeatureFlags::AUTO
                    | FeatureFlags::SETTABLE_WHILE_STREAMING
            }
            Feature::Gain => FeatureFlags::PRESENT | FeatureFlags::MANUAL,
            Feature::WhiteBalance => {
                FeatureFlags::PRESENT
                    | FeatureFlags::MANUAL
                    | FeatureFlags::AUTO
                    | FeatureFlags::ONE_SHOT
                    | FeatureFlags::SETTABLE_WHILE_STREAMING
            }
            Feature::Gamma => {
                FeatureFlags::PRESENT | FeatureFlags::MANUAL | FeatureFlags::SETTABLE_WHILE_STREAMING
            }
            Feature::Saturation => 0,
        };
        FeatureFlags::from_bits(bits)
    }

    fn set_manual(&mut self, feature: Feature, value: i64) -> Result<()> {
        if self.capabilities_of(feature).requires_stream_stop()
            && self.state == StreamState::Started
        {
            return Err(Error::Stream(format!("{:?} cannot change while streaming", feature)));
        }
        self.values.insert(feature, value);
        Ok(())
    }

    fn set_continuous_auto(&mut self, feature: Feature, enable: bool) -> Result<()> {
        self.auto.insert(feature, enable);
        Ok(())
    }

    fn trigger_one_shot(&mut self, feature: Feature) -> Result<()> {
        self.auto.insert(feature, false);
        Ok(())
    }
}
