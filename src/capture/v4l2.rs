//! V4L2 camera with memory-mapped streaming

use std::io;
use std::time::Duration;

use tracing::{debug, info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Description, Flags as CtrlFlags, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::control::{Feature, FeatureControl, FeatureFlags};
use crate::capture::frame::{FrameDimensions, PixelFormat};
use crate::capture::source::{FetchError, FrameSource, StreamState};
use crate::utils;
use crate::{CaptureConfig, Error, Result};

const EIO: i32 = 5;

const CID_SATURATION: u32 = 0x0098_0902;
const CID_AUTO_WHITE_BALANCE: u32 = 0x0098_090c;
const CID_DO_WHITE_BALANCE: u32 = 0x0098_090d;
const CID_GAMMA: u32 = 0x0098_0910;
const CID_AUTOGAIN: u32 = 0x0098_0912;
const CID_GAIN: u32 = 0x0098_0913;
const CID_WHITE_BALANCE_TEMPERATURE: u32 = 0x0098_091a;
const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;

// V4L2_EXPOSURE_MANUAL / V4L2_EXPOSURE_APERTURE_PRIORITY
const EXPOSURE_MANUAL: i64 = 1;
const EXPOSURE_APERTURE_PRIORITY: i64 = 3;

/// Control ids behind one feature: value, continuous auto, one-shot trigger.
fn control_ids(feature: Feature) -> (u32, Option<u32>, Option<u32>) {
    match feature {
        Feature::Exposure => (CID_EXPOSURE_ABSOLUTE, Some(CID_EXPOSURE_AUTO), None),
        Feature::Gain => (CID_GAIN, Some(CID_AUTOGAIN), None),
        Feature::WhiteBalance => (
            CID_WHITE_BALANCE_TEMPERATURE,
            Some(CID_AUTO_WHITE_BALANCE),
            Some(CID_DO_WHITE_BALANCE),
        ),
        Feature::Gamma => (CID_GAMMA, None, None),
        Feature::Saturation => (CID_SATURATION, None, None),
    }
}

/// V4L2 capture device delivering 4:2:2 frames
pub struct V4l2Source {
    path: String,
    device: Box<Device>,
    stream: Option<MmapStream<'static>>,
    dims: FrameDimensions,
    format: PixelFormat,
    buffer_count: u32,
    timeout: Duration,
    controls: Vec<Description>,
}

impl V4l2Source {
    /// Open the device and negotiate the requested format and size.
    #[instrument(skip(config), fields(device = %config.device))]
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        let (path, requested) = if config.device.is_empty() {
            let found = utils::auto_detect_device()?;
            (found.path, found.format)
        } else {
            (config.device.clone(), config.format)
        };
        let device_err = |source: io::Error| Error::Device {
            path: path.clone(),
            source,
        };

        info!("Initializing V4L2 capture: {}", path);
        let device = Device::with_path(&path).map_err(device_err)?;

        // Query capabilities
        let caps = device.query_caps().map_err(device_err)?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(Error::NotACaptureDevice(path.clone()));
        }

        let mut fmt = device.format().map_err(device_err)?;
        if config.width > 0 && config.height > 0 {
            fmt.width = config.width;
            fmt.height = config.height;
        }
        fmt.fourcc = FourCC::new(&requested.fourcc());
        let fmt = device.set_format(&fmt).map_err(device_err)?;

        // The driver may pick something else; what it reports is what we get.
        let format = PixelFormat::from_fourcc(&fmt.fourcc.repr)
            .ok_or_else(|| Error::UnsupportedFormat(fmt.fourcc.to_string()))?;
        let dims = FrameDimensions::new(fmt.width, fmt.height)?;
        if fmt.width != config.width || fmt.height != config.height {
            debug!(
                "Requested {}x{}, device resolved {}",
                config.width, config.height, dims
            );
        }

        let controls = device.query_controls().unwrap_or_default();
        debug!("{} controls available", controls.len());

        Ok(Self {
            path,
            device: Box::new(device),
            stream: None,
            dims,
            format,
            buffer_count: config.buffer_count,
            timeout: Duration::from_millis(config.fetch_timeout_ms),
            controls,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn describe(&self, id: u32) -> Option<&Description> {
        self.controls
            .iter()
            .find(|c| c.id == id && !c.flags.contains(CtrlFlags::DISABLED))
    }

    fn set(&self, id: u32, value: Value) -> Result<()> {
        self.device
            .set_control(Control { id, value })
            .map_err(|e| Error::Feature(format!("control {:#x}: {}", id, e)))
    }
}

impl FrameSource for V4l2Source {
    fn query_frame_dimensions(&self) -> Result<FrameDimensions> {
        Ok(self.dims)
    }

    fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    fn stream_state(&self) -> StreamState {
        if self.stream.is_some() {
            StreamState::Started
        } else {
            StreamState::Stopped
        }
    }

    fn start_stream(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let mut stream =
            MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)
                .map_err(|e| Error::Stream(e.to_string()))?;
        stream.set_timeout(self.timeout);

        self.stream = Some(stream);
        info!(
            "Capture stream started with {} buffers",
            self.buffer_count
        );
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<()> {
        // Dropping the stream issues STREAMOFF and releases the buffers.
        if self.stream.take().is_some() {
            info!("Capture stream stopped");
        }
        Ok(())
    }

    fn fetch_frame(&mut self, buffer: &mut [u8]) -> Result<usize, FetchError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| FetchError::Fatal("stream not started".into()))?;

        let (buf, meta) = stream.next().map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                FetchError::Transient(e.to_string())
            }
            _ if e.raw_os_error() == Some(EIO) => FetchError::Transient(e.to_string()),
            _ => FetchError::Fatal(e.to_string()),
        })?;

        let used = (meta.bytesused as usize).min(buf.len()).min(buffer.len());
        buffer[..used].copy_from_slice(&buf[..used]);
        Ok(used)
    }
}

impl FeatureControl for V4l2Source {
    fn feature_flags(&self, feature: Feature) -> FeatureFlags {
        let (value, auto, one_shot) = control_ids(feature);
        let Some(desc) = self.describe(value) else {
            return FeatureFlags::default();
        };

        let mut bits = FeatureFlags::PRESENT;
        if !desc.flags.contains(CtrlFlags::READ_ONLY) {
            bits |= FeatureFlags::MANUAL;
        }
        if !desc.flags.contains(CtrlFlags::GRABBED) {
            bits |= FeatureFlags::SETTABLE_WHILE_STREAMING;
        }
        if auto.and_then(|id| self.describe(id)).is_some() {
            bits |= FeatureFlags::AUTO;
        }
        if one_shot.and_then(|id| self.describe(id)).is_some() {
            bits |= FeatureFlags::ONE_SHOT;
        }
        FeatureFlags::from_bits(bits)
    }

    fn set_manual(&mut self, feature: Feature, value: i64) -> Result<()> {
        let (id, _, _) = control_ids(feature);
        if let Some(desc) = self.describe(id) {
            if value < desc.minimum || value > desc.maximum {
                return Err(Error::Feature(format!(
                    "{} outside [{}, {}]",
                    value, desc.minimum, desc.maximum
                )));
            }
        }
        self.set(id, Value::Integer(value))
    }

    fn set_continuous_auto(&mut self, feature: Feature, enable: bool) -> Result<()> {
        match control_ids(feature) {
            (_, Some(CID_EXPOSURE_AUTO), _) => {
                let mode = if enable {
                    EXPOSURE_APERTURE_PRIORITY
                } else {
                    EXPOSURE_MANUAL
                };
                self.set(CID_EXPOSURE_AUTO, Value::Integer(mode))
            }
            (_, Some(id), _) => self.set(id, Value::Boolean(enable)),
            _ => Err(Error::Feature(format!("{:?} has no auto mode", feature))),
        }
    }

    fn trigger_one_shot(&mut self, feature: Feature) -> Result<()> {
        match control_ids(feature) {
            (_, _, Some(id)) => self.set(id, Value::Integer(1)),
            _ => Err(Error::Feature(format!("{:?} has no one-shot mode", feature))),
        }
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        let _ = self.stop_stream();
    }
}
