use std::path::Path;

use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device};

use crate::capture::PixelFormat;
use crate::{Error, Result};

// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

impl FoundDevice {
    pub fn new(path: String, format: PixelFormat) -> Self {
        Self { path, format }
    }
}

/// Find the first capture device that can deliver a 4:2:2 layout we convert.
pub fn auto_detect_device() -> Result<FoundDevice> {
    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            debug!("{} is not a capture device", path);
            continue;
        }

        if let Ok(formats) = dev.enum_formats() {
            let supported = formats
                .iter()
                .find_map(|fmt| PixelFormat::from_fourcc(&fmt.fourcc.repr));
            if let Some(format) = supported {
                info!("Found {:?} device: {} - {}", format, path, caps.card);
                return Ok(FoundDevice::new(path, format));
            }
        }
    }

    Err(Error::DeviceNotFound)
}
