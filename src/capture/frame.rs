use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Frame size in pixels, fixed for the lifetime of one run.
///
/// Both sides are positive and even so that 4:2:0 chroma planes and 2x2
/// pixel groups always cover the image exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameDimensions {
    width: u32,
    height: u32,
}

impl FrameDimensions {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(Error::InvalidDimensions { width, height });
        }
        Ok(Self { width, height })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of luma samples (one per pixel).
    pub fn luma_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Size of one 4:2:0 chroma plane.
    pub fn chroma_len(&self) -> usize {
        self.luma_len() / 4
    }

    /// `width * height * 3 / 2`
    pub fn i420_len(&self) -> usize {
        self.luma_len() + 2 * self.chroma_len()
    }

    /// `width * height * 4`
    pub fn argb_len(&self) -> usize {
        self.luma_len() * 4
    }
}

impl fmt::Display for FrameDimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Native sensor layouts a device may deliver. All of them are 4:2:2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Planar: Y plane, then U and V planes at half width and full height.
    I422,
    /// Packed: Y0 U0 Y1 V0
    Yuyv,
    /// Packed: U0 Y0 V0 Y1
    Uyvy,
}

impl PixelFormat {
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::I422 => *b"422P",
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Uyvy => *b"UYVY",
        }
    }

    pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"422P" => Some(PixelFormat::I422),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"UYVY" => Some(PixelFormat::Uyvy),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        2
    }

    /// Raw frame size the device reports for `dims`.
    pub fn frame_len(&self, dims: FrameDimensions) -> usize {
        dims.luma_len() * self.bytes_per_pixel()
    }
}

static LAST_TIMESTAMP_NS: AtomicU64 = AtomicU64::new(0);

/// Acquisition time, nanoseconds since the UNIX epoch.
///
/// Taken by the acquisition loop, never by the device. Values handed out by
/// [`Timestamp::now`] strictly increase within the process even if the wall
/// clock stalls or steps backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn now() -> Self {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mut last = LAST_TIMESTAMP_NS.load(Ordering::Relaxed);
        loop {
            let next = wall.max(last + 1);
            match LAST_TIMESTAMP_NS.compare_exchange_weak(
                last,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Self(next),
                Err(actual) => last = actual,
            }
        }
    }

    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / 1_000_000_000, (self.0 % 1_000_000_000) / 1_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_odd_or_zero_dimensions() {
        assert!(FrameDimensions::new(0, 480).is_err());
        assert!(FrameDimensions::new(752, 0).is_err());
        assert!(FrameDimensions::new(751, 480).is_err());
        assert!(FrameDimensions::new(752, 479).is_err());
        assert!(FrameDimensions::new(752, 480).is_ok());
    }

    #[test]
    fn buffer_sizes() {
        let dims = FrameDimensions::new(752, 480).unwrap();
        assert_eq!(dims.i420_len(), 541_440);
        assert_eq!(dims.argb_len(), 1_443_840);
        assert_eq!(PixelFormat::Yuyv.frame_len(dims), 721_920);
    }

    #[test]
    fn fourcc_round_trip() {
        for format in [PixelFormat::I422, PixelFormat::Yuyv, PixelFormat::Uyvy] {
            assert_eq!(PixelFormat::from_fourcc(&format.fourcc()), Some(format));
        }
        assert_eq!(PixelFormat::from_fourcc(b"MJPG"), None);
    }

    #[test]
    fn timestamps_strictly_increase() {
        let mut prev = Timestamp::now();
        for _ in 0..10_000 {
            let next = Timestamp::now();
            assert!(next > prev);
            prev = next;
        }
    }
}
