//! Device frame source contract consumed by the acquisition loop.

use thiserror::Error;

use crate::capture::frame::{FrameDimensions, PixelFormat};
use crate::Result;

/// Outcome of a failed frame request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The frame is lost but the device is healthy; asking again may work.
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// The device cannot deliver any more frames.
    #[error("fatal fetch failure: {0}")]
    Fatal(String),
}

/// Whether the device is currently delivering frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Started,
    Stopped,
}

/// A camera that hands out one raw frame per request.
pub trait FrameSource: Send {
    /// Resolve the size of the frames the device delivers.
    fn query_frame_dimensions(&self) -> Result<FrameDimensions>;

    /// Native layout of the raw frames.
    fn pixel_format(&self) -> PixelFormat;

    /// Device-reported size of one raw frame in bytes.
    fn frame_len(&self) -> Result<usize> {
        Ok(self.pixel_format().frame_len(self.query_frame_dimensions()?))
    }

    fn stream_state(&self) -> StreamState;

    fn start_stream(&mut self) -> Result<()>;

    fn stop_stream(&mut self) -> Result<()>;

    /// Block until the next frame is available and copy it into `buffer`.
    ///
    /// Returns the number of bytes written. May block up to the device's
    /// own timeout.
    fn fetch_frame(&mut self, buffer: &mut [u8]) -> Result<usize, FetchError>;

    /// Move to `state` if not already there.
    fn set_stream_state(&mut self, state: StreamState) -> Result<()> {
        match (self.stream_state(), state) {
            (StreamState::Started, StreamState::Stopped) => self.stop_stream(),
            (StreamState::Stopped, StreamState::Started) => self.start_stream(),
            _ => Ok(()),
        }
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn query_frame_dimensions(&self) -> Result<FrameDimensions> {
        (**self).query_frame_dimensions()
    }

    fn pixel_format(&self) -> PixelFormat {
        (**self).pixel_format()
    }

    fn frame_len(&self) -> Result<usize> {
        (**self).frame_len()
    }

    fn stream_state(&self) -> StreamState {
        (**self).stream_state()
    }

    fn start_stream(&mut self) -> Result<()> {
        (**self).start_stream()
    }

    fn stop_stream(&mut self) -> Result<()> {
        (**self).stop_stream()
    }

    fn fetch_frame(&mut self, buffer: &mut [u8]) -> Result<usize, FetchError> {
        (**self).fetch_frame(buffer)
    }
}
