pub mod control;
pub mod frame;
pub mod source;
pub mod synthetic;
pub mod v4l2;

pub use control::{apply_features, Capabilities, Feature, FeatureControl, FeatureFlags, InterruptStream};
pub use frame::{FrameDimensions, PixelFormat, Timestamp};
pub use source::{FetchError, FrameSource, StreamState};
pub use synthetic::SyntheticSource;
pub use v4l2::V4l2Source;
