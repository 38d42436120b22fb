pub mod capture;
pub mod convert;
pub mod error;
pub mod pipeline;
pub mod publish;
pub mod utils;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use capture::{FrameDimensions, PixelFormat, Timestamp};
pub use error::{Error, Result};

use capture::Feature;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "IRIS_CONFIG";

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub output: OutputConfig,
    pub pipeline: PipelineConfig,
    /// Debug-level logging
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    V4l2,
    Synthetic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub source: SourceKind,
    /// Empty means auto-detect
    pub device: String,
    /// Requested size; 0 keeps what the device is set to
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Expected frames per second. Only checked against, never scheduled on.
    pub freq: f32,
    pub buffer_count: u32,
    pub fetch_timeout_ms: u64,
    pub features: FeatureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory the named regions live in
    pub dir: PathBuf,
    pub name_i420: String,
    pub name_argb: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Fetch attempts per frame before it is dropped
    pub max_fetch_attempts: u32,
    /// Pin the acquisition thread to this core
    pub pin_core: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureMode {
    Manual,
    Auto,
    OneShot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSetting {
    pub mode: FeatureMode,
    /// Required for `manual`
    #[serde(default)]
    pub value: Option<i64>,
}

/// Startup feature settings; unset features are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub exposure: Option<FeatureSetting>,
    pub gain: Option<FeatureSetting>,
    pub white_balance: Option<FeatureSetting>,
    pub gamma: Option<FeatureSetting>,
    pub saturation: Option<FeatureSetting>,
}

impl FeatureConfig {
    pub fn get(&self, feature: Feature) -> Option<&FeatureSetting> {
        match feature {
            Feature::Exposure => self.exposure.as_ref(),
            Feature::Gain => self.gain.as_ref(),
            Feature::WhiteBalance => self.white_balance.as_ref(),
            Feature::Gamma => self.gamma.as_ref(),
            Feature::Saturation => self.saturation.as_ref(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                source: SourceKind::V4l2,
                device: String::new(),
                width: 752,
                height: 480,
                format: PixelFormat::Yuyv,
                freq: 20.0,
                buffer_count: 4,
                fetch_timeout_ms: 1000,
                features: FeatureConfig::default(),
            },
            output: OutputConfig::default(),
            pipeline: PipelineConfig::default(),
            verbose: false,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/dev/shm"),
            name_i420: "iris.i420".into(),
            name_argb: "iris.argb".into(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_fetch_attempts: 4,
            pin_core: None,
        }
    }
}

impl Config {
    /// Defaults, then the config file (`IRIS_CONFIG` or `iris.toml`, optional),
    /// then `IRIS_*` environment variables (`__` separates sections).
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "iris".into());
        Self::load_from(&file)
    }

    pub fn load_from(file: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(config::File::with_name(file).required(false))
            .add_source(
                config::Environment::with_prefix("IRIS")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));
        let capture = &self.capture;

        if !(capture.freq > 0.0) {
            return invalid(format!("freq must be larger than 0; found {}", capture.freq));
        }
        if capture.width != 0 || capture.height != 0 {
            FrameDimensions::new(capture.width, capture.height)?;
        }
        if capture.buffer_count == 0 {
            return invalid("buffer_count must be at least 1".into());
        }
        if self.pipeline.max_fetch_attempts == 0 {
            return invalid("max_fetch_attempts must be at least 1".into());
        }

        for name in [&self.output.name_i420, &self.output.name_argb] {
            if name.is_empty() || name.contains('/') {
                return invalid(format!("invalid output name '{}'", name));
            }
        }
        if self.output.name_i420 == self.output.name_argb {
            return invalid("I420 and ARGB outputs need distinct names".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_positive_freq() {
        let mut config = Config::default();
        config.capture.freq = 0.0;
        assert!(config.validate().is_err());
        config.capture.freq = f32::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_odd_requested_size() {
        let mut config = Config::default();
        config.capture.width = 751;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidDimensions { .. })
        ));

        config.capture.width = 0;
        config.capture.height = 0;
        config.validate().unwrap();
    }

    #[test]
    fn rejects_bad_output_names() {
        let mut config = Config::default();
        config.output.name_argb = config.output.name_i420.clone();
        assert!(config.validate().is_err());

        config.output.name_argb = "a/b".into();
        assert!(config.validate().is_err());

        config.output.name_argb = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_attempts() {
        let mut config = Config::default();
        config.pipeline.max_fetch_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_toml_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camera.toml");
        std::fs::write(
            &path,
            r#"
verbose = true

[capture]
source = "synthetic"
format = "uyvy"
freq = 30.0

[capture.features.gain]
mode = "manual"
value = 8

[output]
name_i420 = "front.i420"
"#,
        )
        .unwrap();

        let config = Config::load_from(path.to_str().unwrap()).unwrap();
        assert!(config.verbose);
        assert_eq!(config.capture.source, SourceKind::Synthetic);
        assert_eq!(config.capture.format, PixelFormat::Uyvy);
        assert_eq!(config.capture.width, 752);
        assert_eq!(config.output.name_i420, "front.i420");
        assert_eq!(config.output.name_argb, "iris.argb");
        assert_eq!(
            config.capture.features.get(Feature::Gain),
            Some(&FeatureSetting {
                mode: FeatureMode::Manual,
                value: Some(8),
            })
        );
        assert_eq!(config.capture.features.get(Feature::Exposure), None);
    }
}
