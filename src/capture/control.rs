//! Device feature capabilities and scoped stream interruption.
//!
//! Feature configuration happens once at startup and is independent of the
//! acquisition loop. Devices describe each feature with a [`FeatureFlags`]
//! set; [`Capabilities::from_flags`] turns that into the questions the
//! configuration logic actually asks.

use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capture::source::{FrameSource, StreamState};
use crate::{Error, FeatureConfig, FeatureMode, FeatureSetting, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Exposure,
    Gain,
    WhiteBalance,
    Gamma,
    Saturation,
}

impl Feature {
    pub const ALL: [Feature; 5] = [
        Feature::Exposure,
        Feature::Gain,
        Feature::WhiteBalance,
        Feature::Gamma,
        Feature::Saturation,
    ];
}

/// Raw per-feature flag bits as reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureFlags(u32);

impl FeatureFlags {
    pub const PRESENT: u32 = 1 << 0;
    pub const MANUAL: u32 = 1 << 1;
    pub const AUTO: u32 = 1 << 2;
    pub const ONE_SHOT: u32 = 1 << 3;
    pub const SETTABLE_WHILE_STREAMING: u32 = 1 << 4;

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn contains(&self, bit: u32) -> bool {
        self.0 & bit == bit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub supported: bool,
    pub auto_capable: bool,
    pub one_shot_capable: bool,
    pub settable_while_streaming: bool,
}

impl Capabilities {
    /// A feature the device does not report as present has no capabilities.
    pub fn from_flags(flags: FeatureFlags) -> Self {
        if !flags.contains(FeatureFlags::PRESENT) {
            return Self::default();
        }
        Self {
            supported: true,
            auto_capable: flags.contains(FeatureFlags::AUTO),
            one_shot_capable: flags.contains(FeatureFlags::ONE_SHOT),
            settable_while_streaming: flags.contains(FeatureFlags::SETTABLE_WHILE_STREAMING),
        }
    }

    /// Changing the feature needs the stream stopped first.
    pub fn requires_stream_stop(&self) -> bool {
        self.supported && !self.settable_while_streaming
    }
}

/// Feature access on a device.
pub trait FeatureControl: FrameSource {
    fn feature_flags(&self, feature: Feature) -> FeatureFlags;

    fn set_manual(&mut self, feature: Feature, value: i64) -> Result<()>;

    fn set_continuous_auto(&mut self, feature: Feature, enable: bool) -> Result<()>;

    fn trigger_one_shot(&mut self, feature: Feature) -> Result<()>;

    fn capabilities_of(&self, feature: Feature) -> Capabilities {
        Capabilities::from_flags(self.feature_flags(feature))
    }
}

/// Holds a source in a required stream state for the guard's lifetime.
///
/// The state found on entry is put back when the guard drops, whichever
/// way the enclosing scope is left.
pub struct InterruptStream<'a, S: FrameSource + ?Sized> {
    source: &'a mut S,
    previous: StreamState,
}

impl<'a, S: FrameSource + ?Sized> InterruptStream<'a, S> {
    pub fn new(source: &'a mut S, required: StreamState) -> Result<Self> {
        let previous = source.stream_state();
        if previous != required {
            debug!(?previous, ?required, "Interrupting stream");
            source.set_stream_state(required)?;
        }
        Ok(Self { source, previous })
    }
}

impl<S: FrameSource + ?Sized> Deref for InterruptStream<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.source
    }
}

impl<S: FrameSource + ?Sized> DerefMut for InterruptStream<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.source
    }
}

impl<S: FrameSource + ?Sized> Drop for InterruptStream<'_, S> {
    fn drop(&mut self) {
        if self.source.stream_state() != self.previous {
            if let Err(e) = self.source.set_stream_state(self.previous) {
                warn!("Failed to restore stream state {:?}: {}", self.previous, e);
            }
        }
    }
}

/// Apply the configured feature settings, skipping what the device can't do.
pub fn apply_features<S: FeatureControl + ?Sized>(
    source: &mut S,
    features: &FeatureConfig,
) -> Result<()> {
    for feature in Feature::ALL {
        let Some(setting) = features.get(feature) else {
            continue;
        };

        let caps = source.capabilities_of(feature);
        if !caps.supported {
            warn!("{:?} is not supported by the device, ignoring", feature);
            continue;
        }

        let result = if caps.requires_stream_stop() {
            let mut guard = InterruptStream::new(source, StreamState::Stopped)?;
            apply_one(&mut *guard, feature, setting, caps)
        } else {
            apply_one(source, feature, setting, caps)
        };

        match result {
            Ok(()) => info!("{:?} set to {:?}", feature, setting),
            Err(Error::Feature(reason)) => warn!("{:?} left unchanged: {}", feature, reason),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn apply_one<S: FeatureControl + ?Sized>(
    source: &mut S,
    feature: Feature,
    setting: &FeatureSetting,
    caps: Capabilities,
) -> Result<()> {
    match setting.mode {
        FeatureMode::Manual => {
            let value = setting
                .value
                .ok_or_else(|| Error::Feature("manual mode needs a value".into()))?;
            if caps.auto_capable {
                source.set_continuous_auto(feature, false)?;
            }
            source.set_manual(feature, value)
        }
        FeatureMode::Auto if caps.auto_capable => source.set_continuous_auto(feature, true),
        FeatureMode::Auto => Err(Error::Feature("continuous auto not available".into())),
        FeatureMode::OneShot if caps.one_shot_capable => source.trigger_one_shot(feature),
        FeatureMode::OneShot => Err(Error::Feature("one-shot auto not available".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::SyntheticSource;
    use crate::capture::PixelFormat;
    use crate::FrameDimensions;

    fn source() -> SyntheticSource {
        SyntheticSource::solid(
            FrameDimensions::new(4, 2).unwrap(),
            PixelFormat::Yuyv,
            [235, 128, 128],
        )
    }

    #[test]
    fn capabilities_follow_flags() {
        let none = Capabilities::from_flags(FeatureFlags::from_bits(FeatureFlags::AUTO));
        assert_eq!(none, Capabilities::default());

        let caps = Capabilities::from_flags(FeatureFlags::from_bits(
            FeatureFlags::PRESENT | FeatureFlags::ONE_SHOT,
        ));
        assert!(caps.supported);
        assert!(!caps.auto_capable);
        assert!(caps.one_shot_capable);
        assert!(caps.requires_stream_stop());

        let caps = Capabilities::from_flags(FeatureFlags::from_bits(
            FeatureFlags::PRESENT | FeatureFlags::AUTO | FeatureFlags::SETTABLE_WHILE_STREAMING,
        ));
        assert!(caps.auto_capable);
        assert!(!caps.one_shot_capable);
        assert!(!caps.requires_stream_stop());
    }

    #[test]
    fn interrupt_restores_previous_state() {
        let mut src = source();
        src.start_stream().unwrap();
        {
            let guard = InterruptStream::new(&mut src, StreamState::Stopped).unwrap();
            assert_eq!(guard.stream_state(), StreamState::Stopped);
        }
        assert_eq!(src.stream_state(), StreamState::Started);
    }

    #[test]
    fn interrupt_restores_on_error_path() {
        fn fails(src: &mut SyntheticSource) -> Result<()> {
            let _guard = InterruptStream::new(src, StreamState::Stopped)?;
            Err(Error::Feature("boom".into()))
        }

        let mut src = source();
        src.start_stream().unwrap();
        assert!(fails(&mut src).is_err());
        assert_eq!(src.stream_state(), StreamState::Started);
    }

    #[test]
    fn interrupt_is_noop_when_already_in_state() {
        let mut src = source();
        {
            let _guard = InterruptStream::new(&mut src, StreamState::Stopped).unwrap();
        }
        assert_eq!(src.stream_state(), StreamState::Stopped);
    }

    #[test]
    fn applies_supported_features_and_skips_the_rest() {
        let mut src = source();
        src.start_stream().unwrap();

        let features = FeatureConfig {
            gain: Some(FeatureSetting {
                mode: FeatureMode::Manual,
                value: Some(12),
            }),
            exposure: Some(FeatureSetting {
                mode: FeatureMode::Auto,
                value: None,
            }),
            saturation: Some(FeatureSetting {
                mode: FeatureMode::OneShot,
                value: None,
            }),
            ..FeatureConfig::default()
        };
        apply_features(&mut src, &features).unwrap();

        assert_eq!(src.feature_value(Feature::Gain), Some(12));
        assert!(src.feature_auto(Feature::Exposure));
        // gain needs the stream stopped on the synthetic device
        assert_eq!(src.stream_interruptions(), 1);
        assert_eq!(src.stream_state(), StreamState::Started);
    }
}
