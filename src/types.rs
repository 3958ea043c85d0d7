//! Type definitions shared by the controller, the calculators and the statistics.

use bitflags::bitflags;
use serde::Serialize;

use crate::utils::duration_ns_to_freq;

// =============================================================================
// Constants
// =============================================================================

/// Refresh rate reported when a calculator has nothing meaningful to say.
pub const INVALID_REFRESH_RATE: i32 = -1;

pub const INVALID_TIMESTAMP_NS: i64 = -1;

/// Refresh rate the panel runs at while dozing with no new frames.
pub const DOZE_IDLE_REFRESH_RATE: i32 = 1;

/// Refresh rate the panel boosts to while presenting a frame in doze.
pub const DOZE_ACTIVE_REFRESH_RATE: i32 = 30;

// =============================================================================
// Power and brightness
// =============================================================================

/// HWC power mode, numbered as the composer HAL numbers them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum PowerMode {
    #[default]
    Off = 0,
    Doze = 1,
    Normal = 2,
    DozeSuspend = 3,
    OnSuspend = 4,
}

impl PowerMode {
    /// Whether the panel shows nothing the controller has to track.
    pub fn is_off(self) -> bool {
        matches!(self, Self::Off | Self::DozeSuspend)
    }

    pub fn is_doze(self) -> bool {
        matches!(self, Self::Doze)
    }

    pub fn short_name(self) -> &'static str {
        match self {
            Self::Off => "Off",
            Self::Doze => "LP",
            Self::Normal => "On",
            Self::DozeSuspend => "LPS",
            Self::OnSuspend => "OnS",
        }
    }
}

impl TryFrom<i32> for PowerMode {
    type Error = anyhow::Error;

    fn try_from(value: i32) -> anyhow::Result<Self> {
        Ok(match value {
            0 => Self::Off,
            1 => Self::Doze,
            2 => Self::Normal,
            3 => Self::DozeSuspend,
            4 => Self::OnSuspend,
            x => anyhow::bail!("unknown power mode {x}"),
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum BrightnessMode {
    #[default]
    Normal,
    /// Global high brightness mode.
    Hbm,
    /// Local high brightness mode, used for under-display fingerprint illumination.
    Lhbm,
}

impl BrightnessMode {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Normal => "",
            Self::Hbm => ":HBM",
            Self::Lhbm => ":LHBM",
        }
    }
}

/// Panel operation rate mode; the high speed mode is required for refresh rates above 60 Hz.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationSpeedMode {
    #[default]
    Hs,
    Ns,
}

// =============================================================================
// Present flags
// =============================================================================

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PresentFrameFlag: u32 {
        const IS_HDR = 1 << 0;
        /// The frame was presented while the panel was dozing.
        const PRESENTING_WHEN_DOZE = 1 << 1;
        const UPDATE_REFRESH_RATE_INDICATOR = 1 << 2;
    }
}

// =============================================================================
// Display configurations
// =============================================================================

/// Expected-present contract of a fully VRR capable mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyExpectedPresentConfig {
    pub heads_up_ns: i64,
    /// Time without presents after which the controller hibernates.
    pub timeout_ns: i64,
}

/// Per-mode VRR descriptor supplied by the display mode negotiation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VrrConfig {
    pub vsync_period_ns: i64,
    pub min_frame_interval_ns: i64,
    pub is_fully_supported: bool,
    pub notify_expected_present_config: Option<NotifyExpectedPresentConfig>,
}

impl VrrConfig {
    pub fn max_frame_rate(&self) -> i32 {
        duration_ns_to_freq(self.min_frame_interval_ns)
    }

    pub fn te_frequency(&self) -> i32 {
        duration_ns_to_freq(self.vsync_period_ns)
    }

    /// Rendering timeout when the mode promises expected-present notifications.
    pub fn rendering_timeout_ns(&self) -> Option<i64> {
        if !self.is_fully_supported {
            return None;
        }
        self.notify_expected_present_config
            .map(|config| config.timeout_ns)
    }
}

/// Geometry and timing of a display configuration, as the context provider exposes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DisplayConfiguration {
    pub width: u32,
    pub height: u32,
    pub vsync_period_ns: i64,
    /// Frequency of the panel's TE signal, which may exceed the refresh rate.
    pub te_frequency: i32,
}

impl DisplayConfiguration {
    pub fn refresh_rate(&self) -> i32 {
        duration_ns_to_freq(self.vsync_period_ns)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_mode_numbering() {
        for mode in [
            PowerMode::Off,
            PowerMode::Doze,
            PowerMode::Normal,
            PowerMode::DozeSuspend,
            PowerMode::OnSuspend,
        ] {
            assert_eq!(PowerMode::try_from(mode as i32).unwrap(), mode);
        }
        assert!(PowerMode::try_from(7).is_err());
        assert!(PowerMode::DozeSuspend.is_off());
        assert!(!PowerMode::Doze.is_off());
    }

    #[test]
    fn rendering_timeout_requires_full_support() {
        let mut config = VrrConfig {
            vsync_period_ns: 8_333_333,
            min_frame_interval_ns: 16_666_667,
            is_fully_supported: false,
            notify_expected_present_config: Some(NotifyExpectedPresentConfig {
                heads_up_ns: 30_000_000,
                timeout_ns: 200_000_000,
            }),
        };
        assert_eq!(config.rendering_timeout_ns(), None);
        assert_eq!(config.max_frame_rate(), 60);
        assert_eq!(config.te_frequency(), 120);

        config.is_fully_supported = true;
        assert_eq!(config.rendering_timeout_ns(), Some(200_000_000));
    }
}
