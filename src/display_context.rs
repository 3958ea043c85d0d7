//! Read-only view of the display the calculators and the controller consult.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::types::{BrightnessMode, DisplayConfiguration, OperationSpeedMode, INVALID_REFRESH_RATE};

/// Live panel and sensor state owned by the display pipeline.
pub trait DisplayStateSource: Send + Sync {
    fn brightness_mode(&self) -> BrightnessMode;
    fn brightness_nits(&self) -> f32;
    fn ambient_light_lux(&self) -> f32;
    fn is_proximity_throttling_enabled(&self) -> bool;
    fn operation_speed_mode(&self) -> OperationSpeedMode;
}

pub trait CommonDisplayContextProvider: Send + Sync {
    fn operation_speed_mode(&self) -> OperationSpeedMode;
    fn brightness_mode(&self) -> BrightnessMode;
    fn brightness_nits(&self) -> f32;
    fn ambient_light_lux(&self) -> f32;
    fn is_proximity_throttling_enabled(&self) -> bool;

    /// Current video frame rate estimate, or [`INVALID_REFRESH_RATE`].
    fn estimated_video_frame_rate(&self) -> i32 {
        self.video_frame_rate_estimate().get()
    }

    /// Cell the controller's video frame rate calculator publishes into.
    fn video_frame_rate_estimate(&self) -> &VideoFrameRateEstimate;

    fn display_config(&self, config_id: i32) -> Option<DisplayConfiguration>;

    /// Every known configuration, sorted by id.
    fn display_configs(&self) -> Vec<(i32, DisplayConfiguration)>;

    fn te_frequency(&self, config_id: i32) -> Option<i32> {
        self.display_config(config_id).map(|config| config.te_frequency)
    }
}

/// Shared video frame rate estimate.
#[derive(Debug, Clone)]
pub struct VideoFrameRateEstimate(Arc<AtomicI32>);

impl Default for VideoFrameRateEstimate {
    fn default() -> Self {
        Self(Arc::new(AtomicI32::new(INVALID_REFRESH_RATE)))
    }
}

impl VideoFrameRateEstimate {
    pub fn get(&self) -> i32 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, rate: i32) {
        self.0.store(rate, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocFamily {
    Gs101,
    Gs201,
    Zuma,
    ZumaPro,
}

impl SocFamily {
    /// Whether the panel driver switches between HS and NS operation rates.
    pub fn has_operation_rate_switch(self) -> bool {
        matches!(self, Self::Zuma | Self::ZumaPro)
    }
}

pub struct DisplayContextProviderImpl {
    source: Arc<dyn DisplayStateSource>,
    configs: HashMap<i32, DisplayConfiguration>,
    operation_rate_switch: bool,
    video_frame_rate: VideoFrameRateEstimate,
}

impl DisplayContextProviderImpl {
    pub fn new(
        source: Arc<dyn DisplayStateSource>,
        configs: HashMap<i32, DisplayConfiguration>,
        operation_rate_switch: bool,
    ) -> Self {
        Self {
            source,
            configs,
            operation_rate_switch,
            video_frame_rate: VideoFrameRateEstimate::default(),
        }
    }
}

impl CommonDisplayContextProvider for DisplayContextProviderImpl {
    fn operation_speed_mode(&self) -> OperationSpeedMode {
        if self.operation_rate_switch {
            self.source.operation_speed_mode()
        } else {
            OperationSpeedMode::Hs
        }
    }

    fn brightness_mode(&self) -> BrightnessMode {
        self.source.brightness_mode()
    }

    fn brightness_nits(&self) -> f32 {
        self.source.brightness_nits()
    }

    fn ambient_light_lux(&self) -> f32 {
        self.source.ambient_light_lux()
    }

    fn is_proximity_throttling_enabled(&self) -> bool {
        self.source.is_proximity_throttling_enabled()
    }

    fn video_frame_rate_estimate(&self) -> &VideoFrameRateEstimate {
        &self.video_frame_rate
    }

    fn display_config(&self, config_id: i32) -> Option<DisplayConfiguration> {
        self.configs.get(&config_id).copied()
    }

    fn display_configs(&self) -> Vec<(i32, DisplayConfiguration)> {
        let mut configs: Vec<_> = self.configs.iter().map(|(&id, &c)| (id, c)).collect();
        configs.sort_by_key(|&(id, _)| id);
        configs
    }
}

pub fn create_display_context_provider(
    soc: SocFamily,
    source: Arc<dyn DisplayStateSource>,
    configs: HashMap<i32, DisplayConfiguration>,
) -> Arc<dyn CommonDisplayContextProvider> {
    debug!("creating display context provider for {soc:?}");
    Arc::new(DisplayContextProviderImpl::new(
        source,
        configs,
        soc.has_operation_rate_switch(),
    ))
}

/// Display state set explicitly, for embedders without live panel state and for tests.
#[derive(Debug, Default)]
pub struct FixedDisplayState {
    inner: Mutex<FixedDisplayStateInner>,
}

#[derive(Debug, Default, Clone, Copy)]
struct FixedDisplayStateInner {
    brightness_mode: BrightnessMode,
    brightness_nits: f32,
    ambient_light_lux: f32,
    proximity_throttling: bool,
    operation_speed_mode: OperationSpeedMode,
}

impl FixedDisplayState {
    fn with<T>(&self, f: impl FnOnce(&mut FixedDisplayStateInner) -> T) -> T {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut inner)
    }

    pub fn set_brightness(&self, mode: BrightnessMode, nits: f32) {
        self.with(|s| {
            s.brightness_mode = mode;
            s.brightness_nits = nits;
        });
    }

    pub fn set_ambient_light_lux(&self, lux: f32) {
        self.with(|s| s.ambient_light_lux = lux);
    }

    pub fn set_proximity_throttling(&self, enabled: bool) {
        self.with(|s| s.proximity_throttling = enabled);
    }

    pub fn set_operation_speed_mode(&self, mode: OperationSpeedMode) {
        self.with(|s| s.operation_speed_mode = mode);
    }
}

impl DisplayStateSource for FixedDisplayState {
    fn brightness_mode(&self) -> BrightnessMode {
        self.with(|s| s.brightness_mode)
    }

    fn brightness_nits(&self) -> f32 {
        self.with(|s| s.brightness_nits)
    }

    fn ambient_light_lux(&self) -> f32 {
        self.with(|s| s.ambient_light_lux)
    }

    fn is_proximity_throttling_enabled(&self) -> bool {
        self.with(|s| s.proximity_throttling)
    }

    fn operation_speed_mode(&self) -> OperationSpeedMode {
        self.with(|s| s.operation_speed_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configs() -> HashMap<i32, DisplayConfiguration> {
        HashMap::from([
            (
                1,
                DisplayConfiguration {
                    width: 1080,
                    height: 2400,
                    vsync_period_ns: 8_333_333,
                    te_frequency: 120,
                },
            ),
            (
                0,
                DisplayConfiguration {
                    width: 1080,
                    height: 2400,
                    vsync_period_ns: 16_666_667,
                    te_frequency: 240,
                },
            ),
        ])
    }

    #[test]
    fn reads_through_to_source() {
        let state = Arc::new(FixedDisplayState::default());
        let provider = create_display_context_provider(SocFamily::Zuma, state.clone(), configs());

        state.set_brightness(BrightnessMode::Hbm, 1000.);
        state.set_ambient_light_lux(250.);
        state.set_proximity_throttling(true);
        state.set_operation_speed_mode(OperationSpeedMode::Ns);

        assert_eq!(provider.brightness_mode(), BrightnessMode::Hbm);
        assert_eq!(provider.brightness_nits(), 1000.);
        assert_eq!(provider.ambient_light_lux(), 250.);
        assert!(provider.is_proximity_throttling_enabled());
        assert_eq!(provider.operation_speed_mode(), OperationSpeedMode::Ns);
    }

    #[test]
    fn operation_rate_is_fixed_without_switch() {
        let state = Arc::new(FixedDisplayState::default());
        state.set_operation_speed_mode(OperationSpeedMode::Ns);
        let provider = create_display_context_provider(SocFamily::Gs101, state, configs());
        assert_eq!(provider.operation_speed_mode(), OperationSpeedMode::Hs);
    }

    #[test]
    fn configs_and_video_estimate() {
        let state = Arc::new(FixedDisplayState::default());
        let provider = create_display_context_provider(SocFamily::Gs201, state, configs());

        assert_eq!(provider.te_frequency(0), Some(240));
        assert_eq!(provider.te_frequency(7), None);
        let ids: Vec<_> = provider.display_configs().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, [0, 1]);

        assert_eq!(provider.estimated_video_frame_rate(), INVALID_REFRESH_RATE);
        provider.video_frame_rate_estimate().clone().set(24);
        assert_eq!(provider.estimated_video_frame_rate(), 24);
    }
}
