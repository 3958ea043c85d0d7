//! Refresh rate calculators.
//!
//! Each calculator answers "what should the refresh rate be for one reason": steady-state
//! cadence, leaving idle, always-on display, video playback. They consume present timestamps
//! and power transitions, keep their own timers in the controller's [`EventQueue`], and publish
//! a candidate rate through the return value of every mutating call. The
//! [`CombinedRefreshRateCalculator`] arbitrates between them by priority.

use std::sync::atomic::{AtomicU64, Ordering};

use hwc_vrr_config::{Config, RefreshRateCalculatorKind};

use crate::event_queue::{EventQueue, VrrControllerEvent, VrrControllerEventType};
use crate::types::{PowerMode, PresentFrameFlag, INVALID_REFRESH_RATE};

mod aod;
mod combined;
mod exit_idle;
mod instant;
mod period;
mod video;

pub use aod::{AodParameters, AodRefreshRateCalculator};
pub use combined::{CombinedParameters, CombinedRefreshRateCalculator};
pub use exit_idle::{ExitIdleParameters, ExitIdleRefreshRateCalculator};
pub use instant::{InstantParameters, InstantRefreshRateCalculator};
pub use period::{PeriodParameters, PeriodRefreshRateCalculator, PeriodType};
pub use video::{VideoFrameRateCalculator, VideoFrameRateParameters};

/// Identifies one calculator instance, so that its timers can be routed back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CalculatorId(u64);

impl CalculatorId {
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

pub trait RefreshRateCalculator: Send {
    fn name(&self) -> &str;

    fn id(&self) -> CalculatorId;

    /// Whether timers tagged with `id` belong to this calculator or one it wraps.
    fn owns(&self, id: CalculatorId) -> bool {
        self.id() == id
    }

    /// Last published rate, or [`INVALID_REFRESH_RATE`].
    fn refresh_rate(&self) -> i32;

    /// Feeds one present. Returns the new rate when it was published.
    fn on_present(
        &mut self,
        queue: &mut EventQueue,
        present_time_ns: i64,
        flag: PresentFrameFlag,
    ) -> Option<i32>;

    fn on_power_state_change(
        &mut self,
        _queue: &mut EventQueue,
        _from: PowerMode,
        _to: PowerMode,
    ) -> Option<i32> {
        None
    }

    /// Handles one of this calculator's timers. Events it does not own are ignored.
    fn on_event(&mut self, queue: &mut EventQueue, event: &VrrControllerEvent) -> Option<i32>;

    fn set_enabled(&mut self, queue: &mut EventQueue, enabled: bool) -> Option<i32>;

    fn set_vrr_config_attributes(&mut self, vsync_period_ns: i64, min_frame_interval_ns: i64);

    /// Clears all history and cancels pending timers.
    fn reset(&mut self, queue: &mut EventQueue);
}

/// Tracks the published rate and decides when a change must be reported.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PublishedRate {
    rate: i32,
    always_callback: bool,
}

impl PublishedRate {
    pub fn new(always_callback: bool) -> Self {
        Self {
            rate: INVALID_REFRESH_RATE,
            always_callback,
        }
    }

    pub fn get(&self) -> i32 {
        self.rate
    }

    pub fn set(&mut self, rate: i32) -> Option<i32> {
        if rate == self.rate && !self.always_callback {
            return None;
        }
        self.rate = rate;
        Some(rate)
    }

    /// Forgets the rate without reporting.
    pub fn clear(&mut self) {
        self.rate = INVALID_REFRESH_RATE;
    }
}

/// Calculator strategies the factory can build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshRateCalculatorType {
    Instant,
    Period,
    ExitIdle,
    Aod,
    VideoFrameRate,
    /// Priority-ordered arbitration over the listed calculators.
    Combined(Vec<RefreshRateCalculatorType>),
}

impl RefreshRateCalculatorType {
    /// The calculator the controller publishes from.
    pub fn controller_default(kind: RefreshRateCalculatorKind) -> Self {
        let steady = match kind {
            RefreshRateCalculatorKind::Instant => Self::Instant,
            RefreshRateCalculatorKind::Period => Self::Period,
        };
        Self::Combined(vec![Self::Aod, Self::ExitIdle, steady])
    }
}

/// Parameters for every strategy, usually derived from the configuration.
#[derive(Debug, Clone, Default)]
pub struct CalculatorParameters {
    pub instant: InstantParameters,
    pub period: PeriodParameters,
    pub exit_idle: ExitIdleParameters,
    pub aod: AodParameters,
    pub video: VideoFrameRateParameters,
    pub combined: CombinedParameters,
}

impl From<&Config> for CalculatorParameters {
    fn from(config: &Config) -> Self {
        Self {
            instant: InstantParameters::from(&config.instant),
            period: PeriodParameters::from(&config.period),
            exit_idle: ExitIdleParameters::from(&config.exit_idle),
            aod: AodParameters::from(&config.panel),
            video: VideoFrameRateParameters::from(&config.video),
            combined: CombinedParameters::from(&config.combined),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RefreshRateCalculatorFactory {
    params: CalculatorParameters,
}

impl RefreshRateCalculatorFactory {
    pub fn new(params: CalculatorParameters) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &CalculatorParameters {
        &self.params
    }

    pub fn build(&self, ty: &RefreshRateCalculatorType) -> Box<dyn RefreshRateCalculator> {
        let params = &self.params;
        match ty {
            RefreshRateCalculatorType::Instant => {
                Box::new(InstantRefreshRateCalculator::new(params.instant.clone()))
            }
            RefreshRateCalculatorType::Period => {
                Box::new(PeriodRefreshRateCalculator::new(params.period.clone()))
            }
            RefreshRateCalculatorType::ExitIdle => {
                Box::new(ExitIdleRefreshRateCalculator::new(params.exit_idle.clone()))
            }
            RefreshRateCalculatorType::Aod => {
                Box::new(AodRefreshRateCalculator::new(params.aod.clone()))
            }
            RefreshRateCalculatorType::VideoFrameRate => {
                Box::new(VideoFrameRateCalculator::new(params.video.clone()))
            }
            RefreshRateCalculatorType::Combined(children) => {
                let children = children.iter().map(|child| self.build(child)).collect();
                Box::new(CombinedRefreshRateCalculator::new(
                    children,
                    params.combined.clone(),
                ))
            }
        }
    }

    pub fn build_video(&self) -> VideoFrameRateCalculator {
        VideoFrameRateCalculator::new(self.params.video.clone())
    }
}

/// Drops the pending timers that belong to `id`.
pub(crate) fn cancel_timers(queue: &mut EventQueue, id: CalculatorId) {
    queue.drop_calculator_events(id);
}

pub(crate) fn is_timer_for(
    event: &VrrControllerEvent,
    id: CalculatorId,
    ty: VrrControllerEventType,
) -> bool {
    event.event_type == ty && event.calculator() == Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::Clock;

    #[test]
    fn ids_are_unique() {
        let a = CalculatorId::next();
        let b = CalculatorId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn published_rate_reports_changes_only() {
        let mut rate = PublishedRate::new(false);
        assert_eq!(rate.get(), INVALID_REFRESH_RATE);
        assert_eq!(rate.set(60), Some(60));
        assert_eq!(rate.set(60), None);
        assert_eq!(rate.set(INVALID_REFRESH_RATE), Some(INVALID_REFRESH_RATE));

        let mut always = PublishedRate::new(true);
        assert_eq!(always.set(24), Some(24));
        assert_eq!(always.set(24), Some(24));
    }

    #[test]
    fn factory_builds_every_strategy_invalid() {
        let factory = RefreshRateCalculatorFactory::default();
        let mut queue = EventQueue::new(Clock::with_time(0));
        let types = [
            RefreshRateCalculatorType::Instant,
            RefreshRateCalculatorType::Period,
            RefreshRateCalculatorType::ExitIdle,
            RefreshRateCalculatorType::Aod,
            RefreshRateCalculatorType::VideoFrameRate,
            RefreshRateCalculatorType::controller_default(RefreshRateCalculatorKind::Period),
        ];
        for ty in &types {
            let mut calculator = factory.build(ty);
            assert_eq!(calculator.refresh_rate(), INVALID_REFRESH_RATE, "{ty:?}");
            calculator.reset(&mut queue);
            assert_eq!(calculator.refresh_rate(), INVALID_REFRESH_RATE, "{ty:?}");
        }
    }

    #[test]
    fn parameters_follow_config() {
        let mut config = Config::default();
        config.period.confidence_percentage = 50;
        config.instant.timeout_ms = 2000;
        config.panel.ddic_frame_insertion_multiplier = 3;

        let params = CalculatorParameters::from(&config);
        assert_eq!(params.period.confidence_percentage, 50);
        assert_eq!(params.instant.timeout_ns, 2_000_000_000);
        assert_eq!(params.aod.frame_insertion_multiplier, 3);
    }
}
