use crate::event_queue::{EventPayload, EventQueue, VrrControllerEvent, VrrControllerEventType};
use crate::refresh_rate_calculator::{
    cancel_timers, is_timer_for, CalculatorId, PublishedRate, RefreshRateCalculator,
};
use crate::types::{PowerMode, PresentFrameFlag, INVALID_REFRESH_RATE};
use crate::utils::{duration_ns_to_freq, ms_to_ns};

const EVENT_TYPE: VrrControllerEventType =
    VrrControllerEventType::EXIT_IDLE_REFRESH_RATE_CALCULATOR_UPDATE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitIdleParameters {
    /// Minimum gap between presents that counts as idle.
    pub idle_criteria_ns: i64,
    /// How long the boosted rate stays valid after leaving idle.
    pub max_valid_ns: i64,
}

impl Default for ExitIdleParameters {
    fn default() -> Self {
        Self::from(&hwc_vrr_config::ExitIdle::default())
    }
}

impl From<&hwc_vrr_config::ExitIdle> for ExitIdleParameters {
    fn from(config: &hwc_vrr_config::ExitIdle) -> Self {
        Self {
            idle_criteria_ns: ms_to_ns(config.idle_criteria_ms),
            max_valid_ns: ms_to_ns(config.max_valid_ms),
        }
    }
}

/// Reports the maximum frame rate for a short while after the display leaves idle, so the
/// first frames are not held back by a stale slow rate.
#[derive(Debug)]
pub struct ExitIdleRefreshRateCalculator {
    id: CalculatorId,
    params: ExitIdleParameters,
    rate: PublishedRate,
    enabled: bool,
    power_mode: PowerMode,
    max_frame_rate: i32,
    last_present_time_ns: Option<i64>,
}

impl ExitIdleRefreshRateCalculator {
    pub fn new(params: ExitIdleParameters) -> Self {
        Self {
            id: CalculatorId::next(),
            params,
            rate: PublishedRate::new(false),
            enabled: true,
            power_mode: PowerMode::Normal,
            max_frame_rate: 0,
            last_present_time_ns: None,
        }
    }

    fn invalidate(&mut self, queue: &mut EventQueue) -> Option<i32> {
        cancel_timers(queue, self.id);
        self.rate.set(INVALID_REFRESH_RATE)
    }
}

impl RefreshRateCalculator for ExitIdleRefreshRateCalculator {
    fn name(&self) -> &str {
        "ExitIdle"
    }

    fn id(&self) -> CalculatorId {
        self.id
    }

    fn refresh_rate(&self) -> i32 {
        self.rate.get()
    }

    fn on_present(
        &mut self,
        queue: &mut EventQueue,
        present_time_ns: i64,
        _flag: PresentFrameFlag,
    ) -> Option<i32> {
        if !self.enabled || self.power_mode != PowerMode::Normal || self.max_frame_rate <= 0 {
            return None;
        }

        // No previous present means the display just came back on.
        let exiting_idle = self
            .last_present_time_ns
            .replace(present_time_ns)
            .map_or(true, |last| {
                present_time_ns - last >= self.params.idle_criteria_ns
            });
        if !exiting_idle {
            return None;
        }

        debug!("exiting idle at {present_time_ns}");
        cancel_timers(queue, self.id);
        queue.post_event_in(
            EVENT_TYPE,
            EventPayload::Calculator(self.id),
            self.params.max_valid_ns,
        );
        self.rate.set(self.max_frame_rate)
    }

    fn on_power_state_change(
        &mut self,
        queue: &mut EventQueue,
        _from: PowerMode,
        to: PowerMode,
    ) -> Option<i32> {
        self.power_mode = to;
        self.last_present_time_ns = None;
        if to == PowerMode::Normal {
            return None;
        }
        self.invalidate(queue)
    }

    fn on_event(&mut self, _queue: &mut EventQueue, event: &VrrControllerEvent) -> Option<i32> {
        if !is_timer_for(event, self.id, EVENT_TYPE) {
            return None;
        }
        self.rate.set(INVALID_REFRESH_RATE)
    }

    fn set_enabled(&mut self, queue: &mut EventQueue, enabled: bool) -> Option<i32> {
        self.enabled = enabled;
        self.last_present_time_ns = None;
        if enabled {
            return None;
        }
        self.invalidate(queue)
    }

    fn set_vrr_config_attributes(&mut self, _vsync_period_ns: i64, min_frame_interval_ns: i64) {
        self.max_frame_rate = duration_ns_to_freq(min_frame_interval_ns);
    }

    fn reset(&mut self, queue: &mut EventQueue) {
        cancel_timers(queue, self.id);
        self.last_present_time_ns = None;
        self.rate.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::Clock;

    const FRAME_120HZ: i64 = 8_333_333;

    fn calculator() -> (ExitIdleRefreshRateCalculator, EventQueue, Clock) {
        let clock = Clock::with_time(0);
        let queue = EventQueue::new(clock.clone());
        let mut calculator = ExitIdleRefreshRateCalculator::new(ExitIdleParameters::default());
        calculator.set_vrr_config_attributes(FRAME_120HZ, FRAME_120HZ);
        (calculator, queue, clock)
    }

    #[test]
    fn boosts_after_idle_gap_then_expires() {
        let (mut calc, mut queue, clock) = calculator();
        assert_eq!(
            calc.on_present(&mut queue, 0, PresentFrameFlag::empty()),
            Some(120)
        );

        clock.set(250_000_000);
        let event = queue.pop_due(clock.now_ns()).unwrap();
        assert_eq!(
            calc.on_event(&mut queue, &event),
            Some(INVALID_REFRESH_RATE)
        );

        // Regular cadence does not count as leaving idle.
        clock.set(300_000_000);
        assert_eq!(
            calc.on_present(&mut queue, 300_000_000, PresentFrameFlag::empty()),
            None
        );
        assert!(queue.is_empty());

        clock.set(1_500_000_000);
        assert_eq!(
            calc.on_present(&mut queue, 1_500_000_000, PresentFrameFlag::empty()),
            Some(120)
        );
        assert_eq!(queue.next_event_time(), Some(1_750_000_000));
    }

    #[test]
    fn leaving_normal_mode_invalidates() {
        let (mut calc, mut queue, _clock) = calculator();
        calc.on_present(&mut queue, 0, PresentFrameFlag::empty());
        assert_eq!(calc.refresh_rate(), 120);

        let rate = calc.on_power_state_change(&mut queue, PowerMode::Normal, PowerMode::Doze);
        assert_eq!(rate, Some(INVALID_REFRESH_RATE));
        assert!(queue.is_empty());

        calc.on_power_state_change(&mut queue, PowerMode::Doze, PowerMode::Normal);
        assert_eq!(
            calc.on_present(&mut queue, 10, PresentFrameFlag::empty()),
            Some(120)
        );
    }
}
