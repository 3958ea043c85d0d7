use crate::event_queue::{EventPayload, EventQueue, VrrControllerEvent, VrrControllerEventType};
use crate::refresh_rate_calculator::{
    cancel_timers, is_timer_for, CalculatorId, PublishedRate, RefreshRateCalculator,
};
use crate::types::{PowerMode, PresentFrameFlag, INVALID_REFRESH_RATE};
use crate::utils::{duration_ns_to_freq, ms_to_ns, round_divide};

const EVENT_TYPE: VrrControllerEventType =
    VrrControllerEventType::INSTANT_REFRESH_RATE_CALCULATOR_UPDATE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstantParameters {
    /// Without a present for this long the rate becomes invalid.
    pub timeout_ns: i64,
}

impl Default for InstantParameters {
    fn default() -> Self {
        Self::from(&hwc_vrr_config::Instant::default())
    }
}

impl From<&hwc_vrr_config::Instant> for InstantParameters {
    fn from(config: &hwc_vrr_config::Instant) -> Self {
        Self {
            timeout_ns: ms_to_ns(config.timeout_ms),
        }
    }
}

/// Derives the rate from the gap between the last two presents.
#[derive(Debug)]
pub struct InstantRefreshRateCalculator {
    id: CalculatorId,
    params: InstantParameters,
    rate: PublishedRate,
    enabled: bool,
    power_mode: PowerMode,
    min_frame_interval_ns: i64,
    max_frame_rate: i32,
    last_present_time_ns: Option<i64>,
}

impl InstantRefreshRateCalculator {
    pub fn new(params: InstantParameters) -> Self {
        Self {
            id: CalculatorId::next(),
            params,
            rate: PublishedRate::new(false),
            enabled: true,
            power_mode: PowerMode::Normal,
            min_frame_interval_ns: 0,
            max_frame_rate: 0,
            last_present_time_ns: None,
        }
    }

    fn rate_for_interval(&self, interval_ns: i64) -> i32 {
        let frames = round_divide(interval_ns, self.min_frame_interval_ns).max(1);
        let rate = round_divide(i64::from(self.max_frame_rate), frames);
        rate.clamp(1, i64::from(self.max_frame_rate)) as i32
    }
}

impl RefreshRateCalculator for InstantRefreshRateCalculator {
    fn name(&self) -> &str {
        "Instant"
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

        let last = self.last_present_time_ns.replace(present_time_ns);

        cancel_timers(queue, self.id);
        queue.post_event_in(
            EVENT_TYPE,
            EventPayload::Calculator(self.id),
            self.params.timeout_ns,
        );

        let last = last?;
        let rate = self.rate_for_interval(present_time_ns - last);
        trace!("instant rate {rate} from interval {}", present_time_ns - last);
        self.rate.set(rate)
    }

    fn on_power_state_change(
        &mut self,
        queue: &mut EventQueue,
        _from: PowerMode,
        to: PowerMode,
    ) -> Option<i32> {
        self.power_mode = to;
        if to == PowerMode::Normal {
            return None;
        }

        cancel_timers(queue, self.id);
        self.last_present_time_ns = None;
        self.rate.set(INVALID_REFRESH_RATE)
    }

    fn on_event(&mut self, _queue: &mut EventQueue, event: &VrrControllerEvent) -> Option<i32> {
        if !is_timer_for(event, self.id, EVENT_TYPE) {
            return None;
        }

        self.last_present_time_ns = None;
        self.rate.set(INVALID_REFRESH_RATE)
    }

    fn set_enabled(&mut self, queue: &mut EventQueue, enabled: bool) -> Option<i32> {
        self.enabled = enabled;
        if enabled {
            return None;
        }

        cancel_timers(queue, self.id);
        self.last_present_time_ns = None;
        self.rate.set(INVALID_REFRESH_RATE)
    }

    fn set_vrr_config_attributes(&mut self, _vsync_period_ns: i64, min_frame_interval_ns: i64) {
        self.min_frame_interval_ns = min_frame_interval_ns;
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
    use proptest::prelude::*;

    use super::*;
    use crate::utils::clock::Clock;

    const FRAME_60HZ: i64 = 16_666_667;

    fn calculator() -> (InstantRefreshRateCalculator, EventQueue, Clock) {
        let clock = Clock::with_time(0);
        let queue = EventQueue::new(clock.clone());
        let mut calculator = InstantRefreshRateCalculator::new(InstantParameters::default());
        calculator.set_vrr_config_attributes(8_333_333, FRAME_60HZ);
        (calculator, queue, clock)
    }

    #[test]
    fn rate_from_consecutive_presents() {
        let (mut calc, mut queue, clock) = calculator();
        assert_eq!(calc.on_present(&mut queue, 0, PresentFrameFlag::empty()), None);
        assert_eq!(calc.refresh_rate(), INVALID_REFRESH_RATE);

        clock.set(2 * FRAME_60HZ);
        let rate = calc.on_present(&mut queue, 2 * FRAME_60HZ, PresentFrameFlag::empty());
        assert_eq!(rate, Some(30));

        clock.set(3 * FRAME_60HZ);
        let rate = calc.on_present(&mut queue, 3 * FRAME_60HZ, PresentFrameFlag::empty());
        assert_eq!(rate, Some(60));

        // One timer per calculator, restarted by each present.
        assert_eq!(queue.number_of_events(EVENT_TYPE), 1);
    }

    #[test]
    fn invalid_after_timeout() {
        let (mut calc, mut queue, clock) = calculator();
        calc.on_present(&mut queue, 0, PresentFrameFlag::empty());
        calc.on_present(&mut queue, FRAME_60HZ, PresentFrameFlag::empty());
        assert_eq!(calc.refresh_rate(), 60);

        clock.set(2_000_000_000);
        let event = queue.pop_due(clock.now_ns()).unwrap();
        assert_eq!(calc.on_event(&mut queue, &event), Some(INVALID_REFRESH_RATE));
        assert_eq!(calc.refresh_rate(), INVALID_REFRESH_RATE);
    }

    #[test]
    fn ignores_presents_outside_normal_mode() {
        let (mut calc, mut queue, _clock) = calculator();
        calc.on_power_state_change(&mut queue, PowerMode::Normal, PowerMode::Doze);
        calc.on_present(&mut queue, 0, PresentFrameFlag::PRESENTING_WHEN_DOZE);
        calc.on_present(&mut queue, FRAME_60HZ, PresentFrameFlag::PRESENTING_WHEN_DOZE);
        assert_eq!(calc.refresh_rate(), INVALID_REFRESH_RATE);
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn rate_stays_within_frame_rate_range(
            presents in prop::collection::vec(0i64..5_000_000_000, 2..50),
        ) {
            let (mut calc, mut queue, _clock) = calculator();
            for present in presents {
                calc.on_present(&mut queue, present, PresentFrameFlag::empty());
                let rate = calc.refresh_rate();
                prop_assert!(rate == INVALID_REFRESH_RATE || (1..=60).contains(&rate));
            }
            prop_assert!((1..=60).contains(&calc.refresh_rate()));
        }
    }
}
