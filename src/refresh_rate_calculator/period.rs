use std::collections::BTreeMap;

use hwc_vrr_config::PeriodKind;

use crate::event_queue::{EventPayload, EventQueue, VrrControllerEvent, VrrControllerEventType};
use crate::refresh_rate_calculator::{
    cancel_timers, is_timer_for, CalculatorId, PublishedRate, RefreshRateCalculator,
};
use crate::types::{PowerMode, PresentFrameFlag, INVALID_REFRESH_RATE};
use crate::utils::{duration_ns_to_freq, round_divide, timer_ms_to_ns};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodType {
    /// Presents per covered vsync, scaled to the vsync rate.
    Average,
    /// The most frequent present interval.
    Majority,
}

impl From<PeriodKind> for PeriodType {
    fn from(kind: PeriodKind) -> Self {
        match kind {
            PeriodKind::Average => Self::Average,
            PeriodKind::Majority => Self::Majority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodParameters {
    pub ty: PeriodType,
    pub measure_period_ns: i64,
    /// Share of the window's vsyncs the samples must cover for a conclusive result.
    pub confidence_percentage: u32,
    /// Publish at the end of every window even when the rate did not change.
    pub always_callback: bool,
    pub event_type: VrrControllerEventType,
}

impl Default for PeriodParameters {
    fn default() -> Self {
        Self::from(&hwc_vrr_config::Period::default())
    }
}

impl From<&hwc_vrr_config::Period> for PeriodParameters {
    fn from(config: &hwc_vrr_config::Period) -> Self {
        Self {
            ty: config.kind.into(),
            measure_period_ns: timer_ms_to_ns(config.measure_period_ms),
            confidence_percentage: config.confidence_percentage.min(100),
            always_callback: false,
            event_type: VrrControllerEventType::PERIOD_REFRESH_RATE_CALCULATOR_UPDATE,
        }
    }
}

/// Measures the present cadence over fixed windows.
#[derive(Debug)]
pub struct PeriodRefreshRateCalculator {
    id: CalculatorId,
    params: PeriodParameters,
    rate: PublishedRate,
    enabled: bool,
    power_mode: PowerMode,
    vsync_period_ns: i64,
    max_frame_rate: i32,
    last_present_time_ns: Option<i64>,
    window_running: bool,
    /// Present count keyed by the interval in vsyncs.
    histogram: BTreeMap<i64, u32>,
}

impl PeriodRefreshRateCalculator {
    pub fn new(params: PeriodParameters) -> Self {
        Self {
            id: CalculatorId::next(),
            rate: PublishedRate::new(params.always_callback),
            params,
            enabled: true,
            power_mode: PowerMode::Normal,
            vsync_period_ns: 0,
            max_frame_rate: 0,
            last_present_time_ns: None,
            window_running: false,
            histogram: BTreeMap::new(),
        }
    }

    pub fn params(&self) -> &PeriodParameters {
        &self.params
    }

    fn is_sampling(&self) -> bool {
        self.enabled && self.power_mode == PowerMode::Normal && self.vsync_period_ns > 0
    }

    fn schedule_window(&mut self, queue: &mut EventQueue) {
        queue.post_event_in(
            self.params.event_type,
            EventPayload::Calculator(self.id),
            self.params.measure_period_ns.max(1),
        );
        self.window_running = true;
    }

    fn stop(&mut self, queue: &mut EventQueue) {
        cancel_timers(queue, self.id);
        self.window_running = false;
        self.last_present_time_ns = None;
        self.histogram.clear();
    }

    /// Evaluates the samples of the window that just closed.
    fn measure(&self) -> i32 {
        let count: u64 = self.histogram.values().map(|&c| u64::from(c)).sum();
        if count == 0 {
            return INVALID_REFRESH_RATE;
        }

        let covered_vsyncs: i64 = self
            .histogram
            .iter()
            .map(|(&vsyncs, &c)| vsyncs * i64::from(c))
            .sum();
        let expected_vsyncs = self.params.measure_period_ns / self.vsync_period_ns;
        if covered_vsyncs * 100 < i64::from(self.params.confidence_percentage) * expected_vsyncs
        {
            trace!("inconclusive window: {covered_vsyncs} of {expected_vsyncs} vsyncs");
            return INVALID_REFRESH_RATE;
        }

        let vsync_rate = i64::from(duration_ns_to_freq(self.vsync_period_ns));
        let rate = match self.params.ty {
            PeriodType::Average => round_divide(vsync_rate * count as i64, covered_vsyncs),
            PeriodType::Majority => {
                // Ties go to the shorter interval.
                let (&vsyncs, _) = self
                    .histogram
                    .iter()
                    .rev()
                    .max_by_key(|(_, &c)| c)
                    .unwrap_or((&1, &0));
                round_divide(vsync_rate, vsyncs)
            }
        };

        rate.clamp(1, i64::from(self.max_frame_rate.max(1))) as i32
    }
}

impl RefreshRateCalculator for PeriodRefreshRateCalculator {
    fn name(&self) -> &str {
        "Period"
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
        if !self.is_sampling() {
            return None;
        }

        if !self.window_running {
            self.schedule_window(queue);
        }

        if let Some(last) = self.last_present_time_ns {
            let interval_ns = present_time_ns - last;
            if interval_ns > 0 && interval_ns <= self.params.measure_period_ns {
                let vsyncs = round_divide(interval_ns, self.vsync_period_ns).max(1);
                *self.histogram.entry(vsyncs).or_default() += 1;
            }
        }
        self.last_present_time_ns = Some(present_time_ns);

        None
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

        self.stop(queue);
        self.rate.set(INVALID_REFRESH_RATE)
    }

    fn on_event(&mut self, queue: &mut EventQueue, event: &VrrControllerEvent) -> Option<i32> {
        if !is_timer_for(event, self.id, self.params.event_type) {
            return None;
        }

        let rate = self.measure();
        self.histogram.clear();
        self.window_running = false;
        if self.is_sampling() {
            self.schedule_window(queue);
        }

        trace!("period window closed at {}: {rate}", event.when_ns);
        self.rate.set(rate)
    }

    fn set_enabled(&mut self, queue: &mut EventQueue, enabled: bool) -> Option<i32> {
        self.enabled = enabled;
        if enabled {
            return None;
        }

        self.stop(queue);
        self.rate.set(INVALID_REFRESH_RATE)
    }

    fn set_vrr_config_attributes(&mut self, vsync_period_ns: i64, min_frame_interval_ns: i64) {
        self.vsync_period_ns = vsync_period_ns;
        self.max_frame_rate = duration_ns_to_freq(min_frame_interval_ns);
        // Intervals measured against the old vsync period are meaningless now.
        self.histogram.clear();
        self.last_present_time_ns = None;
    }

    fn reset(&mut self, queue: &mut EventQueue) {
        self.stop(queue);
        self.rate.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::Clock;

    const VSYNC_120HZ: i64 = 8_333_333;
    const FRAME_60HZ: i64 = 16_666_667;

    fn calculator(params: PeriodParameters) -> (PeriodRefreshRateCalculator, EventQueue, Clock) {
        let clock = Clock::with_time(0);
        let queue = EventQueue::new(clock.clone());
        let mut calculator = PeriodRefreshRateCalculator::new(params);
        calculator.set_vrr_config_attributes(VSYNC_120HZ, VSYNC_120HZ);
        (calculator, queue, clock)
    }

    fn present_every(
        calc: &mut PeriodRefreshRateCalculator,
        queue: &mut EventQueue,
        clock: &Clock,
        interval_ns: i64,
        count: usize,
    ) {
        for _ in 0..count {
            calc.on_present(queue, clock.now_ns(), PresentFrameFlag::empty());
            clock.advance(interval_ns);
        }
    }

    fn close_window(
        calc: &mut PeriodRefreshRateCalculator,
        queue: &mut EventQueue,
        clock: &Clock,
    ) -> Option<i32> {
        clock.set(queue.next_event_time().unwrap());
        let event = queue.pop_due(clock.now_ns()).unwrap();
        calc.on_event(queue, &event)
    }

    #[test]
    fn average_over_window() {
        let (mut calc, mut queue, clock) = calculator(PeriodParameters::default());
        present_every(&mut calc, &mut queue, &clock, 16_600_000, 10);
        assert_eq!(calc.refresh_rate(), INVALID_REFRESH_RATE);

        assert_eq!(close_window(&mut calc, &mut queue, &clock), Some(60));
        // The next window is already scheduled.
        assert_eq!(
            queue.number_of_events(VrrControllerEventType::PERIOD_REFRESH_RATE_CALCULATOR_UPDATE),
            1
        );
    }

    #[test]
    fn zero_length_window_rearms_ahead() {
        let config = hwc_vrr_config::Period {
            measure_period_ms: 0,
            ..hwc_vrr_config::Period::default()
        };
        assert_eq!(
            PeriodParameters::from(&config).measure_period_ns,
            crate::utils::NANOS_PER_MILLI
        );

        let params = PeriodParameters {
            measure_period_ns: 0,
            ..PeriodParameters::default()
        };
        let (mut calc, mut queue, clock) = calculator(params);
        present_every(&mut calc, &mut queue, &clock, FRAME_60HZ, 2);
        close_window(&mut calc, &mut queue, &clock);

        let next = queue.next_event_time().unwrap();
        assert!(next > clock.now_ns());
        assert!(queue.pop_due(clock.now_ns()).is_none());
    }

    #[test]
    fn inconclusive_window_is_invalid() {
        let (mut calc, mut queue, clock) = calculator(PeriodParameters::default());
        // Two intervals of two vsyncs cover 4 of 60 vsyncs, below 20 %.
        present_every(&mut calc, &mut queue, &clock, FRAME_60HZ, 3);
        assert_eq!(close_window(&mut calc, &mut queue, &clock), None);
        assert_eq!(calc.refresh_rate(), INVALID_REFRESH_RATE);
    }

    #[test]
    fn majority_picks_most_frequent_interval() {
        let params = PeriodParameters {
            ty: PeriodType::Majority,
            confidence_percentage: 0,
            ..PeriodParameters::default()
        };
        let (mut calc, mut queue, clock) = calculator(params);
        present_every(&mut calc, &mut queue, &clock, FRAME_60HZ, 6);
        present_every(&mut calc, &mut queue, &clock, VSYNC_120HZ, 3);
        assert_eq!(close_window(&mut calc, &mut queue, &clock), Some(60));
    }

    #[test]
    fn empty_window_reschedules() {
        let (mut calc, mut queue, clock) = calculator(PeriodParameters::default());
        present_every(&mut calc, &mut queue, &clock, FRAME_60HZ, 30);
        assert_eq!(close_window(&mut calc, &mut queue, &clock), Some(60));

        // No presents in the second window.
        assert_eq!(
            close_window(&mut calc, &mut queue, &clock),
            Some(INVALID_REFRESH_RATE)
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn power_off_cancels_window() {
        let (mut calc, mut queue, clock) = calculator(PeriodParameters::default());
        present_every(&mut calc, &mut queue, &clock, FRAME_60HZ, 5);
        assert_eq!(queue.len(), 1);

        calc.on_power_state_change(&mut queue, PowerMode::Normal, PowerMode::Off);
        assert!(queue.is_empty());
        calc.on_present(&mut queue, clock.now_ns(), PresentFrameFlag::empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn always_callback_reports_every_window() {
        let params = PeriodParameters {
            always_callback: true,
            confidence_percentage: 0,
            ..PeriodParameters::default()
        };
        let (mut calc, mut queue, clock) = calculator(params);
        present_every(&mut calc, &mut queue, &clock, FRAME_60HZ, 30);
        assert_eq!(close_window(&mut calc, &mut queue, &clock), Some(60));
        present_every(&mut calc, &mut queue, &clock, FRAME_60HZ, 30);
        assert_eq!(close_window(&mut calc, &mut queue, &clock), Some(60));
    }
}
