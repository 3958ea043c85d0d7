use std::collections::VecDeque;

use crate::event_queue::{EventQueue, VrrControllerEvent, VrrControllerEventType};
use crate::refresh_rate_calculator::{
    CalculatorId, PeriodParameters, PeriodRefreshRateCalculator, PeriodType, PublishedRate,
    RefreshRateCalculator,
};
use crate::types::{PowerMode, PresentFrameFlag, INVALID_REFRESH_RATE};
use crate::utils::{round_divide, timer_ms_to_ns};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrameRateParameters {
    /// Two samples within this many Hz count as the same rate.
    pub delta: i32,
    pub min_stable_runs: u32,
    /// Number of recent samples averaged into the published rate.
    pub window_size: usize,
    pub min_interested_frame_rate: i32,
    pub max_interested_frame_rate: i32,
    pub measure_period_ns: i64,
}

impl Default for VideoFrameRateParameters {
    fn default() -> Self {
        Self::from(&hwc_vrr_config::Video::default())
    }
}

impl From<&hwc_vrr_config::Video> for VideoFrameRateParameters {
    fn from(config: &hwc_vrr_config::Video) -> Self {
        Self {
            delta: i32::try_from(config.delta).unwrap_or(i32::MAX),
            min_stable_runs: config.min_stable_runs.max(1),
            window_size: (config.window_size as usize).max(1),
            min_interested_frame_rate: i32::try_from(config.min_interested_frame_rate)
                .unwrap_or(i32::MAX),
            max_interested_frame_rate: i32::try_from(config.max_interested_frame_rate)
                .unwrap_or(i32::MAX),
            measure_period_ns: timer_ms_to_ns(config.measure_period_ms),
        }
    }
}

/// Estimates the frame rate of video content.
///
/// Wraps a period calculator that reports every window, and only publishes once the samples
/// have settled.
#[derive(Debug)]
pub struct VideoFrameRateCalculator {
    params: VideoFrameRateParameters,
    period: PeriodRefreshRateCalculator,
    rate: PublishedRate,
    last_sample: i32,
    stable_runs: u32,
    samples: VecDeque<i32>,
}

impl VideoFrameRateCalculator {
    pub fn new(params: VideoFrameRateParameters) -> Self {
        let period = PeriodRefreshRateCalculator::new(PeriodParameters {
            ty: PeriodType::Average,
            measure_period_ns: params.measure_period_ns,
            confidence_percentage: 0,
            always_callback: true,
            event_type: VrrControllerEventType::VIDEO_FRAME_RATE_CALCULATOR_UPDATE,
        });
        Self {
            samples: VecDeque::with_capacity(params.window_size),
            params,
            period,
            rate: PublishedRate::new(false),
            last_sample: INVALID_REFRESH_RATE,
            stable_runs: 0,
        }
    }

    fn is_interesting(&self, rate: i32) -> bool {
        (self.params.min_interested_frame_rate..=self.params.max_interested_frame_rate)
            .contains(&rate)
    }

    fn clear_history(&mut self) {
        self.last_sample = INVALID_REFRESH_RATE;
        self.stable_runs = 0;
        self.samples.clear();
    }

    /// Feeds the result of one measurement window.
    fn on_sample(&mut self, sample: i32) -> Option<i32> {
        if !self.is_interesting(sample) {
            self.clear_history();
            return self.rate.set(INVALID_REFRESH_RATE);
        }

        if self.last_sample != INVALID_REFRESH_RATE
            && (sample - self.last_sample).abs() <= self.params.delta
        {
            self.stable_runs += 1;
        } else {
            self.stable_runs = 1;
            self.samples.clear();
        }
        self.last_sample = sample;

        if self.samples.len() == self.params.window_size {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);

        if self.stable_runs < self.params.min_stable_runs {
            return None;
        }

        let sum: i64 = self.samples.iter().map(|&s| i64::from(s)).sum();
        let mean = round_divide(sum, self.samples.len() as i64) as i32;
        debug!("video frame rate settled at {mean} after {} runs", self.stable_runs);
        self.rate.set(mean)
    }
}

impl RefreshRateCalculator for VideoFrameRateCalculator {
    fn name(&self) -> &str {
        "VideoFrameRate"
    }

    fn id(&self) -> CalculatorId {
        self.period.id()
    }

    fn refresh_rate(&self) -> i32 {
        self.rate.get()
    }

    fn on_present(
        &mut self,
        queue: &mut EventQueue,
        present_time_ns: i64,
        flag: PresentFrameFlag,
    ) -> Option<i32> {
        self.period.on_present(queue, present_time_ns, flag);
        None
    }

    fn on_power_state_change(
        &mut self,
        queue: &mut EventQueue,
        from: PowerMode,
        to: PowerMode,
    ) -> Option<i32> {
        self.period.on_power_state_change(queue, from, to);
        if to == PowerMode::Normal {
            return None;
        }
        self.clear_history();
        self.rate.set(INVALID_REFRESH_RATE)
    }

    fn on_event(&mut self, queue: &mut EventQueue, event: &VrrControllerEvent) -> Option<i32> {
        let sample = self.period.on_event(queue, event)?;
        self.on_sample(sample)
    }

    fn set_enabled(&mut self, queue: &mut EventQueue, enabled: bool) -> Option<i32> {
        self.period.set_enabled(queue, enabled);
        if enabled {
            return None;
        }
        self.clear_history();
        self.rate.set(INVALID_REFRESH_RATE)
    }

    fn set_vrr_config_attributes(&mut self, vsync_period_ns: i64, min_frame_interval_ns: i64) {
        self.period
            .set_vrr_config_attributes(vsync_period_ns, min_frame_interval_ns);
    }

    fn reset(&mut self, queue: &mut EventQueue) {
        self.period.reset(queue);
        self.clear_history();
        self.rate.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::Clock;

    fn calculator() -> VideoFrameRateCalculator {
        VideoFrameRateCalculator::new(VideoFrameRateParameters::default())
    }

    #[test]
    fn publishes_after_stable_runs() {
        let mut calc = calculator();
        assert_eq!(calc.on_sample(24), None);
        assert_eq!(calc.on_sample(25), None);
        assert_eq!(calc.on_sample(24), Some(24));
        assert_eq!(calc.refresh_rate(), 24);
    }

    #[test]
    fn jump_restarts_stability() {
        let mut calc = calculator();
        calc.on_sample(24);
        calc.on_sample(24);
        assert_eq!(calc.on_sample(60), None);
        assert_eq!(calc.on_sample(60), None);
        assert_eq!(calc.on_sample(60), Some(60));
    }

    #[test]
    fn mean_covers_window_only() {
        let mut calc = calculator();
        for sample in [30, 30, 30, 30, 30] {
            calc.on_sample(sample);
        }
        assert_eq!(calc.refresh_rate(), 30);
        for sample in [34, 34, 34, 34, 34] {
            calc.on_sample(sample);
        }
        assert_eq!(calc.refresh_rate(), 34);
    }

    #[test]
    fn uninteresting_rates_are_never_published() {
        let mut calc = calculator();
        for _ in 0..5 {
            calc.on_sample(120);
        }
        assert_eq!(calc.refresh_rate(), INVALID_REFRESH_RATE);

        for _ in 0..3 {
            calc.on_sample(24);
        }
        assert_eq!(calc.refresh_rate(), 24);
        assert_eq!(calc.on_sample(INVALID_REFRESH_RATE), Some(INVALID_REFRESH_RATE));
    }

    #[test]
    fn measures_present_stream() {
        let clock = Clock::with_time(0);
        let mut queue = EventQueue::new(clock.clone());
        let mut calc = calculator();
        calc.set_vrr_config_attributes(8_333_333, 8_333_333);

        // 24 fps content against a 120 Hz vsync: one frame every five vsyncs.
        let frame = 5 * 8_333_333;
        for _ in 0..3 {
            let window_end = clock.now_ns() + 500_000_000;
            while clock.now_ns() < window_end {
                calc.on_present(&mut queue, clock.now_ns(), PresentFrameFlag::empty());
                clock.advance(frame);
            }
            let event = queue.pop_due(clock.now_ns()).unwrap();
            calc.on_event(&mut queue, &event);
        }
        assert_eq!(calc.refresh_rate(), 24);
    }
}
