use crate::event_queue::{EventPayload, EventQueue, VrrControllerEvent, VrrControllerEventType};
use crate::refresh_rate_calculator::{
    cancel_timers, is_timer_for, CalculatorId, PublishedRate, RefreshRateCalculator,
};
use crate::types::{
    PowerMode, PresentFrameFlag, DOZE_ACTIVE_REFRESH_RATE, DOZE_IDLE_REFRESH_RATE,
    INVALID_REFRESH_RATE,
};
use crate::utils::freq_to_duration_ns;

const EVENT_TYPE: VrrControllerEventType =
    VrrControllerEventType::AOD_REFRESH_RATE_CALCULATOR_UPDATE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AodParameters {
    pub active_refresh_rate: i32,
    pub idle_refresh_rate: i32,
    /// Frames the DDIC inserts after each doze present.
    pub frame_insertion_multiplier: u32,
}

impl Default for AodParameters {
    fn default() -> Self {
        Self::from(&hwc_vrr_config::Panel::default())
    }
}

impl From<&hwc_vrr_config::Panel> for AodParameters {
    fn from(panel: &hwc_vrr_config::Panel) -> Self {
        Self {
            active_refresh_rate: DOZE_ACTIVE_REFRESH_RATE,
            idle_refresh_rate: DOZE_IDLE_REFRESH_RATE,
            frame_insertion_multiplier: panel.ddic_frame_insertion_multiplier.max(1),
        }
    }
}

impl AodParameters {
    fn active_frame_ns(&self) -> i64 {
        freq_to_duration_ns(self.active_refresh_rate)
    }

    /// How long a doze present keeps the panel at the active rate.
    fn active_duration_ns(&self) -> i64 {
        self.active_frame_ns() * i64::from(self.frame_insertion_multiplier)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AodState {
    Idle,
    Active,
    /// Holds the active rate for one more frame before dropping to idle.
    ActiveToIdleTransition,
}

/// Refresh rate while the always-on display is showing.
#[derive(Debug)]
pub struct AodRefreshRateCalculator {
    id: CalculatorId,
    params: AodParameters,
    rate: PublishedRate,
    enabled: bool,
    power_mode: PowerMode,
    state: AodState,
}

impl AodRefreshRateCalculator {
    pub fn new(params: AodParameters) -> Self {
        Self {
            id: CalculatorId::next(),
            params,
            rate: PublishedRate::new(false),
            enabled: true,
            power_mode: PowerMode::Off,
            state: AodState::Idle,
        }
    }

    pub fn state(&self) -> AodState {
        self.state
    }

    fn set_state(&mut self, queue: &mut EventQueue, state: AodState) -> Option<i32> {
        if self.state != state {
            trace!("aod {:?} -> {state:?}", self.state);
        }
        self.state = state;

        cancel_timers(queue, self.id);
        let (rate, hold_ns) = match state {
            AodState::Idle => (self.params.idle_refresh_rate, None),
            AodState::Active => (
                self.params.active_refresh_rate,
                Some(self.params.active_duration_ns()),
            ),
            AodState::ActiveToIdleTransition => (
                self.params.active_refresh_rate,
                Some(self.params.active_frame_ns()),
            ),
        };
        if let Some(hold_ns) = hold_ns {
            queue.post_event_in(EVENT_TYPE, EventPayload::Calculator(self.id), hold_ns);
        }
        self.rate.set(rate)
    }
}

impl RefreshRateCalculator for AodRefreshRateCalculator {
    fn name(&self) -> &str {
        "AOD"
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
        _present_time_ns: i64,
        _flag: PresentFrameFlag,
    ) -> Option<i32> {
        if !self.enabled || !self.power_mode.is_doze() {
            return None;
        }
        // Every doze present restarts the active period, including one arriving during the
        // transition.
        self.set_state(queue, AodState::Active)
    }

    fn on_power_state_change(
        &mut self,
        queue: &mut EventQueue,
        from: PowerMode,
        to: PowerMode,
    ) -> Option<i32> {
        self.power_mode = to;
        if !self.enabled {
            return None;
        }

        if to.is_doze() && !from.is_doze() {
            return self.set_state(queue, AodState::Idle);
        }
        if !to.is_doze() {
            cancel_timers(queue, self.id);
            self.state = AodState::Idle;
            return self.rate.set(INVALID_REFRESH_RATE);
        }
        None
    }

    fn on_event(&mut self, queue: &mut EventQueue, event: &VrrControllerEvent) -> Option<i32> {
        if !is_timer_for(event, self.id, EVENT_TYPE) {
            return None;
        }

        match self.state {
            AodState::Active => self.set_state(queue, AodState::ActiveToIdleTransition),
            AodState::ActiveToIdleTransition => self.set_state(queue, AodState::Idle),
            AodState::Idle => None,
        }
    }

    fn set_enabled(&mut self, queue: &mut EventQueue, enabled: bool) -> Option<i32> {
        self.enabled = enabled;
        if !enabled {
            cancel_timers(queue, self.id);
            self.state = AodState::Idle;
            return self.rate.set(INVALID_REFRESH_RATE);
        }
        if self.power_mode.is_doze() {
            return self.set_state(queue, AodState::Idle);
        }
        None
    }

    fn set_vrr_config_attributes(&mut self, _vsync_period_ns: i64, _min_frame_interval_ns: i64) {}

    fn reset(&mut self, queue: &mut EventQueue) {
        cancel_timers(queue, self.id);
        self.state = AodState::Idle;
        self.rate.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::Clock;

    fn dozing() -> (AodRefreshRateCalculator, EventQueue, Clock) {
        let clock = Clock::with_time(0);
        let mut queue = EventQueue::new(clock.clone());
        let mut calculator = AodRefreshRateCalculator::new(AodParameters::default());
        let rate = calculator.on_power_state_change(&mut queue, PowerMode::Normal, PowerMode::Doze);
        assert_eq!(rate, Some(1));
        (calculator, queue, clock)
    }

    fn fire(
        calc: &mut AodRefreshRateCalculator,
        queue: &mut EventQueue,
        clock: &Clock,
    ) -> Option<i32> {
        clock.set(queue.next_event_time().unwrap());
        let event = queue.pop_due(clock.now_ns()).unwrap();
        calc.on_event(queue, &event)
    }

    #[test]
    fn present_boosts_then_returns_to_idle() {
        let (mut calc, mut queue, clock) = dozing();
        let flag = PresentFrameFlag::PRESENTING_WHEN_DOZE;

        assert_eq!(calc.on_present(&mut queue, 0, flag), Some(30));
        assert_eq!(calc.state(), AodState::Active);
        // Two active frames for a frame insertion multiplier of two.
        assert_eq!(queue.next_event_time(), Some(66_666_666));

        assert_eq!(fire(&mut calc, &mut queue, &clock), None);
        assert_eq!(calc.state(), AodState::ActiveToIdleTransition);
        assert_eq!(calc.refresh_rate(), 30);

        assert_eq!(fire(&mut calc, &mut queue, &clock), Some(1));
        assert_eq!(calc.state(), AodState::Idle);
        assert!(queue.is_empty());
    }

    #[test]
    fn present_during_transition_stays_active() {
        let (mut calc, mut queue, clock) = dozing();
        let flag = PresentFrameFlag::PRESENTING_WHEN_DOZE;

        calc.on_present(&mut queue, 0, flag);
        fire(&mut calc, &mut queue, &clock);
        assert_eq!(calc.state(), AodState::ActiveToIdleTransition);

        assert_eq!(calc.on_present(&mut queue, clock.now_ns(), flag), None);
        assert_eq!(calc.state(), AodState::Active);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn invalid_outside_doze() {
        let clock = Clock::with_time(0);
        let mut queue = EventQueue::new(clock);
        let mut calc = AodRefreshRateCalculator::new(AodParameters::default());
        calc.on_power_state_change(&mut queue, PowerMode::Off, PowerMode::Normal);
        assert_eq!(calc.on_present(&mut queue, 0, PresentFrameFlag::empty()), None);
        assert_eq!(calc.refresh_rate(), INVALID_REFRESH_RATE);

        calc.on_power_state_change(&mut queue, PowerMode::Normal, PowerMode::Doze);
        calc.on_present(&mut queue, 0, PresentFrameFlag::PRESENTING_WHEN_DOZE);
        let rate = calc.on_power_state_change(&mut queue, PowerMode::Doze, PowerMode::Normal);
        assert_eq!(rate, Some(INVALID_REFRESH_RATE));
        assert!(queue.is_empty());
    }
}
