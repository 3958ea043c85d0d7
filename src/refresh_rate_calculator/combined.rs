use crate::event_queue::{EventQueue, VrrControllerEvent};
use crate::refresh_rate_calculator::{CalculatorId, PublishedRate, RefreshRateCalculator};
use crate::types::{PowerMode, PresentFrameFlag, INVALID_REFRESH_RATE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedParameters {
    pub min_valid_refresh_rate: i32,
    pub max_valid_refresh_rate: i32,
}

impl Default for CombinedParameters {
    fn default() -> Self {
        Self::from(&hwc_vrr_config::Combined::default())
    }
}

impl From<&hwc_vrr_config::Combined> for CombinedParameters {
    fn from(config: &hwc_vrr_config::Combined) -> Self {
        Self {
            min_valid_refresh_rate: i32::try_from(config.min_valid_refresh_rate).unwrap_or(1),
            max_valid_refresh_rate: i32::try_from(config.max_valid_refresh_rate)
                .unwrap_or(i32::MAX),
        }
    }
}

/// Publishes the rate of the first calculator, in priority order, whose rate is valid.
pub struct CombinedRefreshRateCalculator {
    id: CalculatorId,
    params: CombinedParameters,
    calculators: Vec<Box<dyn RefreshRateCalculator>>,
    rate: PublishedRate,
}

impl std::fmt::Debug for CombinedRefreshRateCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.calculators.iter().map(|c| c.name()).collect();
        f.debug_struct("CombinedRefreshRateCalculator")
            .field("id", &self.id)
            .field("params", &self.params)
            .field("calculators", &names)
            .field("rate", &self.rate.get())
            .finish()
    }
}

impl CombinedRefreshRateCalculator {
    pub fn new(
        calculators: Vec<Box<dyn RefreshRateCalculator>>,
        params: CombinedParameters,
    ) -> Self {
        Self {
            id: CalculatorId::next(),
            params,
            calculators,
            rate: PublishedRate::new(false),
        }
    }

    /// Name and current rate of every calculator, in priority order.
    pub fn calculator_rates(&self) -> Vec<(&str, i32)> {
        self.calculators
            .iter()
            .map(|c| (c.name(), c.refresh_rate()))
            .collect()
    }

    fn is_valid(&self, rate: i32) -> bool {
        (self.params.min_valid_refresh_rate..=self.params.max_valid_refresh_rate).contains(&rate)
    }

    /// Re-polls every calculator and publishes the winner.
    fn update(&mut self) -> Option<i32> {
        let winner = self
            .calculators
            .iter()
            .map(|c| (c.name(), c.refresh_rate()))
            .find(|&(_, rate)| self.is_valid(rate));

        let rate = match winner {
            Some((name, rate)) => {
                trace!("combined rate {rate} from {name}");
                rate
            }
            None => INVALID_REFRESH_RATE,
        };
        self.rate.set(rate)
    }

    /// Runs `f` on every calculator and publishes once if any of them changed.
    fn for_each(
        &mut self,
        mut f: impl FnMut(&mut dyn RefreshRateCalculator) -> Option<i32>,
    ) -> Option<i32> {
        let mut changed = false;
        for calculator in &mut self.calculators {
            changed |= f(&mut **calculator).is_some();
        }
        if changed {
            self.update()
        } else {
            None
        }
    }
}

impl RefreshRateCalculator for CombinedRefreshRateCalculator {
    fn name(&self) -> &str {
        "Combined"
    }

    fn id(&self) -> CalculatorId {
        self.id
    }

    fn owns(&self, id: CalculatorId) -> bool {
        self.id == id || self.calculators.iter().any(|c| c.owns(id))
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
        let _span = tracy_client::span!("CombinedRefreshRateCalculator::on_present");
        self.for_each(|c| c.on_present(queue, present_time_ns, flag))
    }

    fn on_power_state_change(
        &mut self,
        queue: &mut EventQueue,
        from: PowerMode,
        to: PowerMode,
    ) -> Option<i32> {
        self.for_each(|c| c.on_power_state_change(queue, from, to))
    }

    fn on_event(&mut self, queue: &mut EventQueue, event: &VrrControllerEvent) -> Option<i32> {
        let id = event.calculator()?;
        let calculator = self.calculators.iter_mut().find(|c| c.owns(id))?;
        calculator.on_event(queue, event)?;
        self.update()
    }

    fn set_enabled(&mut self, queue: &mut EventQueue, enabled: bool) -> Option<i32> {
        self.for_each(|c| c.set_enabled(queue, enabled))
    }

    fn set_vrr_config_attributes(&mut self, vsync_period_ns: i64, min_frame_interval_ns: i64) {
        for calculator in &mut self.calculators {
            calculator.set_vrr_config_attributes(vsync_period_ns, min_frame_interval_ns);
        }
    }

    fn reset(&mut self, queue: &mut EventQueue) {
        for calculator in &mut self.calculators {
            calculator.reset(queue);
        }
        self.rate.clear();
    }
}
