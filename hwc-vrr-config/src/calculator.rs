//! Parameter blocks for the refresh rate calculators.

/// The calculator measuring steady-state cadence inside the controller's combined
/// calculator.
#[derive(knuffel::DecodeScalar, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RefreshRateCalculatorKind {
    Instant,
    #[default]
    Period,
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Instant {
    #[knuffel(child, unwrap(argument), default = 1000)]
    pub timeout_ms: u32,
}

impl Default for Instant {
    fn default() -> Self {
        Self { timeout_ms: 1000 }
    }
}

#[derive(knuffel::DecodeScalar, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PeriodKind {
    #[default]
    Average,
    Majority,
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Period {
    #[knuffel(child, unwrap(argument), default)]
    pub kind: PeriodKind,
    #[knuffel(child, unwrap(argument), default = 500)]
    pub measure_period_ms: u32,
    #[knuffel(child, unwrap(argument), default = 20)]
    pub confidence_percentage: u32,
}

impl Default for Period {
    fn default() -> Self {
        Self {
            kind: PeriodKind::Average,
            measure_period_ms: 500,
            confidence_percentage: 20,
        }
    }
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct ExitIdle {
    #[knuffel(child, unwrap(argument), default = 1000)]
    pub idle_criteria_ms: u32,
    #[knuffel(child, unwrap(argument), default = 250)]
    pub max_valid_ms: u32,
}

impl Default for ExitIdle {
    fn default() -> Self {
        Self {
            idle_criteria_ms: 1000,
            max_valid_ms: 250,
        }
    }
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Video {
    #[knuffel(child, unwrap(argument), default = 5)]
    pub delta: u32,
    #[knuffel(child, unwrap(argument), default = 3)]
    pub min_stable_runs: u32,
    #[knuffel(child, unwrap(argument), default = 5)]
    pub window_size: u32,
    #[knuffel(child, unwrap(argument), default = 1)]
    pub min_interested_frame_rate: u32,
    #[knuffel(child, unwrap(argument), default = 60)]
    pub max_interested_frame_rate: u32,
    #[knuffel(child, unwrap(argument), default = 500)]
    pub measure_period_ms: u32,
}

impl Default for Video {
    fn default() -> Self {
        Self {
            delta: 5,
            min_stable_runs: 3,
            window_size: 5,
            min_interested_frame_rate: 1,
            max_interested_frame_rate: 60,
            measure_period_ms: 500,
        }
    }
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Combined {
    #[knuffel(child, unwrap(argument), default = 1)]
    pub min_valid_refresh_rate: u32,
    #[knuffel(child, unwrap(argument), default = 120)]
    pub max_valid_refresh_rate: u32,
}

impl Default for Combined {
    fn default() -> Self {
        Self {
            min_valid_refresh_rate: 1,
            max_valid_refresh_rate: 120,
        }
    }
}
