use crate::calculator::RefreshRateCalculatorKind;

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Controller {
    #[knuffel(child, unwrap(argument), default)]
    pub present_timeout_controller: PresentTimeoutController,
    /// Interval of the keep-alive poll while hibernating.
    #[knuffel(child, unwrap(argument), default = 500)]
    pub hibernate_wake_up_ms: u32,
    /// Delay before the vendor rendering timeout schedule starts when no override is set.
    #[knuffel(child, unwrap(argument), default = 100)]
    pub vendor_present_timeout_ms: u32,
    #[knuffel(child, unwrap(argument), default)]
    pub refresh_rate_calculator: RefreshRateCalculatorKind,
    #[knuffel(child)]
    pub vendor_present_timeout: Option<VendorPresentTimeout>,
}

impl Default for Controller {
    fn default() -> Self {
        Self {
            present_timeout_controller: PresentTimeoutController::default(),
            hibernate_wake_up_ms: 500,
            vendor_present_timeout_ms: 100,
            refresh_rate_calculator: RefreshRateCalculatorKind::default(),
            vendor_present_timeout: None,
        }
    }
}

#[derive(knuffel::DecodeScalar, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PresentTimeoutController {
    #[default]
    Software,
    Hardware,
}

/// Explicit frame insertion schedule replacing the panel plugin's default one.
#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct VendorPresentTimeout {
    #[knuffel(child, unwrap(argument))]
    pub timeout_ms: u32,
    #[knuffel(children(name = "interval"))]
    pub intervals: Vec<TimeoutInterval>,
}

#[derive(knuffel::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutInterval {
    #[knuffel(argument)]
    pub count: u32,
    #[knuffel(argument)]
    pub interval_ms: u32,
}
