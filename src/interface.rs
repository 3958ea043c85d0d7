//! Narrow capability traits between the controller and the display pipeline.
//!
//! The pipeline talks to the controller through the listener traits; the controller talks back
//! through [`DisplayHost`] and [`RefreshRateChangeListener`].

use std::os::fd::BorrowedFd;

use crate::types::PowerMode;

pub trait PresentListener {
    /// Announces the expected present time of the frame about to be committed.
    fn set_expected_present_time(&self, timestamp_ns: i64, frame_interval_ns: i64);

    /// Called after a frame was committed. The fence stays owned by the caller.
    fn on_present(&self, fence: Option<BorrowedFd<'_>>);
}

pub trait VsyncListener {
    fn on_vsync(&self, timestamp_ns: i64, vsync_period_ns: i64);
}

pub trait PowerModeListener {
    fn on_power_state_change(&self, from: PowerMode, to: PowerMode);
}

/// Receives every refresh rate the controller publishes.
///
/// Called with the controller lock held, so implementations must not call back into the
/// controller.
pub trait RefreshRateChangeListener: Send + Sync {
    fn on_refresh_rate_changed(&self, refresh_rate: i32);
}

/// The display owning the controller.
pub trait DisplayHost: Send + Sync {
    /// Returns `None` when the display has no valid handle yet.
    fn display_id(&self) -> Option<i64>;

    /// Refresh rate indicator hook, only called while the indicator is enabled.
    fn on_refresh_rate_changed_debug(
        &self,
        display_id: i64,
        vsync_period_ns: i64,
        refresh_period_ns: i64,
    );
}
