//! The VRR controller: state machine, event loop thread and the pipeline-facing API.

use std::collections::HashMap;
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{ensure, Context};
use hwc_vrr_config::{Config, PresentTimeoutController};

use crate::display_context::CommonDisplayContextProvider;
use crate::event_queue::VrrControllerEvent;
use crate::external_event_handler::{
    ExternalEventHandler, ExternalEventHandlerLoader, PresentTimeoutOverride,
};
use crate::interface::{
    DisplayHost, PowerModeListener, PresentListener, RefreshRateChangeListener, VsyncListener,
};
use crate::statistics::DisplayPresentStatistics;
use crate::types::{PowerMode, VrrConfig};
use crate::utils::clock::Clock;

mod fence;
mod inner;
mod record;

pub use fence::{PresentFence, SignalTime};
pub use inner::{
    REFRESH_CTRL_FRAME_INSERTION, REFRESH_CTRL_MIN_REFRESH_RATE, REFRESH_CTRL_PEAK_LOCK,
    REFRESH_CTRL_VALUE_MASK,
};
pub use record::{History, PresentTimeRecord, VrrRecord, VsyncRecord, HISTORY_CAPACITY};

use inner::ControllerInner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// The display is not in normal power mode, or the controller is disabled.
    Disable,
    Rendering,
    /// No presents for longer than the rendering timeout.
    Hibernate,
}

struct Shared {
    inner: Mutex<ControllerInner>,
    cond: Condvar,
    should_stop: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ControllerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves fence signal times into the vsync history.
    ///
    /// Fences are queried without the lock held. Fences that have not signaled are dropped.
    fn update_vsync_history(&self) {
        let fences = std::mem::take(&mut self.lock().record.pending_fences);
        if fences.is_empty() {
            return;
        }

        let times: Vec<i64> = fences
            .iter()
            .filter_map(|fence| match fence.signal_time() {
                SignalTime::Signaled(time_ns) => Some(time_ns),
                other => {
                    trace!("dropping present fence: {other:?}");
                    None
                }
            })
            .collect();
        if !times.is_empty() {
            self.lock().add_fence_signal_times(times);
        }
    }
}

/// VRR controller of one display.
///
/// Every method takes the controller lock and wakes the event loop thread, if there is one.
pub struct VariableRefreshRateController {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl VariableRefreshRateController {
    /// Creates a controller without a loop thread.
    ///
    /// Due events run when [`Self::run_pending_events`] is called, which suits tests and trace
    /// replays driven by a manual [`Clock`].
    pub fn new(
        config: &Config,
        host: Arc<dyn DisplayHost>,
        context: Arc<dyn CommonDisplayContextProvider>,
        clock: Clock,
    ) -> anyhow::Result<Self> {
        let display_id = host
            .display_id()
            .context("display has no valid handle")?;
        let inner = ControllerInner::new(config, display_id, host, context, clock);

        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                cond: Condvar::new(),
                should_stop: AtomicBool::new(false),
            }),
            thread: None,
        })
    }

    /// Creates a controller on the monotonic clock and starts its event loop thread.
    pub fn spawn(
        config: &Config,
        host: Arc<dyn DisplayHost>,
        context: Arc<dyn CommonDisplayContextProvider>,
    ) -> anyhow::Result<Self> {
        let mut controller = Self::new(config, host, context, Clock::monotonic())?;

        let realtime = !config.debug.no_realtime_thread;
        let display_id = controller.shared.lock().display_id;
        let shared = controller.shared.clone();
        let thread = thread::Builder::new()
            .name(format!("vrr-ctl-{display_id}"))
            .spawn(move || run_loop(&shared, realtime))
            .context("error spawning the controller thread")?;
        controller.thread = Some(thread);

        Ok(controller)
    }

    fn with<T>(&self, f: impl FnOnce(&mut ControllerInner) -> T) -> T {
        let rv = f(&mut self.shared.lock());
        self.shared.cond.notify_all();
        rv
    }

    pub fn set_vrr_configurations(&self, configs: HashMap<i32, VrrConfig>) {
        self.with(|inner| inner.set_vrr_configurations(configs));
    }

    /// Switches to a known configuration. Unknown ids are logged and ignored.
    pub fn set_active_vrr_configuration(&self, config_id: i32) {
        self.with(|inner| inner.set_active_vrr_configuration(config_id));
    }

    pub fn set_enable(&self, enabled: bool) {
        self.with(|inner| inner.set_enable(enabled));
    }

    pub fn set_power_mode(&self, mode: PowerMode) {
        self.with(|inner| inner.set_power_mode(mode));
    }

    /// Announces the next present ahead of time, resuming from hibernation.
    pub fn notify_expected_present(&self, timestamp_ns: i64, frame_interval_ns: i64) {
        self.with(|inner| inner.notify_expected_present(timestamp_ns, frame_interval_ns));
    }

    pub fn set_external_event_handler(&self, handler: Box<dyn ExternalEventHandler>) {
        self.with(|inner| inner.set_external_event_handler(handler));
    }

    /// Loads the panel plugin at `path`.
    pub fn load_external_event_handler(&self, path: &Path) -> anyhow::Result<()> {
        let panel_name = self.shared.lock().panel_name.clone();
        let handler = ExternalEventHandlerLoader::load(path, &panel_name)?;
        self.set_external_event_handler(Box::new(handler));
        Ok(())
    }

    pub fn set_present_timeout_controller(&self, controller: PresentTimeoutController) {
        self.with(|inner| inner.set_present_timeout_controller(controller));
    }

    /// Replaces the plugin's frame insertion schedule.
    ///
    /// `schedule` holds `(count, interval_ns)` pairs starting `timeout_ns` after the last
    /// present.
    pub fn set_present_timeout_parameters(&self, timeout_ns: i64, schedule: Vec<(u32, i64)>) {
        let timeout_override = PresentTimeoutOverride {
            timeout_ns,
            schedule,
        };
        self.with(|inner| inner.set_present_timeout_parameters(timeout_override));
    }

    pub fn clear_present_timeout_parameters(&self) {
        self.with(|inner| inner.clear_present_timeout_parameters());
    }

    pub fn set_fixed_refresh_rate_range(&self, min_refresh_rate: u32, min_lock_time_ns: i64) {
        self.with(|inner| inner.set_fixed_refresh_rate_range(min_refresh_rate, min_lock_time_ns));
    }

    pub fn register_refresh_rate_change_listener(
        &self,
        listener: Arc<dyn RefreshRateChangeListener>,
    ) {
        self.with(|inner| inner.register_listener(listener));
    }

    pub fn enable_refresh_rate_indicator(&self, enabled: bool) {
        self.with(|inner| inner.enable_refresh_rate_indicator(enabled));
    }

    pub fn get_statistics(&self) -> DisplayPresentStatistics {
        self.shared.lock().statistics.get_statistics()
    }

    pub fn get_updated_statistics(&self) -> DisplayPresentStatistics {
        self.shared.lock().statistics.get_updated_statistics()
    }

    pub fn dump(&self, out: &mut String) {
        self.shared.lock().dump(out);
    }

    /// Drops every pending event and all history.
    pub fn reset(&self) {
        self.with(|inner| inner.reset());
    }

    pub fn state(&self) -> ControllerState {
        self.shared.lock().state
    }

    /// Last published refresh rate.
    pub fn refresh_rate(&self) -> i32 {
        self.shared.lock().refresh_rate
    }

    pub fn estimated_video_frame_rate(&self) -> i32 {
        self.shared.lock().estimated_video_frame_rate()
    }

    /// Pending events in dispatch order.
    pub fn pending_events(&self) -> Vec<VrrControllerEvent> {
        self.shared.lock().queue.events()
    }

    /// Runs every event due at the clock's current time. Returns how many ran.
    pub fn run_pending_events(&self) -> usize {
        let dispatched = self.shared.lock().dispatch_due();
        if dispatched.transitioned {
            self.shared.update_vsync_history();
        }
        dispatched.handled
    }
}

impl Drop for VariableRefreshRateController {
    fn drop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        {
            let _guard = self.shared.lock();
            self.shared.should_stop.store(true, Ordering::SeqCst);
        }
        self.shared.cond.notify_all();
        if thread.join().is_err() {
            error!("controller thread panicked");
        }
    }
}

impl PresentListener for VariableRefreshRateController {
    fn set_expected_present_time(&self, timestamp_ns: i64, frame_interval_ns: i64) {
        self.with(|inner| inner.set_expected_present_time(timestamp_ns, frame_interval_ns));
    }

    fn on_present(&self, fence: Option<BorrowedFd<'_>>) {
        let _span = tracy_client::span!("VariableRefreshRateController::on_present");

        let fence = fence.and_then(|fd| match PresentFence::dup(fd) {
            Ok(fence) => Some(fence),
            Err(err) => {
                warn!("{err:#}");
                None
            }
        });
        self.with(|inner| inner.on_present(fence));
        self.shared.update_vsync_history();
    }
}

impl VsyncListener for VariableRefreshRateController {
    fn on_vsync(&self, timestamp_ns: i64, vsync_period_ns: i64) {
        self.shared.lock().on_vsync(timestamp_ns, vsync_period_ns);
    }
}

impl PowerModeListener for VariableRefreshRateController {
    fn on_power_state_change(&self, _from: PowerMode, to: PowerMode) {
        self.set_power_mode(to);
    }
}

fn set_realtime_priority() -> anyhow::Result<()> {
    // SAFETY: plain syscalls on the calling thread with a valid sched_param.
    unsafe {
        let priority = libc::sched_get_priority_max(libc::SCHED_FIFO);
        ensure!(priority >= 0, "{}", std::io::Error::last_os_error());

        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = priority;
        let rv = libc::sched_setscheduler(0, libc::SCHED_FIFO, &param);
        ensure!(rv == 0, "{}", std::io::Error::last_os_error());
    }
    Ok(())
}

fn run_loop(shared: &Shared, realtime: bool) {
    if realtime {
        if let Err(err) = set_realtime_priority() {
            error!("error switching the controller thread to SCHED_FIFO: {err:?}");
            return;
        }
    }

    let mut inner = shared.lock();
    loop {
        if shared.should_stop.load(Ordering::SeqCst) {
            break;
        }

        if !inner.enabled {
            inner = shared.cond.wait(inner).unwrap_or_else(PoisonError::into_inner);
            continue;
        }
        let Some(next_ns) = inner.queue.next_event_time() else {
            inner = shared.cond.wait(inner).unwrap_or_else(PoisonError::into_inner);
            continue;
        };

        let now_ns = inner.clock.now_ns();
        if next_ns > now_ns {
            let timeout = Duration::from_nanos(u64::try_from(next_ns - now_ns).unwrap_or(0));
            inner = match shared.cond.wait_timeout(inner, timeout) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
            continue;
        }

        let dispatched = inner.dispatch_due();
        if dispatched.transitioned {
            drop(inner);
            shared.update_vsync_history();
            inner = shared.lock();
        }
    }

    debug!("exiting controller thread for display {}", inner.display_id);
}
