//! Controller state guarded by the controller lock, and everything that runs under it.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use hwc_vrr_config::{Config, PresentTimeoutController};

use super::fence::PresentFence;
use super::record::{PresentTimeRecord, VrrRecord, VsyncRecord};
use super::ControllerState;
use crate::display_context::{CommonDisplayContextProvider, VideoFrameRateEstimate};
use crate::event_queue::{EventPayload, EventQueue, VrrControllerEvent, VrrControllerEventType};
use crate::external_event_handler::{
    ExternalEventHandler, PanelCommand, PresentTimeoutOverride, TimedEvent,
};
use crate::file_node::{FileNodeWriter, REFRESH_CTRL, TE2_OPTION, TE2_RATE_HZ};
use crate::interface::{DisplayHost, RefreshRateChangeListener};
use crate::refresh_rate_calculator::{
    CalculatorParameters, RefreshRateCalculator, RefreshRateCalculatorFactory,
    RefreshRateCalculatorType, VideoFrameRateCalculator,
};
use crate::statistics::{StatisticsParameters, VariableRefreshRateStatistic};
use crate::types::{PowerMode, PresentFrameFlag, VrrConfig, INVALID_REFRESH_RATE};
use crate::utils::clock::Clock;
use crate::utils::{freq_to_duration_ns, ms_to_ns, timer_ms_to_ns, NANOS_PER_MILLI};

/// `refresh_ctrl` command bits. The low 16 bits carry the command's value.
pub const REFRESH_CTRL_VALUE_MASK: u32 = 0xffff;
pub const REFRESH_CTRL_FRAME_INSERTION: u32 = 1 << 16;
pub const REFRESH_CTRL_MIN_REFRESH_RATE: u32 = 1 << 17;
pub const REFRESH_CTRL_PEAK_LOCK: u32 = 1 << 18;

const TE2_CHANGEABLE: &str = "changeable";

/// What [`ControllerInner::dispatch_due`] did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Dispatched {
    pub handled: usize,
    /// A state transition happened, so the vsync history should be re-synced.
    pub transitioned: bool,
}

pub struct ControllerInner {
    pub(super) clock: Clock,
    pub(super) display_id: i64,
    host: Arc<dyn DisplayHost>,
    pub(super) queue: EventQueue,
    pub(super) record: VrrRecord,
    pub(super) state: ControllerState,
    pub(super) enabled: bool,
    pub(super) power_mode: PowerMode,
    vrr_configs: HashMap<i32, VrrConfig>,
    pub(super) active_config_id: Option<i32>,
    pub(super) refresh_rate: i32,

    refresh_rate_calculator: Box<dyn RefreshRateCalculator>,
    video_calculator: VideoFrameRateCalculator,
    video_estimate: VideoFrameRateEstimate,
    pub(super) statistics: VariableRefreshRateStatistic,

    listeners: Vec<Arc<dyn RefreshRateChangeListener>>,
    refresh_rate_indicator: bool,

    present_timeout_controller: PresentTimeoutController,
    vendor_present_timeout_ns: i64,
    present_timeout_override: Option<PresentTimeoutOverride>,
    external_handler: Option<Box<dyn ExternalEventHandler>>,
    pub(super) panel_name: String,
    hibernate_wake_up_ns: i64,

    file_nodes: FileNodeWriter,
    panel_root: PathBuf,
    te2_changeable: bool,
    peak_locked: bool,
}

impl ControllerInner {
    pub fn new(
        config: &Config,
        display_id: i64,
        host: Arc<dyn DisplayHost>,
        context: Arc<dyn CommonDisplayContextProvider>,
        clock: Clock,
    ) -> Self {
        let factory = RefreshRateCalculatorFactory::new(CalculatorParameters::from(config));
        let calculator_type = RefreshRateCalculatorType::controller_default(
            config.controller.refresh_rate_calculator,
        );
        let refresh_rate_calculator = factory.build(&calculator_type);
        let video_calculator = factory.build_video();
        let video_estimate = context.video_frame_rate_estimate().clone();
        let statistics = VariableRefreshRateStatistic::new(
            context,
            clock.clone(),
            StatisticsParameters::from(&config.statistics),
        );

        let mut file_nodes = FileNodeWriter::new();
        let panel_root = PathBuf::from(&config.panel.sysfs_root);
        let te2_changeable = config.panel.te2_changeable
            || match file_nodes.get_or_create(&panel_root).read_string(TE2_OPTION) {
                Ok(option) => option == TE2_CHANGEABLE,
                Err(err) => {
                    debug!("TE2 rate is fixed: {err:#}");
                    false
                }
            };

        let mut inner = Self {
            queue: EventQueue::new(clock.clone()),
            clock,
            display_id,
            host,
            record: VrrRecord::default(),
            state: ControllerState::Disable,
            enabled: true,
            power_mode: PowerMode::Off,
            vrr_configs: HashMap::new(),
            active_config_id: None,
            refresh_rate: INVALID_REFRESH_RATE,
            refresh_rate_calculator,
            video_calculator,
            video_estimate,
            statistics,
            listeners: Vec::new(),
            refresh_rate_indicator: config.debug.refresh_rate_indicator,
            present_timeout_controller: config.controller.present_timeout_controller,
            vendor_present_timeout_ns: ms_to_ns(config.controller.vendor_present_timeout_ms),
            present_timeout_override: config
                .controller
                .vendor_present_timeout
                .as_ref()
                .map(PresentTimeoutOverride::from),
            external_handler: None,
            panel_name: config.panel.name.clone(),
            hibernate_wake_up_ns: timer_ms_to_ns(config.controller.hibernate_wake_up_ms),
            file_nodes,
            panel_root,
            te2_changeable,
            peak_locked: false,
        };
        inner.post_statistic_update();
        inner
    }

    pub fn active_vrr_config(&self) -> Option<VrrConfig> {
        self.vrr_configs.get(&self.active_config_id?).copied()
    }

    pub fn estimated_video_frame_rate(&self) -> i32 {
        self.video_estimate.get()
    }

    fn transition(&mut self, to: ControllerState) {
        if self.state == to {
            return;
        }
        debug!("controller {}: {:?} -> {:?}", self.display_id, self.state, to);
        self.state = to;
    }

    fn post_rendering_timeout(&mut self) {
        self.queue
            .drop_event_mask(VrrControllerEventType::SYSTEM_RENDERING_TIMEOUT);
        let Some(timeout_ns) = self.active_vrr_config().and_then(|c| c.rendering_timeout_ns())
        else {
            return;
        };
        self.queue.post_event_in(
            VrrControllerEventType::SYSTEM_RENDERING_TIMEOUT,
            EventPayload::None,
            timeout_ns,
        );
    }

    fn post_statistic_update(&mut self) {
        let period_ns = self.statistics.update_period_ns();
        if period_ns <= 0 {
            return;
        }
        self.queue
            .drop_event_mask(VrrControllerEventType::STATISTIC_UPDATE);
        self.queue.post_event_in(
            VrrControllerEventType::STATISTIC_UPDATE,
            EventPayload::None,
            period_ns,
        );
    }

    fn drop_vendor_events(&mut self) {
        self.queue
            .drop_event_mask(VrrControllerEventType::VENDOR_RENDERING_TIMEOUT_INIT);
        self.queue
            .drop_event_mask(VrrControllerEventType::VENDOR_RENDERING_TIMEOUT_POST);
    }

    /// Enters `Rendering` when the display is on and the controller enabled.
    fn start_rendering_if_ready(&mut self) {
        if self.enabled
            && self.power_mode == PowerMode::Normal
            && self.state == ControllerState::Disable
        {
            self.transition(ControllerState::Rendering);
            self.post_rendering_timeout();
        }
    }

    fn disable(&mut self) {
        self.transition(ControllerState::Disable);
        self.queue
            .drop_event_mask(VrrControllerEventType::GENERAL_EVENT_MASK);
        if self.peak_locked {
            self.release_peak_lock();
        }
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    pub fn set_vrr_configurations(&mut self, configs: HashMap<i32, VrrConfig>) {
        info!("controller {}: {} VRR configurations", self.display_id, configs.len());
        self.vrr_configs = configs;
        match self.active_config_id {
            Some(id) if !self.vrr_configs.contains_key(&id) => {
                warn!("active VRR config {id} was removed");
                self.active_config_id = None;
            }
            Some(id) => self.apply_config(id),
            None => (),
        }
    }

    pub fn set_active_vrr_configuration(&mut self, config_id: i32) {
        if !self.vrr_configs.contains_key(&config_id) {
            error!("controller {}: unknown VRR config {config_id}", self.display_id);
            return;
        }
        self.active_config_id = Some(config_id);
        self.apply_config(config_id);
        self.statistics.set_active_config(config_id);
    }

    fn apply_config(&mut self, config_id: i32) {
        let Some(config) = self.vrr_configs.get(&config_id).copied() else {
            return;
        };
        debug!(
            "VRR config {config_id}: vsync {}ns, min frame interval {}ns",
            config.vsync_period_ns, config.min_frame_interval_ns
        );
        self.refresh_rate_calculator
            .set_vrr_config_attributes(config.vsync_period_ns, config.min_frame_interval_ns);
        self.video_calculator
            .set_vrr_config_attributes(config.vsync_period_ns, config.min_frame_interval_ns);
        if self.state == ControllerState::Rendering {
            self.post_rendering_timeout();
        }
    }

    pub fn set_enable(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        debug!("controller {}: enabled={enabled}", self.display_id);
        self.enabled = enabled;

        let rate = self
            .refresh_rate_calculator
            .set_enabled(&mut self.queue, enabled);
        self.publish(rate);
        let video = self.video_calculator.set_enabled(&mut self.queue, enabled);
        self.publish_video(video);

        if enabled {
            self.start_rendering_if_ready();
        } else {
            self.disable();
        }
    }

    pub fn set_power_mode(&mut self, to: PowerMode) {
        let from = self.power_mode;
        if from == to {
            return;
        }
        debug!("controller {}: power {from:?} -> {to:?}", self.display_id);
        self.power_mode = to;

        let rate = self
            .refresh_rate_calculator
            .on_power_state_change(&mut self.queue, from, to);
        self.publish(rate);
        let video = self
            .video_calculator
            .on_power_state_change(&mut self.queue, from, to);
        self.publish_video(video);
        self.statistics.on_power_state_change(from, to);

        if to == PowerMode::Normal {
            self.start_rendering_if_ready();
        } else {
            self.disable();
        }
    }

    pub fn set_present_timeout_controller(&mut self, controller: PresentTimeoutController) {
        if self.present_timeout_controller == controller {
            return;
        }
        debug!("present timeout controller: {controller:?}");
        self.present_timeout_controller = controller;
        if controller == PresentTimeoutController::Hardware {
            self.drop_vendor_events();
        }
    }

    pub fn set_present_timeout_parameters(&mut self, timeout_override: PresentTimeoutOverride) {
        debug!("present timeout override: {timeout_override:?}");
        self.present_timeout_override = Some(timeout_override);
    }

    pub fn clear_present_timeout_parameters(&mut self) {
        self.present_timeout_override = None;
    }

    pub fn set_external_event_handler(&mut self, handler: Box<dyn ExternalEventHandler>) {
        info!("using external event handler {}", handler.name());
        self.external_handler = Some(handler);
    }

    pub fn register_listener(&mut self, listener: Arc<dyn RefreshRateChangeListener>) {
        self.listeners.push(listener);
    }

    pub fn enable_refresh_rate_indicator(&mut self, enabled: bool) {
        self.refresh_rate_indicator = enabled;
        if enabled && self.refresh_rate > 0 {
            self.notify_indicator(self.refresh_rate);
        }
    }

    pub fn set_fixed_refresh_rate_range(&mut self, min_refresh_rate: u32, min_lock_time_ns: i64) {
        let value = REFRESH_CTRL_MIN_REFRESH_RATE | (min_refresh_rate & REFRESH_CTRL_VALUE_MASK);
        self.write_refresh_ctrl(value);

        self.queue
            .drop_event_mask(VrrControllerEventType::MIN_LOCK_TIME_FOR_PEAK_REFRESH_RATE);
        if min_lock_time_ns <= 0 {
            if self.peak_locked {
                self.release_peak_lock();
            }
            return;
        }

        let peak = self
            .active_vrr_config()
            .map_or(0, |c| u32::try_from(c.max_frame_rate()).unwrap_or(0));
        self.write_refresh_ctrl(REFRESH_CTRL_PEAK_LOCK | (peak & REFRESH_CTRL_VALUE_MASK));
        self.peak_locked = true;
        self.queue.post_event_in(
            VrrControllerEventType::MIN_LOCK_TIME_FOR_PEAK_REFRESH_RATE,
            EventPayload::None,
            min_lock_time_ns,
        );
    }

    fn release_peak_lock(&mut self) {
        debug!("releasing peak refresh rate lock");
        self.write_refresh_ctrl(REFRESH_CTRL_PEAK_LOCK);
        self.peak_locked = false;
    }

    pub fn reset(&mut self) {
        debug!("controller {}: reset", self.display_id);
        self.queue.drop_event();
        self.record = VrrRecord::default();
        self.refresh_rate_calculator.reset(&mut self.queue);
        self.video_calculator.reset(&mut self.queue);
        self.video_estimate.set(INVALID_REFRESH_RATE);
        self.statistics.reset();
        self.refresh_rate = INVALID_REFRESH_RATE;
        self.peak_locked = false;

        self.state = ControllerState::Disable;
        self.start_rendering_if_ready();
        self.post_statistic_update();
    }

    // =========================================================================
    // Pipeline notifications
    // =========================================================================

    pub fn set_expected_present_time(&mut self, timestamp_ns: i64, frame_interval_ns: i64) {
        self.record.pending_current_present_time = Some(PresentTimeRecord {
            config_id: self.active_config_id.unwrap_or(-1),
            time_ns: timestamp_ns,
            frame_interval_ns,
        });
    }

    pub fn notify_expected_present(&mut self, timestamp_ns: i64, frame_interval_ns: i64) {
        self.record.next_expected_present_time = Some(PresentTimeRecord {
            config_id: self.active_config_id.unwrap_or(-1),
            time_ns: timestamp_ns,
            frame_interval_ns,
        });
        self.queue
            .drop_event_mask(VrrControllerEventType::NOTIFY_EXPECTED_PRESENT_CONFIG);
        let now = self.queue.now_ns();
        self.queue.post_event(
            VrrControllerEventType::NOTIFY_EXPECTED_PRESENT_CONFIG,
            EventPayload::None,
            now,
        );
    }

    pub fn on_vsync(&mut self, timestamp_ns: i64, vsync_period_ns: i64) {
        let accepted = self.record.vsync_history.push(VsyncRecord {
            time_ns: timestamp_ns,
            period_ns: vsync_period_ns,
        });
        if !accepted {
            trace!("dropping out-of-order vsync at {timestamp_ns}");
        }
    }

    /// Adds signal times read from present fences to the vsync history.
    pub fn add_fence_signal_times(&mut self, times: impl IntoIterator<Item = i64>) {
        let period_ns = self
            .active_vrr_config()
            .map_or(0, |config| config.vsync_period_ns);
        for time_ns in times {
            self.on_vsync(time_ns, period_ns);
        }
    }

    pub fn on_present(&mut self, fence: Option<PresentFence>) {
        let _span = tracy_client::span!("ControllerInner::on_present");

        let Some(present) = self.record.pending_current_present_time.take() else {
            warn!("controller {}: present without an expected present time", self.display_id);
            return;
        };
        if !self.enabled {
            return;
        }
        if !self.record.present_history.push(present) {
            warn!("dropping out-of-order present at {}", present.time_ns);
            return;
        }
        self.record.pending_fences.extend(fence);

        let mut flag = PresentFrameFlag::empty();
        if self.power_mode.is_doze() {
            flag |= PresentFrameFlag::PRESENTING_WHEN_DOZE;
        }
        if self.refresh_rate_indicator {
            flag |= PresentFrameFlag::UPDATE_REFRESH_RATE_INDICATOR;
        }

        let rate = self
            .refresh_rate_calculator
            .on_present(&mut self.queue, present.time_ns, flag);
        self.publish(rate);
        let video = self
            .video_calculator
            .on_present(&mut self.queue, present.time_ns, flag);
        self.publish_video(video);
        self.statistics.on_present(present.time_ns, flag);

        match self.state {
            ControllerState::Disable => return,
            ControllerState::Hibernate => {
                warn!(
                    "controller {}: present while hibernating without an expected present",
                    self.display_id
                );
                self.queue
                    .drop_event_mask(VrrControllerEventType::HIBERNATE_TIMEOUT);
                self.transition(ControllerState::Rendering);
            }
            ControllerState::Rendering => (),
        }

        self.post_rendering_timeout();
        if self.present_timeout_controller == PresentTimeoutController::Software {
            self.drop_vendor_events();
            let delay_ns = self
                .present_timeout_override
                .as_ref()
                .map_or(self.vendor_present_timeout_ns, |o| o.timeout_ns);
            self.queue.post_event_in(
                VrrControllerEventType::VENDOR_RENDERING_TIMEOUT_INIT,
                EventPayload::None,
                delay_ns,
            );
        }
    }

    // =========================================================================
    // Publication
    // =========================================================================

    fn publish(&mut self, rate: Option<i32>) {
        let Some(rate) = rate else {
            return;
        };
        if rate == self.refresh_rate {
            return;
        }
        debug!("controller {}: refresh rate {} -> {rate}", self.display_id, self.refresh_rate);
        self.refresh_rate = rate;

        for listener in &self.listeners {
            listener.on_refresh_rate_changed(rate);
        }
        if rate <= 0 {
            return;
        }
        if self.refresh_rate_indicator {
            self.notify_indicator(rate);
        }
        if self.power_mode.is_doze() {
            self.set_te2_rate(rate);
        }
    }

    fn publish_video(&mut self, rate: Option<i32>) {
        if let Some(rate) = rate {
            trace!("video frame rate estimate {rate}");
            self.video_estimate.set(rate);
        }
    }

    fn notify_indicator(&self, rate: i32) {
        let vsync_period_ns = self
            .active_vrr_config()
            .map_or(0, |config| config.vsync_period_ns);
        self.host.on_refresh_rate_changed_debug(
            self.display_id,
            vsync_period_ns,
            freq_to_duration_ns(rate),
        );
    }

    // =========================================================================
    // Panel commands
    // =========================================================================

    fn write_refresh_ctrl(&mut self, value: u32) {
        if let Err(err) = self
            .file_nodes
            .write_u32(&self.panel_root, REFRESH_CTRL, value)
        {
            warn!("error writing refresh_ctrl: {err:#}");
        }
    }

    fn set_te2_rate(&mut self, hz: i32) {
        if !self.te2_changeable {
            return;
        }
        let Ok(hz) = u32::try_from(hz) else {
            return;
        };
        let node = self.file_nodes.get_or_create(&self.panel_root);
        if node.last_written_value(TE2_RATE_HZ) == Some(hz) {
            return;
        }
        if let Err(err) = node.write_u32(TE2_RATE_HZ, hz) {
            warn!("error writing te2_rate_hz: {err:#}");
        }
    }

    fn execute_panel_command(&mut self, command: PanelCommand) {
        trace!("panel command {command:?}");
        match command {
            PanelCommand::FrameInsertion { frames } => {
                let value = REFRESH_CTRL_FRAME_INSERTION | (frames & REFRESH_CTRL_VALUE_MASK);
                self.write_refresh_ctrl(value);
            }
            PanelCommand::Te2Rate { hz } => {
                self.set_te2_rate(i32::try_from(hz).unwrap_or(i32::MAX));
            }
        }
    }

    // =========================================================================
    // Event dispatch
    // =========================================================================

    /// Runs every event due at the current time.
    pub fn dispatch_due(&mut self) -> Dispatched {
        let _span = tracy_client::span!("ControllerInner::dispatch_due");

        let mut dispatched = Dispatched::default();
        while let Some(event) = self.queue.pop_due(self.clock.now_ns()) {
            dispatched.handled += 1;
            dispatched.transitioned |= self.handle_event(event);
        }
        dispatched
    }

    /// Returns whether the event caused a state transition.
    fn handle_event(&mut self, event: VrrControllerEvent) -> bool {
        trace!("handling {} due at {}", event.event_type.name(), event.when_ns);

        if event.event_type.is_callback() {
            self.handle_callback_event(&event);
            return false;
        }

        use VrrControllerEventType as Ty;
        let ty = event.event_type;
        match self.state {
            _ if ty == Ty::MIN_LOCK_TIME_FOR_PEAK_REFRESH_RATE => {
                self.release_peak_lock();
                false
            }
            ControllerState::Disable => {
                debug!("ignoring {} while disabled", ty.name());
                false
            }
            ControllerState::Rendering if ty == Ty::SYSTEM_RENDERING_TIMEOUT => {
                self.handle_hibernate();
                true
            }
            ControllerState::Hibernate if ty == Ty::HIBERNATE_TIMEOUT => {
                self.handle_stay_hibernate();
                false
            }
            ControllerState::Hibernate if ty == Ty::NOTIFY_EXPECTED_PRESENT_CONFIG => {
                self.handle_resume();
                true
            }
            ControllerState::Rendering if ty == Ty::NOTIFY_EXPECTED_PRESENT_CONFIG => {
                self.handle_cadence_change();
                false
            }
            _ if ty == Ty::VENDOR_RENDERING_TIMEOUT_INIT => {
                self.handle_vendor_rendering_timeout();
                false
            }
            _ if ty == Ty::VENDOR_RENDERING_TIMEOUT_POST => {
                match event.payload {
                    EventPayload::Panel(command) => self.execute_panel_command(command),
                    payload => warn!("vendor timeout event without a panel command: {payload:?}"),
                }
                false
            }
            state => {
                warn!("unexpected {} in state {state:?}", ty.name());
                false
            }
        }
    }

    fn handle_callback_event(&mut self, event: &VrrControllerEvent) {
        if event.event_type == VrrControllerEventType::STATISTIC_UPDATE {
            self.statistics.update();
            self.post_statistic_update();
            return;
        }

        let Some(id) = event.calculator() else {
            warn!("{} without a calculator", event.event_type.name());
            return;
        };
        if self.video_calculator.owns(id) {
            let rate = self.video_calculator.on_event(&mut self.queue, event);
            self.publish_video(rate);
        } else if self.refresh_rate_calculator.owns(id) {
            let rate = self.refresh_rate_calculator.on_event(&mut self.queue, event);
            self.publish(rate);
        } else {
            trace!("dropping stale {} for calculator {}", event.event_type.name(), id.get());
        }
    }

    fn handle_hibernate(&mut self) {
        self.transition(ControllerState::Hibernate);
        self.drop_vendor_events();
        self.queue
            .drop_event_mask(VrrControllerEventType::HIBERNATE_TIMEOUT);
        self.queue.post_event_in(
            VrrControllerEventType::HIBERNATE_TIMEOUT,
            EventPayload::None,
            self.hibernate_wake_up_ns,
        );
    }

    fn handle_stay_hibernate(&mut self) {
        trace!("controller {}: still hibernating", self.display_id);
        self.queue.post_event_in(
            VrrControllerEventType::HIBERNATE_TIMEOUT,
            EventPayload::None,
            self.hibernate_wake_up_ns,
        );
    }

    fn handle_resume(&mut self) {
        let expected = self.record.next_expected_present_time.take();
        debug!("controller {}: resuming for {expected:?}", self.display_id);
        self.queue
            .drop_event_mask(VrrControllerEventType::HIBERNATE_TIMEOUT);
        self.transition(ControllerState::Rendering);
        self.post_rendering_timeout();
    }

    fn handle_cadence_change(&mut self) {
        let Some(expected) = self.record.next_expected_present_time.take() else {
            return;
        };
        trace!(
            "cadence change: next present at {} every {}ns",
            expected.time_ns,
            expected.frame_interval_ns
        );

        // Count the timeout from the announced present when it lies ahead.
        let Some(timeout_ns) = self.active_vrr_config().and_then(|c| c.rendering_timeout_ns())
        else {
            return;
        };
        self.queue
            .drop_event_mask(VrrControllerEventType::SYSTEM_RENDERING_TIMEOUT);
        let start = expected.time_ns.max(self.queue.now_ns());
        self.queue.post_event(
            VrrControllerEventType::SYSTEM_RENDERING_TIMEOUT,
            EventPayload::None,
            start.saturating_add(timeout_ns),
        );
    }

    fn vendor_schedule(&mut self) -> Vec<TimedEvent> {
        if let Some(timeout_override) = &self.present_timeout_override {
            return timeout_override.events();
        }
        match &mut self.external_handler {
            Some(handler) => handler.get_handle_events(),
            None => Vec::new(),
        }
    }

    fn handle_vendor_rendering_timeout(&mut self) {
        if self.present_timeout_controller != PresentTimeoutController::Software {
            return;
        }
        let start = self.queue.now_ns();
        let events = self.vendor_schedule();
        trace!("vendor rendering timeout: scheduling {} panel commands", events.len());
        for event in events {
            self.queue.post_event(
                VrrControllerEventType::VENDOR_RENDERING_TIMEOUT_POST,
                EventPayload::Panel(event.command),
                event.deadline(start),
            );
        }
    }

    // =========================================================================
    // Dump
    // =========================================================================

    pub fn dump(&self, out: &mut String) {
        let _ = writeln!(out, "VRR controller for display {}", self.display_id);
        let _ = writeln!(
            out,
            "  state: {:?}, enabled: {}, power: {:?}",
            self.state, self.enabled, self.power_mode
        );
        let _ = writeln!(
            out,
            "  active config: {:?}, refresh rate: {}, video frame rate: {}",
            self.active_config_id,
            self.refresh_rate,
            self.video_estimate.get()
        );
        let _ = writeln!(
            out,
            "  present timeout: {:?}, vendor timeout {}ms, override: {}",
            self.present_timeout_controller,
            self.vendor_present_timeout_ns / NANOS_PER_MILLI,
            self.present_timeout_override.is_some()
        );
        let _ = writeln!(
            out,
            "  presents: {}, vsyncs: {}, pending fences: {}",
            self.record.present_history.len(),
            self.record.vsync_history.len(),
            self.record.pending_fences.len()
        );
        let _ = writeln!(
            out,
            "  calculator: {} = {}",
            self.refresh_rate_calculator.name(),
            self.refresh_rate_calculator.refresh_rate()
        );
        self.queue.dump(out);
        self.statistics.dump(out);
        match serde_json::to_string(&self.statistics.snapshot()) {
            Ok(json) => {
                let _ = writeln!(out, "statistics json: {json}");
            }
            Err(err) => warn!("error serializing statistics: {err:?}"),
        }
    }
}
