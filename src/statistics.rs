//! Residency accounting of the display's present cadence.
//!
//! Every present is bucketed by the profile the panel was in: power mode, configuration,
//! brightness mode and the number of vsyncs since the previous present. While idle no presents
//! arrive, so idle time is synthesized lazily whenever the statistics are read.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use serde::Serialize;

use crate::display_context::CommonDisplayContextProvider;
use crate::types::{
    BrightnessMode, PowerMode, PresentFrameFlag, DOZE_ACTIVE_REFRESH_RATE, DOZE_IDLE_REFRESH_RATE,
};
use crate::utils::clock::Clock;
use crate::utils::{freq_to_duration_ns, ms_to_ns, round_divide, NANOS_PER_MILLI};

/// Idle refresh rates above this would give sub-millisecond idle intervals.
pub const MAX_IDLE_REFRESH_RATE: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DisplayStatus {
    pub active_config_id: i32,
    pub power_mode: PowerMode,
    pub brightness_mode: BrightnessMode,
}

impl Default for DisplayStatus {
    fn default() -> Self {
        Self {
            active_config_id: -1,
            power_mode: PowerMode::Off,
            brightness_mode: BrightnessMode::Normal,
        }
    }
}

/// Statistics key.
///
/// All profiles with the panel off compare equal, whatever their other fields say, and sort
/// before every other profile.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DisplayPresentProfile {
    pub status: DisplayStatus,
    pub num_vsync: i32,
}

impl DisplayPresentProfile {
    pub fn is_off(&self) -> bool {
        self.status.power_mode.is_off()
    }

    fn key(&self) -> (i32, PowerMode, BrightnessMode, i32) {
        let s = &self.status;
        (s.active_config_id, s.power_mode, s.brightness_mode, self.num_vsync)
    }
}

impl Ord for DisplayPresentProfile {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.is_off(), other.is_off()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.key().cmp(&other.key()),
        }
    }
}

impl PartialOrd for DisplayPresentProfile {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DisplayPresentProfile {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DisplayPresentProfile {}

impl fmt::Display for DisplayPresentProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_off() {
            return f.write_str("Off");
        }
        let s = &self.status;
        write!(
            f,
            "{}:config{}:{}vsync{}",
            s.power_mode.short_name(),
            s.active_config_id,
            self.num_vsync,
            s.brightness_mode.suffix(),
        )
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DisplayPresentRecord {
    pub count: u64,
    pub accumulated_time_ns: i64,
    pub last_timestamp_boot_ns: i64,
    /// Changed since the last [`VariableRefreshRateStatistic::get_updated_statistics`].
    pub updated: bool,
}

pub type DisplayPresentStatistics = BTreeMap<DisplayPresentProfile, DisplayPresentRecord>;

#[derive(Debug, Clone, Serialize)]
pub struct StatisticEntry {
    pub profile: DisplayPresentProfile,
    pub record: DisplayPresentRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatisticsParameters {
    /// Minimum refresh rate the panel keeps while idle in normal mode.
    pub idle_refresh_rate: i32,
    /// Period of the controller's statistic update event, zero when disabled.
    pub update_period_ns: i64,
}

impl Default for StatisticsParameters {
    fn default() -> Self {
        Self::from(&hwc_vrr_config::Statistics::default())
    }
}

impl From<&hwc_vrr_config::Statistics> for StatisticsParameters {
    fn from(config: &hwc_vrr_config::Statistics) -> Self {
        Self {
            idle_refresh_rate: i32::try_from(
                config.idle_refresh_rate.clamp(1, MAX_IDLE_REFRESH_RATE),
            )
            .unwrap_or(1),
            update_period_ns: ms_to_ns(config.update_period_ms),
        }
    }
}

pub struct VariableRefreshRateStatistic {
    context: Arc<dyn CommonDisplayContextProvider>,
    clock: Clock,
    params: StatisticsParameters,
    status: DisplayStatus,
    te_frequency: i32,
    /// Boot clock time up to which residency has been accounted.
    last_timestamp_ns: Option<i64>,
    statistics: DisplayPresentStatistics,
}

impl VariableRefreshRateStatistic {
    pub fn new(
        context: Arc<dyn CommonDisplayContextProvider>,
        clock: Clock,
        params: StatisticsParameters,
    ) -> Self {
        Self {
            context,
            clock,
            params,
            status: DisplayStatus::default(),
            te_frequency: 0,
            last_timestamp_ns: None,
            statistics: DisplayPresentStatistics::new(),
        }
    }

    pub fn update_period_ns(&self) -> i64 {
        self.params.update_period_ns
    }

    pub fn status(&self) -> DisplayStatus {
        self.status
    }

    fn idle_refresh_rate(&self) -> i32 {
        if self.status.power_mode.is_doze() {
            DOZE_IDLE_REFRESH_RATE
        } else {
            self.params.idle_refresh_rate
        }
    }

    fn profile(&self, num_vsync: i32) -> DisplayPresentProfile {
        DisplayPresentProfile {
            status: self.status,
            num_vsync,
        }
    }

    /// Profile the panel sits in while no frames arrive.
    fn idle_profile(&self) -> DisplayPresentProfile {
        let num_vsync = if self.te_frequency > 0 {
            (self.te_frequency / self.idle_refresh_rate()).max(1)
        } else {
            0
        };
        self.profile(num_vsync)
    }

    fn record(&mut self, profile: DisplayPresentProfile) -> &mut DisplayPresentRecord {
        let record = self.statistics.entry(profile).or_default();
        record.updated = true;
        record
    }

    /// Accounts the idle time up to `now_ns` in whole enforced refresh intervals.
    fn update_idle_stats(&mut self, now_ns: i64) {
        let Some(last) = self.last_timestamp_ns else {
            return;
        };
        if now_ns <= last {
            return;
        }

        if self.status.power_mode.is_off() {
            let record = self.record(self.profile(0));
            record.accumulated_time_ns += now_ns - last;
            record.last_timestamp_boot_ns = now_ns;
            self.last_timestamp_ns = Some(now_ns);
            return;
        }

        if self.te_frequency <= 0 {
            return;
        }

        let interval_ns = freq_to_duration_ns(self.idle_refresh_rate());
        if interval_ns <= 0 {
            return;
        }
        let intervals = (now_ns - last) / interval_ns;
        if intervals == 0 {
            return;
        }

        let end = last + intervals * interval_ns;
        let profile = self.idle_profile();
        let record = self.record(profile);
        record.count += intervals as u64;
        record.accumulated_time_ns += intervals * interval_ns;
        record.last_timestamp_boot_ns = end;
        self.last_timestamp_ns = Some(end);
    }

    /// Accounts the partial interval since the last timestamp into the current idle profile
    /// and switches to a new display status.
    fn switch_status(&mut self, now_ns: i64, status: DisplayStatus) {
        self.update_idle_stats(now_ns);
        if let Some(last) = self.last_timestamp_ns {
            if now_ns > last && (self.status.power_mode.is_off() || self.te_frequency > 0) {
                let profile = self.idle_profile();
                self.record(profile).accumulated_time_ns += now_ns - last;
            }
        }

        self.status = status;
        self.te_frequency = self
            .context
            .te_frequency(status.active_config_id)
            .unwrap_or(0);

        let profile = self.idle_profile();
        let record = self.record(profile);
        record.count += 1;
        record.last_timestamp_boot_ns = now_ns;
        self.last_timestamp_ns = Some(now_ns);
    }

    fn sync_brightness(&mut self, now_ns: i64) {
        let brightness_mode = self.context.brightness_mode();
        if brightness_mode != self.status.brightness_mode && !self.status.power_mode.is_off() {
            debug!("brightness mode changed to {brightness_mode:?}");
            let status = DisplayStatus {
                brightness_mode,
                ..self.status
            };
            self.switch_status(now_ns, status);
        }
    }

    pub fn on_present(&mut self, present_time_ns: i64, flag: PresentFrameFlag) {
        let _span = tracy_client::span!("VariableRefreshRateStatistic::on_present");

        if self.status.power_mode.is_off() {
            return;
        }

        let now = self.clock.monotonic_to_boottime_ns(present_time_ns);
        self.sync_brightness(now);

        if self.last_timestamp_ns.is_none() || self.te_frequency <= 0 {
            self.last_timestamp_ns = Some(now);
            return;
        }

        self.update_idle_stats(now);
        let last = self.last_timestamp_ns.unwrap_or(now);
        let elapsed = (now - last).max(0);

        let te_period_ns = freq_to_duration_ns(self.te_frequency);
        let mut num_vsync =
            round_divide(elapsed, te_period_ns).clamp(1, i64::from(self.te_frequency)) as i32;
        let presenting_doze = flag.contains(PresentFrameFlag::PRESENTING_WHEN_DOZE);
        if presenting_doze {
            num_vsync = (self.te_frequency / DOZE_ACTIVE_REFRESH_RATE).max(1);
        }

        let record = self.record(self.profile(num_vsync));
        record.count += 1;
        record.accumulated_time_ns += elapsed;
        record.last_timestamp_boot_ns = now;

        if presenting_doze {
            // The panel reverts to the doze idle rate on its own right after the frame.
            let profile = self.idle_profile();
            let record = self.record(profile);
            record.count += 1;
            record.last_timestamp_boot_ns = now;
        }

        self.last_timestamp_ns = Some(now);
    }

    pub fn on_power_state_change(&mut self, from: PowerMode, to: PowerMode) {
        if from == to {
            return;
        }
        let now = self.clock.boottime_ns();
        let status = DisplayStatus {
            power_mode: to,
            brightness_mode: self.context.brightness_mode(),
            ..self.status
        };
        self.switch_status(now, status);
    }

    pub fn set_active_config(&mut self, config_id: i32) {
        if config_id == self.status.active_config_id {
            return;
        }
        let now = self.clock.boottime_ns();
        let status = DisplayStatus {
            active_config_id: config_id,
            ..self.status
        };
        if self.last_timestamp_ns.is_none() {
            // Nothing accounted yet.
            self.status = status;
            self.te_frequency = self.context.te_frequency(config_id).unwrap_or(0);
            return;
        }
        self.switch_status(now, status);
    }

    /// Brings idle accounting up to date.
    pub fn update(&mut self) {
        let now = self.clock.boottime_ns();
        self.sync_brightness(now);
        self.update_idle_stats(now);
    }

    pub fn get_statistics(&mut self) -> DisplayPresentStatistics {
        self.update();
        self.statistics.clone()
    }

    /// Returns the records changed since the previous call and clears their flags.
    ///
    /// The off profile keeps accumulating while the panel is off, so it stays flagged.
    pub fn get_updated_statistics(&mut self) -> DisplayPresentStatistics {
        self.update();
        let current_off = self.status.power_mode.is_off();
        let mut updated = DisplayPresentStatistics::new();
        for (profile, record) in &mut self.statistics {
            if !record.updated {
                continue;
            }
            updated.insert(*profile, *record);
            if !(current_off && profile.is_off()) {
                record.updated = false;
            }
        }
        updated
    }

    pub fn snapshot(&self) -> Vec<StatisticEntry> {
        self.statistics
            .iter()
            .map(|(&profile, &record)| StatisticEntry { profile, record })
            .collect()
    }

    pub fn reset(&mut self) {
        self.statistics.clear();
        self.last_timestamp_ns = None;
    }

    pub fn dump(&self, out: &mut String) {
        let _ = writeln!(out, "statistics: {} profiles", self.statistics.len());
        for (profile, record) in &self.statistics {
            let _ = writeln!(
                out,
                "  {profile}: count={} time={}ms last={}",
                record.count,
                record.accumulated_time_ns / NANOS_PER_MILLI,
                record.last_timestamp_boot_ns,
            );
        }
    }
}
