//! Display state residency for the power stats service.
//!
//! The service expects a fixed table of named states. Every statistics profile maps onto one
//! of them by power mode, configuration geometry, effective refresh rate and brightness.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::controller::VariableRefreshRateController;
use crate::display_context::CommonDisplayContextProvider;
use crate::statistics::{DisplayPresentProfile, DisplayPresentStatistics};
use crate::types::{
    BrightnessMode, DisplayConfiguration, PowerMode, DOZE_ACTIVE_REFRESH_RATE,
    DOZE_IDLE_REFRESH_RATE,
};
use crate::utils::{round_divide, NANOS_PER_MILLI};

mod watcher;

pub use watcher::{DisplayStateResidencyWatcher, PowerStatsService, DEFAULT_POLL_INTERVAL};

pub const POWER_ENTITY_NAME: &str = "Display";
const OFF_STATE: &str = "Off";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PowerEntityState {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateResidency {
    pub id: i32,
    pub total_time_in_state_ms: i64,
    pub total_state_entry_count: i64,
    pub last_entry_timestamp_ms: i64,
}

/// Where the residency provider reads statistics from.
pub trait StatisticsSource: Send + Sync {
    /// Records changed since the previous call.
    fn get_updated_statistics(&self) -> DisplayPresentStatistics;
}

impl StatisticsSource for VariableRefreshRateController {
    fn get_updated_statistics(&self) -> DisplayPresentStatistics {
        VariableRefreshRateController::get_updated_statistics(self)
    }
}

/// Callback the power stats service polls.
pub trait StateResidencyCallback: Send + Sync {
    fn get_state_residency(&self) -> Vec<StateResidency>;
}

/// Refresh rates a TE frequency can produce by showing each frame for a whole number of TE
/// periods, highest first.
fn on_refresh_rates(te_frequency: i32) -> Vec<i32> {
    let te = i64::from(te_frequency.max(1));
    let mut rates: Vec<i32> = (1..=te)
        .map(|num_vsync| round_divide(te, num_vsync) as i32)
        .collect();
    rates.dedup();
    rates
}

fn state_name(
    power_mode: PowerMode,
    config: &DisplayConfiguration,
    refresh_rate: i32,
    brightness_mode: BrightnessMode,
) -> String {
    if power_mode.is_off() {
        return String::from(OFF_STATE);
    }
    let mode = if power_mode.is_doze() { "LP" } else { "On" };
    // Local HBM only lights the fingerprint area and is reported as normal brightness.
    let suffix = match brightness_mode {
        BrightnessMode::Hbm => BrightnessMode::Hbm.suffix(),
        BrightnessMode::Normal | BrightnessMode::Lhbm => "",
    };
    format!(
        "{mode}:{}x{}@{}:{refresh_rate}{suffix}",
        config.width, config.height, config.te_frequency
    )
}

/// Builds the state table and aggregates statistics into it.
pub struct DisplayStateResidencyProvider {
    context: Arc<dyn CommonDisplayContextProvider>,
    source: Arc<dyn StatisticsSource>,
    states: Vec<PowerEntityState>,
    ids: HashMap<String, i32>,
    /// Latest record of every profile seen so far.
    statistics: Mutex<DisplayPresentStatistics>,
}

impl DisplayStateResidencyProvider {
    pub fn new(
        context: Arc<dyn CommonDisplayContextProvider>,
        source: Arc<dyn StatisticsSource>,
    ) -> Self {
        let mut names = vec![String::from(OFF_STATE)];
        for (_, config) in context.display_configs() {
            for brightness in [BrightnessMode::Normal, BrightnessMode::Hbm] {
                for rate in on_refresh_rates(config.te_frequency) {
                    names.push(state_name(PowerMode::Normal, &config, rate, brightness));
                }
            }
            for rate in [DOZE_ACTIVE_REFRESH_RATE, DOZE_IDLE_REFRESH_RATE] {
                names.push(state_name(PowerMode::Doze, &config, rate, BrightnessMode::Normal));
            }
        }

        let mut states = Vec::with_capacity(names.len());
        let mut ids = HashMap::with_capacity(names.len());
        for name in names {
            // Configurations may share geometry and TE frequency.
            if ids.contains_key(&name) {
                continue;
            }
            let id = states.len() as i32;
            ids.insert(name.clone(), id);
            states.push(PowerEntityState { id, name });
        }
        debug!("display residency table has {} states", states.len());

        Self {
            context,
            source,
            states,
            ids,
            statistics: Mutex::new(DisplayPresentStatistics::new()),
        }
    }

    pub fn states(&self) -> &[PowerEntityState] {
        &self.states
    }

    pub fn state_id(&self, profile: &DisplayPresentProfile) -> Option<i32> {
        let name = if profile.is_off() {
            String::from(OFF_STATE)
        } else {
            let status = &profile.status;
            let config = self.context.display_config(status.active_config_id)?;
            let num_vsync = i64::from(profile.num_vsync.max(1));
            let rate = round_divide(i64::from(config.te_frequency), num_vsync) as i32;
            state_name(status.power_mode, &config, rate, status.brightness_mode)
        };
        self.ids.get(&name).copied()
    }

    pub fn get_state_residency(&self) -> Vec<StateResidency> {
        let _span = tracy_client::span!("DisplayStateResidencyProvider::get_state_residency");

        let updated = self.source.get_updated_statistics();
        let mut statistics = self.statistics.lock().unwrap_or_else(PoisonError::into_inner);
        statistics.extend(updated);

        let mut residencies: Vec<StateResidency> = self
            .states
            .iter()
            .map(|state| StateResidency {
                id: state.id,
                ..StateResidency::default()
            })
            .collect();

        for (profile, record) in statistics.iter() {
            let Some(id) = self.state_id(profile) else {
                trace!("no residency state for {profile}");
                continue;
            };
            let Some(residency) = residencies.get_mut(id as usize) else {
                continue;
            };
            residency.total_time_in_state_ms += record.accumulated_time_ns / NANOS_PER_MILLI;
            residency.total_state_entry_count += i64::try_from(record.count).unwrap_or(i64::MAX);
            residency.last_entry_timestamp_ms = residency
                .last_entry_timestamp_ms
                .max(record.last_timestamp_boot_ns / NANOS_PER_MILLI);
        }

        residencies
    }
}

impl StateResidencyCallback for DisplayStateResidencyProvider {
    fn get_state_residency(&self) -> Vec<StateResidency> {
        DisplayStateResidencyProvider::get_state_residency(self)
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use super::*;
    use crate::display_context::{create_display_context_provider, FixedDisplayState, SocFamily};
    use crate::statistics::{DisplayPresentRecord, DisplayStatus};

    struct FixedStatistics(Mutex<Vec<DisplayPresentStatistics>>);

    impl StatisticsSource for FixedStatistics {
        fn get_updated_statistics(&self) -> DisplayPresentStatistics {
            let mut batches = self.0.lock().unwrap();
            if batches.is_empty() {
                DisplayPresentStatistics::new()
            } else {
                batches.remove(0)
            }
        }
    }

    fn context() -> Arc<dyn CommonDisplayContextProvider> {
        let configs = HashMap::from([(
            0,
            DisplayConfiguration {
                width: 1080,
                height: 2400,
                vsync_period_ns: 16_666_667,
                te_frequency: 60,
            },
        )]);
        create_display_context_provider(
            SocFamily::Zuma,
            Arc::new(FixedDisplayState::default()),
            configs,
        )
    }

    fn profile(
        power_mode: PowerMode,
        brightness_mode: BrightnessMode,
        num_vsync: i32,
    ) -> DisplayPresentProfile {
        DisplayPresentProfile {
            status: DisplayStatus {
                active_config_id: 0,
                power_mode,
                brightness_mode,
            },
            num_vsync,
        }
    }

    fn record(count: u64, time_ms: i64, last_ms: i64) -> DisplayPresentRecord {
        DisplayPresentRecord {
            count,
            accumulated_time_ns: time_ms * NANOS_PER_MILLI,
            last_timestamp_boot_ns: last_ms * NANOS_PER_MILLI,
            updated: true,
        }
    }

    fn provider(batches: Vec<DisplayPresentStatistics>) -> DisplayStateResidencyProvider {
        DisplayStateResidencyProvider::new(
            context(),
            Arc::new(FixedStatistics(Mutex::new(batches))),
        )
    }

    #[test]
    fn refresh_rates_of_te() {
        assert_eq!(
            on_refresh_rates(60),
            [60, 30, 20, 15, 12, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1]
        );
    }

    #[test]
    fn state_table() {
        let provider = provider(Vec::new());
        let names: Vec<_> = provider.states().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names.len(), 1 + 2 * 15 + 2);
        let interesting: Vec<_> = names
            .iter()
            .filter(|name| {
                !name.starts_with("On:") || name.ends_with(":60") || name.ends_with("HBM")
            })
            .take(5)
            .collect();
        assert_snapshot!(format!("{interesting:#?}"), @r#"
        [
            "Off",
            "On:1080x2400@60:60",
            "On:1080x2400@60:60:HBM",
            "On:1080x2400@60:30:HBM",
            "On:1080x2400@60:20:HBM",
        ]
        "#);
    }

    #[test]
    fn profiles_map_to_states() {
        let provider = provider(Vec::new());
        let name = |p: DisplayPresentProfile| {
            let id = provider.state_id(&p).unwrap();
            provider.states()[id as usize].name.clone()
        };

        assert_eq!(name(profile(PowerMode::Off, BrightnessMode::Hbm, 3)), "Off");
        assert_eq!(name(profile(PowerMode::DozeSuspend, BrightnessMode::Normal, 1)), "Off");
        assert_eq!(
            name(profile(PowerMode::Normal, BrightnessMode::Normal, 2)),
            "On:1080x2400@60:30"
        );
        assert_eq!(
            name(profile(PowerMode::Normal, BrightnessMode::Lhbm, 1)),
            "On:1080x2400@60:60"
        );
        assert_eq!(
            name(profile(PowerMode::Normal, BrightnessMode::Hbm, 60)),
            "On:1080x2400@60:1:HBM"
        );
        assert_eq!(
            name(profile(PowerMode::Doze, BrightnessMode::Normal, 2)),
            "LP:1080x2400@60:30"
        );
        assert_eq!(
            name(profile(PowerMode::Doze, BrightnessMode::Normal, 60)),
            "LP:1080x2400@60:1"
        );

        let unknown = DisplayPresentProfile {
            status: DisplayStatus {
                active_config_id: 9,
                ..profile(PowerMode::Normal, BrightnessMode::Normal, 1).status
            },
            num_vsync: 1,
        };
        assert_eq!(provider.state_id(&unknown), None);
    }

    #[test]
    fn aggregates_cached_records() {
        let first = DisplayPresentStatistics::from([
            (profile(PowerMode::Normal, BrightnessMode::Normal, 1), record(10, 100, 1_000)),
            (profile(PowerMode::Normal, BrightnessMode::Lhbm, 1), record(5, 50, 1_500)),
            (profile(PowerMode::Off, BrightnessMode::Normal, 0), record(1, 2_000, 500)),
        ]);
        // Only the changed record comes back the second time.
        let second = DisplayPresentStatistics::from([(
            profile(PowerMode::Normal, BrightnessMode::Normal, 1),
            record(12, 130, 2_000),
        )]);
        let provider = provider(vec![first, second]);

        let on_60 = provider
            .state_id(&profile(PowerMode::Normal, BrightnessMode::Normal, 1))
            .unwrap() as usize;

        let residency = provider.get_state_residency();
        assert_eq!(residency.len(), provider.states().len());
        assert_eq!(residency[0].total_time_in_state_ms, 2_000);
        assert_eq!(
            residency[on_60],
            StateResidency {
                id: on_60 as i32,
                total_time_in_state_ms: 150,
                total_state_entry_count: 15,
                last_entry_timestamp_ms: 1_500,
            }
        );

        let residency = provider.get_state_residency();
        assert_eq!(residency[on_60].total_time_in_state_ms, 180);
        assert_eq!(residency[on_60].total_state_entry_count, 17);
        assert_eq!(residency[on_60].last_entry_timestamp_ms, 2_000);
        assert_eq!(residency[0].total_time_in_state_ms, 2_000);
    }
}
