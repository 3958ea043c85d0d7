//! Panel and controller configuration for hwc-vrr.
//!
//! The configuration is a KDL document with one top-level node per section. Every section
//! is optional and falls back to the defaults the controller ships with.

#[macro_use]
extern crate tracing;

use std::ffi::OsStr;
use std::path::Path;

use miette::{Context, IntoDiagnostic};

pub mod calculator;
pub mod controller;
pub mod panel;

pub use crate::calculator::{
    Combined, ExitIdle, Instant, Period, PeriodKind, RefreshRateCalculatorKind, Video,
};
pub use crate::controller::{Controller, PresentTimeoutController, VendorPresentTimeout};
pub use crate::panel::Panel;

#[derive(knuffel::Decode, Debug, Default, Clone, PartialEq)]
pub struct Config {
    #[knuffel(child, default)]
    pub panel: Panel,
    #[knuffel(child, default)]
    pub controller: Controller,
    #[knuffel(child, default)]
    pub instant: Instant,
    #[knuffel(child, default)]
    pub period: Period,
    #[knuffel(child, default)]
    pub exit_idle: ExitIdle,
    #[knuffel(child, default)]
    pub video: Video,
    #[knuffel(child, default)]
    pub combined: Combined,
    #[knuffel(child, default)]
    pub statistics: Statistics,
    #[knuffel(child, default)]
    pub debug: DebugOptions,
}

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Statistics {
    /// Period of the self-refreshing idle bookkeeping event. Zero disables it.
    #[knuffel(child, unwrap(argument), default = 0)]
    pub update_period_ms: u32,
    /// Minimum refresh rate the panel keeps while idle in normal power mode.
    #[knuffel(child, unwrap(argument), default = 1)]
    pub idle_refresh_rate: u32,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            update_period_ms: 0,
            idle_refresh_rate: 1,
        }
    }
}

#[derive(knuffel::Decode, Debug, Default, Clone, PartialEq)]
pub struct DebugOptions {
    /// Forward every published refresh rate to the host's debug callback.
    #[knuffel(child)]
    pub refresh_rate_indicator: bool,
    /// Run the controller loop at normal priority instead of SCHED_FIFO.
    #[knuffel(child)]
    pub no_realtime_thread: bool,
}

impl Config {
    pub fn load(path: &Path) -> miette::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .into_diagnostic()
            .with_context(|| format!("error reading {path:?}"))?;

        let config = Self::parse(
            path.file_name()
                .and_then(OsStr::to_str)
                .unwrap_or("vrr.kdl"),
            &contents,
        )
        .context("error parsing")?;
        debug!("loaded config from {path:?}");
        Ok(config)
    }

    pub fn parse(filename: &str, text: &str) -> Result<Self, knuffel::Error> {
        let _span = tracy_client::span!("Config::parse");
        knuffel::parse(filename, text)
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_debug_snapshot;
    use pretty_assertions::assert_eq;

    use super::*;

    #[track_caller]
    fn do_parse(text: &str) -> Config {
        Config::parse("test.kdl", text)
            .map_err(miette::Report::new)
            .unwrap()
    }

    #[test]
    fn empty_config_is_default() {
        assert_eq!(do_parse(""), Config::default());
    }

    #[test]
    fn default_config_parses() {
        let config = do_parse(include_str!("../../resources/default-vrr.kdl"));
        assert_eq!(config.panel.name, "primary-panel");
        assert_eq!(
            config.controller.present_timeout_controller,
            PresentTimeoutController::Software
        );
        assert_eq!(config.period.measure_period_ms, 500);
    }

    #[test]
    fn parse() {
        let config = do_parse(
            r#"
            panel {
                name "bigsurf"
                sysfs-root "/tmp/panel"
                te2-changeable
            }

            controller {
                present-timeout-controller "hardware"
                hibernate-wake-up-ms 250
                refresh-rate-calculator "instant"
                vendor-present-timeout {
                    timeout-ms 50
                    interval 3 16
                    interval 1 33
                }
            }

            period {
                kind "majority"
                confidence-percentage 40
            }

            video {
                max-interested-frame-rate 48
            }

            debug {
                refresh-rate-indicator
            }
            "#,
        );

        assert_eq!(config.panel.name, "bigsurf");
        assert_eq!(config.panel.sysfs_root, "/tmp/panel");
        assert!(config.panel.te2_changeable);
        assert_eq!(
            config.controller.present_timeout_controller,
            PresentTimeoutController::Hardware
        );
        assert_debug_snapshot!(config.controller, @r"
        Controller {
            present_timeout_controller: Hardware,
            hibernate_wake_up_ms: 250,
            vendor_present_timeout_ms: 100,
            refresh_rate_calculator: Instant,
            vendor_present_timeout: Some(
                VendorPresentTimeout {
                    timeout_ms: 50,
                    intervals: [
                        TimeoutInterval {
                            count: 3,
                            interval_ms: 16,
                        },
                        TimeoutInterval {
                            count: 1,
                            interval_ms: 33,
                        },
                    ],
                },
            ),
        }
        ");

        assert_eq!(config.period.kind, PeriodKind::Majority);
        assert_eq!(config.period.confidence_percentage, 40);
        assert_eq!(config.period.measure_period_ms, 500);
        assert_eq!(config.video.max_interested_frame_rate, 48);
        assert_eq!(config.video.min_stable_runs, 3);
        assert!(config.debug.refresh_rate_indicator);
        assert!(!config.debug.no_realtime_thread);
    }

    #[test]
    fn unknown_calculator_is_an_error() {
        let res = Config::parse(
            "test.kdl",
            r#"controller { refresh-rate-calculator "magic"; }"#,
        );
        assert!(res.is_err());
    }
}
