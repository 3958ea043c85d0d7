use std::time::Duration;

use libc::{clock_gettime, timespec, CLOCK_BOOTTIME, CLOCK_MONOTONIC};

pub mod clock;

pub const NANOS_PER_SECOND: i64 = 1_000_000_000;
pub const NANOS_PER_MILLI: i64 = 1_000_000;

fn read_clock(id: libc::clockid_t) -> Duration {
    let mut ts = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid, writable timespec.
    let rv = unsafe { clock_gettime(id, &mut ts) };
    if rv != 0 {
        // Both clocks are mandatory on Linux; a failure here means a broken libc.
        error!("clock_gettime({id}) failed: {:?}", std::io::Error::last_os_error());
        return Duration::ZERO;
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

pub fn get_monotonic_time() -> Duration {
    read_clock(CLOCK_MONOTONIC)
}

/// Returns the time since boot including suspend, which telemetry timestamps use.
pub fn get_boottime() -> Duration {
    read_clock(CLOCK_BOOTTIME)
}

pub fn duration_to_ns(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

pub fn ms_to_ns(ms: u32) -> i64 {
    i64::from(ms) * NANOS_PER_MILLI
}

/// Length of a rearming timer. At least one millisecond, so a timer never comes due again
/// at the instant it fires.
pub fn timer_ms_to_ns(ms: u32) -> i64 {
    ms_to_ns(ms.max(1))
}

/// Divides rounding half away from zero. `divisor` must be non-zero.
pub fn round_divide(dividend: i64, divisor: i64) -> i64 {
    debug_assert!(divisor != 0);
    if (dividend < 0) != (divisor < 0) {
        (dividend - divisor / 2) / divisor
    } else {
        (dividend + divisor / 2) / divisor
    }
}

/// Converts a period to the closest whole frequency in Hz. Non-positive periods give 0.
pub fn duration_ns_to_freq(duration_ns: i64) -> i32 {
    if duration_ns <= 0 {
        return 0;
    }
    i32::try_from(round_divide(NANOS_PER_SECOND, duration_ns)).unwrap_or(i32::MAX)
}

/// Converts a frequency in Hz to its period. Non-positive frequencies give 0.
pub fn freq_to_duration_ns(freq: i32) -> i64 {
    if freq <= 0 {
        return 0;
    }
    round_divide(NANOS_PER_SECOND, i64::from(freq))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_divide_rounds_half_away_from_zero() {
        assert_eq!(round_divide(5, 2), 3);
        assert_eq!(round_divide(4, 3), 1);
        assert_eq!(round_divide(-5, 2), -3);
        assert_eq!(round_divide(33_333_333, 16_666_667), 2);
    }

    #[test]
    fn freq_conversions() {
        assert_eq!(freq_to_duration_ns(120), 8_333_333);
        assert_eq!(freq_to_duration_ns(60), 16_666_667);
        assert_eq!(duration_ns_to_freq(8_333_333), 120);
        assert_eq!(duration_ns_to_freq(16_666_667), 60);
        assert_eq!(duration_ns_to_freq(0), 0);
        assert_eq!(freq_to_duration_ns(-1), 0);
    }

    #[test]
    fn boottime_is_not_behind_monotonic() {
        let mono = get_monotonic_time();
        let boot = get_boottime();
        assert!(boot >= mono);
    }
}
