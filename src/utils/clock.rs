use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use super::{duration_to_ns, get_boottime, get_monotonic_time};

/// Shareable source of "now" for the controller and everything it schedules.
///
/// By default the clock reads the system monotonic clock. A clock created with
/// [`Clock::with_time`] is driven manually instead, which lets tests and trace replays step
/// through timeouts deterministically. Clones share the same underlying time.
#[derive(Debug, Default, Clone)]
pub struct Clock {
    manual: Option<Arc<ManualTime>>,
}

#[derive(Debug)]
struct ManualTime {
    now_ns: AtomicI64,
}

impl Clock {
    pub fn monotonic() -> Self {
        Self::default()
    }

    /// Creates a manually driven clock starting at the given time.
    pub fn with_time(now_ns: i64) -> Self {
        Self {
            manual: Some(Arc::new(ManualTime {
                now_ns: AtomicI64::new(now_ns),
            })),
        }
    }

    pub fn is_manual(&self) -> bool {
        self.manual.is_some()
    }

    /// Returns the current monotonic time in nanoseconds.
    pub fn now_ns(&self) -> i64 {
        match &self.manual {
            Some(manual) => manual.now_ns.load(Ordering::SeqCst),
            None => duration_to_ns(get_monotonic_time()),
        }
    }

    /// Returns the current boot time in nanoseconds.
    ///
    /// A manual clock has no suspend time, so its boot time equals its monotonic time.
    pub fn boottime_ns(&self) -> i64 {
        match &self.manual {
            Some(manual) => manual.now_ns.load(Ordering::SeqCst),
            None => duration_to_ns(get_boottime()),
        }
    }

    /// Converts a monotonic timestamp into the boot clock domain.
    pub fn monotonic_to_boottime_ns(&self, monotonic_ns: i64) -> i64 {
        match &self.manual {
            Some(_) => monotonic_ns,
            None => {
                let offset = duration_to_ns(get_boottime()) - duration_to_ns(get_monotonic_time());
                monotonic_ns + offset
            }
        }
    }

    /// Sets the time of a manual clock. Does nothing on the system clock.
    pub fn set(&self, now_ns: i64) {
        match &self.manual {
            Some(manual) => manual.now_ns.store(now_ns, Ordering::SeqCst),
            None => warn!("ignoring attempt to set the system clock"),
        }
    }

    /// Advances a manual clock. Does nothing on the system clock.
    pub fn advance(&self, delta_ns: i64) {
        match &self.manual {
            Some(manual) => {
                manual.now_ns.fetch_add(delta_ns, Ordering::SeqCst);
            }
            None => warn!("ignoring attempt to advance the system clock"),
        }
    }
}

impl PartialEq for Clock {
    fn eq(&self, other: &Self) -> bool {
        match (&self.manual, &other.manual) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Eq for Clock {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_is_shared() {
        let clock = Clock::with_time(0);
        let other = clock.clone();
        assert_eq!(clock, other);

        clock.advance(16_666_667);
        assert_eq!(other.now_ns(), 16_666_667);

        other.set(100);
        assert_eq!(clock.now_ns(), 100);
        assert_eq!(clock.boottime_ns(), 100);
        assert_eq!(clock.monotonic_to_boottime_ns(42), 42);
    }

    #[test]
    fn system_clock_moves_forward() {
        let clock = Clock::monotonic();
        assert!(!clock.is_manual());
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
        assert_ne!(clock, Clock::with_time(0));
    }
}
