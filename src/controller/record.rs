//! Bounded histories of what the pipeline told the controller.

use std::collections::VecDeque;

use super::fence::PresentFence;

pub const HISTORY_CAPACITY: usize = 128;

pub trait Timestamped {
    fn time_ns(&self) -> i64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentTimeRecord {
    /// Active configuration when the present was announced, or -1.
    pub config_id: i32,
    pub time_ns: i64,
    pub frame_interval_ns: i64,
}

impl Timestamped for PresentTimeRecord {
    fn time_ns(&self) -> i64 {
        self.time_ns
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsyncRecord {
    pub time_ns: i64,
    pub period_ns: i64,
}

impl Timestamped for VsyncRecord {
    fn time_ns(&self) -> i64 {
        self.time_ns
    }
}

/// Ring buffer of timestamped entries in non-decreasing time order.
#[derive(Debug, Clone)]
pub struct History<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T: Timestamped> History<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Appends `entry`, evicting the oldest one when full.
    ///
    /// Returns `false` and drops the entry when it is older than the newest one.
    pub fn push(&mut self, entry: T) -> bool {
        if let Some(last) = self.entries.back() {
            if entry.time_ns() < last.time_ns() {
                return false;
            }
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        true
    }

    pub fn last(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}

#[derive(Debug)]
pub struct VrrRecord {
    /// Announced by the last expected present notification, consumed on resume.
    pub next_expected_present_time: Option<PresentTimeRecord>,
    /// Announced by `set_expected_present_time`, consumed by the next present.
    pub pending_current_present_time: Option<PresentTimeRecord>,
    pub present_history: History<PresentTimeRecord>,
    pub vsync_history: History<VsyncRecord>,
    /// Fences whose signal times have not been read yet.
    pub pending_fences: Vec<PresentFence>,
}

impl Default for VrrRecord {
    fn default() -> Self {
        Self {
            next_expected_present_time: None,
            pending_current_present_time: None,
            present_history: History::new(HISTORY_CAPACITY),
            vsync_history: History::new(HISTORY_CAPACITY),
            pending_fences: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn vsync(time_ns: i64) -> VsyncRecord {
        VsyncRecord {
            time_ns,
            period_ns: 8_333_333,
        }
    }

    #[test]
    fn rejects_out_of_order() {
        let mut history = History::new(4);
        assert!(history.push(vsync(10)));
        assert!(history.push(vsync(10)));
        assert!(!history.push(vsync(9)));
        assert_eq!(history.len(), 2);
        assert_eq!(history.last().unwrap().time_ns, 10);
    }

    #[test]
    fn evicts_oldest() {
        let mut history = History::new(3);
        for time in 0..5 {
            history.push(vsync(time));
        }
        let times: Vec<_> = history.iter().map(|v| v.time_ns).collect();
        assert_eq!(times, [2, 3, 4]);
    }

    proptest! {
        #[test]
        fn stays_sorted_and_bounded(times in prop::collection::vec(0i64..1_000, 0..300)) {
            let mut history = History::new(HISTORY_CAPACITY);
            for time in times {
                history.push(vsync(time));
            }
            prop_assert!(history.len() <= HISTORY_CAPACITY);
            let times: Vec<_> = history.iter().map(|v| v.time_ns).collect();
            prop_assert!(times.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
