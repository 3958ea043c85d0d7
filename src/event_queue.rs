//! Deadline-ordered event queue driving the VRR controller.
//!
//! Events are plain data: a type, an absolute deadline and a tagged payload. Whoever pops an
//! event decides what to do with it, so the queue can be inspected and asserted on without
//! running anything.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt::Write as _;

use bitflags::bitflags;

use crate::external_event_handler::PanelCommand;
use crate::refresh_rate_calculator::CalculatorId;
use crate::utils::clock::Clock;
use crate::utils::NANOS_PER_MILLI;

bitflags! {
    /// Event type. Every type belongs to exactly one of the three masks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VrrControllerEventType: u32 {
        const GENERAL_EVENT_MASK = 0x1000_0000;
        const SYSTEM_RENDERING_TIMEOUT = Self::GENERAL_EVENT_MASK.bits() | (1 << 0);
        const VENDOR_RENDERING_TIMEOUT_INIT = Self::GENERAL_EVENT_MASK.bits() | (1 << 1);
        const VENDOR_RENDERING_TIMEOUT_POST = Self::GENERAL_EVENT_MASK.bits() | (1 << 2);
        const HIBERNATE_TIMEOUT = Self::GENERAL_EVENT_MASK.bits() | (1 << 3);
        const NOTIFY_EXPECTED_PRESENT_CONFIG = Self::GENERAL_EVENT_MASK.bits() | (1 << 4);
        const MIN_LOCK_TIME_FOR_PEAK_REFRESH_RATE = Self::GENERAL_EVENT_MASK.bits() | (1 << 5);

        /// Housekeeping timers that fire regardless of the controller state.
        const CALLBACK_EVENT_MASK = 0x2000_0000;
        const INSTANT_REFRESH_RATE_CALCULATOR_UPDATE = Self::CALLBACK_EVENT_MASK.bits() | (1 << 0);
        const PERIOD_REFRESH_RATE_CALCULATOR_UPDATE = Self::CALLBACK_EVENT_MASK.bits() | (1 << 1);
        const VIDEO_FRAME_RATE_CALCULATOR_UPDATE = Self::CALLBACK_EVENT_MASK.bits() | (1 << 2);
        const COMBINED_REFRESH_RATE_CALCULATOR_UPDATE = Self::CALLBACK_EVENT_MASK.bits() | (1 << 3);
        const AOD_REFRESH_RATE_CALCULATOR_UPDATE = Self::CALLBACK_EVENT_MASK.bits() | (1 << 4);
        const EXIT_IDLE_REFRESH_RATE_CALCULATOR_UPDATE =
            Self::CALLBACK_EVENT_MASK.bits() | (1 << 5);
        const STATISTIC_UPDATE = Self::CALLBACK_EVENT_MASK.bits() | (1 << 6);

        const EXTERNAL_EVENT_MASK = 0x4000_0000;
    }
}

impl VrrControllerEventType {
    /// Whether this type carries every bit of `mask`.
    ///
    /// Masks select whole families (`GENERAL_EVENT_MASK`) as well as single types.
    pub fn matches(self, mask: Self) -> bool {
        self.contains(mask)
    }

    pub fn is_callback(self) -> bool {
        self.matches(Self::CALLBACK_EVENT_MASK)
    }

    pub fn name(self) -> &'static str {
        EVENT_NAMES
            .iter()
            .find(|(ty, _)| *ty == self)
            .map_or("Unknown", |&(_, name)| name)
    }
}

const EVENT_NAMES: &[(VrrControllerEventType, &str)] = {
    use VrrControllerEventType as Ty;
    &[
        (Ty::SYSTEM_RENDERING_TIMEOUT, "SystemRenderingTimeout"),
        (Ty::VENDOR_RENDERING_TIMEOUT_INIT, "VendorRenderingTimeoutInit"),
        (Ty::VENDOR_RENDERING_TIMEOUT_POST, "VendorRenderingTimeoutPost"),
        (Ty::HIBERNATE_TIMEOUT, "HibernateTimeout"),
        (Ty::NOTIFY_EXPECTED_PRESENT_CONFIG, "NotifyExpectedPresentConfig"),
        (Ty::MIN_LOCK_TIME_FOR_PEAK_REFRESH_RATE, "MinLockTimeForPeakRefreshRate"),
        (Ty::INSTANT_REFRESH_RATE_CALCULATOR_UPDATE, "InstantRefreshRateCalculatorUpdate"),
        (Ty::PERIOD_REFRESH_RATE_CALCULATOR_UPDATE, "PeriodRefreshRateCalculatorUpdate"),
        (Ty::VIDEO_FRAME_RATE_CALCULATOR_UPDATE, "VideoFrameRateCalculatorUpdate"),
        (Ty::COMBINED_REFRESH_RATE_CALCULATOR_UPDATE, "CombinedRefreshRateCalculatorUpdate"),
        (Ty::AOD_REFRESH_RATE_CALCULATOR_UPDATE, "AodRefreshRateCalculatorUpdate"),
        (Ty::EXIT_IDLE_REFRESH_RATE_CALCULATOR_UPDATE, "ExitIdleRefreshRateCalculatorUpdate"),
        (Ty::STATISTIC_UPDATE, "StatisticUpdate"),
    ]
};

/// What the consumer of an event acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPayload {
    None,
    /// Timer owned by one calculator instance.
    Calculator(CalculatorId),
    /// Command sent to the panel when a vendor rendering timeout step fires.
    Panel(PanelCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VrrControllerEvent {
    pub event_type: VrrControllerEventType,
    /// Absolute deadline on the monotonic clock.
    pub when_ns: i64,
    pub payload: EventPayload,
}

impl VrrControllerEvent {
    pub fn new(event_type: VrrControllerEventType, when_ns: i64) -> Self {
        Self {
            event_type,
            when_ns,
            payload: EventPayload::None,
        }
    }

    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn calculator(&self) -> Option<CalculatorId> {
        match self.payload {
            EventPayload::Calculator(id) => Some(id),
            _ => None,
        }
    }
}

/// Heap entry. Earlier deadlines pop first; ties pop in posting order.
#[derive(Debug, Clone)]
struct QueuedEvent {
    event: VrrControllerEvent,
    seq: u64,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap, so invert.
        other
            .event
            .when_ns
            .cmp(&self.event.when_ns)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
pub struct EventQueue {
    clock: Clock,
    queue: BinaryHeap<QueuedEvent>,
    next_seq: u64,
}

impl EventQueue {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            queue: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn now_ns(&self) -> i64 {
        self.clock.now_ns()
    }

    pub fn post(&mut self, event: VrrControllerEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(QueuedEvent { event, seq });
    }

    /// Posts an event at an absolute deadline.
    pub fn post_event(
        &mut self,
        event_type: VrrControllerEventType,
        payload: EventPayload,
        when_ns: i64,
    ) {
        self.post(VrrControllerEvent::new(event_type, when_ns).with_payload(payload));
    }

    /// Posts an event `delay_ns` from now.
    ///
    /// The deadline is fixed here, not when the event is popped, so a late dispatch never
    /// reorders the queue.
    pub fn post_event_in(
        &mut self,
        event_type: VrrControllerEventType,
        payload: EventPayload,
        delay_ns: i64,
    ) {
        let when_ns = self.clock.now_ns().saturating_add(delay_ns);
        self.post_event(event_type, payload, when_ns);
    }

    /// Drops every pending event.
    pub fn drop_event(&mut self) {
        self.queue = BinaryHeap::new();
    }

    /// Drops every event whose type matches `mask`.
    pub fn drop_event_mask(&mut self, mask: VrrControllerEventType) {
        self.queue.retain(|e| !e.event.event_type.matches(mask));
    }

    pub fn drop_events_where(&mut self, mut pred: impl FnMut(&VrrControllerEvent) -> bool) {
        self.queue.retain(|e| !pred(&e.event));
    }

    /// Drops the timers owned by one calculator.
    pub fn drop_calculator_events(&mut self, id: CalculatorId) {
        self.drop_events_where(|event| event.calculator() == Some(id));
    }

    pub fn number_of_events(&self, mask: VrrControllerEventType) -> usize {
        self.queue
            .iter()
            .filter(|e| e.event.event_type.matches(mask))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn next_event_time(&self) -> Option<i64> {
        self.queue.peek().map(|e| e.event.when_ns)
    }

    /// Pops the earliest event if its deadline has passed.
    pub fn pop_due(&mut self, now_ns: i64) -> Option<VrrControllerEvent> {
        if self.next_event_time()? > now_ns {
            return None;
        }
        self.queue.pop().map(|e| e.event)
    }

    /// Returns pending events in dispatch order.
    pub fn events(&self) -> Vec<VrrControllerEvent> {
        self.queue
            .clone()
            .into_sorted_vec()
            .into_iter()
            .rev()
            .map(|e| e.event)
            .collect()
    }

    pub fn dump(&self, out: &mut String) {
        let now = self.clock.now_ns();
        if self.queue.is_empty() {
            let _ = writeln!(out, "event queue: empty");
            return;
        }

        let _ = writeln!(out, "event queue: {} pending", self.queue.len());
        for event in self.events() {
            let in_ms = (event.when_ns - now) as f64 / NANOS_PER_MILLI as f64;
            let _ = writeln!(
                out,
                "  {} at {} ({in_ms:+.3} ms)",
                event.event_type.name(),
                event.when_ns,
            );
        }
    }
}
