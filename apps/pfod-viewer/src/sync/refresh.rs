use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

/// Conditions that must all hold before the refresh timer may be armed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshGate {
    pub updates_enabled: bool,
    pub interval_ms: u64,
    pub gesture_active: bool,
    pub queue_empty: bool,
    pub in_flight: bool,
    pub overlay_open: bool,
    pub displaying_drawing: bool,
}

impl RefreshGate {
    /// First condition preventing a refresh, if any.
    pub fn blocker(&self) -> Option<&'static str> {
        if self.interval_ms == 0 {
            Some("refresh disabled")
        } else if !self.updates_enabled {
            Some("updates paused")
        } else if self.gesture_active {
            Some("pointer down")
        } else if !self.queue_empty {
            Some("queue not empty")
        } else if self.in_flight {
            Some("request in flight")
        } else if self.overlay_open {
            Some("input overlay open")
        } else if !self.displaying_drawing {
            Some("no drawing displayed")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDecision {
    Armed(Duration),
    Skipped(&'static str),
}

/// One-shot timer for the root drawing's refresh interval. The driver sleeps
/// until `deadline` and then calls `take_due`.
#[derive(Debug, Default)]
pub struct RefreshScheduler {
    deadline: Option<Instant>,
}

impl RefreshScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels any pending timer and re-arms it if the gate allows.
    pub fn schedule(&mut self, gate: &RefreshGate, now: Instant) -> ScheduleDecision {
        self.deadline = None;
        match gate.blocker() {
            Some(reason) => {
                trace!(target: "pfod::refresh", reason, "refresh not scheduled");
                ScheduleDecision::Skipped(reason)
            }
            None => ScheduleDecision::Armed(self.arm(gate.interval_ms, now)),
        }
    }

    /// Arms unconditionally; used when the interval itself changed.
    pub fn arm(&mut self, interval_ms: u64, now: Instant) -> Duration {
        let interval = Duration::from_millis(interval_ms);
        self.deadline = Some(now + interval);
        debug!(target: "pfod::refresh", interval_ms, "refresh armed");
        interval
    }

    pub fn cancel(&mut self) {
        if self.deadline.take().is_some() {
            debug!(target: "pfod::refresh", "refresh cancelled");
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Consumes the timer if it has expired.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
