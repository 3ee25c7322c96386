//! Per-agent timers
//!
//! Timers are deadlines owned by the agent's worker, not spawned tasks. The
//! worker sleeps until [`TimerCoordinator::next_deadline`] and then calls
//! [`TimerCoordinator::take_due`], which removes a timer before handing it
//! out. A fired timer can therefore be re-armed from its own handler, and a
//! cancelled one can never fire late.

use crate::event::ActivityEvent;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// The two timeouts an agent can have pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Text-only output, promotes the agent to `waiting`
    Idle,
    /// Non-exempt tool open for too long
    Permission,
}

/// At most one pending deadline per [`TimerKind`].
#[derive(Debug, Default)]
pub struct TimerCoordinator {
    pending: HashMap<TimerKind, Instant>,
}

impl TimerCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any pending timer of `kind` and arm a new one `delay` from now.
    pub fn start(&mut self, kind: TimerKind, delay: Duration) {
        self.start_at(kind, Instant::now() + delay);
    }

    pub fn start_at(&mut self, kind: TimerKind, deadline: Instant) {
        self.pending.insert(kind, deadline);
    }

    /// Idempotent.
    pub fn cancel(&mut self, kind: TimerKind) {
        self.pending.remove(&kind);
    }

    pub fn cancel_all(&mut self) {
        self.pending.clear();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Remove and return every timer due at `now`, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due: Vec<(Instant, TimerKind)> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(kind, deadline)| (*deadline, *kind))
            .collect();
        due.sort_by_key(|(deadline, _)| *deadline);
        for (_, kind) in &due {
            self.pending.remove(kind);
        }
        due.into_iter().map(|(_, kind)| kind).collect()
    }
}

/// Events held back for a short delay (e.g. "tool done", so the UI can animate).
///
/// All entries share one fixed delay, so insertion order is deadline order.
#[derive(Debug, Default)]
pub struct DeferredEvents {
    queue: VecDeque<(Instant, ActivityEvent)>,
}

impl DeferredEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delay: Duration, event: ActivityEvent) {
        self.push_at(Instant::now() + delay, event);
    }

    pub fn push_at(&mut self, deadline: Instant, event: ActivityEvent) {
        // Keep the queue sorted even if a caller mixes delays.
        let pos = self
            .queue
            .iter()
            .rposition(|(d, _)| *d <= deadline)
            .map_or(0, |p| p + 1);
        self.queue.insert(pos, (deadline, event));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.front().map(|(d, _)| *d)
    }

    pub fn take_due(&mut self, now: Instant) -> Vec<ActivityEvent> {
        let mut out = Vec::new();
        while self.queue.front().is_some_and(|(d, _)| *d <= now) {
            if let Some((_, event)) = self.queue.pop_front() {
                out.push(event);
            }
        }
        out
    }

}
