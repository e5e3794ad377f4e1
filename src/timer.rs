//! Deferred per-connection actions
//!
//! Cases arm close, kill and continuation timers relative to "now". The
//! queue is owned by the connection actor; the actor asks for the next
//! deadline, sleeps until it, then pops due actions one at a time. Each pop
//! re-checks the connection state, so an action whose connection is already
//! gone becomes a no-op instead of acting on a dead socket.

use std::time::Duration;

use tokio::time::Instant;

use crate::connection::ConnState;
use crate::trace::{WireEvent, WireTrace};

/// What a timer does when it fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledAction {
    /// Start the closing handshake
    Close,
    /// Fail the connection
    Kill,
    /// Resume the case at the step named by the tag
    Continue(String),
}

impl ScheduledAction {
    fn fired_event(&self) -> WireEvent {
        match self {
            ScheduledAction::Close => WireEvent::CloseFired,
            ScheduledAction::Kill => WireEvent::KillFired,
            ScheduledAction::Continue(tag) => WireEvent::TimerFired { tag: tag.clone() },
        }
    }
}

#[derive(Debug)]
struct Pending {
    due: Instant,
    seq: u64,
    action: ScheduledAction,
}

/// Ordered set of pending actions for one connection
#[derive(Debug, Default)]
pub struct ScheduledActionQueue {
    pending: Vec<Pending>,
    next_seq: u64,
}

/// Convert a delay in seconds, treating negative and NaN as zero
pub fn delay(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::ZERO)
}

impl ScheduledActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, now: Instant, secs: f64, action: ScheduledAction) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(Pending {
            due: now + delay(secs),
            seq,
            action,
        });
    }

    /// Start the closing handshake after `secs`
    pub fn close_after(&mut self, now: Instant, secs: f64, trace: &mut WireTrace) {
        trace.log_timer(WireEvent::CloseArmed { delay_sec: secs });
        self.push(now, secs, ScheduledAction::Close);
    }

    /// Fail the connection after `secs`
    pub fn kill_after(&mut self, now: Instant, secs: f64, trace: &mut WireTrace) {
        trace.log_timer(WireEvent::KillArmed { delay_sec: secs });
        self.push(now, secs, ScheduledAction::Kill);
    }

    /// Resume the case with `tag` after `secs`
    pub fn continue_after(
        &mut self,
        now: Instant,
        secs: f64,
        tag: impl Into<String>,
        trace: &mut WireTrace,
    ) {
        let tag = tag.into();
        trace.log_timer(WireEvent::TimerArmed {
            delay_sec: secs,
            tag: tag.clone(),
        });
        self.push(now, secs, ScheduledAction::Continue(tag));
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|p| p.due).min()
    }

    /// Pop the earliest action due at `now`
    ///
    /// Actions due on a closed connection are discarded. Actions that do
    /// fire get a matching `*Fired` event in the trace.
    pub fn pop_due(
        &mut self,
        now: Instant,
        state: ConnState,
        trace: &mut WireTrace,
    ) -> Option<ScheduledAction> {
        loop {
            let idx = self
                .pending
                .iter()
                .enumerate()
                .filter(|(_, p)| p.due <= now)
                .min_by_key(|(_, p)| (p.due, p.seq))
                .map(|(i, _)| i)?;
            let entry = self.pending.swap_remove(idx);

            if state == ConnState::Closed {
                tracing::debug!(action = ?entry.action, "connection already gone, timer skipped");
                continue;
            }
            trace.log_timer(entry.action.fired_event());
            return Some(entry.action);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop everything still pending
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
