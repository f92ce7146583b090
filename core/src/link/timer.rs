//! One-shot deadline queue
//!
//! Every timer the link manager arms lands here, keyed by a stable
//! [`TimerKey`]. Arming an already-armed key replaces its deadline, so each
//! link owns at most one link timer at a time. Payloads reference pool slots
//! through [`LinkId`] / [`ChannelId`] and are re-validated on expiry.

use crate::channel::ChannelId;
use crate::link::types::LinkId;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// What a timer is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// The per-link timer: connect / idle / echo / disconnect / flow control
    Link(LinkId),
    /// Waiting for the peer's information response
    InfoResponse(LinkId),
    /// Security delay-check grace period on a channel
    ChannelDelay(ChannelId),
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    deadlines: BTreeMap<(Instant, u64), TimerKey>,
    armed: HashMap<TimerKey, (Instant, u64)>,
    seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) `key` to fire `after` from now
    pub fn arm(&mut self, key: TimerKey, after: Duration) {
        self.arm_at(key, Instant::now() + after);
    }

    pub fn arm_at(&mut self, key: TimerKey, deadline: Instant) {
        self.cancel(key);
        self.seq = self.seq.wrapping_add(1);
        let entry = (deadline, self.seq);
        self.deadlines.insert(entry, key);
        self.armed.insert(key, entry);
    }

    /// Cancel `key`; returns whether it was armed
    pub fn cancel(&mut self, key: TimerKey) -> bool {
        match self.armed.remove(&key) {
            Some(entry) => {
                self.deadlines.remove(&entry);
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, key: TimerKey) -> bool {
        self.armed.contains_key(&key)
    }

    pub fn deadline(&self, key: TimerKey) -> Option<Instant> {
        self.armed.get(&key).map(|(deadline, _)| *deadline)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Pop the earliest timer whose deadline is at or before `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerKey> {
        let (&entry, &key) = self.deadlines.iter().next()?;
        if entry.0 > now {
            return None;
        }
        self.deadlines.remove(&entry);
        self.armed.remove(&key);
        Some(key)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}
