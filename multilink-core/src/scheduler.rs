//! Link selection for outgoing data packets.
//!
//! The scheduler picks exactly one link in state Up for every packet. It is
//! pure and deterministic for testability: it never looks at a link's state
//! except through the candidates it is handed, and it re-evaluates on every
//! call, so a link that drops to Down stops receiving traffic immediately.
//!
//! Supported modes:
//!
//! - **ROUND_ROBIN**: rotate over the Up links (default)
//! - **LOWEST_RTT**: always the Up link with the smallest smoothed RTT
//!
//! When no link is Up, [`DownPolicy`] decides whether packets are dropped or
//! held in a bounded [`PendingQueue`] until a link recovers.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::health::LinkState;

/// Link identifier, stable for the lifetime of a session
pub type LinkId = usize;

/// Scheduling mode configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    /// Rotate across every Up link
    #[default]
    RoundRobin,
    /// Prefer the Up link with the lowest smoothed RTT
    LowestRtt,
}

/// What happens to outgoing packets while every link is Down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum DownPolicy {
    /// Report `NoHealthyLink` to the caller and discard the packet
    #[default]
    Drop,
    /// Hold up to `capacity` packets for at most `max_wait`
    Queue {
        capacity: usize,
        #[serde(with = "humantime_serde")]
        max_wait: Duration,
    },
}

/// Scheduler errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("no healthy link")]
    NoHealthyLink,
}

/// A link as seen by the scheduler at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub id: LinkId,
    pub state: LinkState,
    /// Smoothed RTT, if any probe has been acknowledged yet
    pub rtt: Option<Duration>,
}

/// Packet scheduler
#[derive(Debug)]
pub struct Scheduler {
    /// Scheduling mode
    mode: SchedulerMode,
    /// Link chosen by the previous round-robin decision
    last: Option<LinkId>,
}

impl Scheduler {
    /// Create a new scheduler with the specified mode
    pub fn new(mode: SchedulerMode) -> Self {
        Self { mode, last: None }
    }

    /// Get the current scheduling mode
    pub fn mode(&self) -> SchedulerMode {
        self.mode
    }

    /// Choose the link for the next packet.
    ///
    /// Only candidates in state Up qualify; `candidates` need not be sorted.
    pub fn select(&mut self, candidates: &[Candidate]) -> Result<LinkId, ScheduleError> {
        let up = candidates.iter().filter(|c| c.state == LinkState::Up);

        let chosen = match self.mode {
            SchedulerMode::RoundRobin => {
                let mut first: Option<LinkId> = None;
                let mut next: Option<LinkId> = None;
                for c in up {
                    first = Some(first.map_or(c.id, |f| f.min(c.id)));
                    if self.last.map_or(true, |last| c.id > last) {
                        next = Some(next.map_or(c.id, |n| n.min(c.id)));
                    }
                }
                next.or(first)
            }
            SchedulerMode::LowestRtt => up
                .min_by_key(|c| (c.rtt.unwrap_or(Duration::MAX), c.id))
                .map(|c| c.id),
        };

        let id = chosen.ok_or(ScheduleError::NoHealthyLink)?;
        self.last = Some(id);
        Ok(id)
    }
}

/// Outcome of pushing onto the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Stored,
    /// Stored after discarding the oldest entry
    DisplacedOldest,
}

/// Bounded FIFO for packets submitted while every link is Down.
#[derive(Debug)]
pub struct PendingQueue {
    entries: VecDeque<(Instant, Vec<u8>)>,
    capacity: usize,
    max_wait: Duration,
    dropped: u64,
}

impl PendingQueue {
    pub fn new(capacity: usize, max_wait: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            max_wait,
            dropped: 0,
        }
    }

    /// Build the queue for a policy, if it asks for one
    pub fn for_policy(policy: DownPolicy) -> Option<Self> {
        match policy {
            DownPolicy::Drop => None,
            DownPolicy::Queue { capacity, max_wait } => Some(Self::new(capacity, max_wait)),
        }
    }

    /// Append a packet. A full queue drops its oldest entry.
    pub fn push(&mut self, now: Instant, packet: Vec<u8>) -> Enqueued {
        let mut outcome = Enqueued::Stored;
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
            outcome = Enqueued::DisplacedOldest;
        }
        self.entries.push_back((now, packet));
        outcome
    }

    /// Take the oldest packet that has not outlived `max_wait`
    pub fn pop_ready(&mut self, now: Instant) -> Option<Vec<u8>> {
        self.expire(now);
        self.entries.pop_front().map(|(_, packet)| packet)
    }

    /// Drop entries older than `max_wait`; returns how many were dropped
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        while let Some((queued_at, _)) = self.entries.front() {
            if now.saturating_duration_since(*queued_at) <= self.max_wait {
                break;
            }
            self.entries.pop_front();
            expired += 1;
        }
        self.dropped += expired as u64;
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Packets lost to overflow or age
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
