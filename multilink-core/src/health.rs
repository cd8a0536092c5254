//! Per-link liveness tracking.
//!
//! Every link runs its own state machine over {Unknown, Up, Down}:
//!
//! - Unknown → Up: first probe ack
//! - Unknown → Down, Up → Down: `failure_threshold` consecutive probe failures
//! - Down → Up: a single probe ack
//!
//! Recovery is deliberately asymmetric. A single lost probe never flaps a
//! link, but a single answered probe makes it usable again.
//!
//! The client drives [`run_active_monitor`], which sends one probe per
//! interval and waits a bounded time for the matching ack. The server never
//! originates probes; [`run_passive_monitor`] counts each probe the client
//! sends on a path as a success and each silent window as a failure.

use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::HealthConfig;
use crate::scheduler::LinkId;

/// EWMA weight given to a new RTT sample
const RTT_ALPHA: f64 = 0.125;

/// Width of the probe-token replay window
const PROBE_WINDOW_BITS: u64 = 64;

/// Health state of one link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LinkState {
    #[default]
    Unknown,
    Up,
    Down,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Unknown => "unknown",
            LinkState::Up => "up",
            LinkState::Down => "down",
        };
        f.write_str(name)
    }
}

/// A state change produced by one probe outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: LinkState,
    pub to: LinkState,
}

/// Point-in-time view of one link's health
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthSnapshot {
    pub state: LinkState,
    /// Smoothed round-trip time; `None` until a timed ack arrives
    pub rtt: Option<Duration>,
    pub probes_sent: u64,
    pub probes_acked: u64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_probe: Option<Instant>,
    pub probe_outstanding: bool,
}

impl HealthSnapshot {
    /// Percentage of probes that went unanswered
    pub fn loss_percent(&self) -> f64 {
        if self.probes_sent == 0 {
            return 0.0;
        }
        let lost = self.probes_sent.saturating_sub(self.probes_acked);
        lost as f64 * 100.0 / self.probes_sent as f64
    }
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        LinkHealth::new(1).snapshot()
    }
}

/// Health counters and state machine for one link.
///
/// Mutated only by the link's own monitor task.
#[derive(Debug, Clone)]
pub struct LinkHealth {
    state: LinkState,
    failure_threshold: u32,
    consecutive_successes: u32,
    consecutive_failures: u32,
    probes_sent: u64,
    probes_acked: u64,
    rtt: Option<Duration>,
    last_probe: Option<Instant>,
    probe_outstanding: bool,
}

impl LinkHealth {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            state: LinkState::Unknown,
            failure_threshold: failure_threshold.max(1),
            consecutive_successes: 0,
            consecutive_failures: 0,
            probes_sent: 0,
            probes_acked: 0,
            rtt: None,
            last_probe: None,
            probe_outstanding: false,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn on_probe_sent(&mut self, now: Instant) {
        self.probes_sent += 1;
        self.last_probe = Some(now);
        self.probe_outstanding = true;
    }

    /// Record an ack received within the wait bound.
    pub fn on_probe_ack(&mut self, rtt: Option<Duration>) -> Option<Transition> {
        self.probes_acked += 1;
        self.probe_outstanding = false;
        self.consecutive_failures = 0;
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);

        if let Some(sample) = rtt {
            self.rtt = Some(match self.rtt {
                None => sample,
                Some(old) => old.mul_f64(1.0 - RTT_ALPHA) + sample.mul_f64(RTT_ALPHA),
            });
        }

        self.transition_to(LinkState::Up)
    }

    /// Record a probe whose wait bound expired.
    pub fn on_probe_timeout(&mut self) -> Option<Transition> {
        self.probe_outstanding = false;
        self.consecutive_successes = 0;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.consecutive_failures >= self.failure_threshold {
            self.transition_to(LinkState::Down)
        } else {
            None
        }
    }

    fn transition_to(&mut self, to: LinkState) -> Option<Transition> {
        if self.state == to {
            return None;
        }
        let from = self.state;
        self.state = to;
        Some(Transition { from, to })
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            state: self.state,
            rtt: self.rtt,
            probes_sent: self.probes_sent,
            probes_acked: self.probes_acked,
            consecutive_successes: self.consecutive_successes,
            consecutive_failures: self.consecutive_failures,
            last_probe: self.last_probe,
            probe_outstanding: self.probe_outstanding,
        }
    }
}

/// Sliding window over probe tokens, so each token is answered at most once.
#[derive(Debug, Default)]
pub struct ProbeReplayWindow {
    highest: Option<u64>,
    /// Bit `i` set means token `highest - i` was seen
    seen: u64,
}

impl ProbeReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time a token is offered, `false` afterwards
    /// or when it falls behind the window.
    pub fn check_and_mark(&mut self, token: u64) -> bool {
        let Some(highest) = self.highest else {
            self.highest = Some(token);
            self.seen = 1;
            return true;
        };

        if token > highest {
            let shift = token - highest;
            self.seen = if shift >= PROBE_WINDOW_BITS {
                0
            } else {
                self.seen << shift
            };
            self.seen |= 1;
            self.highest = Some(token);
            return true;
        }

        let offset = highest - token;
        if offset >= PROBE_WINDOW_BITS {
            return false;
        }
        let bit = 1u64 << offset;
        if self.seen & bit != 0 {
            return false;
        }
        self.seen |= bit;
        true
    }
}

/// Sends one probe on a link and returns its correlation token.
pub trait ProbeTransmit: Send + Sync + 'static {
    fn send_probe(&self) -> impl Future<Output = io::Result<u64>> + Send;
}

/// Outcome of one probe round, sent to the session coordinator.
#[derive(Debug, Clone, Copy)]
pub struct MonitorReport {
    pub link: LinkId,
    pub snapshot: HealthSnapshot,
    pub transition: Option<Transition>,
}

enum Wait {
    Acked,
    TimedOut,
    Stopped,
}

async fn wait_for_ack(
    token: u64,
    acks: &mut mpsc::Receiver<u64>,
    timeout: Duration,
    stop: &mut watch::Receiver<bool>,
) -> Wait {
    let deadline = time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => return Wait::Stopped,
            _ = &mut deadline => return Wait::TimedOut,
            ack = acks.recv() => match ack {
                Some(t) if t == token => return Wait::Acked,
                // Late ack for an earlier probe
                Some(_) => continue,
                None => return Wait::Stopped,
            },
        }
    }
}

/// Hand a report to the coordinator; false once the session is stopping.
async fn publish(
    reports: &mpsc::Sender<MonitorReport>,
    report: MonitorReport,
    stop: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        sent = reports.send(report) => sent.is_ok(),
        _ = stop.changed() => false,
    }
}

/// Probe loop for one client link.
///
/// `acks` carries the tokens of authenticated ProbeAcks received on this link.
pub async fn run_active_monitor<P: ProbeTransmit>(
    link: LinkId,
    config: HealthConfig,
    prober: P,
    mut acks: mpsc::Receiver<u64>,
    reports: mpsc::Sender<MonitorReport>,
    mut stop: watch::Receiver<bool>,
) {
    let mut health = LinkHealth::new(config.failure_threshold);
    let mut ticker = time::interval(config.probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }

        while acks.try_recv().is_ok() {}

        let sent_at = Instant::now();
        let wait = match prober.send_probe().await {
            Ok(token) => {
                health.on_probe_sent(sent_at);
                wait_for_ack(token, &mut acks, config.probe_timeout, &mut stop).await
            }
            Err(e) => {
                tracing::debug!(link, error = %e, "probe send failed");
                health.on_probe_sent(sent_at);
                Wait::TimedOut
            }
        };

        let transition = match wait {
            Wait::Acked => health.on_probe_ack(Some(sent_at.elapsed())),
            Wait::TimedOut => health.on_probe_timeout(),
            Wait::Stopped => break,
        };

        let report = MonitorReport {
            link,
            snapshot: health.snapshot(),
            transition,
        };
        if !publish(&reports, report, &mut stop).await {
            break;
        }
    }
}

/// Health loop for one server-side path.
///
/// `probes` yields the token of each authenticated probe seen on this path.
/// A window of `probe_interval + probe_timeout` without one counts as a
/// failure.
pub async fn run_passive_monitor(
    link: LinkId,
    config: HealthConfig,
    mut probes: mpsc::Receiver<u64>,
    reports: mpsc::Sender<MonitorReport>,
    mut stop: watch::Receiver<bool>,
) {
    let mut health = LinkHealth::new(config.failure_threshold);
    let window = config.probe_interval + config.probe_timeout;

    loop {
        if *stop.borrow() {
            break;
        }

        let started = Instant::now();
        let seen = tokio::select! {
            _ = stop.changed() => break,
            seen = time::timeout(window, probes.recv()) => seen,
        };

        let transition = match seen {
            Ok(Some(_token)) => {
                health.on_probe_sent(started);
                health.on_probe_ack(None)
            }
            Ok(None) => break,
            Err(_) => {
                health.on_probe_sent(started);
                health.on_probe_timeout()
            }
        };

        let report = MonitorReport {
            link,
            snapshot: health.snapshot(),
            transition,
        };
        if !publish(&reports, report, &mut stop).await {
            break;
        }
    }
}
