//! Owned registry of the links belonging to one session.
//!
//! Links are indexed by [`LinkId`]. Only the session coordinator mutates the
//! registry, by applying the reports each link's monitor sends it; everyone
//! else reads snapshots.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::Duration;

use crate::health::{HealthSnapshot, LinkState, MonitorReport, Transition};
use crate::scheduler::{Candidate, LinkId};
use crate::transport::TransportPath;

/// One WAN path of a session
#[derive(Debug, Clone)]
pub struct Link {
    pub id: LinkId,
    pub name: String,
    pub path: TransportPath,
    pub health: HealthSnapshot,
}

impl Link {
    pub fn state(&self) -> LinkState {
        self.health.state
    }
}

/// Operator-facing view of one link
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSnapshot {
    pub id: LinkId,
    pub name: String,
    pub state: LinkState,
    pub rtt: Option<Duration>,
    pub loss_percent: f64,
    pub probes_sent: u64,
    pub probes_acked: u64,
    pub remote: SocketAddr,
}

#[derive(Debug, Default)]
pub struct LinkRegistry {
    links: BTreeMap<LinkId, Link>,
    by_peer: HashMap<SocketAddr, LinkId>,
    next_id: LinkId,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a link in state Unknown and return its id
    pub fn insert(&mut self, name: impl Into<String>, path: TransportPath) -> LinkId {
        let id = self.next_id;
        self.next_id += 1;
        self.by_peer.insert(path.peer_addr(), id);
        self.links.insert(
            id,
            Link {
                id,
                name: name.into(),
                path,
                health: HealthSnapshot::default(),
            },
        );
        id
    }

    pub fn get(&self, id: LinkId) -> Option<&Link> {
        self.links.get(&id)
    }

    /// Forget a link; its remote address can be learned again later.
    pub fn remove(&mut self, id: LinkId) -> Option<Link> {
        let link = self.links.remove(&id)?;
        self.by_peer.remove(&link.path.peer_addr());
        Some(link)
    }

    /// Link whose remote end is `peer`
    pub fn find_by_peer(&self, peer: SocketAddr) -> Option<LinkId> {
        self.by_peer.get(&peer).copied()
    }

    /// Store a monitor's latest view; returns the transition it carried.
    pub fn apply_report(&mut self, report: &MonitorReport) -> Option<Transition> {
        let link = self.links.get_mut(&report.link)?;
        link.health = report.snapshot;
        report.transition
    }

    pub fn candidates(&self) -> Vec<Candidate> {
        self.links
            .values()
            .map(|link| Candidate {
                id: link.id,
                state: link.health.state,
                rtt: link.health.rtt,
            })
            .collect()
    }

    pub fn any_up(&self) -> bool {
        self.links.values().any(|link| link.state() == LinkState::Up)
    }

    pub fn snapshots(&self) -> Vec<LinkSnapshot> {
        self.links
            .values()
            .map(|link| LinkSnapshot {
                id: link.id,
                name: link.name.clone(),
                state: link.health.state,
                rtt: link.health.rtt,
                loss_percent: link.health.loss_percent(),
                probes_sent: link.health.probes_sent,
                probes_acked: link.health.probes_acked,
                remote: link.path.peer_addr(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Render link health as a small fixed-width table for periodic logging.
pub fn format_link_table(links: &[LinkSnapshot]) -> String {
    if links.is_empty() {
        return "no links".to_string();
    }
    let mut out = format!(
        "{:<12} {:<8} {:>9} {:>7} {}",
        "LINK", "STATE", "RTT", "LOSS", "REMOTE"
    );
    for link in links {
        let rtt = link
            .rtt
            .map(|rtt| format!("{:.1}ms", rtt.as_secs_f64() * 1000.0))
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "\n{:<12} {:<8} {:>9} {:>6.1}% {}",
            link.name,
            link.state.to_string(),
            rtt,
            link.loss_percent,
            link.remote
        ));
    }
    out
}
