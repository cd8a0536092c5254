//! One authenticated client/server association and the tasks that drive it.
//!
//! A [`Session`] owns the codec, the link registry, the scheduler and the
//! reassembler. Work is split across tokio tasks:
//!
//! - one health monitor per link (active on the client, passive on the server)
//! - one receive loop per link socket (client only; the server dispatcher
//!   feeds [`Session::ingest`] from its single socket)
//! - one coordinator that owns the [`Reassembler`], applies monitor reports to
//!   the registry, flushes the all-links-down queue and expires the session
//!
//! Every task watches the session's stop signal, so none outlives it.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::codec::{Codec, CodecError, Opened, Role};
use crate::config::SessionConfig;
use crate::handshake::Established;
use crate::health::{
    self, LinkState, MonitorReport, ProbeReplayWindow, ProbeTransmit, Transition,
};
use crate::link::{LinkRegistry, LinkSnapshot};
use crate::proto::{PacketType, MAX_DATAGRAM_SIZE};
use crate::reorder::{ReassemblerStats, Reassembler};
use crate::scheduler::{LinkId, PendingQueue, ScheduleError, Scheduler};
use crate::transport::TransportPath;

const DELIVERY_QUEUE: usize = 1024;
const INBOUND_QUEUE: usize = 1024;
const REPORT_QUEUE: usize = 64;
const PROBE_ROUTE_QUEUE: usize = 16;
const EVENT_QUEUE: usize = 64;

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no healthy link")]
    NoHealthyLink,

    #[error("sequence space exhausted; session must be re-established")]
    SequenceExhausted,

    #[error("session closed")]
    Closed,

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<ScheduleError> for SessionError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::NoHealthyLink => SessionError::NoHealthyLink,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Shutdown,
    SequenceExhausted,
    /// No link was Up for the configured idle timeout
    Idle,
}

/// Events published for operational tooling
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LinkAdded {
        link: LinkId,
        name: String,
        remote: SocketAddr,
    },
    /// A learned server path went Down and was forgotten
    LinkRemoved {
        link: LinkId,
        name: String,
        remote: SocketAddr,
    },
    LinkStateChanged {
        link: LinkId,
        name: String,
        from: LinkState,
        to: LinkState,
    },
    AllLinksDown,
    Terminated {
        reason: TerminationReason,
    },
}

/// Result of a successful `submit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Sent { link: LinkId, sequence: u64 },
    /// Held until a link comes back Up
    Queued,
}

/// Monotonic counter shared by every sender of one session direction.
///
/// `u64::MAX` is never handed out; reaching it is exhaustion.
#[derive(Debug)]
pub struct SequenceCounter {
    next: AtomicU64,
}

impl SequenceCounter {
    pub fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    pub fn next(&self) -> Result<u64, SessionError> {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_add(1))
            .map_err(|_| SessionError::SequenceExhausted)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

fn std_now() -> std::time::Instant {
    Instant::now().into_std()
}

struct Shared {
    codec: Codec,
    config: SessionConfig,
    tx_sequence: SequenceCounter,
    probe_tokens: SequenceCounter,
    links: RwLock<LinkRegistry>,
    scheduler: Mutex<Scheduler>,
    pending: Mutex<Option<PendingQueue>>,
    /// Per-link channel into that link's health monitor
    probe_routes: Mutex<HashMap<LinkId, mpsc::Sender<u64>>>,
    probe_replay: Mutex<ProbeReplayWindow>,
    /// Socket used for learned paths (server only)
    reply_socket: Option<Arc<UdpSocket>>,
    inbound: mpsc::Sender<(u64, Vec<u8>)>,
    reports: mpsc::Sender<MonitorReport>,
    events: broadcast::Sender<SessionEvent>,
    stats: Mutex<ReassemblerStats>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop: watch::Sender<bool>,
    terminated: AtomicBool,
}

impl Shared {
    fn role(&self) -> Role {
        self.codec.role()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn terminate(&self, reason: TerminationReason) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(client_id = self.codec.client_id(), ?reason, "session terminated");
        self.emit(SessionEvent::Terminated { reason });
        let _ = self.stop.send(true);
    }

    fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(tokio::spawn(fut));
    }

    /// Seal and send one data packet on the scheduler's choice of link.
    async fn send_data(&self, plaintext: &[u8]) -> Result<(LinkId, u64), SessionError> {
        let (link, path) = {
            let links = read(&self.links);
            let id = lock(&self.scheduler).select(&links.candidates())?;
            let path = links
                .get(id)
                .map(|l| l.path.clone())
                .ok_or(SessionError::NoHealthyLink)?;
            (id, path)
        };

        let sequence = match self.tx_sequence.next() {
            Ok(sequence) => sequence,
            Err(e) => {
                self.terminate(TerminationReason::SequenceExhausted);
                return Err(e);
            }
        };
        let wire = self.codec.encapsulate(PacketType::Data, sequence, plaintext)?;
        path.send(&wire).await?;
        Ok((link, sequence))
    }

    /// Send everything queued while no link was Up.
    async fn flush_pending(&self) {
        loop {
            let packet = match lock(&self.pending).as_mut() {
                Some(queue) => queue.pop_ready(std_now()),
                None => None,
            };
            let Some(packet) = packet else {
                break;
            };
            if let Err(e) = self.send_data(&packet).await {
                tracing::debug!(error = %e, "dropping queued packet");
                if matches!(e, SessionError::SequenceExhausted) {
                    break;
                }
            }
        }
    }

    /// Route one authenticated envelope received on `link`.
    async fn dispatch(&self, link: LinkId, opened: Opened) {
        match (self.role(), opened.packet_type) {
            (_, PacketType::Data) => {
                // Never wait on the coordinator from a receive path
                if self.inbound.try_send((opened.sequence, opened.payload)).is_err() {
                    tracing::debug!(link, "inbound queue full, dropping packet");
                }
            }
            (Role::Server, PacketType::Probe) => {
                let token = opened.sequence;
                if self.fresh_probe(token) {
                    self.ack_probe(link, token).await;
                }
            }
            (Role::Client, PacketType::ProbeAck) => self.route_probe(link, opened.sequence),
            (role, packet_type) => {
                tracing::trace!(link, ?role, %packet_type, "unexpected envelope dropped");
            }
        }
    }

    fn fresh_probe(&self, token: u64) -> bool {
        let fresh = lock(&self.probe_replay).check_and_mark(token);
        if !fresh {
            tracing::trace!(token, "replayed probe dropped");
        }
        fresh
    }

    /// Echo an accepted probe token and credit it to the path's monitor.
    async fn ack_probe(&self, link: LinkId, token: u64) {
        let path = read(&self.links).get(link).map(|l| l.path.clone());
        if let Some(path) = path {
            match self.codec.encapsulate(PacketType::ProbeAck, token, &[]) {
                Ok(ack) => {
                    if let Err(e) = path.send(&ack).await {
                        tracing::debug!(link, error = %e, "probe ack send failed");
                    }
                }
                Err(e) => tracing::debug!(link, error = %e, "probe ack seal failed"),
            }
        }
        self.route_probe(link, token);
    }

    fn route_probe(&self, link: LinkId, token: u64) {
        if let Some(route) = lock(&self.probe_routes).get(&link) {
            let _ = route.try_send(token);
        }
    }

    /// Forget a learned server path. Dropping its route stops the monitor.
    fn retire_path(&self, link: LinkId) {
        if self.reply_socket.is_none() {
            return;
        }
        let removed = write(&self.links).remove(link);
        lock(&self.probe_routes).remove(&link);
        if let Some(removed) = removed {
            let remote = removed.path.peer_addr();
            tracing::info!(client_id = self.codec.client_id(), %remote, "retired path");
            self.emit(SessionEvent::LinkRemoved {
                link,
                name: removed.name,
                remote,
            });
        }
    }

    /// Apply one monitor report; returns the transition it carried.
    fn apply_report(&self, report: &MonitorReport) -> Option<Transition> {
        let transition = write(&self.links).apply_report(report)?;
        let name = read(&self.links)
            .get(report.link)
            .map(|l| l.name.clone())
            .unwrap_or_default();

        match transition.to {
            LinkState::Up => tracing::info!(link = %name, from = %transition.from, "link up"),
            LinkState::Down => tracing::warn!(link = %name, from = %transition.from, "link down"),
            LinkState::Unknown => {}
        }
        self.emit(SessionEvent::LinkStateChanged {
            link: report.link,
            name,
            from: transition.from,
            to: transition.to,
        });
        Some(transition)
    }
}

/// Probes one client link through the session codec.
struct LinkProber {
    shared: Arc<Shared>,
    path: TransportPath,
}

impl ProbeTransmit for LinkProber {
    async fn send_probe(&self) -> io::Result<u64> {
        let token = self.shared.probe_tokens.next().map_err(io::Error::other)?;
        let wire = self
            .shared
            .codec
            .encapsulate(PacketType::Probe, token, &[])
            .map_err(io::Error::other)?;
        self.path.send(&wire).await?;
        Ok(token)
    }
}

/// A running session.
pub struct Session {
    shared: Arc<Shared>,
    delivered: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl Session {
    fn build(
        established: Established,
        config: SessionConfig,
        reply_socket: Option<Arc<UdpSocket>>,
    ) -> (Self, mpsc::Receiver<(u64, Vec<u8>)>, mpsc::Receiver<MonitorReport>, mpsc::Sender<Vec<u8>>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (report_tx, report_rx) = mpsc::channel(REPORT_QUEUE);
        let (delivered_tx, delivered_rx) = mpsc::channel(DELIVERY_QUEUE);
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        let (stop, _) = watch::channel(false);

        let initial = established.params.initial_sequence;
        let shared = Arc::new(Shared {
            codec: established.codec,
            tx_sequence: SequenceCounter::new(initial),
            probe_tokens: SequenceCounter::new(1),
            links: RwLock::new(LinkRegistry::new()),
            scheduler: Mutex::new(Scheduler::new(config.scheduler.mode)),
            pending: Mutex::new(PendingQueue::for_policy(config.scheduler.all_links_down)),
            probe_routes: Mutex::new(HashMap::new()),
            probe_replay: Mutex::new(ProbeReplayWindow::new()),
            reply_socket,
            inbound: inbound_tx,
            reports: report_tx,
            events,
            stats: Mutex::new(ReassemblerStats::default()),
            tasks: Mutex::new(Vec::new()),
            stop,
            terminated: AtomicBool::new(false),
            config,
        });

        let session = Self {
            shared,
            delivered: tokio::sync::Mutex::new(delivered_rx),
        };
        (session, inbound_rx, report_rx, delivered_tx)
    }

    fn start_coordinator(
        &self,
        initial_sequence: u64,
        inbound: mpsc::Receiver<(u64, Vec<u8>)>,
        reports: mpsc::Receiver<MonitorReport>,
        delivered: mpsc::Sender<Vec<u8>>,
    ) {
        let shared = self.shared.clone();
        self.shared.spawn(run_coordinator(
            shared,
            initial_sequence,
            inbound,
            reports,
            delivered,
        ));
    }

    /// Start a client session over one socket per WAN link.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_client(
        established: Established,
        links: Vec<(String, TransportPath)>,
        config: SessionConfig,
    ) -> Self {
        let initial = established.params.initial_sequence;
        let (session, inbound, reports, delivered) = Self::build(established, config, None);
        session.start_coordinator(initial, inbound, reports, delivered);

        for (name, path) in links {
            let id = write(&session.shared.links).insert(name, path.clone());
            let (ack_tx, ack_rx) = mpsc::channel(PROBE_ROUTE_QUEUE);
            lock(&session.shared.probe_routes).insert(id, ack_tx);

            let shared = session.shared.clone();
            session.shared.spawn(run_link_receiver(shared, id, path.clone()));

            let prober = LinkProber {
                shared: session.shared.clone(),
                path,
            };
            session.shared.spawn(health::run_active_monitor(
                id,
                session.shared.config.health.clone(),
                prober,
                ack_rx,
                session.shared.reports.clone(),
                session.shared.stop.subscribe(),
            ));
        }

        session
    }

    /// Start a server session replying through the shared listening socket.
    ///
    /// Paths are learned from fresh probes passed to [`Session::ingest`].
    pub fn spawn_server(
        established: Established,
        socket: Arc<UdpSocket>,
        config: SessionConfig,
    ) -> Self {
        let initial = established.params.initial_sequence;
        let (session, inbound, reports, delivered) =
            Self::build(established, config, Some(socket));
        session.start_coordinator(initial, inbound, reports, delivered);
        session
    }

    pub fn client_id(&self) -> u64 {
        self.shared.codec.client_id()
    }

    pub fn role(&self) -> Role {
        self.shared.role()
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }

    /// Subscribe to link and lifecycle events
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn link_snapshots(&self) -> Vec<LinkSnapshot> {
        read(&self.shared.links).snapshots()
    }

    pub fn reassembly_stats(&self) -> ReassemblerStats {
        *lock(&self.shared.stats)
    }

    /// Send one plaintext packet to the peer.
    pub async fn submit(&self, plaintext: Vec<u8>) -> Result<SubmitOutcome, SessionError> {
        if self.is_terminated() {
            return Err(SessionError::Closed);
        }

        {
            let any_up = read(&self.shared.links).any_up();
            let mut pending = lock(&self.shared.pending);
            if let Some(queue) = pending.as_mut() {
                // Keep FIFO order behind anything already waiting
                if !any_up || !queue.is_empty() {
                    queue.push(std_now(), plaintext);
                    return Ok(SubmitOutcome::Queued);
                }
            }
        }

        let (link, sequence) = self.shared.send_data(&plaintext).await?;
        Ok(SubmitOutcome::Sent { link, sequence })
    }

    /// Next in-order payload from the peer; `None` once the session is gone.
    pub async fn deliver(&self) -> Option<Vec<u8>> {
        self.delivered.lock().await.recv().await
    }

    /// Feed one datagram from the server's shared socket.
    ///
    /// Unauthenticated input is dropped without trace of a response. A new
    /// source address becomes a path only through an authenticated probe
    /// whose token has not been seen before.
    pub async fn ingest(&self, peer: SocketAddr, wire: &[u8]) {
        if self.is_terminated() {
            return;
        }
        let opened = match self.shared.codec.decapsulate(wire) {
            Ok(opened) => opened,
            Err(_) => {
                tracing::trace!(%peer, "dropping unauthenticated datagram");
                return;
            }
        };

        let known = read(&self.shared.links).find_by_peer(peer);
        match known {
            Some(link) => self.shared.dispatch(link, opened).await,
            None => self.learn_path(peer, opened).await,
        }
    }

    async fn learn_path(&self, peer: SocketAddr, opened: Opened) {
        if opened.packet_type != PacketType::Probe {
            tracing::trace!(%peer, packet_type = %opened.packet_type, "no path for sender, dropping");
            return;
        }
        let token = opened.sequence;
        if !self.shared.fresh_probe(token) {
            return;
        }
        if let Some(link) = self.add_path(peer) {
            self.shared.ack_probe(link, token).await;
        }
    }

    fn add_path(&self, peer: SocketAddr) -> Option<LinkId> {
        let socket = self.shared.reply_socket.clone()?;
        let name = format!("path-{}", peer);
        let id = {
            let mut links = write(&self.shared.links);
            if let Some(existing) = links.find_by_peer(peer) {
                return Some(existing);
            }
            if links.len() >= self.shared.config.max_paths {
                tracing::debug!(%peer, limit = self.shared.config.max_paths, "path limit reached");
                return None;
            }
            links.insert(name.clone(), TransportPath::from_socket(socket, peer))
        };

        let (probe_tx, probe_rx) = mpsc::channel(PROBE_ROUTE_QUEUE);
        lock(&self.shared.probe_routes).insert(id, probe_tx);
        self.shared.spawn(health::run_passive_monitor(
            id,
            self.shared.config.health.clone(),
            probe_rx,
            self.shared.reports.clone(),
            self.shared.stop.subscribe(),
        ));

        tracing::info!(client_id = self.client_id(), %peer, "learned new path");
        self.shared.emit(SessionEvent::LinkAdded {
            link: id,
            name,
            remote: peer,
        });
        Some(id)
    }

    /// Stop every task of this session and wait for them to finish.
    pub async fn shutdown(&self) {
        self.shared.terminate(TerminationReason::Shutdown);
        let tasks: Vec<_> = lock(&self.shared.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.terminated.store(true, Ordering::Release);
        let _ = self.shared.stop.send(true);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id())
            .field("role", &self.role())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

async fn run_link_receiver(shared: Arc<Shared>, link: LinkId, path: TransportPath) {
    let mut stop = shared.stop.subscribe();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        if *stop.borrow() {
            break;
        }
        let (n, from) = tokio::select! {
            _ = stop.changed() => break,
            res = path.recv(&mut buf) => match res {
                Ok(received) => received,
                Err(e) => {
                    tracing::debug!(link, error = %e, "link receive failed");
                    continue;
                }
            },
        };

        if from != path.peer_addr() {
            tracing::trace!(link, %from, "datagram from unexpected source dropped");
            continue;
        }
        match shared.codec.decapsulate(&buf[..n]) {
            Ok(opened) => shared.dispatch(link, opened).await,
            Err(_) => tracing::trace!(link, "dropping unauthenticated datagram"),
        }
    }
}

async fn run_coordinator(
    shared: Arc<Shared>,
    initial_sequence: u64,
    mut inbound: mpsc::Receiver<(u64, Vec<u8>)>,
    mut reports: mpsc::Receiver<MonitorReport>,
    delivered: mpsc::Sender<Vec<u8>>,
) {
    let mut stop = shared.stop.subscribe();
    let mut reassembler = Reassembler::new(initial_sequence, &shared.config.reorder);
    let mut ticker = time::interval(shared.config.reorder.expiry_tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut idle_since = Some(Instant::now());
    let mut all_down_reported = false;

    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            _ = stop.changed() => break,
            Some((sequence, payload)) = inbound.recv() => {
                reassembler.admit(sequence, payload, std_now());
            }
            Some(report) = reports.recv() => {
                let Some(transition) = shared.apply_report(&report) else {
                    continue;
                };
                if transition.to == LinkState::Down {
                    shared.retire_path(report.link);
                }
                let any_up = read(&shared.links).any_up();
                if any_up {
                    idle_since = None;
                    all_down_reported = false;
                    if transition.to == LinkState::Up {
                        shared.flush_pending().await;
                    }
                } else {
                    idle_since.get_or_insert_with(Instant::now);
                    if !all_down_reported {
                        all_down_reported = true;
                        tracing::warn!(client_id = shared.codec.client_id(), "all links down");
                        shared.emit(SessionEvent::AllLinksDown);
                    }
                }
                continue;
            }
            _ = ticker.tick() => {
                reassembler.expire(std_now());
                if let Some(queue) = lock(&shared.pending).as_mut() {
                    queue.expire(std_now());
                }
                if let Some(since) = idle_since {
                    if since.elapsed() >= shared.config.idle_timeout {
                        shared.terminate(TerminationReason::Idle);
                        break;
                    }
                }
            }
        }

        let ready: Vec<_> = reassembler.drain().collect();
        *lock(&shared.stats) = reassembler.stats();
        for (_, payload) in ready {
            tokio::select! {
                sent = delivered.send(payload) => {
                    if sent.is_err() {
                        return;
                    }
                }
                _ = stop.changed() => return,
            }
        }
    }
}
