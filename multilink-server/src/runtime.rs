use anyhow::{Context, Result};
use multilink_core::{
    format_link_table, AuthOutcome, Authenticator, EnvelopeHeader, PacketType, PreSharedKey,
    ServerConfig, Session, SessionError, SessionEvent, TerminationReason, MAX_DATAGRAM_SIZE,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

pub type LogFn = Box<dyn Fn(String) + Send + Sync + 'static>;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(10);
const FORWARD_QUEUE: usize = 1024;

/// Sent by a session's forwarding task to the dispatcher
enum SessionNotice {
    Delivered { client_id: u64, payload: Vec<u8> },
    Ended { client_id: u64, reason: TerminationReason },
}

/// A configured server with its tunnel and relay sockets bound.
pub struct Server {
    cfg: ServerConfig,
    socket: Arc<UdpSocket>,
    relay: Arc<UdpSocket>,
}

impl Server {
    pub async fn bind(cfg: ServerConfig) -> Result<Self> {
        cfg.validate().context("invalid server config")?;
        let socket = UdpSocket::bind(cfg.listen_addr)
            .await
            .with_context(|| format!("failed to bind UDP socket to {}", cfg.listen_addr))?;
        let relay = UdpSocket::bind(cfg.local.listen_addr)
            .await
            .with_context(|| format!("failed to bind local relay on {}", cfg.local.listen_addr))?;
        Ok(Self {
            cfg,
            socket: Arc::new(socket),
            relay: Arc::new(relay),
        })
    }

    /// Address clients reach the server on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Address local applications send packets to
    pub fn relay_addr(&self) -> Result<SocketAddr> {
        Ok(self.relay.local_addr()?)
    }

    /// Serve clients until `stop` fires.
    ///
    /// One dispatcher owns the listening socket: handshakes go to the
    /// authenticator, everything else to the session named by the
    /// envelope's client id. Local traffic is relayed into the session that
    /// most recently delivered a packet (or was most recently established).
    pub async fn run(self, mut stop: watch::Receiver<bool>, log: LogFn) -> Result<()> {
        let log = Arc::new(log);
        let cfg = &self.cfg;
        let psk = PreSharedKey::from_base64(&cfg.psk_b64).context("invalid pre-shared key")?;
        let mut authenticator = Authenticator::new(psk, cfg.initial_sequence);

        (log.as_ref())(format!(
            "Server listening on {} relay={} -> {} idle_timeout={:?}",
            self.socket.local_addr()?,
            cfg.local.listen_addr,
            cfg.local.peer_addr,
            cfg.session.idle_timeout
        ));

        let mut sessions: HashMap<u64, Arc<Session>> = HashMap::new();
        let mut active: Option<u64> = None;
        let (notice_tx, mut notices) = mpsc::channel(FORWARD_QUEUE);

        let mut health_tick = time::interval_at(
            Instant::now() + HEALTH_LOG_INTERVAL,
            HEALTH_LOG_INTERVAL,
        );
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut relay_buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        (log.as_ref())("Stop requested".to_string());
                        break;
                    }
                }
                recv = self.socket.recv_from(&mut buf) => {
                    let (n, peer) = match recv {
                        Ok(received) => received,
                        Err(e) => {
                            tracing::debug!(error = %e, "receive failed");
                            continue;
                        }
                    };
                    let wire = &buf[..n];
                    let header = match EnvelopeHeader::decode(wire) {
                        Ok(header) => header,
                        Err(e) => {
                            tracing::trace!(%peer, error = %e, "dropping malformed datagram");
                            continue;
                        }
                    };

                    if header.packet_type != PacketType::Handshake {
                        match sessions.get(&header.client_id) {
                            Some(session) => session.ingest(peer, wire).await,
                            None => tracing::trace!(%peer, client_id = header.client_id, "no such session"),
                        }
                        continue;
                    }

                    if sessions.len() >= cfg.max_sessions {
                        tracing::debug!(
                            %peer,
                            limit = cfg.max_sessions,
                            "session limit reached, dropping handshake"
                        );
                        continue;
                    }
                    match authenticator.respond(peer, wire) {
                        Ok(AuthOutcome::Accepted { response, session }) => {
                            let client_id = session.params.client_id;
                            let session = Arc::new(Session::spawn_server(
                                session,
                                self.socket.clone(),
                                cfg.session.clone(),
                            ));
                            tokio::spawn(forward_session(
                                session.clone(),
                                session.events(),
                                notice_tx.clone(),
                                log.clone(),
                            ));
                            sessions.insert(client_id, session);
                            active = Some(client_id);
                            if let Err(e) = self.socket.send_to(&response, peer).await {
                                tracing::warn!(%peer, error = %e, "auth response send failed");
                            }
                            (log.as_ref())(format!(
                                "Client {peer} authenticated (client id {client_id:#x}, {} sessions)",
                                sessions.len()
                            ));
                        }
                        Ok(AuthOutcome::Retransmit { response }) => {
                            tracing::debug!(%peer, "resending auth response");
                            let _ = self.socket.send_to(&response, peer).await;
                        }
                        Ok(AuthOutcome::Rejected { response }) => {
                            let _ = self.socket.send_to(&response, peer).await;
                            (log.as_ref())(format!("Rejected authentication from {peer}"));
                        }
                        Err(e) => tracing::debug!(%peer, error = %e, "dropping bad handshake"),
                    }
                }
                recv = self.relay.recv_from(&mut relay_buf) => {
                    let n = match recv {
                        Ok((n, _)) => n,
                        Err(e) => {
                            tracing::debug!(error = %e, "local relay receive failed");
                            continue;
                        }
                    };
                    let Some(session) = active.and_then(|id| sessions.get(&id)) else {
                        tracing::debug!("no session, dropping local packet");
                        continue;
                    };
                    match session.submit(relay_buf[..n].to_vec()).await {
                        Ok(_) | Err(SessionError::SequenceExhausted | SessionError::Closed) => {}
                        Err(SessionError::NoHealthyLink) => {
                            tracing::debug!("no healthy path, dropping local packet");
                        }
                        Err(e) => tracing::warn!(error = %e, "send failed"),
                    }
                }
                Some(notice) = notices.recv() => match notice {
                    SessionNotice::Delivered { client_id, payload } => {
                        active = Some(client_id);
                        if let Err(e) = self.relay.send_to(&payload, cfg.local.peer_addr).await {
                            tracing::warn!(error = %e, "local relay send failed");
                        }
                    }
                    SessionNotice::Ended { client_id, reason } => {
                        if let Some(session) = sessions.remove(&client_id) {
                            session.shutdown().await;
                        }
                        if active == Some(client_id) {
                            active = None;
                        }
                        (log.as_ref())(format!(
                            "Session {client_id:#x} ended ({reason:?}), {} remaining",
                            sessions.len()
                        ));
                    }
                },
                _ = health_tick.tick() => {
                    for (client_id, session) in &sessions {
                        (log.as_ref())(format!(
                            "Session {client_id:#x} links:\n{}",
                            format_link_table(&session.link_snapshots())
                        ));
                    }
                }
            }
        }

        for (_, session) in sessions.drain() {
            session.shutdown().await;
        }
        (log.as_ref())("Server stopped".to_string());
        Ok(())
    }
}

/// Pump one session's deliveries and lifecycle into the dispatcher.
async fn forward_session(
    session: Arc<Session>,
    mut events: broadcast::Receiver<SessionEvent>,
    notices: mpsc::Sender<SessionNotice>,
    log: Arc<LogFn>,
) {
    let client_id = session.client_id();
    let reason = loop {
        tokio::select! {
            payload = session.deliver() => match payload {
                Some(payload) => {
                    if notices.send(SessionNotice::Delivered { client_id, payload }).await.is_err() {
                        return;
                    }
                }
                None => break TerminationReason::Shutdown,
            },
            event = events.recv() => match event {
                Ok(SessionEvent::Terminated { reason }) => break reason,
                Ok(SessionEvent::LinkAdded { remote, .. }) => {
                    (log.as_ref())(format!("Session {client_id:#x}: new path from {remote}"));
                }
                Ok(SessionEvent::LinkRemoved { remote, .. }) => {
                    (log.as_ref())(format!("Session {client_id:#x}: path from {remote} retired"));
                }
                Ok(SessionEvent::LinkStateChanged { name, from, to, .. }) => {
                    (log.as_ref())(format!("Session {client_id:#x}: {name} {from} -> {to}"));
                }
                Ok(SessionEvent::AllLinksDown) => {
                    (log.as_ref())(format!("Session {client_id:#x}: all paths down"));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break TerminationReason::Shutdown,
            },
        }
    };
    drop(session);
    let _ = notices.send(SessionNotice::Ended { client_id, reason }).await;
}

pub async fn run_server(cfg: ServerConfig, stop: watch::Receiver<bool>, log: LogFn) -> Result<()> {
    Server::bind(cfg).await?.run(stop, log).await
}
