use anyhow::{Context, Result};
use multilink_core::{
    format_link_table, ClientConfig, ClientHandshake, HandshakeError, PreSharedKey, Session,
    SessionError, SessionEvent, TerminationReason, TransportPath, MAX_DATAGRAM_SIZE,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

pub type LogFn = Box<dyn Fn(String) + Send + Sync + 'static>;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Bind one socket per configured link, all aimed at the server.
async fn bind_links(cfg: &ClientConfig) -> Result<Vec<(String, TransportPath)>> {
    let mut links = Vec::with_capacity(cfg.links.len());
    for link in &cfg.links {
        let path = TransportPath::bind(link.bind_addr, cfg.server_addr)
            .await
            .with_context(|| format!("failed to bind link {} on {}", link.name, link.bind_addr))?;
        links.push((link.name.clone(), path));
    }
    Ok(links)
}

/// Authenticate with the server and start a session over every link.
///
/// Attempts rotate across the links so one dead uplink cannot stall
/// connection setup. A rejection ends this attempt; whether to try again is
/// up to the caller.
pub async fn connect(cfg: &ClientConfig, log: &LogFn) -> Result<Session> {
    let psk = PreSharedKey::from_base64(&cfg.psk_b64).context("invalid pre-shared key")?;
    let links = bind_links(cfg).await?;
    if links.is_empty() {
        anyhow::bail!("no links configured");
    }

    let mut handshake = ClientHandshake::new(psk);
    handshake.start()?;
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    for attempt in 1..=cfg.handshake.attempts {
        let (name, path) = &links[(attempt as usize - 1) % links.len()];
        let request = handshake
            .retransmit()
            .context("handshake left the waiting state")?;
        path.send(request)
            .await
            .with_context(|| format!("failed to send auth request on link {name}"))?;

        let deadline = Instant::now() + cfg.handshake.timeout;
        loop {
            let (n, from) = match time::timeout_at(deadline, path.recv(&mut buf)).await {
                Ok(res) => res.with_context(|| format!("receive failed on link {name}"))?,
                Err(_) => {
                    (log.as_ref())(format!(
                        "Handshake attempt {attempt}/{} on {name} timed out, retrying",
                        cfg.handshake.attempts
                    ));
                    break;
                }
            };
            if from != cfg.server_addr {
                continue;
            }
            match handshake.on_response(&buf[..n]) {
                Ok(established) => {
                    let client_id = established.params.client_id;
                    (log.as_ref())(format!(
                        "Authenticated with {} via {name} (client id {client_id:#x})",
                        cfg.server_addr
                    ));
                    return Ok(Session::spawn_client(
                        established,
                        links,
                        cfg.session.clone(),
                    ));
                }
                Err(HandshakeError::Rejected) => return Err(HandshakeError::Rejected.into()),
                Err(e) => tracing::debug!(link = %name, error = %e, "ignoring handshake datagram"),
            }
        }
    }

    anyhow::bail!(
        "no handshake response from {} after {} attempts",
        cfg.server_addr,
        cfg.handshake.attempts
    )
}

/// True if `err` means the server refused our key
pub fn is_rejection(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<HandshakeError>(),
        Some(HandshakeError::Rejected)
    )
}

enum RelayEnd {
    Stopped,
    Terminated(TerminationReason),
}

/// A configured client with its local relay socket bound.
pub struct Client {
    cfg: ClientConfig,
    relay: Arc<UdpSocket>,
}

impl Client {
    pub async fn bind(cfg: ClientConfig) -> Result<Self> {
        cfg.validate().context("invalid client config")?;
        let relay = UdpSocket::bind(cfg.local.listen_addr)
            .await
            .with_context(|| format!("failed to bind local relay on {}", cfg.local.listen_addr))?;
        Ok(Self {
            cfg,
            relay: Arc::new(relay),
        })
    }

    /// Address local applications send packets to
    pub fn relay_addr(&self) -> Result<SocketAddr> {
        Ok(self.relay.local_addr()?)
    }

    /// Keep a session up until `stop` fires, reconnecting after each loss.
    pub async fn run(self, mut stop: watch::Receiver<bool>, log: LogFn) -> Result<()> {
        let cfg = &self.cfg;
        (log.as_ref())(format!(
            "Client config: server={} links={} mode={:?} relay={} -> {}",
            cfg.server_addr,
            cfg.links.len(),
            cfg.session.scheduler.mode,
            cfg.local.listen_addr,
            cfg.local.peer_addr
        ));

        loop {
            if *stop.borrow() {
                break;
            }

            let connected = tokio::select! {
                _ = stop.changed() => break,
                res = connect(cfg, &log) => res,
            };
            let session = match connected {
                Ok(session) => session,
                Err(e) if is_rejection(&e) && !cfg.handshake.retry_on_reject => {
                    (log.as_ref())(
                        "Server rejected authentication; check the pre-shared key \
                         (the refusal is unauthenticated, set handshake.retry_on_reject \
                         to keep trying)"
                            .to_string(),
                    );
                    return Err(e);
                }
                Err(e) if is_rejection(&e) => {
                    (log.as_ref())(format!(
                        "Server rejected authentication (unauthenticated refusal); retrying in {:?}",
                        cfg.reconnect_delay
                    ));
                    if wait_or_stop(cfg.reconnect_delay, &mut stop).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    (log.as_ref())(format!(
                        "Connect failed: {e:#}; retrying in {:?}",
                        cfg.reconnect_delay
                    ));
                    if wait_or_stop(cfg.reconnect_delay, &mut stop).await {
                        break;
                    }
                    continue;
                }
            };

            let end = self.relay_session(&session, &mut stop, &log).await;
            session.shutdown().await;
            match end {
                RelayEnd::Stopped => break,
                RelayEnd::Terminated(reason) => {
                    (log.as_ref())(format!(
                        "Session ended ({reason:?}); reconnecting in {:?}",
                        cfg.reconnect_delay
                    ));
                    if wait_or_stop(cfg.reconnect_delay, &mut stop).await {
                        break;
                    }
                }
            }
        }

        (log.as_ref())("Client stopped".to_string());
        Ok(())
    }

    async fn relay_session(
        &self,
        session: &Session,
        stop: &mut watch::Receiver<bool>,
        log: &LogFn,
    ) -> RelayEnd {
        let mut events = session.events();
        let mut health_tick = time::interval_at(
            Instant::now() + HEALTH_LOG_INTERVAL,
            HEALTH_LOG_INTERVAL,
        );
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = stop.changed() => return RelayEnd::Stopped,
                recv = self.relay.recv_from(&mut buf) => {
                    let n = match recv {
                        Ok((n, _)) => n,
                        Err(e) => {
                            tracing::debug!(error = %e, "local relay receive failed");
                            continue;
                        }
                    };
                    match session.submit(buf[..n].to_vec()).await {
                        Ok(_) => {}
                        Err(SessionError::NoHealthyLink) => {
                            tracing::debug!("no healthy link, dropping local packet");
                        }
                        // Termination is reported through the event stream
                        Err(SessionError::SequenceExhausted | SessionError::Closed) => {}
                        Err(e) => tracing::warn!(error = %e, "send failed"),
                    }
                }
                payload = session.deliver() => {
                    let Some(payload) = payload else {
                        return RelayEnd::Terminated(TerminationReason::Shutdown);
                    };
                    if let Err(e) = self.relay.send_to(&payload, self.cfg.local.peer_addr).await {
                        tracing::warn!(error = %e, "local relay send failed");
                    }
                }
                event = events.recv() => match event {
                    Ok(SessionEvent::Terminated { reason }) => return RelayEnd::Terminated(reason),
                    Ok(SessionEvent::LinkStateChanged { name, from, to, .. }) => {
                        (log.as_ref())(format!("Link {name}: {from} -> {to}"));
                    }
                    Ok(SessionEvent::AllLinksDown) => {
                        (log.as_ref())("All links down".to_string());
                    }
                    Ok(SessionEvent::LinkAdded { .. } | SessionEvent::LinkRemoved { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "session events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return RelayEnd::Terminated(TerminationReason::Shutdown);
                    }
                },
                _ = health_tick.tick() => {
                    (log.as_ref())(format!("Link health:\n{}", format_link_table(&session.link_snapshots())));
                }
            }
        }
    }
}

/// Sleep for `delay`; true if `stop` fired first.
async fn wait_or_stop(delay: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = stop.changed() => true,
        _ = time::sleep(delay) => *stop.borrow(),
    }
}

pub async fn run_client(cfg: ClientConfig, stop: watch::Receiver<bool>, log: LogFn) -> Result<()> {
    Client::bind(cfg).await?.run(stop, log).await
}
