use anyhow::Result;
use multilink_client::runtime::{connect, is_rejection, Client, LogFn};
use multilink_core::{
    ClientConfig, Codec, HealthConfig, LinkConfig, LocalRelayConfig, PacketType, PreSharedKey,
    Role, ServerConfig, SessionConfig, SessionKeys,
};
use multilink_server::runtime::Server;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

fn fast_session() -> SessionConfig {
    SessionConfig {
        health: HealthConfig {
            probe_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(40),
            failure_threshold: 4,
        },
        ..SessionConfig::default()
    }
}

/// Turn a wedged tunnel into a failure instead of a hung test run.
async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(30), fut)
        .await
        .expect("test did not finish in time")
}

fn any_local() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn collecting_log(tag: &'static str, sink: Arc<Mutex<Vec<String>>>) -> LogFn {
    Box::new(move |msg| {
        println!("[{tag}] {msg}");
        sink.lock().unwrap().push(msg);
    })
}

fn client_config(server_addr: SocketAddr, psk_b64: String, app: SocketAddr) -> ClientConfig {
    ClientConfig {
        server_addr,
        psk_b64,
        links: vec![
            LinkConfig {
                name: "ethernet".to_string(),
                bind_addr: any_local(),
            },
            LinkConfig {
                name: "lte".to_string(),
                bind_addr: any_local(),
            },
        ],
        session: fast_session(),
        local: LocalRelayConfig {
            listen_addr: any_local(),
            peer_addr: app,
        },
        reconnect_delay: Duration::from_millis(100),
        ..ClientConfig::default()
    }
}

struct RunningServer {
    addr: SocketAddr,
    relay: SocketAddr,
    app: UdpSocket,
    stop: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<Result<()>>,
    log: Arc<Mutex<Vec<String>>>,
}

async fn start_server(psk_b64: &str) -> Result<RunningServer> {
    let app = UdpSocket::bind(any_local()).await?;
    let cfg = ServerConfig {
        listen_addr: any_local(),
        psk_b64: psk_b64.to_string(),
        session: fast_session(),
        local: LocalRelayConfig {
            listen_addr: any_local(),
            peer_addr: app.local_addr()?,
        },
        ..ServerConfig::default()
    };
    let server = Server::bind(cfg).await?;
    let addr = server.local_addr()?;
    let relay = server.relay_addr()?;

    let log = Arc::new(Mutex::new(Vec::new()));
    let (stop, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(server.run(stop_rx, collecting_log("SERVER", log.clone())));
    Ok(RunningServer {
        addr,
        relay,
        app,
        stop,
        handle,
        log,
    })
}

/// Send `payload` to `target` until it shows up on `sink`.
///
/// Early sends are dropped while links come up, so this retries.
async fn send_until_received(
    from: &UdpSocket,
    target: SocketAddr,
    sink: &UdpSocket,
    payload: &[u8],
) -> bool {
    let mut buf = [0u8; 2048];
    for _ in 0..100 {
        if from.send_to(payload, target).await.is_err() {
            return false;
        }
        let deadline = tokio::time::Instant::now() + Duration::from_millis(100);
        while let Ok(Ok((n, _))) =
            tokio::time::timeout_at(deadline, sink.recv_from(&mut buf)).await
        {
            if &buf[..n] == payload {
                return true;
            }
        }
    }
    false
}

/// Client id announced in the client's "Authenticated with" log line
fn logged_client_id(log: &Mutex<Vec<String>>) -> Option<u64> {
    log.lock().unwrap().iter().find_map(|m| {
        let hex = m.split("client id 0x").nth(1)?.trim_end_matches(')');
        u64::from_str_radix(hex, 16).ok()
    })
}

fn count_matching(log: &Mutex<Vec<String>>, needle: &str) -> usize {
    log.lock().unwrap().iter().filter(|m| m.contains(needle)).count()
}

#[tokio::test]
async fn test_relay_both_directions() -> Result<()> {
    within(async {
        let psk = PreSharedKey::generate_base64();
        let server = start_server(&psk).await?;

        let client_app = UdpSocket::bind(any_local()).await?;
        let client = Client::bind(client_config(server.addr, psk, client_app.local_addr()?)).await?;
        let client_relay = client.relay_addr()?;
        let client_log = Arc::new(Mutex::new(Vec::new()));
        let (client_stop, client_stop_rx) = watch::channel(false);
        let client_handle = tokio::spawn(client.run(
            client_stop_rx,
            collecting_log("CLIENT", client_log.clone()),
        ));

        assert!(send_until_received(&client_app, client_relay, &server.app, b"upstream").await);
        assert!(send_until_received(&server.app, server.relay, &client_app, b"downstream").await);

        let _ = client_stop.send(true);
        client_handle.await??;
        let _ = server.stop.send(true);
        server.handle.await??;

        assert!(client_log
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.starts_with("Authenticated with")));
        assert!(server
            .log
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.contains("authenticated")));
        Ok::<_, anyhow::Error>(())
    })
    .await
}

#[tokio::test]
async fn test_wrong_key_rejected_then_right_key_accepted() -> Result<()> {
    within(async {
        let psk = PreSharedKey::generate_base64();
        let server = start_server(&psk).await?;
        let app = any_local();
        let quiet: LogFn = Box::new(|_: String| {});

        let wrong = client_config(server.addr, PreSharedKey::generate_base64(), app);
        let err = connect(&wrong, &quiet).await.unwrap_err();
        assert!(is_rejection(&err), "unexpected error: {err:#}");

        let right = client_config(server.addr, psk, app);
        let session = connect(&right, &quiet).await?;
        assert_ne!(session.client_id(), 0);
        session.shutdown().await;

        let _ = server.stop.send(true);
        server.handle.await??;

        let log = server.log.lock().unwrap();
        assert!(log.iter().any(|m| m.starts_with("Rejected authentication")));
        assert!(log.iter().any(|m| m.contains("authenticated")));
        Ok::<_, anyhow::Error>(())
    })
    .await
}

#[tokio::test]
async fn test_client_gives_up_without_server() -> Result<()> {
    within(async {
        // Bound but silent, so requests are swallowed
        let silent = UdpSocket::bind(any_local()).await?;
        let mut cfg = client_config(
            silent.local_addr()?,
            PreSharedKey::generate_base64(),
            any_local(),
        );
        cfg.handshake.timeout = Duration::from_millis(50);
        cfg.handshake.attempts = 3;

        let quiet: LogFn = Box::new(|_: String| {});
        let err = connect(&cfg, &quiet).await.unwrap_err();
        assert!(!is_rejection(&err));
        assert!(err.to_string().contains("after 3 attempts"));
        Ok::<_, anyhow::Error>(())
    })
    .await
}

#[tokio::test]
async fn test_garbage_does_not_disturb_session() -> Result<()> {
    within(async {
        let psk = PreSharedKey::generate_base64();
        let server = start_server(&psk).await?;

        let client_app = UdpSocket::bind(any_local()).await?;
        let client = Client::bind(client_config(server.addr, psk, client_app.local_addr()?)).await?;
        let client_relay = client.relay_addr()?;
        let client_log = Arc::new(Mutex::new(Vec::new()));
        let (client_stop, client_stop_rx) = watch::channel(false);
        let client_handle = tokio::spawn(client.run(
            client_stop_rx,
            collecting_log("CLIENT", client_log.clone()),
        ));

        assert!(send_until_received(&client_app, client_relay, &server.app, b"first").await);

        // Unauthenticated noise aimed at the server's tunnel socket
        let attacker = UdpSocket::bind(any_local()).await?;
        let attacker_addr = attacker.local_addr()?;
        attacker.send_to(&[0xFF; 40], server.addr).await?;
        attacker.send_to(&[2u8; 64], server.addr).await?;
        attacker.send_to(b"", server.addr).await?;

        // Well framed for the live session, with one tag bit flipped
        let client_id = logged_client_id(&client_log).expect("client id not logged");
        let forger = Codec::new(Role::Client, client_id, &SessionKeys::generate());
        for packet_type in [PacketType::Data, PacketType::Probe] {
            let mut forged = forger.encapsulate(packet_type, 1, b"forged")?;
            let last = forged.len() - 1;
            forged[last] ^= 0x01;
            attacker.send_to(&forged, server.addr).await?;
        }

        assert!(send_until_received(&client_app, client_relay, &server.app, b"second").await);

        // No answer of any kind, and no path learned for the sender
        let mut buf = [0u8; 2048];
        let answered =
            tokio::time::timeout(Duration::from_millis(300), attacker.recv_from(&mut buf)).await;
        assert!(answered.is_err(), "server answered unauthenticated traffic");
        assert_eq!(count_matching(&server.log, &attacker_addr.to_string()), 0);

        let _ = client_stop.send(true);
        client_handle.await??;
        let _ = server.stop.send(true);
        server.handle.await??;
        Ok::<_, anyhow::Error>(())
    })
    .await
}

#[tokio::test]
async fn test_rejection_retried_only_when_configured() -> Result<()> {
    within(async {
        let server = start_server(&PreSharedKey::generate_base64()).await?;
        let mut cfg = client_config(server.addr, PreSharedKey::generate_base64(), any_local());

        // Default: the refusal ends the client, with a hint about why
        let log = Arc::new(Mutex::new(Vec::new()));
        let (_stop, stop_rx) = watch::channel(false);
        let err = Client::bind(cfg.clone())
            .await?
            .run(stop_rx, collecting_log("CLIENT", log.clone()))
            .await
            .unwrap_err();
        assert!(is_rejection(&err), "unexpected error: {err:#}");
        assert_eq!(count_matching(&log, "retry_on_reject"), 1);

        // Opted in: keeps trying until stopped
        cfg.handshake.retry_on_reject = true;
        let log = Arc::new(Mutex::new(Vec::new()));
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(
            Client::bind(cfg)
                .await?
                .run(stop_rx, collecting_log("CLIENT", log.clone())),
        );
        while count_matching(&log, "unauthenticated refusal") < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!handle.is_finished());

        let _ = stop.send(true);
        handle.await??;
        let _ = server.stop.send(true);
        server.handle.await??;
        assert!(count_matching(&server.log, "Rejected authentication") >= 2);
        Ok::<_, anyhow::Error>(())
    })
    .await
}
