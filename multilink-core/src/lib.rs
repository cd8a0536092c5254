//! Core library for the multilink tunnel.
//!
//! This library bonds several independent WAN links (e.g. Ethernet + LTE)
//! into one encrypted, authenticated connection between a client and a server.
//!
//! # Architecture
//!
//! The library is organized into several key modules:
//!
//! - `proto`: Wire envelope, packet types and handshake messages
//! - `codec`: Authenticated encryption of envelopes with sequence-derived nonces
//! - `handshake`: Pre-shared-key authentication and session key derivation
//! - `health`: Per-link liveness state machine and probe loops
//! - `scheduler`: Link selection and the all-links-down queue
//! - `reorder`: Sequence-ordered jitter buffer on the receive path
//! - `link`: Owned registry of a session's links
//! - `transport`: UDP paths
//! - `session`: Session lifecycle, task wiring and the data-path API
//! - `config`: Already-parsed configuration types
//!
//! # Example
//!
//! ```no_run
//! # async fn example(
//! #     wire: &[u8],
//! #     links: Vec<(String, multilink_core::TransportPath)>,
//! # ) -> anyhow::Result<()> {
//! use multilink_core::{ClientHandshake, PreSharedKey, Session, SessionConfig};
//!
//! let mut handshake = ClientHandshake::new(PreSharedKey::from_base64("...")?);
//! let _request = handshake.start()?;
//! // send the request, then feed the server's answer back in
//! let established = handshake.on_response(wire)?;
//!
//! let session = Session::spawn_client(established, links, SessionConfig::default());
//! session.submit(b"packet".to_vec()).await?;
//! let _reply = session.deliver().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod handshake;
pub mod health;
pub mod link;
pub mod proto;
pub mod reorder;
pub mod scheduler;
pub mod session;
pub mod transport;

pub use codec::{Codec, CodecError, Role, SessionKeys};
pub use config::{
    ClientConfig, ConfigError, HandshakeConfig, HealthConfig, LinkConfig, LocalRelayConfig,
    ReorderConfig, SchedulerConfig, ServerConfig, SessionConfig,
};
pub use handshake::{
    AuthOutcome, Authenticator, ClientHandshake, Established, HandshakeError, HandshakeState,
    PreSharedKey,
};
pub use health::LinkState;
pub use link::{format_link_table, LinkSnapshot};
pub use proto::{EnvelopeHeader, PacketType, MAX_DATAGRAM_SIZE};
pub use scheduler::{DownPolicy, LinkId, SchedulerMode};
pub use session::{Session, SessionError, SessionEvent, SubmitOutcome, TerminationReason};
pub use transport::TransportPath;
