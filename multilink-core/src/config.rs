//! Already-parsed configuration for the tunnel engine.
//!
//! File loading lives in the binaries; this module only defines the shapes,
//! their defaults and validation.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::scheduler::{DownPolicy, SchedulerMode};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("probe_timeout ({timeout:?}) must not exceed probe_interval ({interval:?})")]
    ProbeTimeoutTooLong {
        timeout: Duration,
        interval: Duration,
    },

    #[error("at least one link must be configured")]
    NoLinks,

    #[error("duplicate link name: {0}")]
    DuplicateLink(String),

    #[error("invalid pre-shared key: {0}")]
    InvalidKey(String),
}

fn require_nonzero_duration(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Zero { field });
    }
    Ok(())
}

fn require_nonzero(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero { field });
    }
    Ok(())
}

/// Probe cadence and hysteresis for every link of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Time between probes on one link
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,
    /// Bounded wait for the matching ack
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Consecutive failures before a link is declared Down
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_millis(500),
            probe_timeout: Duration::from_millis(400),
            failure_threshold: 4,
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero_duration("probe_interval", self.probe_interval)?;
        require_nonzero_duration("probe_timeout", self.probe_timeout)?;
        require_nonzero("failure_threshold", self.failure_threshold as usize)?;
        if self.probe_timeout > self.probe_interval {
            return Err(ConfigError::ProbeTimeoutTooLong {
                timeout: self.probe_timeout,
                interval: self.probe_interval,
            });
        }
        Ok(())
    }
}

/// Bounds on the receive-side jitter buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReorderConfig {
    /// Maximum number of out-of-order slots held at once
    pub max_slots: usize,
    /// Age after which a gap is given up on
    #[serde(with = "humantime_serde")]
    pub max_gap_age: Duration,
    /// How often slot ages are checked
    #[serde(with = "humantime_serde")]
    pub expiry_tick: Duration,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            max_slots: 1024,
            max_gap_age: Duration::from_millis(50),
            expiry_tick: Duration::from_millis(10),
        }
    }
}

impl ReorderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero("max_slots", self.max_slots)?;
        require_nonzero_duration("max_gap_age", self.max_gap_age)?;
        require_nonzero_duration("expiry_tick", self.expiry_tick)
    }
}

/// Link selection policy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub mode: SchedulerMode,
    pub all_links_down: DownPolicy,
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let DownPolicy::Queue { capacity, max_wait } = self.all_links_down {
            require_nonzero("all_links_down.capacity", capacity)?;
            require_nonzero_duration("all_links_down.max_wait", max_wait)?;
        }
        Ok(())
    }
}

/// Client handshake retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Wait for an `AuthResponse` before resending the request
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Total number of requests sent before giving up
    pub attempts: u32,
    /// Keep reconnecting after the server refuses the key.
    ///
    /// A refusal carries no proof, so anyone able to spoof the server's
    /// address can forge one.
    pub retry_on_reject: bool,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            attempts: 5,
            retry_on_reject: false,
        }
    }
}

impl HandshakeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero_duration("handshake.timeout", self.timeout)?;
        require_nonzero("handshake.attempts", self.attempts as usize)
    }
}

/// Everything a session needs once the handshake is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// A session with no Up link for this long terminates itself
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Most paths a server session learns at once
    pub max_paths: usize,
    pub health: HealthConfig,
    pub reorder: ReorderConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            health: HealthConfig::default(),
            reorder: ReorderConfig::default(),
            scheduler: SchedulerConfig::default(),
            idle_timeout: Duration::from_secs(30),
            max_paths: 8,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.health.validate()?;
        self.reorder.validate()?;
        self.scheduler.validate()?;
        require_nonzero("max_paths", self.max_paths)?;
        require_nonzero_duration("idle_timeout", self.idle_timeout)
    }
}

/// One WAN link on the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Operator-facing name (e.g. "ethernet", "lte")
    pub name: String,
    /// Local address the link's socket binds to; selects the egress interface
    pub bind_addr: SocketAddr,
}

/// Local packet source/sink, standing in for a virtual interface.
///
/// The tunnel reads datagrams arriving on `listen_addr` and writes delivered
/// payloads to `peer_addr`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRelayConfig {
    pub listen_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

/// Configuration for the multilink client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server UDP endpoint
    pub server_addr: SocketAddr,
    /// Base64-encoded pre-shared secret
    pub psk_b64: String,
    /// Delay before re-establishing a terminated session
    #[serde(default = "default_reconnect_delay", with = "humantime_serde")]
    pub reconnect_delay: Duration,
    pub links: Vec<LinkConfig>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub handshake: HandshakeConfig,
    pub local: LocalRelayConfig,
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(1)
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: ([127, 0, 0, 1], 5000).into(),
            psk_b64: String::new(),
            links: vec![
                LinkConfig {
                    name: "link0".to_string(),
                    bind_addr: ([0, 0, 0, 0], 0).into(),
                },
                LinkConfig {
                    name: "link1".to_string(),
                    bind_addr: ([0, 0, 0, 0], 0).into(),
                },
            ],
            session: SessionConfig::default(),
            handshake: HandshakeConfig::default(),
            local: LocalRelayConfig {
                listen_addr: ([127, 0, 0, 1], 5100).into(),
                peer_addr: ([127, 0, 0, 1], 5101).into(),
            },
            reconnect_delay: default_reconnect_delay(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.links.is_empty() {
            return Err(ConfigError::NoLinks);
        }
        for (i, link) in self.links.iter().enumerate() {
            if self.links[..i].iter().any(|l| l.name == link.name) {
                return Err(ConfigError::DuplicateLink(link.name.clone()));
            }
        }
        crate::handshake::PreSharedKey::from_base64(&self.psk_b64)
            .map_err(|e| ConfigError::InvalidKey(e.to_string()))?;
        self.session.validate()?;
        self.handshake.validate()
    }
}

/// Configuration for the multilink server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the single server UDP socket binds to
    pub listen_addr: SocketAddr,
    /// Base64-encoded pre-shared secret
    pub psk_b64: String,
    /// First sequence number handed to new sessions
    #[serde(default = "default_initial_sequence")]
    pub initial_sequence: u64,
    /// Handshakes beyond this many live sessions are dropped
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default)]
    pub session: SessionConfig,
    pub local: LocalRelayConfig,
}

fn default_initial_sequence() -> u64 {
    1
}

fn default_max_sessions() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 5000).into(),
            psk_b64: String::new(),
            session: SessionConfig::default(),
            initial_sequence: default_initial_sequence(),
            max_sessions: default_max_sessions(),
            local: LocalRelayConfig {
                listen_addr: ([127, 0, 0, 1], 5200).into(),
                peer_addr: ([127, 0, 0, 1], 5201).into(),
            },
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        crate::handshake::PreSharedKey::from_base64(&self.psk_b64)
            .map_err(|e| ConfigError::InvalidKey(e.to_string()))?;
        require_nonzero("max_sessions", self.max_sessions)?;
        self.session.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    fn psk() -> String {
        base64::engine::general_purpose::STANDARD.encode([7u8; 32])
    }

    #[test]
    fn test_health_defaults() {
        let cfg = HealthConfig::default();
        assert_eq!(cfg.failure_threshold, 4);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_probe_timeout_longer_than_interval_rejected() {
        let cfg = HealthConfig {
            probe_timeout: Duration::from_secs(2),
            ..HealthConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ProbeTimeoutTooLong { .. })
        ));
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let cfg = SchedulerConfig {
            all_links_down: DownPolicy::Queue {
                capacity: 0,
                max_wait: Duration::from_secs(1),
            },
            ..SchedulerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Zero { .. })));
    }

    #[test]
    fn test_client_requires_links_and_key() {
        let mut cfg = ClientConfig::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidKey(_))));

        cfg.psk_b64 = psk();
        assert!(cfg.validate().is_ok());

        cfg.links[1].name = cfg.links[0].name.clone();
        assert!(matches!(cfg.validate(), Err(ConfigError::DuplicateLink(_))));

        cfg.links.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::NoLinks)));
    }

    #[test]
    fn test_server_toml_uses_humantime() {
        let raw = format!(
            r#"
listen_addr = "0.0.0.0:7000"
psk_b64 = "{}"

[session]
idle_timeout = "45s"

[session.health]
probe_interval = "250ms"
probe_timeout = "200ms"

[session.scheduler]
mode = "lowest_rtt"

[session.scheduler.all_links_down]
policy = "queue"
capacity = 64
max_wait = "2s"

[local]
listen_addr = "127.0.0.1:6000"
peer_addr = "127.0.0.1:6001"
"#,
            psk()
        );

        let cfg: ServerConfig = toml::from_str(&raw).unwrap();
        assert_eq!(cfg.session.idle_timeout, Duration::from_secs(45));
        assert_eq!(cfg.session.health.probe_interval, Duration::from_millis(250));
        assert_eq!(cfg.session.health.failure_threshold, 4);
        assert_eq!(cfg.session.scheduler.mode, SchedulerMode::LowestRtt);
        assert_eq!(
            cfg.session.scheduler.all_links_down,
            DownPolicy::Queue {
                capacity: 64,
                max_wait: Duration::from_secs(2)
            }
        );
        assert_eq!(cfg.initial_sequence, 1);
        assert_eq!(cfg.max_sessions, 256);
        assert_eq!(cfg.session.max_paths, 8);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_session_and_path_limits_must_be_nonzero() {
        let mut cfg = ServerConfig {
            psk_b64: psk(),
            max_sessions: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Zero { field: "max_sessions" })
        ));

        cfg.max_sessions = 4;
        cfg.session.max_paths = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Zero { field: "max_paths" })
        ));
    }

    #[test]
    fn test_retry_on_reject_defaults_off() {
        let raw = format!(
            r#"
server_addr = "192.0.2.1:5000"
psk_b64 = "{}"

[[links]]
name = "ethernet"
bind_addr = "0.0.0.0:0"

[handshake]
attempts = 3

[local]
listen_addr = "127.0.0.1:5100"
peer_addr = "127.0.0.1:5101"
"#,
            psk()
        );
        let mut cfg: ClientConfig = toml::from_str(&raw).unwrap();
        assert_eq!(cfg.handshake.attempts, 3);
        assert!(!cfg.handshake.retry_on_reject);
        assert!(cfg.validate().is_ok());

        cfg.handshake.retry_on_reject = true;
        assert!(cfg.validate().is_ok());
    }
}
