//! Pre-shared-key authentication and session key derivation.
//!
//! One round trip:
//!
//! 1. Client sends `AuthRequest { client_nonce, proof }` where
//!    `proof = HMAC-SHA256(psk, REQUEST_LABEL || client_nonce)`.
//! 2. Server verifies the proof. On success it assigns session parameters,
//!    picks `server_nonce` and answers `AuthResponse(Success)` with its own
//!    proof over both nonces and the parameters. On failure it answers
//!    `AuthResponse(Failure)` and keeps no state.
//!
//! The server remembers each accepted `client_nonce` for a while. A repeat
//! from the same address is a retransmit and gets the cached answer; a repeat
//! from anywhere else is a replay and gets nothing.
//!
//! Both ends then derive directional keys with HKDF-SHA256 over the PSK,
//! salted with both nonces. The [`Codec`] is built from the complete key pair
//! in one step, so no packet is ever handled under partial key material.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use base64::Engine as _;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::codec::{Codec, Role, SessionKeys, KEY_SIZE};
use crate::proto::{
    AuthResponse, HandshakeMessage, ProtocolError, SessionParams, CHALLENGE_SIZE, PROOF_SIZE,
};

type HmacSha256 = Hmac<Sha256>;

const REQUEST_LABEL: &[u8] = b"multilink auth request v1";
const RESPONSE_LABEL: &[u8] = b"multilink auth response v1";
const KEY_LABEL: &[u8] = b"multilink session keys v1";

/// Shortest accepted pre-shared secret
pub const MIN_PSK_LEN: usize = 16;

/// How long an accepted client nonce is remembered
pub const NONCE_MEMORY: Duration = Duration::from_secs(120);
/// Most client nonces remembered at once; the oldest is forgotten first
pub const NONCE_CAPACITY: usize = 4096;

/// Handshake errors
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("pre-shared key too short: {len} bytes, need at least {MIN_PSK_LEN}")]
    KeyTooShort { len: usize },

    #[error("pre-shared key is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("malformed handshake message: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("unexpected handshake message")]
    UnexpectedMessage,

    #[error("handshake not expecting this step in state {0:?}")]
    InvalidState(HandshakeState),

    #[error("server rejected authentication")]
    Rejected,

    #[error("auth request already answered for another address")]
    Replayed,

    #[error("server proof did not verify")]
    BadServerProof,

    #[error("key derivation failed")]
    KeyDerivation,
}

/// Pre-shared secret. Wiped on drop.
#[derive(Clone)]
pub struct PreSharedKey(Zeroizing<Vec<u8>>);

impl PreSharedKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, HandshakeError> {
        let bytes = Zeroizing::new(bytes);
        if bytes.len() < MIN_PSK_LEN {
            return Err(HandshakeError::KeyTooShort { len: bytes.len() });
        }
        Ok(Self(bytes))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, HandshakeError> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
        Self::from_bytes(bytes)
    }

    /// Generate a random 32-byte secret, base64 encoded
    pub fn generate_base64() -> String {
        let mut raw = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut raw[..]);
        base64::engine::general_purpose::STANDARD.encode(&raw[..])
    }

    fn mac(&self) -> Result<HmacSha256, HandshakeError> {
        HmacSha256::new_from_slice(&self.0).map_err(|_| HandshakeError::KeyDerivation)
    }

    fn request_mac(&self, client_nonce: &[u8; CHALLENGE_SIZE]) -> Result<HmacSha256, HandshakeError> {
        let mut mac = self.mac()?;
        mac.update(REQUEST_LABEL);
        mac.update(client_nonce);
        Ok(mac)
    }

    fn response_mac(
        &self,
        client_nonce: &[u8; CHALLENGE_SIZE],
        server_nonce: &[u8; CHALLENGE_SIZE],
        params: &SessionParams,
    ) -> Result<HmacSha256, HandshakeError> {
        let mut mac = self.mac()?;
        mac.update(RESPONSE_LABEL);
        mac.update(client_nonce);
        mac.update(server_nonce);
        mac.update(&params.client_id.to_be_bytes());
        mac.update(&params.initial_sequence.to_be_bytes());
        Ok(mac)
    }

    fn derive_keys(
        &self,
        client_nonce: &[u8; CHALLENGE_SIZE],
        server_nonce: &[u8; CHALLENGE_SIZE],
        params: &SessionParams,
    ) -> Result<SessionKeys, HandshakeError> {
        let mut salt = [0u8; 2 * CHALLENGE_SIZE];
        salt[..CHALLENGE_SIZE].copy_from_slice(client_nonce);
        salt[CHALLENGE_SIZE..].copy_from_slice(server_nonce);

        let mut info = Vec::with_capacity(KEY_LABEL.len() + 16);
        info.extend_from_slice(KEY_LABEL);
        info.extend_from_slice(&params.client_id.to_be_bytes());
        info.extend_from_slice(&params.initial_sequence.to_be_bytes());

        let hk = Hkdf::<Sha256>::new(Some(&salt), &self.0);
        let mut okm = Zeroizing::new([0u8; 2 * KEY_SIZE]);
        hk.expand(&info, &mut okm[..])
            .map_err(|_| HandshakeError::KeyDerivation)?;

        let mut c2s = Zeroizing::new([0u8; KEY_SIZE]);
        let mut s2c = Zeroizing::new([0u8; KEY_SIZE]);
        c2s.copy_from_slice(&okm[..KEY_SIZE]);
        s2c.copy_from_slice(&okm[KEY_SIZE..]);
        Ok(SessionKeys::new(*c2s, *s2c))
    }
}

impl std::fmt::Debug for PreSharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PreSharedKey(..)")
    }
}

fn random_challenge() -> [u8; CHALLENGE_SIZE] {
    let mut nonce = [0u8; CHALLENGE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn to_proof(mac: HmacSha256) -> [u8; PROOF_SIZE] {
    let mut proof = [0u8; PROOF_SIZE];
    proof.copy_from_slice(&mac.finalize().into_bytes());
    proof
}

/// A session both ends agree on
#[derive(Debug)]
pub struct Established {
    pub params: SessionParams,
    pub codec: Codec,
}

/// Client handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    AwaitResponse,
    Established,
    /// Terminal: the server refused the proof
    Rejected,
}

/// Client side of the handshake.
#[derive(Debug)]
pub struct ClientHandshake {
    psk: PreSharedKey,
    state: HandshakeState,
    client_nonce: [u8; CHALLENGE_SIZE],
    request: Vec<u8>,
}

impl ClientHandshake {
    pub fn new(psk: PreSharedKey) -> Self {
        Self {
            psk,
            state: HandshakeState::Init,
            client_nonce: [0u8; CHALLENGE_SIZE],
            request: Vec::new(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Build the `AuthRequest` envelope and wait for the answer.
    pub fn start(&mut self) -> Result<Vec<u8>, HandshakeError> {
        if self.state != HandshakeState::Init {
            return Err(HandshakeError::InvalidState(self.state));
        }

        self.client_nonce = random_challenge();
        let proof = to_proof(self.psk.request_mac(&self.client_nonce)?);
        self.request = HandshakeMessage::AuthRequest {
            client_nonce: self.client_nonce,
            proof,
        }
        .to_envelope(0);
        self.state = HandshakeState::AwaitResponse;
        Ok(self.request.clone())
    }

    /// The pending request, for resending after a timeout
    pub fn retransmit(&self) -> Option<&[u8]> {
        (self.state == HandshakeState::AwaitResponse).then_some(self.request.as_slice())
    }

    /// Process one inbound datagram.
    ///
    /// Anything that is not a valid answer to this request leaves the state in
    /// `AwaitResponse`; only a `Failure` response is terminal.
    pub fn on_response(&mut self, wire: &[u8]) -> Result<Established, HandshakeError> {
        if self.state != HandshakeState::AwaitResponse {
            return Err(HandshakeError::InvalidState(self.state));
        }

        let (_, message) = HandshakeMessage::from_envelope(wire)?;
        let HandshakeMessage::AuthResponse(response) = message else {
            return Err(HandshakeError::UnexpectedMessage);
        };

        match response {
            AuthResponse::Failure => {
                self.state = HandshakeState::Rejected;
                Err(HandshakeError::Rejected)
            }
            AuthResponse::Success {
                params,
                server_nonce,
                proof,
            } => {
                self.psk
                    .response_mac(&self.client_nonce, &server_nonce, &params)?
                    .verify_slice(&proof)
                    .map_err(|_| HandshakeError::BadServerProof)?;

                let keys = self.psk.derive_keys(&self.client_nonce, &server_nonce, &params)?;
                let codec = Codec::new(Role::Client, params.client_id, &keys);
                self.state = HandshakeState::Established;
                Ok(Established { params, codec })
            }
        }
    }
}

/// What the server does with one `AuthRequest`
#[derive(Debug)]
pub enum AuthOutcome {
    Accepted {
        response: Vec<u8>,
        session: Established,
    },
    /// Send `response` and forget the peer
    Rejected { response: Vec<u8> },
    /// The peer resent a request already accepted; resend the same answer
    Retransmit { response: Vec<u8> },
}

#[derive(Debug)]
struct Answered {
    peer: SocketAddr,
    response: Vec<u8>,
}

/// Server side of the handshake.
///
/// Keeps no per-client state beyond a bounded memory of recent nonces.
#[derive(Debug)]
pub struct Authenticator {
    psk: PreSharedKey,
    next_client_id: u64,
    initial_sequence: u64,
    answered: HashMap<[u8; CHALLENGE_SIZE], Answered>,
    /// Accepted nonces, oldest first
    arrivals: VecDeque<(Instant, [u8; CHALLENGE_SIZE])>,
    memory: Duration,
    capacity: usize,
}

impl Authenticator {
    pub fn new(psk: PreSharedKey, initial_sequence: u64) -> Self {
        Self {
            psk,
            next_client_id: OsRng.next_u64() >> 16,
            initial_sequence,
            answered: HashMap::new(),
            arrivals: VecDeque::new(),
            memory: NONCE_MEMORY,
            capacity: NONCE_CAPACITY,
        }
    }

    /// Override how long and how many accepted nonces are remembered.
    pub fn with_nonce_memory(mut self, memory: Duration, capacity: usize) -> Self {
        self.memory = memory;
        self.capacity = capacity.max(1);
        self
    }

    fn forget_oldest(&mut self) {
        if let Some((_, nonce)) = self.arrivals.pop_front() {
            self.answered.remove(&nonce);
        }
    }

    fn forget_expired(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.arrivals.front() {
            if now.duration_since(at) < self.memory {
                break;
            }
            self.forget_oldest();
        }
    }

    fn remember(
        &mut self,
        now: Instant,
        nonce: [u8; CHALLENGE_SIZE],
        peer: SocketAddr,
        response: &[u8],
    ) {
        while self.arrivals.len() >= self.capacity {
            self.forget_oldest();
        }
        self.arrivals.push_back((now, nonce));
        self.answered.insert(
            nonce,
            Answered {
                peer,
                response: response.to_vec(),
            },
        );
    }

    fn allocate_client_id(&mut self) -> u64 {
        loop {
            let id = self.next_client_id;
            self.next_client_id = self.next_client_id.wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Verify an `AuthRequest` envelope from `peer` and build the answer.
    ///
    /// Malformed input and replays are errors and get no answer at all.
    pub fn respond(
        &mut self,
        peer: SocketAddr,
        wire: &[u8],
    ) -> Result<AuthOutcome, HandshakeError> {
        let (_, message) = HandshakeMessage::from_envelope(wire)?;
        let HandshakeMessage::AuthRequest {
            client_nonce,
            proof,
        } = message
        else {
            return Err(HandshakeError::UnexpectedMessage);
        };

        if self
            .psk
            .request_mac(&client_nonce)?
            .verify_slice(&proof)
            .is_err()
        {
            tracing::warn!("authentication failed: bad pre-shared key proof");
            return Ok(AuthOutcome::Rejected {
                response: HandshakeMessage::AuthResponse(AuthResponse::Failure).to_envelope(0),
            });
        }

        let now = Instant::now();
        self.forget_expired(now);
        if let Some(answered) = self.answered.get(&client_nonce) {
            if answered.peer != peer {
                tracing::warn!(%peer, first = %answered.peer, "replayed auth request dropped");
                return Err(HandshakeError::Replayed);
            }
            return Ok(AuthOutcome::Retransmit {
                response: answered.response.clone(),
            });
        }

        let params = SessionParams {
            client_id: self.allocate_client_id(),
            initial_sequence: self.initial_sequence,
        };
        let server_nonce = random_challenge();
        let server_proof = to_proof(self.psk.response_mac(&client_nonce, &server_nonce, &params)?);
        let keys = self.psk.derive_keys(&client_nonce, &server_nonce, &params)?;

        let response = HandshakeMessage::AuthResponse(AuthResponse::Success {
            params,
            server_nonce,
            proof: server_proof,
        })
        .to_envelope(params.client_id);
        self.remember(now, client_nonce, peer, &response);

        Ok(AuthOutcome::Accepted {
            response,
            session: Established {
                params,
                codec: Codec::new(Role::Server, params.client_id, &keys),
            },
        })
    }
}
