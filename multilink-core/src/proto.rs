//! Wire envelope for the multilink tunnel.
//!
//! Every datagram exchanged between client and server is exactly one envelope.
//! All multi-byte fields use network byte order (big-endian).
//!
//! # Envelope Format
//!
//! - Type (1 byte): Handshake, Data, Probe or ProbeAck
//! - Client ID (8 bytes): session owner, zero until the handshake assigns one
//! - Sequence (8 bytes): per-session, per-direction counter; for Probe and
//!   ProbeAck it carries the probe correlation token
//! - Body (variable): for Handshake a [`HandshakeMessage`], otherwise the AEAD
//!   ciphertext followed by a 16-byte authentication tag
//!
//! Total header size: 17 bytes. Probe and ProbeAck carry an empty plaintext, so
//! their body is the tag alone.

use std::fmt;

/// Size of the AEAD authentication tag (ChaCha20Poly1305)
pub const AUTH_TAG_SIZE: usize = 16;

/// Size of the random challenge each side contributes to the handshake
pub const CHALLENGE_SIZE: usize = 16;

/// Size of an HMAC-SHA256 handshake proof
pub const PROOF_SIZE: usize = 32;

/// Largest datagram either side will read off a socket
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Closed set of envelope types.
///
/// Anything else on the wire is a decode error, never a best-effort guess.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Handshake = 0x01,
    Data = 0x02,
    Probe = 0x03,
    ProbeAck = 0x04,
}

impl PacketType {
    /// Whether envelopes of this type carry an AEAD body.
    pub fn is_sealed(self) -> bool {
        !matches!(self, PacketType::Handshake)
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Handshake),
            0x02 => Ok(PacketType::Data),
            0x03 => Ok(PacketType::Probe),
            0x04 => Ok(PacketType::ProbeAck),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Handshake => "handshake",
            PacketType::Data => "data",
            PacketType::Probe => "probe",
            PacketType::ProbeAck => "probe-ack",
        };
        f.write_str(name)
    }
}

/// Fixed-size envelope header. Authenticated as AEAD associated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub packet_type: PacketType,
    pub client_id: u64,
    pub sequence: u64,
}

impl EnvelopeHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 17;

    pub fn new(packet_type: PacketType, client_id: u64, sequence: u64) -> Self {
        Self {
            packet_type,
            client_id,
            sequence,
        }
    }

    /// Encode header to bytes (network byte order)
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.packet_type as u8;
        buf[1..9].copy_from_slice(&self.client_id.to_be_bytes());
        buf[9..17].copy_from_slice(&self.sequence.to_be_bytes());
        buf
    }

    /// Decode header from the front of `buf` (network byte order)
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::SIZE {
            return Err(ProtocolError::InvalidLength {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }

        let packet_type = PacketType::try_from(buf[0])?;
        let client_id = read_u64(&buf[1..9]);
        let sequence = read_u64(&buf[9..17]);

        Ok(Self {
            packet_type,
            client_id,
            sequence,
        })
    }
}

/// Complete envelope: header plus opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub header: EnvelopeHeader,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(header: EnvelopeHeader, body: Vec<u8>) -> Self {
        Self { header, body }
    }

    /// Total size of the envelope in bytes
    pub fn total_size(&self) -> usize {
        EnvelopeHeader::SIZE + self.body.len()
    }

    /// Encode envelope to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.total_size());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Decode envelope from bytes.
    ///
    /// Sealed types must carry at least a tag; probes must carry exactly one.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let header = EnvelopeHeader::decode(buf)?;
        let body = &buf[EnvelopeHeader::SIZE..];

        match header.packet_type {
            PacketType::Handshake => {}
            PacketType::Data => {
                if body.len() < AUTH_TAG_SIZE {
                    return Err(ProtocolError::InvalidLength {
                        expected: EnvelopeHeader::SIZE + AUTH_TAG_SIZE,
                        actual: buf.len(),
                    });
                }
            }
            PacketType::Probe | PacketType::ProbeAck => {
                if body.len() != AUTH_TAG_SIZE {
                    return Err(ProtocolError::InvalidLength {
                        expected: EnvelopeHeader::SIZE + AUTH_TAG_SIZE,
                        actual: buf.len(),
                    });
                }
            }
        }

        Ok(Self {
            header,
            body: body.to_vec(),
        })
    }
}

/// Parameters the server hands out on a successful handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    pub client_id: u64,
    /// First sequence number used in both directions
    pub initial_sequence: u64,
}

/// Server verdict on an `AuthRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResponse {
    Success {
        params: SessionParams,
        server_nonce: [u8; CHALLENGE_SIZE],
        /// Proves the server holds the same secret
        proof: [u8; PROOF_SIZE],
    },
    Failure,
}

/// Body of a Handshake envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    AuthRequest {
        client_nonce: [u8; CHALLENGE_SIZE],
        proof: [u8; PROOF_SIZE],
    },
    AuthResponse(AuthResponse),
}

const MSG_AUTH_REQUEST: u8 = 0x01;
const MSG_AUTH_RESPONSE: u8 = 0x02;
const STATUS_SUCCESS: u8 = 0x00;
const STATUS_FAILURE: u8 = 0x01;

const AUTH_REQUEST_LEN: usize = 1 + CHALLENGE_SIZE + PROOF_SIZE;
const AUTH_SUCCESS_LEN: usize = 2 + 8 + 8 + CHALLENGE_SIZE + PROOF_SIZE;
const AUTH_FAILURE_LEN: usize = 2;

impl HandshakeMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            HandshakeMessage::AuthRequest {
                client_nonce,
                proof,
            } => {
                let mut buf = Vec::with_capacity(AUTH_REQUEST_LEN);
                buf.push(MSG_AUTH_REQUEST);
                buf.extend_from_slice(client_nonce);
                buf.extend_from_slice(proof);
                buf
            }
            HandshakeMessage::AuthResponse(AuthResponse::Success {
                params,
                server_nonce,
                proof,
            }) => {
                let mut buf = Vec::with_capacity(AUTH_SUCCESS_LEN);
                buf.push(MSG_AUTH_RESPONSE);
                buf.push(STATUS_SUCCESS);
                buf.extend_from_slice(&params.client_id.to_be_bytes());
                buf.extend_from_slice(&params.initial_sequence.to_be_bytes());
                buf.extend_from_slice(server_nonce);
                buf.extend_from_slice(proof);
                buf
            }
            HandshakeMessage::AuthResponse(AuthResponse::Failure) => {
                vec![MSG_AUTH_RESPONSE, STATUS_FAILURE]
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let Some(&kind) = buf.first() else {
            return Err(ProtocolError::InvalidLength {
                expected: 1,
                actual: 0,
            });
        };

        match kind {
            MSG_AUTH_REQUEST => {
                expect_len(buf, AUTH_REQUEST_LEN)?;
                let mut client_nonce = [0u8; CHALLENGE_SIZE];
                client_nonce.copy_from_slice(&buf[1..1 + CHALLENGE_SIZE]);
                let mut proof = [0u8; PROOF_SIZE];
                proof.copy_from_slice(&buf[1 + CHALLENGE_SIZE..]);
                Ok(HandshakeMessage::AuthRequest {
                    client_nonce,
                    proof,
                })
            }
            MSG_AUTH_RESPONSE => {
                let status = *buf.get(1).ok_or(ProtocolError::InvalidLength {
                    expected: AUTH_FAILURE_LEN,
                    actual: buf.len(),
                })?;
                match status {
                    STATUS_SUCCESS => {
                        expect_len(buf, AUTH_SUCCESS_LEN)?;
                        let params = SessionParams {
                            client_id: read_u64(&buf[2..10]),
                            initial_sequence: read_u64(&buf[10..18]),
                        };
                        let mut server_nonce = [0u8; CHALLENGE_SIZE];
                        server_nonce.copy_from_slice(&buf[18..18 + CHALLENGE_SIZE]);
                        let mut proof = [0u8; PROOF_SIZE];
                        proof.copy_from_slice(&buf[18 + CHALLENGE_SIZE..]);
                        Ok(HandshakeMessage::AuthResponse(AuthResponse::Success {
                            params,
                            server_nonce,
                            proof,
                        }))
                    }
                    STATUS_FAILURE => {
                        expect_len(buf, AUTH_FAILURE_LEN)?;
                        Ok(HandshakeMessage::AuthResponse(AuthResponse::Failure))
                    }
                    other => Err(ProtocolError::UnknownAuthStatus(other)),
                }
            }
            other => Err(ProtocolError::UnknownHandshakeMessage(other)),
        }
    }

    /// Wrap this message in a Handshake envelope.
    pub fn to_envelope(&self, client_id: u64) -> Vec<u8> {
        Envelope::new(
            EnvelopeHeader::new(PacketType::Handshake, client_id, 0),
            self.encode(),
        )
        .encode()
    }

    /// Parse a Handshake envelope, rejecting any other type.
    pub fn from_envelope(wire: &[u8]) -> Result<(EnvelopeHeader, Self), ProtocolError> {
        let envelope = Envelope::decode(wire)?;
        if envelope.header.packet_type != PacketType::Handshake {
            return Err(ProtocolError::UnexpectedPacketType(
                envelope.header.packet_type,
            ));
        }
        let message = Self::decode(&envelope.body)?;
        Ok((envelope.header, message))
    }
}

fn expect_len(buf: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if buf.len() != expected {
        return Err(ProtocolError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn read_u64(buf: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[..8]);
    u64::from_be_bytes(raw)
}

/// Protocol-related errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown packet type: 0x{0:02X}")]
    UnknownPacketType(u8),

    #[error("Unexpected packet type: {0}")]
    UnexpectedPacketType(PacketType),

    #[error("Invalid packet length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Unknown handshake message: 0x{0:02X}")]
    UnknownHandshakeMessage(u8),

    #[error("Unknown auth status: 0x{0:02X}")]
    UnknownAuthStatus(u8),
}
