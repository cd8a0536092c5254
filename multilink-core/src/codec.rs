//! Authenticated encryption of tunnel envelopes.
//!
//! Each session owns one key per direction. The AEAD nonce is never random:
//! it is built from the direction, the channel (data or probe) and the
//! envelope sequence number, so a sequence number must never be sealed twice
//! in the same direction.
//!
//! The encoded envelope header is authenticated as associated data, which binds
//! the type, client id and sequence to the ciphertext.

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::proto::{Envelope, EnvelopeHeader, PacketType, AUTH_TAG_SIZE};

/// Size of ChaCha20Poly1305 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of nonce in bytes
const NONCE_SIZE: usize = 12;

const NONCE_DOMAIN_CLIENT_TO_SERVER: u32 = 0x43325300; // "C2S\0"
const NONCE_DOMAIN_SERVER_TO_CLIENT: u32 = 0x53324300; // "S2C\0"

const CHANNEL_DATA: u32 = b'D' as u32;
const CHANNEL_PROBE: u32 = b'P' as u32;

/// Which end of the tunnel a codec belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

/// Direction of travel for one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    /// Direction of envelopes this role sends.
    pub fn outbound(role: Role) -> Self {
        match role {
            Role::Client => Direction::ClientToServer,
            Role::Server => Direction::ServerToClient,
        }
    }

    /// Direction of envelopes this role receives.
    pub fn inbound(role: Role) -> Self {
        match role {
            Role::Client => Direction::ServerToClient,
            Role::Server => Direction::ClientToServer,
        }
    }

    fn domain(self) -> u32 {
        match self {
            Direction::ClientToServer => NONCE_DOMAIN_CLIENT_TO_SERVER,
            Direction::ServerToClient => NONCE_DOMAIN_SERVER_TO_CLIENT,
        }
    }
}

/// Derive the nonce for one envelope.
///
/// Layout: `[ direction domain (3) | channel (1) | sequence (8) ]`.
pub fn nonce_for(direction: Direction, packet_type: PacketType, sequence: u64) -> [u8; NONCE_SIZE] {
    let channel = match packet_type {
        PacketType::Probe | PacketType::ProbeAck => CHANNEL_PROBE,
        PacketType::Data | PacketType::Handshake => CHANNEL_DATA,
    };
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[0..4].copy_from_slice(&(direction.domain() | channel).to_be_bytes());
    nonce[4..12].copy_from_slice(&sequence.to_be_bytes());
    nonce
}

/// Directional key material for one session. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    client_to_server: [u8; KEY_SIZE],
    server_to_client: [u8; KEY_SIZE],
}

impl SessionKeys {
    pub fn new(client_to_server: [u8; KEY_SIZE], server_to_client: [u8; KEY_SIZE]) -> Self {
        Self {
            client_to_server,
            server_to_client,
        }
    }

    /// Generate a fresh random key pair
    pub fn generate() -> Self {
        let mut keys = Self::new([0u8; KEY_SIZE], [0u8; KEY_SIZE]);
        OsRng.fill_bytes(&mut keys.client_to_server);
        OsRng.fill_bytes(&mut keys.server_to_client);
        keys
    }

    fn for_direction(&self, direction: Direction) -> &[u8; KEY_SIZE] {
        match direction {
            Direction::ClientToServer => &self.client_to_server,
            Direction::ServerToClient => &self.server_to_client,
        }
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

/// Codec errors.
///
/// Every inbound failure collapses into [`CodecError::Rejected`] so callers
/// cannot tell a bad tag from a truncated or misaddressed envelope.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("packet type {0} is not sealed")]
    NotSealed(PacketType),

    #[error("Encryption error")]
    Encryption,

    #[error("envelope rejected")]
    Rejected,
}

/// A successfully authenticated inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opened {
    pub packet_type: PacketType,
    pub sequence: u64,
    pub payload: Vec<u8>,
}

/// Envelope encryptor/decryptor for one session.
///
/// Both directional ciphers are installed at construction, so a codec is
/// never observable with partial key material.
pub struct Codec {
    role: Role,
    client_id: u64,
    seal: ChaCha20Poly1305,
    open: ChaCha20Poly1305,
}

impl Codec {
    pub fn new(role: Role, client_id: u64, keys: &SessionKeys) -> Self {
        let seal_key = keys.for_direction(Direction::outbound(role));
        let open_key = keys.for_direction(Direction::inbound(role));
        Self {
            role,
            client_id,
            seal: ChaCha20Poly1305::new(Key::from_slice(seal_key)),
            open: ChaCha20Poly1305::new(Key::from_slice(open_key)),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Seal `plaintext` into a complete wire envelope.
    pub fn encapsulate(
        &self,
        packet_type: PacketType,
        sequence: u64,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CodecError> {
        if !packet_type.is_sealed() {
            return Err(CodecError::NotSealed(packet_type));
        }

        let header = EnvelopeHeader::new(packet_type, self.client_id, sequence);
        let aad = header.encode();
        let nonce = nonce_for(Direction::outbound(self.role), packet_type, sequence);

        let mut wire = Vec::with_capacity(EnvelopeHeader::SIZE + plaintext.len() + AUTH_TAG_SIZE);
        wire.extend_from_slice(&aad);
        wire.extend_from_slice(plaintext);

        let tag = self
            .seal
            .encrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                &aad,
                &mut wire[EnvelopeHeader::SIZE..],
            )
            .map_err(|_| CodecError::Encryption)?;
        wire.extend_from_slice(tag.as_slice());
        Ok(wire)
    }

    /// Authenticate and decrypt one wire envelope.
    pub fn decapsulate(&self, wire: &[u8]) -> Result<Opened, CodecError> {
        let envelope = Envelope::decode(wire).map_err(|_| CodecError::Rejected)?;
        let header = envelope.header;
        if !header.packet_type.is_sealed() || header.client_id != self.client_id {
            return Err(CodecError::Rejected);
        }

        let mut body = envelope.body;
        let split = body
            .len()
            .checked_sub(AUTH_TAG_SIZE)
            .ok_or(CodecError::Rejected)?;
        let tag = Tag::clone_from_slice(&body[split..]);
        body.truncate(split);

        let nonce = nonce_for(
            Direction::inbound(self.role),
            header.packet_type,
            header.sequence,
        );
        self.open
            .decrypt_in_place_detached(Nonce::from_slice(&nonce), &header.encode(), &mut body, &tag)
            .map_err(|_| CodecError::Rejected)?;

        Ok(Opened {
            packet_type: header.packet_type,
            sequence: header.sequence,
            payload: body,
        })
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("role", &self.role)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}
