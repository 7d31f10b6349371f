// outpost-comms/src/communicator.rs
// ============================================================================
// Module: Outpost Communicator
// Description: Message bundling over the cipher layer.
// Purpose: Pack, compress, encrypt, and authenticate message bundles.
// Dependencies: crate::{crypto, wire}, flate2, outpost-core
// ============================================================================

//! ## Overview
//! The communicator packs an ordered message list with a microsecond
//! timestamp nonce, compresses it when zlib shrinks it, and hands the result
//! to the cipher layer. On receive it verifies the HMAC before decrypting,
//! resolves and verifies the sender, and returns typed messages with their
//! authentication state. Per-peer cipher sessions are cached for a day.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use thiserror::Error;

use outpost_core::AgentMessage;
use outpost_core::AuthState;
use outpost_core::ClientId;
use outpost_core::DurationMicros;
use outpost_core::IdParseError;
use outpost_core::Payload;
use outpost_core::PayloadError;
use outpost_core::Priority;
use outpost_core::RequestId;
use outpost_core::ResponseBody;
use outpost_core::ResponseId;
use outpost_core::SessionId;
use outpost_core::Status;
use outpost_core::Timestamp;
use outpost_core::hashing::canonical_json_bytes;

use crate::crypto::Cipher;
use crate::crypto::CryptoError;
use crate::crypto::PrivateKey;
use crate::crypto::PublicKey;
use crate::wire::API_VERSION;
use crate::wire::ClientCommunication;
use crate::wire::CompressionType;
use crate::wire::PackedMessageList;
use crate::wire::WireError;
use crate::wire::WireMessage;
use crate::wire::WireMessageType;
use crate::wire::decode_message_list;
use crate::wire::encode_message_list;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Lifetime of a cached per-peer cipher session.
const CIPHER_CACHE_TTL: DurationMicros = DurationMicros::from_secs(24 * 3600);
/// Payload type name used for terminal statuses on the wire.
const STATUS_TYPE_NAME: &str = "Status";
/// Payload type name used for iterator continuations on the wire.
const ITERATOR_TYPE_NAME: &str = "Iterator";
/// Microseconds per second, for quota conversions.
const MICROS_PER_SECOND_F64: f64 = 1_000_000.0;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Communicator errors.
#[derive(Debug, Error)]
pub enum CommsError {
    /// Wire codec failure.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// Cipher layer failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// Typed payload failure.
    #[error(transparent)]
    Payload(#[from] PayloadError),
    /// Bundle decompression failure.
    #[error("decompression failed: {0}")]
    Decompression(String),
    /// A message carried a malformed identifier.
    #[error(transparent)]
    Id(#[from] IdParseError),
}

// ============================================================================
// SECTION: Peer Resolution
// ============================================================================

/// Source of peer public keys by common name.
pub trait PeerKeyResolver: Send + Sync {
    /// Resolves the public key pinned for a peer.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnknownPeer`] when the peer is not known.
    fn resolve(&self, common_name: &str) -> Result<PublicKey, CryptoError>;
}

/// Static peer key table, used by tests and by agents (which pin exactly one
/// server key).
#[derive(Debug, Default)]
pub struct StaticPeerKeys {
    /// Common name to public key map.
    keys: HashMap<String, PublicKey>,
}

impl StaticPeerKeys {
    /// Creates a table from `(common_name, key)` pairs.
    #[must_use]
    pub fn new(keys: impl IntoIterator<Item = (String, PublicKey)>) -> Self {
        Self { keys: keys.into_iter().collect() }
    }
}

impl PeerKeyResolver for StaticPeerKeys {
    fn resolve(&self, common_name: &str) -> Result<PublicKey, CryptoError> {
        self.keys
            .get(common_name)
            .cloned()
            .ok_or_else(|| CryptoError::UnknownPeer(common_name.to_string()))
    }
}

// ============================================================================
// SECTION: Decoded Bundle
// ============================================================================

/// Result of decoding one inbound bundle.
#[derive(Debug)]
pub struct DecodedBundle {
    /// Decoded messages with their authentication state applied.
    pub messages: Vec<AgentMessage>,
    /// Sender common name from the cipher metadata.
    pub source: String,
    /// Bundle nonce (the packed timestamp).
    pub nonce: i64,
    /// True when the sender verified against a pinned key and, if an
    /// expected nonce was supplied, the nonce matched.
    pub authenticated: bool,
}

// ============================================================================
// SECTION: Communicator
// ============================================================================

/// Cached cipher session with its creation time.
struct CachedCipher {
    /// The session.
    cipher: Cipher,
    /// Creation time.
    created_at: Timestamp,
}

/// Encoder/decoder of message bundles for one identity.
pub struct Communicator {
    /// Our common name, embedded in signed cipher metadata.
    common_name: String,
    /// Our long-lived private key.
    private_key: PrivateKey,
    /// Peer public key source.
    peers: Arc<dyn PeerKeyResolver>,
    /// Per-peer session cache.
    sessions: Mutex<HashMap<String, CachedCipher>>,
    /// Bytes received by this process.
    received_bytes: AtomicU64,
    /// Bytes sent by this process.
    sent_bytes: AtomicU64,
}

impl Communicator {
    /// Creates a communicator for one identity.
    #[must_use]
    pub fn new(
        common_name: impl Into<String>,
        private_key: PrivateKey,
        peers: Arc<dyn PeerKeyResolver>,
    ) -> Self {
        Self {
            common_name: common_name.into(),
            private_key,
            peers,
            sessions: Mutex::new(HashMap::new()),
            received_bytes: AtomicU64::new(0),
            sent_bytes: AtomicU64::new(0),
        }
    }

    /// Returns our common name.
    #[must_use]
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// Returns total bytes received.
    #[must_use]
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    /// Returns total bytes sent.
    #[must_use]
    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    /// Returns the cached session for a peer, deriving one when absent or
    /// stale.
    fn session_for(&self, peer: &str, now: Timestamp) -> Result<Cipher, CommsError> {
        if let Ok(guard) = self.sessions.lock()
            && let Some(cached) = guard.get(peer)
            && now.since(cached.created_at) < CIPHER_CACHE_TTL
        {
            return Ok(cached.cipher.clone());
        }
        let peer_key = self.peers.resolve(peer)?;
        let cipher = Cipher::new(&self.common_name, &self.private_key, &peer_key)?;
        if let Ok(mut guard) = self.sessions.lock() {
            guard.insert(
                peer.to_string(),
                CachedCipher { cipher: cipher.clone(), created_at: now },
            );
        }
        Ok(cipher)
    }

    // ------------------------------------------------------------------
    // Encoding
    // ------------------------------------------------------------------

    /// Encodes a bundle for a peer using `timestamp` as the nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CommsError`] when the peer is unknown or encoding fails.
    pub fn encode_bundle(
        &self,
        peer: &str,
        messages: &[AgentMessage],
        timestamp: Timestamp,
        now: Timestamp,
    ) -> Result<Vec<u8>, CommsError> {
        let cipher = self.session_for(peer, now)?;

        let wire_messages: Vec<WireMessage> =
            messages.iter().map(agent_to_wire).collect::<Result<_, _>>()?;
        let serialized = encode_message_list(&wire_messages);

        // Only compress when it buys us something.
        let compressed = zlib_compress(&serialized)?;
        let (message_list, compression) = if compressed.len() < serialized.len() {
            (compressed, CompressionType::Zlib)
        } else {
            (serialized, CompressionType::Uncompressed)
        };

        let packed = PackedMessageList {
            message_list,
            compression,
            timestamp: timestamp.as_micros(),
            source: self.common_name.clone(),
        };
        let (packet_iv, encrypted) = cipher.encrypt(&packed.encode())?;
        let record = ClientCommunication {
            hmac: cipher.legacy_hmac(&encrypted)?,
            full_hmac: cipher.full_hmac(&encrypted, &packet_iv, API_VERSION)?,
            encrypted_cipher: cipher.encrypted_cipher.clone(),
            encrypted_cipher_metadata: cipher.encrypted_cipher_metadata.clone(),
            packet_iv,
            encrypted,
            api_version: API_VERSION,
            num_messages: u32::try_from(messages.len()).unwrap_or(u32::MAX),
        };
        let bytes = record.encode();
        self.sent_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(bytes)
    }

    // ------------------------------------------------------------------
    // Decoding
    // ------------------------------------------------------------------

    /// Decodes an inbound bundle.
    ///
    /// Verification order: HMAC first, decrypt second, sender signature
    /// third. An unknown sender yields an unauthenticated bundle (the
    /// enrollment path); a known sender with a bad signature is an error.
    /// When `expected_nonce` is supplied a mismatching nonce marks the whole
    /// bundle unauthenticated.
    ///
    /// # Errors
    ///
    /// Returns [`CommsError`] on HMAC mismatch, decryption failure, bad
    /// compression, or malformed payloads.
    pub fn decode_bundle(
        &self,
        bytes: &[u8],
        expected_nonce: Option<i64>,
    ) -> Result<DecodedBundle, CommsError> {
        self.received_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        let record = ClientCommunication::decode(bytes)?;
        let (cipher, metadata) = Cipher::from_received(
            &self.private_key,
            &record.encrypted_cipher,
            &record.encrypted_cipher_metadata,
        )?;

        // HMAC before decrypt; legacy short HMAC only for older peers.
        if record.api_version >= API_VERSION {
            cipher.verify_hmac(
                &record.full_hmac,
                &[
                    &record.encrypted,
                    &record.encrypted_cipher,
                    &record.encrypted_cipher_metadata,
                    &record.packet_iv,
                    &record.api_version.to_le_bytes(),
                ],
            )?;
        } else {
            cipher.verify_hmac(&record.hmac, &[&record.encrypted])?;
        }

        let plaintext = cipher.decrypt(&record.packet_iv, &record.encrypted)?;
        let packed = PackedMessageList::decode(&plaintext)?;
        let serialized = match packed.compression {
            CompressionType::Uncompressed => packed.message_list,
            CompressionType::Zlib => zlib_decompress(&packed.message_list)?,
        };
        let wire_messages = decode_message_list(&serialized)?;

        let mut authenticated = match self.peers.resolve(&metadata.source) {
            Ok(peer_key) => {
                cipher.verify_source(&metadata, &peer_key)?;
                true
            }
            Err(CryptoError::UnknownPeer(_)) => false,
            Err(err) => return Err(err.into()),
        };
        if let Some(expected) = expected_nonce
            && packed.timestamp != expected
        {
            authenticated = false;
        }

        let auth_state =
            if authenticated { AuthState::Authenticated } else { AuthState::Unauthenticated };
        let source_client: Option<ClientId> = metadata.source.parse().ok();
        let messages = wire_messages
            .into_iter()
            .map(|message| wire_to_agent(message, auth_state, source_client))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(DecodedBundle {
            messages,
            source: metadata.source,
            nonce: packed.timestamp,
            authenticated,
        })
    }
}

// ============================================================================
// SECTION: Message Conversion
// ============================================================================

/// Converts a typed message to its wire form.
fn agent_to_wire(message: &AgentMessage) -> Result<WireMessage, CommsError> {
    let (message_type, args_type_name, payload) = match &message.body {
        ResponseBody::Message(payload) => {
            (WireMessageType::Message, payload.type_name().to_string(), payload.encode_body()?)
        }
        ResponseBody::Status(status) => (
            WireMessageType::Status,
            STATUS_TYPE_NAME.to_string(),
            canonical_json_bytes(status)
                .map_err(|err| PayloadError::Encode(err.to_string()))?,
        ),
        ResponseBody::Iterator(value) => (
            WireMessageType::Iterator,
            ITERATOR_TYPE_NAME.to_string(),
            canonical_json_bytes(value)
                .map_err(|err| PayloadError::Encode(err.to_string()))?,
        ),
    };
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, reason = "quota seconds fit u64 micros")]
    let cpu_limit_micros = (message.cpu_limit_seconds * MICROS_PER_SECOND_F64) as u64;
    Ok(WireMessage {
        session_id: message.session_id.to_string(),
        request_id: message.request_id.as_raw(),
        response_id: message.response_id.as_raw(),
        name: message.name.clone().unwrap_or_default(),
        args_type_name,
        payload,
        source: message.source.map(|client| client.to_string()).unwrap_or_default(),
        auth_state: 0,
        message_type,
        task_id: message.task_id,
        cpu_limit_micros,
        network_bytes_limit: message.network_bytes_limit,
        require_fastpoll: message.require_fastpoll,
        priority: match message.priority {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
        },
    })
}

/// Converts a wire message to its typed form with the given auth state.
fn wire_to_agent(
    message: WireMessage,
    auth_state: AuthState,
    source_client: Option<ClientId>,
) -> Result<AgentMessage, CommsError> {
    let session_id: SessionId = message.session_id.parse()?;
    let body = match message.message_type {
        WireMessageType::Message => {
            ResponseBody::Message(Payload::decode(&message.args_type_name, &message.payload)?)
        }
        WireMessageType::Status => {
            let status: Status =
                serde_json::from_slice(&message.payload).map_err(|err| {
                    PayloadError::Malformed {
                        type_name: STATUS_TYPE_NAME.to_string(),
                        message: err.to_string(),
                    }
                })?;
            ResponseBody::Status(status)
        }
        WireMessageType::Iterator => {
            let value: serde_json::Value =
                serde_json::from_slice(&message.payload).map_err(|err| {
                    PayloadError::Malformed {
                        type_name: ITERATOR_TYPE_NAME.to_string(),
                        message: err.to_string(),
                    }
                })?;
            ResponseBody::Iterator(value)
        }
    };
    let source = if message.source.is_empty() {
        source_client
    } else {
        message.source.parse().ok().or(source_client)
    };
    #[allow(clippy::cast_precision_loss, reason = "quota micros fit f64 seconds")]
    let cpu_limit_seconds = message.cpu_limit_micros as f64 / MICROS_PER_SECOND_F64;
    Ok(AgentMessage {
        session_id,
        request_id: RequestId::from_raw(message.request_id),
        response_id: ResponseId::from_raw(message.response_id),
        name: if message.name.is_empty() { None } else { Some(message.name) },
        body,
        source,
        auth_state,
        task_id: message.task_id,
        cpu_limit_seconds,
        network_bytes_limit: message.network_bytes_limit,
        require_fastpoll: message.require_fastpoll,
        priority: match message.priority {
            0 => Priority::Low,
            2 => Priority::High,
            _ => Priority::Medium,
        },
    })
}

// ============================================================================
// SECTION: Compression
// ============================================================================

/// Zlib-compresses bytes.
fn zlib_compress(data: &[u8]) -> Result<Vec<u8>, CommsError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(|err| CommsError::Decompression(err.to_string()))?;
    encoder.finish().map_err(|err| CommsError::Decompression(err.to_string()))
}

/// Zlib-decompresses bytes, failing closed on malformed streams.
fn zlib_decompress(data: &[u8]) -> Result<Vec<u8>, CommsError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|err| CommsError::Decompression(err.to_string()))?;
    Ok(out)
}
