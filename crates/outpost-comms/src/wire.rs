// outpost-comms/src/wire.rs
// ============================================================================
// Module: Outpost Wire Codec
// Description: Tagged binary record encoding for the agent transport.
// Purpose: Encode and decode transport records with strict, bounded parsing.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! The agent transport uses a compact tagged record encoding: each field is a
//! varint key `(tag << 3) | wire_type` followed by a varint value or a
//! length-delimited byte run. Unknown fields are skipped so record layouts
//! can grow; truncated or oversized input fails closed. The record layouts in
//! this module are the canonical wire contract and must not be reordered.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Wire type for varint-encoded scalars.
const WIRE_VARINT: u64 = 0;
/// Wire type for length-delimited byte runs.
const WIRE_BYTES: u64 = 2;
/// Maximum accepted length of a single length-delimited field.
const MAX_FIELD_BYTES: u64 = 64 * 1024 * 1024;

/// Current transport API version.
pub const API_VERSION: u32 = 3;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Wire codec errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Input ended inside a field.
    #[error("truncated wire input")]
    Truncated,
    /// A varint ran past its maximum width.
    #[error("malformed varint")]
    MalformedVarint,
    /// A length-delimited field exceeded the size bound.
    #[error("wire field too large: {0} bytes")]
    FieldTooLarge(u64),
    /// The wire type is not supported.
    #[error("unsupported wire type: {0}")]
    UnsupportedWireType(u64),
    /// A required field is missing from the record.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    /// A field held an invalid value.
    #[error("invalid field value: {0}")]
    InvalidField(&'static str),
}

// ============================================================================
// SECTION: Writer
// ============================================================================

/// Append-only wire record writer.
#[derive(Debug, Default)]
pub struct WireWriter {
    /// Encoded bytes.
    buffer: Vec<u8>,
}

impl WireWriter {
    /// Creates an empty writer.
    #[must_use]
    pub const fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Returns the encoded bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Writes a raw varint.
    fn put_varint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buffer.push(byte);
                return;
            }
            self.buffer.push(byte | 0x80);
        }
    }

    /// Writes a varint scalar field. Zero values are written explicitly so
    /// records round-trip without presence ambiguity.
    pub fn field_u64(&mut self, tag: u64, value: u64) {
        self.put_varint((tag << 3) | WIRE_VARINT);
        self.put_varint(value);
    }

    /// Writes a length-delimited bytes field.
    pub fn field_bytes(&mut self, tag: u64, value: &[u8]) {
        self.put_varint((tag << 3) | WIRE_BYTES);
        self.put_varint(value.len() as u64);
        self.buffer.extend_from_slice(value);
    }

    /// Writes a UTF-8 string field.
    pub fn field_str(&mut self, tag: u64, value: &str) {
        self.field_bytes(tag, value.as_bytes());
    }
}

// ============================================================================
// SECTION: Reader
// ============================================================================

/// One decoded field.
#[derive(Debug)]
pub enum WireField<'a> {
    /// Varint scalar.
    Varint(u64),
    /// Length-delimited bytes.
    Bytes(&'a [u8]),
}

impl<'a> WireField<'a> {
    /// Returns the scalar value.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::InvalidField`] when the field is not a scalar.
    pub const fn as_u64(&self, name: &'static str) -> Result<u64, WireError> {
        match self {
            Self::Varint(value) => Ok(*value),
            Self::Bytes(_) => Err(WireError::InvalidField(name)),
        }
    }

    /// Returns the byte run.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::InvalidField`] when the field is not bytes.
    pub const fn as_bytes(&self, name: &'static str) -> Result<&'a [u8], WireError> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            Self::Varint(_) => Err(WireError::InvalidField(name)),
        }
    }

    /// Returns the byte run as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::InvalidField`] for non-bytes or non-UTF-8 data.
    pub fn as_str(&self, name: &'static str) -> Result<&'a str, WireError> {
        std::str::from_utf8(self.as_bytes(name)?).map_err(|_| WireError::InvalidField(name))
    }
}

/// Forward-only wire record reader.
#[derive(Debug)]
pub struct WireReader<'a> {
    /// Remaining input.
    input: &'a [u8],
}

impl<'a> WireReader<'a> {
    /// Creates a reader over the input.
    #[must_use]
    pub const fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    /// Returns true when the input is fully consumed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    /// Reads a raw varint.
    fn get_varint(&mut self) -> Result<u64, WireError> {
        let mut value: u64 = 0;
        for shift in 0..10u32 {
            let (byte, rest) = self.input.split_first().ok_or(WireError::Truncated)?;
            self.input = rest;
            let part = u64::from(byte & 0x7f);
            value |= part
                .checked_shl(shift * 7)
                .ok_or(WireError::MalformedVarint)?;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(WireError::MalformedVarint)
    }

    /// Reads the next `(tag, field)` pair, or `None` at end of input.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on malformed input.
    pub fn next_field(&mut self) -> Result<Option<(u64, WireField<'a>)>, WireError> {
        if self.input.is_empty() {
            return Ok(None);
        }
        let key = self.get_varint()?;
        let tag = key >> 3;
        match key & 0x07 {
            WIRE_VARINT => Ok(Some((tag, WireField::Varint(self.get_varint()?)))),
            WIRE_BYTES => {
                let length = self.get_varint()?;
                if length > MAX_FIELD_BYTES {
                    return Err(WireError::FieldTooLarge(length));
                }
                let length = usize::try_from(length).map_err(|_| WireError::FieldTooLarge(u64::MAX))?;
                if self.input.len() < length {
                    return Err(WireError::Truncated);
                }
                let (bytes, rest) = self.input.split_at(length);
                self.input = rest;
                Ok(Some((tag, WireField::Bytes(bytes))))
            }
            other => Err(WireError::UnsupportedWireType(other)),
        }
    }
}

// ============================================================================
// SECTION: Client Communication Record
// ============================================================================

/// Top-level transport record posted to `/control`.
///
/// Field tags are the canonical wire contract and must not change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientCommunication {
    /// RSA-encrypted serialized cipher properties.
    pub encrypted_cipher: Vec<u8>,
    /// AES-encrypted signed cipher metadata.
    pub encrypted_cipher_metadata: Vec<u8>,
    /// Fresh per-packet IV (16 bytes).
    pub packet_iv: Vec<u8>,
    /// AES-CBC ciphertext of the serialized packed message list.
    pub encrypted: Vec<u8>,
    /// Legacy HMAC over the ciphertext only (32 bytes).
    pub hmac: Vec<u8>,
    /// Full HMAC over ciphertext, cipher, metadata, IV, and version.
    pub full_hmac: Vec<u8>,
    /// Transport API version.
    pub api_version: u32,
    /// Number of messages in the bundle.
    pub num_messages: u32,
}

impl ClientCommunication {
    /// Encodes the record.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = WireWriter::new();
        writer.field_bytes(1, &self.encrypted_cipher);
        writer.field_bytes(2, &self.encrypted_cipher_metadata);
        writer.field_bytes(3, &self.packet_iv);
        writer.field_bytes(4, &self.encrypted);
        writer.field_bytes(5, &self.hmac);
        writer.field_bytes(6, &self.full_hmac);
        writer.field_u64(7, u64::from(self.api_version));
        writer.field_u64(8, u64::from(self.num_messages));
        writer.into_bytes()
    }

    /// Decodes the record.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on malformed input.
    pub fn decode(input: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut reader = WireReader::new(input);
        while let Some((tag, field)) = reader.next_field()? {
            match tag {
                1 => record.encrypted_cipher = field.as_bytes("encrypted_cipher")?.to_vec(),
                2 => {
                    record.encrypted_cipher_metadata =
                        field.as_bytes("encrypted_cipher_metadata")?.to_vec();
                }
                3 => record.packet_iv = field.as_bytes("packet_iv")?.to_vec(),
                4 => record.encrypted = field.as_bytes("encrypted")?.to_vec(),
                5 => record.hmac = field.as_bytes("hmac")?.to_vec(),
                6 => record.full_hmac = field.as_bytes("full_hmac")?.to_vec(),
                7 => {
                    record.api_version = u32::try_from(field.as_u64("api_version")?)
                        .map_err(|_| WireError::InvalidField("api_version"))?;
                }
                8 => {
                    record.num_messages = u32::try_from(field.as_u64("num_messages")?)
                        .map_err(|_| WireError::InvalidField("num_messages"))?;
                }
                _ => {}
            }
        }
        Ok(record)
    }
}

// ============================================================================
// SECTION: Packed Message List
// ============================================================================

/// Compression applied to a packed message list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompressionType {
    /// No compression.
    #[default]
    Uncompressed,
    /// Zlib compression.
    Zlib,
}

/// Encrypted payload of one bundle: the serialized message list plus nonce.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackedMessageList {
    /// Serialized (possibly compressed) message list.
    pub message_list: Vec<u8>,
    /// Compression applied to `message_list`.
    pub compression: CompressionType,
    /// Microsecond timestamp doubling as the bundle nonce.
    pub timestamp: i64,
    /// Sender common name or client id.
    pub source: String,
}

impl PackedMessageList {
    /// Encodes the record.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = WireWriter::new();
        writer.field_bytes(1, &self.message_list);
        let compression = match self.compression {
            CompressionType::Uncompressed => 0,
            CompressionType::Zlib => 1,
        };
        writer.field_u64(2, compression);
        writer.field_u64(3, self.timestamp.cast_unsigned());
        writer.field_str(4, &self.source);
        writer.into_bytes()
    }

    /// Decodes the record.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on malformed input.
    pub fn decode(input: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut reader = WireReader::new(input);
        while let Some((tag, field)) = reader.next_field()? {
            match tag {
                1 => record.message_list = field.as_bytes("message_list")?.to_vec(),
                2 => {
                    record.compression = match field.as_u64("compression")? {
                        0 => CompressionType::Uncompressed,
                        1 => CompressionType::Zlib,
                        _ => return Err(WireError::InvalidField("compression")),
                    };
                }
                3 => record.timestamp = field.as_u64("timestamp")?.cast_signed(),
                4 => record.source = field.as_str("source")?.to_string(),
                _ => {}
            }
        }
        Ok(record)
    }
}

// ============================================================================
// SECTION: Wire Message
// ============================================================================

/// Message body kind on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireMessageType {
    /// Regular payload.
    #[default]
    Message,
    /// Terminal status.
    Status,
    /// Iterator continuation.
    Iterator,
}

/// One message on the wire, payload still encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireMessage {
    /// Routing session id.
    pub session_id: String,
    /// Request id within the session.
    pub request_id: u64,
    /// Response ordinal within the request.
    pub response_id: u64,
    /// Action name (outbound requests only).
    pub name: String,
    /// Registered payload type name.
    pub args_type_name: String,
    /// Encoded payload bytes.
    pub payload: Vec<u8>,
    /// Originating client id string.
    pub source: String,
    /// Authentication state (assigned on receive, ignored from the wire).
    pub auth_state: u32,
    /// Message body kind.
    pub message_type: WireMessageType,
    /// Outbound queue task id.
    pub task_id: u64,
    /// CPU budget in microseconds; zero unlimited.
    pub cpu_limit_micros: u64,
    /// Network budget in bytes; zero unlimited.
    pub network_bytes_limit: u64,
    /// Fast-poll hint.
    pub require_fastpoll: bool,
    /// Delivery priority.
    pub priority: u32,
}

impl WireMessage {
    /// Encodes the record.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = WireWriter::new();
        writer.field_str(1, &self.session_id);
        writer.field_u64(2, self.request_id);
        writer.field_u64(3, self.response_id);
        writer.field_str(4, &self.name);
        writer.field_str(5, &self.args_type_name);
        writer.field_bytes(6, &self.payload);
        writer.field_str(7, &self.source);
        writer.field_u64(8, u64::from(self.auth_state));
        let message_type = match self.message_type {
            WireMessageType::Message => 0,
            WireMessageType::Status => 1,
            WireMessageType::Iterator => 2,
        };
        writer.field_u64(9, message_type);
        writer.field_u64(10, self.task_id);
        writer.field_u64(11, self.cpu_limit_micros);
        writer.field_u64(12, self.network_bytes_limit);
        writer.field_u64(13, u64::from(self.require_fastpoll));
        writer.field_u64(14, u64::from(self.priority));
        writer.into_bytes()
    }

    /// Decodes the record.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on malformed input.
    pub fn decode(input: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut reader = WireReader::new(input);
        while let Some((tag, field)) = reader.next_field()? {
            match tag {
                1 => record.session_id = field.as_str("session_id")?.to_string(),
                2 => record.request_id = field.as_u64("request_id")?,
                3 => record.response_id = field.as_u64("response_id")?,
                4 => record.name = field.as_str("name")?.to_string(),
                5 => record.args_type_name = field.as_str("args_type_name")?.to_string(),
                6 => record.payload = field.as_bytes("payload")?.to_vec(),
                7 => record.source = field.as_str("source")?.to_string(),
                8 => {
                    record.auth_state = u32::try_from(field.as_u64("auth_state")?)
                        .map_err(|_| WireError::InvalidField("auth_state"))?;
                }
                9 => {
                    record.message_type = match field.as_u64("type")? {
                        0 => WireMessageType::Message,
                        1 => WireMessageType::Status,
                        2 => WireMessageType::Iterator,
                        _ => return Err(WireError::InvalidField("type")),
                    };
                }
                10 => record.task_id = field.as_u64("task_id")?,
                11 => record.cpu_limit_micros = field.as_u64("cpu_limit")?,
                12 => record.network_bytes_limit = field.as_u64("network_bytes_limit")?,
                13 => record.require_fastpoll = field.as_u64("require_fastpoll")? != 0,
                14 => {
                    record.priority = u32::try_from(field.as_u64("priority")?)
                        .map_err(|_| WireError::InvalidField("priority"))?;
                }
                _ => {}
            }
        }
        Ok(record)
    }
}

/// Encodes an ordered message list as repeated field 1.
#[must_use]
pub fn encode_message_list(messages: &[WireMessage]) -> Vec<u8> {
    let mut writer = WireWriter::new();
    for message in messages {
        writer.field_bytes(1, &message.encode());
    }
    writer.into_bytes()
}

/// Decodes an ordered message list.
///
/// # Errors
///
/// Returns [`WireError`] on malformed input.
pub fn decode_message_list(input: &[u8]) -> Result<Vec<WireMessage>, WireError> {
    let mut messages = Vec::new();
    let mut reader = WireReader::new(input);
    while let Some((tag, field)) = reader.next_field()? {
        if tag == 1 {
            messages.push(WireMessage::decode(field.as_bytes("message")?)?);
        }
    }
    Ok(messages)
}

// ============================================================================
// SECTION: Cipher Records
// ============================================================================

/// Symmetric session material, RSA-encrypted to the peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CipherProperties {
    /// Cipher suite name.
    pub name: String,
    /// AES-256 key (32 bytes).
    pub key: Vec<u8>,
    /// IV used to encrypt the cipher metadata (16 bytes).
    pub metadata_iv: Vec<u8>,
    /// HMAC-SHA-256 key (32 bytes).
    pub hmac_key: Vec<u8>,
}

impl CipherProperties {
    /// Encodes the record.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = WireWriter::new();
        writer.field_str(1, &self.name);
        writer.field_bytes(2, &self.key);
        writer.field_bytes(3, &self.metadata_iv);
        writer.field_bytes(4, &self.hmac_key);
        writer.into_bytes()
    }

    /// Decodes the record.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on malformed input or missing key material.
    pub fn decode(input: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut reader = WireReader::new(input);
        while let Some((tag, field)) = reader.next_field()? {
            match tag {
                1 => record.name = field.as_str("name")?.to_string(),
                2 => record.key = field.as_bytes("key")?.to_vec(),
                3 => record.metadata_iv = field.as_bytes("metadata_iv")?.to_vec(),
                4 => record.hmac_key = field.as_bytes("hmac_key")?.to_vec(),
                _ => {}
            }
        }
        if record.key.len() != 32 {
            return Err(WireError::InvalidField("key"));
        }
        if record.metadata_iv.len() != 16 {
            return Err(WireError::InvalidField("metadata_iv"));
        }
        if record.hmac_key.len() != 32 {
            return Err(WireError::InvalidField("hmac_key"));
        }
        Ok(record)
    }
}

/// Signed sender identity bound to a cipher session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CipherMetadata {
    /// Sender common name or client id.
    pub source: String,
    /// RSA signature over the serialized cipher properties.
    pub signature: Vec<u8>,
}

impl CipherMetadata {
    /// Encodes the record.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = WireWriter::new();
        writer.field_str(1, &self.source);
        writer.field_bytes(2, &self.signature);
        writer.into_bytes()
    }

    /// Decodes the record.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on malformed input.
    pub fn decode(input: &[u8]) -> Result<Self, WireError> {
        let mut record = Self::default();
        let mut reader = WireReader::new(input);
        while let Some((tag, field)) = reader.next_field()? {
            match tag {
                1 => record.source = field.as_str("source")?.to_string(),
                2 => record.signature = field.as_bytes("signature")?.to_vec(),
                _ => {}
            }
        }
        if record.signature.is_empty() {
            return Err(WireError::MissingField("signature"));
        }
        Ok(record)
    }
}
