// outpost-comms/src/lib.rs
// ============================================================================
// Module: Outpost Comms Library
// Description: Public API surface for the Outpost communications layer.
// Purpose: Expose the wire codec, cipher layer, and communicator.
// Dependencies: crate::{communicator, crypto, wire}
// ============================================================================

//! ## Overview
//! The communications crate implements the agent transport: a tagged binary
//! wire codec, per-peer authenticated encryption over long-lived RSA
//! keypairs, and the communicator that packs, compresses, and seals message
//! bundles. The server front end and the agent both build on this crate.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod communicator;
pub mod crypto;
pub mod wire;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use communicator::CommsError;
pub use communicator::Communicator;
pub use communicator::DecodedBundle;
pub use communicator::PeerKeyResolver;
pub use communicator::StaticPeerKeys;
pub use crypto::CIPHER_NAME;
pub use crypto::Cipher;
pub use crypto::CryptoError;
pub use crypto::PrivateKey;
pub use crypto::PublicKey;
pub use crypto::RSA_KEY_BITS;
pub use crypto::sign_blob;
pub use crypto::verify_blob;
pub use wire::API_VERSION;
pub use wire::ClientCommunication;
pub use wire::CompressionType;
pub use wire::PackedMessageList;
pub use wire::WireError;
pub use wire::WireMessage;
pub use wire::WireMessageType;
pub use wire::decode_message_list;
pub use wire::encode_message_list;
