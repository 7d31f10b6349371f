// outpost-comms/src/crypto.rs
// ============================================================================
// Module: Outpost Cipher Layer
// Description: Per-peer authenticated encryption for agent bundles.
// Purpose: Protect bundles against eavesdropping, tampering, replay, and
//          impersonation without a TLS client certificate on the agent.
// Dependencies: aes, cbc, hmac, rand, rsa, sha2
// ============================================================================

//! ## Overview
//! Each party owns a long-lived RSA keypair. For every peer a fresh symmetric
//! session is derived: a random AES-256 key, an HMAC-SHA-256 key, and a
//! metadata IV. The session material is RSA-OAEP encrypted to the peer and
//! accompanied by metadata signed with the sender's private key, so a packet
//! both identifies and authenticates its origin. Each packet carries a fresh
//! IV, the AES-CBC ciphertext, and HMACs binding ciphertext, session blobs,
//! IV, and API version together. Verification order is HMAC first, decrypt
//! second, signature third; any failure drops the bundle.

// ============================================================================
// SECTION: Imports
// ============================================================================

use aes::Aes256;
use aes::cipher::BlockDecryptMut;
use aes::cipher::BlockEncryptMut;
use aes::cipher::KeyIvInit;
use aes::cipher::block_padding::Pkcs7;
use hmac::Hmac;
use hmac::Mac;
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::Oaep;
use rsa::RsaPrivateKey;
use rsa::RsaPublicKey;
use rsa::pkcs1v15::Signature;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs1v15::VerifyingKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::pkcs8::EncodePrivateKey;
use rsa::pkcs8::EncodePublicKey;
use rsa::pkcs8::LineEnding;
use rsa::signature::SignatureEncoding;
use rsa::signature::Signer;
use rsa::signature::Verifier;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

use outpost_core::ClientId;

use crate::wire::CipherMetadata;
use crate::wire::CipherProperties;
use crate::wire::WireError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Cipher suite name carried in serialized cipher properties.
pub const CIPHER_NAME: &str = "aes_256_cbc";
/// RSA key size for generated keypairs.
pub const RSA_KEY_BITS: usize = 2048;
/// AES-256 key length in bytes.
const AES_KEY_LEN: usize = 32;
/// AES block / IV length in bytes.
const AES_IV_LEN: usize = 16;

/// AES-256-CBC encryptor.
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
/// AES-256-CBC decryptor.
type Aes256CbcDec = cbc::Decryptor<Aes256>;
/// HMAC-SHA-256 authenticator.
type HmacSha256 = Hmac<Sha256>;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Cipher layer errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key generation or encoding failure.
    #[error("key handling error: {0}")]
    Key(String),
    /// The peer's public key could not be resolved.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    /// HMAC verification failed; the bundle must be dropped.
    #[error("hmac verification failed")]
    HmacMismatch,
    /// RSA or AES decryption failed.
    #[error("decryption failed: {0}")]
    Decryption(String),
    /// Cipher metadata signature verification failed.
    #[error("cipher signature verification failed")]
    BadSignature,
    /// A wire record inside the cipher exchange was malformed.
    #[error(transparent)]
    Wire(#[from] WireError),
}

// ============================================================================
// SECTION: Key Material
// ============================================================================

/// Long-lived RSA private key with PEM persistence.
#[derive(Debug, Clone)]
pub struct PrivateKey {
    /// Inner RSA key.
    inner: RsaPrivateKey,
}

impl PrivateKey {
    /// Generates a fresh keypair.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Key`] when generation fails.
    pub fn generate() -> Result<Self, CryptoError> {
        let inner = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
            .map_err(|err| CryptoError::Key(err.to_string()))?;
        Ok(Self { inner })
    }

    /// Loads a key from PKCS#8 PEM text.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Key`] when the PEM does not parse.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let inner =
            RsaPrivateKey::from_pkcs8_pem(pem).map_err(|err| CryptoError::Key(err.to_string()))?;
        Ok(Self { inner })
    }

    /// Serializes the key as PKCS#8 PEM text.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Key`] when encoding fails.
    pub fn to_pem(&self) -> Result<String, CryptoError> {
        self.inner
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|err| CryptoError::Key(err.to_string()))
    }

    /// Returns the corresponding public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey { inner: RsaPublicKey::from(&self.inner) }
    }

    /// Decrypts an OAEP ciphertext addressed to this key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Decryption`] on failure.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.inner
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|err| CryptoError::Decryption(err.to_string()))
    }

    /// Signs bytes with PKCS#1 v1.5 over SHA-256.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Key`] when signing fails.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let signer = SigningKey::<Sha256>::new(self.inner.clone());
        signer
            .try_sign(message)
            .map(|signature| signature.to_vec())
            .map_err(|err| CryptoError::Key(err.to_string()))
    }
}

/// Long-lived RSA public key with PEM persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    /// Inner RSA key.
    inner: RsaPublicKey,
}

impl PublicKey {
    /// Loads a key from SPKI PEM text.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Key`] when the PEM does not parse.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let inner = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|err| CryptoError::Key(err.to_string()))?;
        Ok(Self { inner })
    }

    /// Serializes the key as SPKI PEM text.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Key`] when encoding fails.
    pub fn to_pem(&self) -> Result<String, CryptoError> {
        self.inner
            .to_public_key_pem(LineEnding::LF)
            .map_err(|err| CryptoError::Key(err.to_string()))
    }

    /// Encrypts bytes to this key with OAEP over SHA-256.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Key`] when encryption fails.
    pub fn encrypt(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.inner
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), message)
            .map_err(|err| CryptoError::Key(err.to_string()))
    }

    /// Verifies a PKCS#1 v1.5 SHA-256 signature.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::BadSignature`] on mismatch.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let signature =
            Signature::try_from(signature).map_err(|_| CryptoError::BadSignature)?;
        VerifyingKey::<Sha256>::new(self.inner.clone())
            .verify(message, &signature)
            .map_err(|_| CryptoError::BadSignature)
    }

    /// Returns the SHA-256 fingerprint of the DER encoding, lower hex.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Key`] when DER encoding fails.
    pub fn fingerprint(&self) -> Result<String, CryptoError> {
        let der = self
            .inner
            .to_public_key_der()
            .map_err(|err| CryptoError::Key(err.to_string()))?;
        let digest = Sha256::digest(der.as_bytes());
        Ok(outpost_core::hashing::hex_encode(&digest))
    }

    /// Derives the stable client id for this key: the first eight bytes of
    /// the DER fingerprint, big-endian.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Key`] when DER encoding fails.
    pub fn client_id(&self) -> Result<ClientId, CryptoError> {
        let der = self
            .inner
            .to_public_key_der()
            .map_err(|err| CryptoError::Key(err.to_string()))?;
        let digest = Sha256::digest(der.as_bytes());
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        Ok(ClientId::from_raw(u64::from_be_bytes(raw)))
    }
}

// ============================================================================
// SECTION: Session Cipher
// ============================================================================

/// Per-peer symmetric session with its encrypted exchange blobs.
#[derive(Debug, Clone)]
pub struct Cipher {
    /// Session material.
    properties: CipherProperties,
    /// Session material RSA-encrypted to the peer.
    pub encrypted_cipher: Vec<u8>,
    /// Signed metadata, AES-encrypted under the session key.
    pub encrypted_cipher_metadata: Vec<u8>,
}

impl Cipher {
    /// Derives a fresh session for `(self_common_name, peer_public_key)`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] when key material generation fails.
    pub fn new(
        self_common_name: &str,
        self_private_key: &PrivateKey,
        peer_public_key: &PublicKey,
    ) -> Result<Self, CryptoError> {
        let mut key = vec![0u8; AES_KEY_LEN];
        let mut metadata_iv = vec![0u8; AES_IV_LEN];
        let mut hmac_key = vec![0u8; AES_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut metadata_iv);
        OsRng.fill_bytes(&mut hmac_key);
        let properties =
            CipherProperties { name: CIPHER_NAME.to_string(), key, metadata_iv, hmac_key };

        let serialized = properties.encode();
        let encrypted_cipher = peer_public_key.encrypt(&serialized)?;

        let metadata = CipherMetadata {
            source: self_common_name.to_string(),
            signature: self_private_key.sign(&serialized)?,
        };
        let encrypted_cipher_metadata =
            aes_encrypt(&properties.key, &properties.metadata_iv, &metadata.encode())?;

        Ok(Self { properties, encrypted_cipher, encrypted_cipher_metadata })
    }

    /// Reconstructs the session on the receiving side.
    ///
    /// Decrypts the session material with the receiver's private key and the
    /// metadata with the recovered session key. Signature verification is
    /// deferred until the peer's public key is resolved.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Decryption`] when either blob fails to open.
    pub fn from_received(
        self_private_key: &PrivateKey,
        encrypted_cipher: &[u8],
        encrypted_cipher_metadata: &[u8],
    ) -> Result<(Self, CipherMetadata), CryptoError> {
        let serialized = self_private_key.decrypt(encrypted_cipher)?;
        let properties = CipherProperties::decode(&serialized)?;
        let metadata_bytes =
            aes_decrypt(&properties.key, &properties.metadata_iv, encrypted_cipher_metadata)?;
        let metadata = CipherMetadata::decode(&metadata_bytes)?;
        let cipher = Self {
            properties,
            encrypted_cipher: encrypted_cipher.to_vec(),
            encrypted_cipher_metadata: encrypted_cipher_metadata.to_vec(),
        };
        Ok((cipher, metadata))
    }

    /// Verifies the session signature against the resolved peer key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::BadSignature`] on mismatch.
    pub fn verify_source(
        &self,
        metadata: &CipherMetadata,
        peer_public_key: &PublicKey,
    ) -> Result<(), CryptoError> {
        peer_public_key.verify(&self.properties.encode(), &metadata.signature)
    }

    /// Encrypts a serialized message list with a fresh per-packet IV.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] when encryption fails.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let mut packet_iv = vec![0u8; AES_IV_LEN];
        OsRng.fill_bytes(&mut packet_iv);
        let ciphertext = aes_encrypt(&self.properties.key, &packet_iv, plaintext)?;
        Ok((packet_iv, ciphertext))
    }

    /// Decrypts a packet with its IV.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Decryption`] on bad padding or key material.
    pub fn decrypt(&self, packet_iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        aes_decrypt(&self.properties.key, packet_iv, ciphertext)
    }

    /// Computes the legacy HMAC over the ciphertext only.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Key`] when the HMAC key is malformed.
    pub fn legacy_hmac(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.hmac_parts(&[ciphertext])
    }

    /// Computes the full HMAC binding the whole packet together.
    ///
    /// Covers `(ciphertext, encrypted_cipher, encrypted_cipher_metadata,
    /// packet_iv, api_version_le)`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Key`] when the HMAC key is malformed.
    pub fn full_hmac(
        &self,
        ciphertext: &[u8],
        packet_iv: &[u8],
        api_version: u32,
    ) -> Result<Vec<u8>, CryptoError> {
        self.hmac_parts(&[
            ciphertext,
            &self.encrypted_cipher,
            &self.encrypted_cipher_metadata,
            packet_iv,
            &api_version.to_le_bytes(),
        ])
    }

    /// HMACs the concatenation of the given parts.
    fn hmac_parts(&self, parts: &[&[u8]]) -> Result<Vec<u8>, CryptoError> {
        let mut mac = HmacSha256::new_from_slice(&self.properties.hmac_key)
            .map_err(|err| CryptoError::Key(err.to_string()))?;
        for part in parts {
            mac.update(part);
        }
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Verifies an HMAC in constant time.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::HmacMismatch`] on mismatch.
    pub fn verify_hmac(&self, expected: &[u8], parts: &[&[u8]]) -> Result<(), CryptoError> {
        let mut mac = HmacSha256::new_from_slice(&self.properties.hmac_key)
            .map_err(|err| CryptoError::Key(err.to_string()))?;
        for part in parts {
            mac.update(part);
        }
        mac.verify_slice(expected).map_err(|_| CryptoError::HmacMismatch)
    }
}

// ============================================================================
// SECTION: AES Helpers
// ============================================================================

/// AES-256-CBC encrypt with PKCS#7 padding.
fn aes_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let encryptor = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|err| CryptoError::Key(err.to_string()))?;
    Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// AES-256-CBC decrypt with PKCS#7 padding.
fn aes_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let decryptor = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|err| CryptoError::Key(err.to_string()))?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|err| CryptoError::Decryption(err.to_string()))
}

// ============================================================================
// SECTION: Code Signing
// ============================================================================

/// Signs a binary blob with the code-signing key.
///
/// # Errors
///
/// Returns [`CryptoError::Key`] when signing fails.
pub fn sign_blob(signing_key: &PrivateKey, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    signing_key.sign(blob)
}

/// Verifies a binary blob against the pinned code-signing public key.
///
/// # Errors
///
/// Returns [`CryptoError::BadSignature`] on mismatch.
pub fn verify_blob(
    signing_public_key: &PublicKey,
    blob: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    signing_public_key.verify(blob, signature)
}
