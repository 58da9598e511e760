//! # Cryptographic Primitives
//!
//! Thin wrappers that fix the algorithms the protocol is built on:
//!
//! - **ChaCha20-Poly1305** seals every packet after the handshake starts. The
//!   96-bit nonce is the packet's 64-bit sequence number, little endian, in the
//!   last eight bytes, so a key must never be reused with a repeated sequence.
//! - **XChaCha20-Poly1305** seals the secret section of a connect token. Its
//!   192-bit nonce is random per token.
//! - **Ed25519** signs connect tokens. The backend holds the signing key; game
//!   servers verify with the public key.
//! - **HKDF-SHA256** derives the token sealing key from the signing key seed, so the
//!   backend and its servers share one secret instead of two.
//!
//! Random bytes always come from the operating system.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, Verifier};
use hkdf::Hkdf;
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::PROTOCOL_VERSION;

pub use ed25519_dalek::{SigningKey, VerifyingKey};

pub const KEY_BYTES: usize = 32;
pub const NONCE_BYTES: usize = 12;
pub const XNONCE_BYTES: usize = 24;
pub const MAC_BYTES: usize = 16;
pub const SIGNATURE_BYTES: usize = 64;

const TOKEN_KEY_INFO: &[u8] = b"connect token secret section";

/// A 256-bit symmetric key, wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_BYTES]);

impl SymmetricKey {
    /// Generates a fresh key from the operating system's RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_BYTES];
        random_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

fn sequence_nonce(sequence: u64) -> [u8; NONCE_BYTES] {
    let mut nonce = [0u8; NONCE_BYTES];
    nonce[4..].copy_from_slice(&sequence.to_le_bytes());
    nonce
}

/// Seals `plaintext` under `key`, using `sequence` as the nonce.
///
/// Returns ciphertext followed by the 16-byte authentication tag.
pub fn encrypt(
    key: &SymmetricKey,
    sequence: u64,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = sequence_nonce(sequence);
    cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encrypt)
}

/// Opens data sealed by [`encrypt`]. Fails if the tag, key, nonce or aad differ.
pub fn decrypt(
    key: &SymmetricKey,
    sequence: u64,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = sequence_nonce(sequence);
    cipher
        .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Authentication)
}

/// Seals with the extended-nonce construction. Used for token secret sections.
pub fn encrypt_bignonce(
    key: &SymmetricKey,
    nonce: &[u8; XNONCE_BYTES],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encrypt)
}

pub fn decrypt_bignonce(
    key: &SymmetricKey,
    nonce: &[u8; XNONCE_BYTES],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Authentication)
}

/// Derives the key that seals connect token secret sections.
///
/// Both the backend minting tokens and the servers opening them hold the same
/// signing key, so the derivation needs no extra shared secret.
pub fn derive_token_key(signing_key: &SigningKey) -> Result<SymmetricKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(&PROTOCOL_VERSION[..]), signing_key.as_bytes());
    let mut okm = [0u8; KEY_BYTES];
    hk.expand(TOKEN_KEY_INFO, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(SymmetricKey(okm))
}

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Deterministic signing key for local development and tests.
///
/// Anyone who knows the seed can mint tokens, so production deployments must use
/// [`generate_signing_key`] and distribute the key out of band.
pub fn development_keys(seed: u64) -> SigningKey {
    let mut rng = StdRng::seed_from_u64(seed);
    SigningKey::generate(&mut rng)
}

pub fn sign(signing_key: &SigningKey, message: &[u8]) -> [u8; SIGNATURE_BYTES] {
    signing_key.sign(message).to_bytes()
}

pub fn verify(verifying_key: &VerifyingKey, message: &[u8], signature: &[u8; SIGNATURE_BYTES]) -> bool {
    let signature = Signature::from_bytes(signature);
    verifying_key.verify(message, &signature).is_ok()
}

pub fn random_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

pub fn random_u64() -> u64 {
    OsRng.next_u64()
}
