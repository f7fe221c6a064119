//! # SHROUD Crypto
//!
//! Cryptographic primitives for the SHROUD file transfer engine.
//!
//! This crate provides:
//! - X25519 key agreement for per-session key negotiation
//! - BLAKE3 keyed derivation of session keys from shared secrets
//! - `ChaCha20-Poly1305` whole-file sealing ([`aead::FileCodec`])
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | KDF | BLAKE3 keyed XOF | 128-bit |
//! | AEAD | ChaCha20-Poly1305 (96-bit nonce) | 256-bit key |
//!
//! The handshake is unauthenticated: it protects against passive
//! eavesdroppers only. Nothing in this crate signs exchanged public keys.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod error;
pub mod hash;
pub mod random;
pub mod x25519;

pub use aead::{AeadKey, FileCodec, Nonce};
pub use error::CryptoError;

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size
pub const X25519_SECRET_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 key size
pub const CHACHA_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce size
pub const CHACHA_NONCE_SIZE: usize = 12;

/// Context string for session key derivation.
pub const SESSION_KEY_CONTEXT: &str = "shroud 2024 session key v1";

/// Derive the symmetric session key both peers agree on.
///
/// The session identifier is mixed into the input key material so two
/// sessions negotiated with the same key pair never share a file key.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidPublicKey`] if the peer key is a low-order
/// point (the shared secret would be all zeros).
pub fn derive_session_key(
    local: &x25519::PrivateKey,
    peer: &x25519::PublicKey,
    session_id: &[u8],
) -> Result<AeadKey, CryptoError> {
    let shared = local
        .exchange(peer)
        .ok_or(CryptoError::InvalidPublicKey)?;

    let mut ikm = zeroize::Zeroizing::new(Vec::with_capacity(32 + session_id.len()));
    ikm.extend_from_slice(shared.as_bytes());
    ikm.extend_from_slice(session_id);

    let kdf = hash::Kdf::new(SESSION_KEY_CONTEXT);
    Ok(AeadKey::new(kdf.derive_key(&ikm)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_session_key_agreement() {
        let alice = x25519::PrivateKey::generate(&mut OsRng);
        let bob = x25519::PrivateKey::generate(&mut OsRng);

        let k1 = derive_session_key(&alice, &bob.public_key(), b"abc123").unwrap();
        let k2 = derive_session_key(&bob, &alice.public_key(), b"abc123").unwrap();

        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_session_key_bound_to_session_id() {
        let alice = x25519::PrivateKey::generate(&mut OsRng);
        let bob = x25519::PrivateKey::generate(&mut OsRng);

        let k1 = derive_session_key(&alice, &bob.public_key(), b"session-a").unwrap();
        let k2 = derive_session_key(&alice, &bob.public_key(), b"session-b").unwrap();

        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_session_key_rejects_low_order_point() {
        let alice = x25519::PrivateKey::generate(&mut OsRng);
        let zero = x25519::PublicKey::from_bytes([0u8; 32]);

        assert!(matches!(
            derive_session_key(&alice, &zero, b"s"),
            Err(CryptoError::InvalidPublicKey)
        ));
    }

    #[test]
    fn test_wire_sizes() {
        let alice = x25519::PrivateKey::generate(&mut OsRng);
        let bob = x25519::PrivateKey::generate(&mut OsRng);
        let key = derive_session_key(&alice, &bob.public_key(), b"s").unwrap();

        assert_eq!(bob.public_key().to_bytes().len(), X25519_PUBLIC_KEY_SIZE);
        assert_eq!(key.as_bytes().len(), CHACHA_KEY_SIZE);

        let (ciphertext, nonce) = FileCodec::encrypt(b"abc", &key).unwrap();
        assert_eq!(nonce.as_bytes().len(), CHACHA_NONCE_SIZE);
        assert_eq!(ciphertext.len(), 3 + aead::TAG_SIZE);
    }
}
