//! `ChaCha20-Poly1305` file sealing.
//!
//! A whole file is sealed as a single AEAD message before it is chunked for
//! transmission, so the Poly1305 tag covers every byte of the transfer:
//! - 256-bit keys
//! - 96-bit random nonces, fresh per [`FileCodec::encrypt`] call
//! - 128-bit authentication tag appended to the ciphertext
//!
//! ## Usage
//!
//! ```
//! use shroud_crypto::aead::{AeadKey, FileCodec};
//! use rand_core::OsRng;
//!
//! let key = AeadKey::generate(&mut OsRng);
//! let (ciphertext, nonce) = FileCodec::encrypt(b"report.pdf bytes", &key)?;
//! let plaintext = FileCodec::decrypt(&ciphertext, &key, &nonce)?;
//! assert_eq!(plaintext, b"report.pdf bytes");
//! # Ok::<(), shroud_crypto::CryptoError>(())
//! ```

use crate::CryptoError;
use chacha20poly1305::{
    ChaCha20Poly1305,
    aead::{Aead, KeyInit},
};
use rand_core::{CryptoRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// ChaCha20-Poly1305 nonce size (12 bytes / 96 bits).
pub const NONCE_SIZE: usize = crate::CHACHA_NONCE_SIZE;

/// AEAD key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = crate::CHACHA_KEY_SIZE;

/// ChaCha20-Poly1305 nonce (12 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a nonce from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidNonceLength`] if the slice is not 12 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; NONCE_SIZE] = slice
            .try_into()
            .map_err(|_| CryptoError::InvalidNonceLength)?;
        Ok(Self(bytes))
    }

    /// Generate a random nonce.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    fn as_generic(&self) -> &chacha20poly1305::Nonce {
        chacha20poly1305::Nonce::from_slice(&self.0)
    }
}

/// AEAD encryption key (32 bytes).
///
/// Used both for negotiated session keys and for literal fallback keys.
/// Key is zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if slice length is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Generate a random key.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Get raw key bytes.
    ///
    /// # Security
    ///
    /// Only the literal fallback mode should ever put these on the wire.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new((&self.0).into())
    }
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AeadKey(..)")
    }
}

/// Whole-payload authenticated encryption.
pub struct FileCodec;

impl FileCodec {
    /// Generate a random literal key for fallback mode.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn generate_key() -> Result<AeadKey, CryptoError> {
        crate::random::random_32().map(AeadKey)
    }

    /// Seal `plaintext` under `key` with a fresh random nonce.
    ///
    /// Returns the ciphertext (tag appended, `plaintext.len() + 16` bytes)
    /// and the nonce the receiver needs to open it.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn encrypt(plaintext: &[u8], key: &AeadKey) -> Result<(Vec<u8>, Nonce), CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        crate::random::fill_random(&mut nonce)?;
        let nonce = Nonce(nonce);

        let ciphertext = key
            .cipher()
            .encrypt(nonce.as_generic(), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok((ciphertext, nonce))
    }

    /// Open a sealed payload.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` when the tag does not verify:
    /// wrong key, corrupted bytes, or a nonce that does not belong to this
    /// ciphertext. Retrying with the same inputs cannot succeed.
    pub fn decrypt(
        ciphertext: &[u8],
        key: &AeadKey,
        nonce: &Nonce,
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        key.cipher()
            .decrypt(nonce.as_generic(), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Ciphertext length produced for a plaintext of `plaintext_len` bytes.
    #[must_use]
    pub const fn sealed_len(plaintext_len: usize) -> usize {
        plaintext_len + TAG_SIZE
    }
}
