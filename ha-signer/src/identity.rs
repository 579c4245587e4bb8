//! Channel authentication identity.
//!
//! A [`SignerIdentity`] is the ed25519 keypair that authenticates this
//! signer during the secure channel handshake. It is unrelated to the
//! validator's consensus key and never signs consensus messages.
//!
//! The keypair is derived from a 32-byte seed kept base64-encoded in the
//! connection seed file (`conn.key`).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;
use zeroize::Zeroizing;

/// Length of the identity seed in bytes.
pub const SEED_LENGTH: usize = 32;

/// Errors from identity derivation and seed file handling.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Invalid seed length: expected {SEED_LENGTH} bytes, got {0}")]
    InvalidSeedLength(usize),

    #[error("Seed file is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Seed file already exists: {0:?}")]
    AlreadyExists(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Derive the keypair for a seed: a 64-byte private key (seed followed by
/// public key) and the 32-byte public key.
pub fn derive_keypair(seed: &[u8]) -> Result<(Zeroizing<[u8; 64]>, [u8; 32]), IdentityError> {
    let identity = SignerIdentity::derive(seed)?;
    Ok((identity.private_key_bytes(), identity.public_key_bytes()))
}

/// Produce a fresh random seed.
pub fn generate_seed() -> Zeroizing<[u8; SEED_LENGTH]> {
    let mut seed = Zeroizing::new([0u8; SEED_LENGTH]);
    OsRng.fill_bytes(&mut seed[..]);
    seed
}

/// Handshake identity of this signer.
pub struct SignerIdentity {
    signing_key: SigningKey,
}

impl SignerIdentity {
    /// Deterministically derive the identity for `seed`.
    pub fn derive(seed: &[u8]) -> Result<Self, IdentityError> {
        let seed: &[u8; SEED_LENGTH] = seed
            .try_into()
            .map_err(|_| IdentityError::InvalidSeedLength(seed.len()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(seed),
        })
    }

    /// Identity from a freshly generated seed. The seed is not retained.
    pub fn generate() -> Self {
        let seed = generate_seed();
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Load the identity from a base64 seed file.
    pub fn load_seed_file(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let contents = Zeroizing::new(fs::read_to_string(path.as_ref())?);
        let seed = Zeroizing::new(BASE64.decode(contents.trim())?);
        Self::derive(&seed)
    }

    /// Write a new random seed to `path` (mode 0600) and return its
    /// identity. An existing file is never overwritten.
    pub fn generate_seed_file(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(IdentityError::AlreadyExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let seed = generate_seed();
        let encoded = Zeroizing::new(BASE64.encode(&seed[..]));

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(encoded.as_bytes())?;
        file.flush()?;
        file.sync_all()?;

        let identity = Self::derive(&seed[..])?;
        info!(
            "Generated connection seed at {:?}, pubkey: {}",
            path,
            hex::encode(identity.public_key_bytes())
        );
        Ok(identity)
    }

    /// 64-byte private key: seed followed by public key.
    pub fn private_key_bytes(&self) -> Zeroizing<[u8; 64]> {
        Zeroizing::new(self.signing_key.to_keypair_bytes())
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign handshake material.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl fmt::Debug for SignerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerIdentity")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish()
    }
}
