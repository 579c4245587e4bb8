//! Consensus signing capability.
//!
//! The controller treats signing as an opaque capability behind
//! [`ConsensusSigner`]. [`FileValidatorKey`] provides it from the
//! validator's ed25519 key file:
//!
//! ```json
//! {
//!   "address": "5BCD69E0178E0E6C6F96F541B265CAE3178611AE",
//!   "pub_key":  { "type": "tendermint/PubKeyEd25519",  "value": "<base64 32B>" },
//!   "priv_key": { "type": "tendermint/PrivKeyEd25519", "value": "<base64 64B>" }
//! }
//! ```

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;
use zeroize::Zeroizing;

/// Errors from loading or using the consensus key.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse key file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Key file value is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Signing failed: {0}")]
    Signing(String),
}

/// Produces consensus signatures with the validator's key.
#[async_trait]
pub trait ConsensusSigner: Send + Sync {
    /// Sign `payload` with the validator's consensus key.
    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, SignerError>;

    /// Consensus public key bytes.
    fn public_key(&self) -> Vec<u8>;
}

#[derive(Deserialize)]
struct TypedValue {
    #[serde(rename = "type")]
    key_type: String,
    value: String,
}

#[derive(Deserialize)]
struct KeyFile {
    address: String,
    pub_key: TypedValue,
    priv_key: TypedValue,
}

/// Validator address: first 20 bytes of SHA-256 over the public key,
/// upper-case hex.
pub fn validator_address(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode_upper(&digest[..20])
}

/// Ed25519 consensus key loaded from the validator key file.
pub struct FileValidatorKey {
    address: String,
    signing_key: SigningKey,
}

impl FileValidatorKey {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SignerError> {
        let contents = Zeroizing::new(fs::read_to_string(path.as_ref())?);
        Self::from_json(&contents)
    }

    /// Parse and cross-check the key file contents: the public key must
    /// match the private key, and the address must match the public key.
    pub fn from_json(json: &str) -> Result<Self, SignerError> {
        let file: KeyFile = serde_json::from_str(json)?;

        if !file.priv_key.key_type.ends_with("Ed25519") {
            return Err(SignerError::InvalidKey(format!(
                "unsupported private key type {}",
                file.priv_key.key_type
            )));
        }
        if !file.pub_key.key_type.ends_with("Ed25519") {
            return Err(SignerError::InvalidKey(format!(
                "unsupported public key type {}",
                file.pub_key.key_type
            )));
        }

        let priv_bytes = Zeroizing::new(BASE64.decode(file.priv_key.value.trim())?);
        let keypair: &[u8; 64] = priv_bytes.as_slice().try_into().map_err(|_| {
            SignerError::InvalidKey(format!(
                "private key must be 64 bytes, got {}",
                priv_bytes.len()
            ))
        })?;
        let signing_key = SigningKey::from_keypair_bytes(keypair)
            .map_err(|e| SignerError::InvalidKey(format!("inconsistent keypair: {e}")))?;

        let pub_bytes = BASE64.decode(file.pub_key.value.trim())?;
        if pub_bytes.as_slice() != signing_key.verifying_key().as_bytes() {
            return Err(SignerError::InvalidKey(
                "public key does not match private key".to_string(),
            ));
        }

        let address = validator_address(&pub_bytes);
        if !file.address.eq_ignore_ascii_case(&address) {
            return Err(SignerError::InvalidKey(format!(
                "address {} does not match public key (expected {})",
                file.address, address
            )));
        }

        Ok(Self {
            address,
            signing_key,
        })
    }

    /// Upper-case hex validator address.
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Debug for FileValidatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileValidatorKey")
            .field("address", &self.address)
            .finish()
    }
}

#[async_trait]
impl ConsensusSigner for FileValidatorKey {
    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, SignerError> {
        Ok(self.signing_key.sign(payload).to_bytes().to_vec())
    }

    fn public_key(&self) -> Vec<u8> {
        self.signing_key.verifying_key().to_bytes().to_vec()
    }
}
