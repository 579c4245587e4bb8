//! Wire protocol between the signer and the consensus node.
//!
//! Messages are bincode-encoded tagged enums. They travel inside the
//! encrypted, length-prefixed frames of [`crate::channel::SecureSession`],
//! one message per frame.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors produced while decoding or validating wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Undecodable message: {0}")]
    Decode(#[from] bincode::Error),

    #[error("Invalid sign request: {0}")]
    Invalid(String),
}

/// Consensus step being signed.
///
/// Declaration order is signing order within a round, so the derived
/// `Ord` is the ordering the double-sign guard relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Step {
    Propose,
    Prevote,
    Precommit,
}

impl Step {
    /// 1-based position of the step within a round. 0 is reserved for
    /// "nothing signed yet at this round".
    pub fn rank(self) -> u8 {
        match self {
            Step::Propose => 1,
            Step::Prevote => 2,
            Step::Precommit => 3,
        }
    }

    /// Inverse of [`Step::rank`].
    pub fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            1 => Some(Step::Propose),
            2 => Some(Step::Prevote),
            3 => Some(Step::Precommit),
            _ => None,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Propose => write!(f, "propose"),
            Step::Prevote => write!(f, "prevote"),
            Step::Precommit => write!(f, "precommit"),
        }
    }
}

/// Request to sign a consensus message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignVoteRequest {
    /// Chain the message belongs to
    pub chain_id: String,
    /// Consensus height
    pub height: i64,
    /// Consensus round within the height
    pub round: i64,
    /// Consensus step within the round
    pub step: Step,
    /// Canonical sign bytes
    pub payload: Vec<u8>,
    /// Unique request ID, echoed in the response
    pub request_id: u64,
}

impl SignVoteRequest {
    /// Create a new sign request with a fresh request ID.
    pub fn new(
        chain_id: impl Into<String>,
        height: i64,
        round: i64,
        step: Step,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            chain_id: chain_id.into(),
            height,
            round,
            step,
            payload,
            request_id: generate_request_id(),
        }
    }

    /// Check the request shape. Failures are refused as malformed, they
    /// never tear down the session.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.chain_id.is_empty() {
            return Err(ProtocolError::Invalid("empty chain id".to_string()));
        }
        if self.height < 0 {
            return Err(ProtocolError::Invalid(format!(
                "negative height {}",
                self.height
            )));
        }
        if self.round < 0 {
            return Err(ProtocolError::Invalid(format!(
                "negative round {}",
                self.round
            )));
        }
        if self.payload.is_empty() {
            return Err(ProtocolError::Invalid("empty payload".to_string()));
        }
        Ok(())
    }
}

/// Why a sign request was not honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefusalReason {
    /// Request failed shape validation
    Malformed,
    /// Request names a chain this signer does not serve
    UnknownChain,
    /// This signer is on standby
    NotActiveSigner,
    /// Signing would conflict with, or regress behind, what was already signed
    DoubleSignRefused,
    /// The signing capability reported an error
    SigningFailed,
    /// The signing capability did not answer in time
    SigningTimeout,
    /// Guard state could not be durably committed
    PersistenceFailed,
}

impl fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RefusalReason::Malformed => "malformed request",
            RefusalReason::UnknownChain => "unknown chain",
            RefusalReason::NotActiveSigner => "not the active signer",
            RefusalReason::DoubleSignRefused => "double sign refused",
            RefusalReason::SigningFailed => "signing failed",
            RefusalReason::SigningTimeout => "signing timed out",
            RefusalReason::PersistenceFailed => "persistence failed",
        };
        f.write_str(s)
    }
}

/// Response to a sign request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignResponse {
    /// Successful signature
    Success {
        /// The signature bytes
        signature: Vec<u8>,
        /// Echo of request ID
        request_id: u64,
    },
    /// The request was not honored
    Refused {
        /// Machine-readable reason code
        reason: RefusalReason,
        /// Human-readable detail
        message: String,
        /// Echo of request ID
        request_id: u64,
    },
}

impl SignResponse {
    pub fn refused(reason: RefusalReason, message: impl Into<String>, request_id: u64) -> Self {
        SignResponse::Refused {
            reason,
            message: message.into(),
            request_id,
        }
    }
}

/// Response with public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubKeyResponse {
    /// Consensus public key bytes
    pub pubkey: Vec<u8>,
}

/// All possible messages from the consensus node to the signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    SignVote(SignVoteRequest),
    GetPubKey,
    Ping,
}

/// All possible messages from the signer to the consensus node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Sign(SignResponse),
    PubKey(PubKeyResponse),
    Pong,
    /// The request frame could not be decoded at all
    Malformed { message: String },
}

impl Request {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a request frame. Unknown tags and truncated bodies are
    /// errors, never coerced into a default request.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl Response {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Generate a unique request ID based on timestamp and random component.
fn generate_request_id() -> u64 {
    use rand::Rng;
    use std::time::{SystemTime, UNIX_EPOCH};
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random: u32 = rand::thread_rng().gen();
    timestamp ^ (random as u64)
}
