//! High-availability remote signer for validators.
//!
//! A set of `N` signer processes shares one validator key. Each holds a
//! rank in `1..=N`; only the active rank signs. When the active signer
//! misses `threshold` consecutive signing opportunities, the next rank
//! takes over. Every signature passes a persistent double-sign guard, so
//! no signer ever signs two different messages at the same
//! (height, round, step), across restarts included.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐   encrypted TCP     ┌─────────────────┐
//! │  Validator Node │ ◄───────────────────│  ha-signer (1)  │ active
//! │                 │ ◄───────────────────│  ha-signer (2)  │ standby
//! └─────────────────┘   SignVote/Refused  └─────────────────┘
//! ```
//!
//! Signers dial the validator and authenticate with an ed25519 channel
//! identity. Requests are answered in arrival order, each one passing the
//! rank check, the double-sign guard and the signing capability.
//!
//! ## Usage
//!
//! ```bash
//! ha-signer init                # config dir, config.toml template, conn.key
//! $EDITOR ~/.ha-signer/config.toml
//! ha-signer start
//! ```

pub mod channel;
pub mod client;
pub mod config;
pub mod identity;
pub mod liveness;
pub mod protocol;
pub mod rank;
pub mod security;
pub mod server;
pub mod session;
pub mod signer;

pub use channel::{ChannelError, DialConfig, PeerPolicy, SecureSession};
pub use client::{ClientError, SignerConnection, ValidatorEndpoint};
pub use config::{Config, ConfigError, MissFeed};
pub use identity::{IdentityError, SignerIdentity};
pub use liveness::{CommitSource, LivenessError, LivenessMonitor, RpcCommitSource};
pub use protocol::{RefusalReason, Request, Response, SignResponse, SignVoteRequest, Step};
pub use rank::{ActiveRankState, RankController, RankError, RankTransition};
pub use security::{
    Admission, DoubleSignError, DoubleSignGuard, DoubleSignState, FileStateStore,
    MemoryStateStore, SignStateStore, SignedPosition,
};
pub use server::{ServerConfig, ServerError, SignerServer};
pub use session::{SessionError, SigningSession};
pub use signer::{ConsensusSigner, FileValidatorKey, SignerError};
