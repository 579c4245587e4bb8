//! Commit-based miss feed.
//!
//! Instead of trusting its own request outcomes, a signer can infer misses
//! from the chain: for every committed height, either the validator's
//! address appears among the commit signatures (success) or it does not
//! (miss). Every signer in the set reads the same chain from the same
//! start height, so they all feed their [`RankController`] the same history
//! and agree on the active rank, whenever each of them started.

use crate::rank::RankController;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors from querying the commit source.
#[derive(Debug, Error)]
pub enum LivenessError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid RPC response: {0}")]
    InvalidResponse(String),
}

/// Source of committed heights and their signers.
#[async_trait]
pub trait CommitSource: Send + Sync {
    /// Latest committed height.
    async fn latest_height(&self) -> Result<i64, LivenessError>;

    /// Upper-case hex addresses of the validators that signed the commit
    /// at `height`.
    async fn commit_signers(&self, height: i64) -> Result<Vec<String>, LivenessError>;
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct StatusResult {
    sync_info: SyncInfo,
}

#[derive(Debug, Deserialize)]
struct SyncInfo {
    latest_block_height: String,
}

#[derive(Debug, Deserialize)]
struct CommitResult {
    signed_header: SignedHeader,
}

#[derive(Debug, Deserialize)]
struct SignedHeader {
    commit: Commit,
}

#[derive(Debug, Deserialize)]
struct Commit {
    signatures: Vec<CommitSig>,
}

#[derive(Debug, Deserialize)]
struct CommitSig {
    block_id_flag: u8,
    #[serde(default)]
    validator_address: String,
}

/// `block_id_flag` of a validator that did not vote.
const BLOCK_ID_FLAG_ABSENT: u8 = 1;

impl StatusResult {
    fn latest_height(&self) -> Result<i64, LivenessError> {
        self.sync_info
            .latest_block_height
            .parse()
            .map_err(|_| {
                LivenessError::InvalidResponse(format!(
                    "latest_block_height {:?}",
                    self.sync_info.latest_block_height
                ))
            })
    }
}

impl CommitResult {
    fn signers(self) -> Vec<String> {
        self.signed_header
            .commit
            .signatures
            .into_iter()
            .filter(|sig| sig.block_id_flag != BLOCK_ID_FLAG_ABSENT)
            .filter(|sig| !sig.validator_address.is_empty())
            .map(|sig| sig.validator_address.to_ascii_uppercase())
            .collect()
    }
}

/// [`CommitSource`] backed by the consensus node's JSON-RPC endpoint.
#[derive(Clone)]
pub struct RpcCommitSource {
    base: String,
    client: Client,
}

impl RpcCommitSource {
    /// `addr` is the node's RPC `host:port`.
    pub fn new(addr: &str, timeout: Duration) -> Result<Self, LivenessError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base: format!("http://{}", addr),
            client,
        })
    }
}

#[async_trait]
impl CommitSource for RpcCommitSource {
    async fn latest_height(&self) -> Result<i64, LivenessError> {
        let url = format!("{}/status", self.base);
        let resp = self.client.get(&url).send().await?.error_for_status()?;
        let status = resp.json::<RpcEnvelope<StatusResult>>().await?;
        status.result.latest_height()
    }

    async fn commit_signers(&self, height: i64) -> Result<Vec<String>, LivenessError> {
        let url = format!("{}/commit?height={}", self.base, height);
        let resp = self.client.get(&url).send().await?.error_for_status()?;
        let commit = resp.json::<RpcEnvelope<CommitResult>>().await?;
        Ok(commit.result.signers())
    }
}

/// Walks committed heights and feeds success/miss for the active rank.
pub struct LivenessMonitor<C> {
    source: C,
    rank: Arc<RankController>,
    validator_address: String,
    poll_interval: Duration,
    start_height: Option<i64>,
    next_height: Option<i64>,
}

impl<C: CommitSource> LivenessMonitor<C> {
    pub fn new(
        source: C,
        rank: Arc<RankController>,
        validator_address: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            rank,
            validator_address: validator_address.into().to_ascii_uppercase(),
            poll_interval,
            start_height: None,
            next_height: None,
        }
    }

    /// Count commits from `height` on instead of from the tip seen by the
    /// first poll. The rank controller must be fresh.
    pub fn with_start_height(mut self, height: Option<i64>) -> Self {
        self.start_height = height;
        self
    }

    /// Observe every height committed since the last poll. The first poll
    /// starts at the start height, or at the current tip when none is set.
    /// Returns the number of heights observed.
    pub async fn poll_once(&mut self) -> Result<u64, LivenessError> {
        let latest = self.source.latest_height().await?;
        let start = self
            .next_height
            .or(self.start_height)
            .unwrap_or(latest);
        if start > latest {
            return Ok(0);
        }

        let mut observed = 0;
        for height in start..=latest {
            let signers = self.source.commit_signers(height).await?;
            if signers.iter().any(|s| *s == self.validator_address) {
                self.rank.record_success();
            } else {
                debug!(
                    "Validator {} absent from commit at height {}",
                    self.validator_address, height
                );
                self.rank.record_miss();
            }
            // Advance per height so a failed fetch resumes where it stopped.
            self.next_height = Some(height + 1);
            observed += 1;
        }
        Ok(observed)
    }

    /// Poll until one pass reaches the tip, retrying source errors every
    /// poll interval. Returns false if `cancel` fired first.
    pub async fn catch_up(&mut self, cancel: &CancellationToken) -> bool {
        loop {
            match self.poll_once().await {
                Ok(observed) => {
                    let state = self.rank.snapshot();
                    info!(
                        "Replayed {} committed heights, active rank {} with {} consecutive misses",
                        observed, state.active_rank, state.consecutive_misses
                    );
                    return true;
                }
                Err(e) => warn!("Commit catch-up failed, retrying: {}", e),
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Poll until `cancel` fires. Source errors are logged and retried on
    /// the next tick.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Liveness monitor watching commits for {} every {:?}",
            self.validator_address, self.poll_interval
        );
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Liveness monitor stopped");
                    return;
                }
                _ = interval.tick() => {}
            }

            if let Err(e) = self.poll_once().await {
                warn!("Commit poll failed: {}", e);
            }
        }
    }
}
