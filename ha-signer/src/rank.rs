//! Rank/threshold failover state machine.
//!
//! Signers in a set are ranked `1..=set_size`. Exactly one rank is active
//! at a time. Every missed signing opportunity of the active signer bumps
//! a counter; reaching `threshold` consecutive misses rotates the active
//! rank forward by one (wrapping from `set_size` back to 1). A success
//! clears the counter.
//!
//! The rule is a pure function of the observed miss history, so signers
//! fed the same history agree on the active rank without coordinating.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Construction-time violations. These are configuration errors and are
/// fatal: the controller refuses to exist rather than degrade.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RankError {
    #[error("Set size must be at least 1, got {0}")]
    InvalidSetSize(u32),

    #[error("Threshold must be at least 1, got {0}")]
    InvalidThreshold(u32),

    #[error("Rank must lie in [1, {set_size}], got {rank}")]
    InvalidRank { rank: u32, set_size: u32 },
}

/// Snapshot of the failover state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRankState {
    /// Rank currently authorized to sign, in `[1, set_size]`
    pub active_rank: u32,
    /// Consecutive misses observed for the active rank
    pub consecutive_misses: u32,
    /// Misses tolerated before promotion
    pub threshold: u32,
}

impl ActiveRankState {
    pub fn is_active(&self, rank: u32) -> bool {
        self.active_rank == rank
    }
}

/// Effect of feeding one observation into the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankTransition {
    /// Active rank unchanged
    Unchanged,
    /// Threshold reached, next rank promoted
    Promoted { from: u32, to: u32 },
}

/// Owner of the [`ActiveRankState`] for one signer process.
pub struct RankController {
    self_rank: u32,
    set_size: u32,
    state: Mutex<ActiveRankState>,
    notifier: watch::Sender<ActiveRankState>,
}

impl RankController {
    /// Create a controller for a set of `set_size` signers where this
    /// process holds `self_rank`. Rank 1 starts active.
    pub fn new(set_size: u32, threshold: u32, self_rank: u32) -> Result<Self, RankError> {
        if set_size < 1 {
            return Err(RankError::InvalidSetSize(set_size));
        }
        if threshold < 1 {
            return Err(RankError::InvalidThreshold(threshold));
        }
        if self_rank < 1 || self_rank > set_size {
            return Err(RankError::InvalidRank {
                rank: self_rank,
                set_size,
            });
        }

        let initial = ActiveRankState {
            active_rank: 1,
            consecutive_misses: 0,
            threshold,
        };
        let (notifier, _) = watch::channel(initial);

        info!(
            "Rank controller: self_rank={}, set_size={}, threshold={}",
            self_rank, set_size, threshold
        );

        Ok(Self {
            self_rank,
            set_size,
            state: Mutex::new(initial),
            notifier,
        })
    }

    /// This process's own rank.
    pub fn self_rank(&self) -> u32 {
        self.self_rank
    }

    pub fn set_size(&self) -> u32 {
        self.set_size
    }

    /// Whether `rank` is the active rank.
    pub fn is_active(&self, rank: u32) -> bool {
        self.snapshot().is_active(rank)
    }

    /// Whether this process is the active signer.
    pub fn is_self_active(&self) -> bool {
        self.is_active(self.self_rank)
    }

    pub fn active_rank(&self) -> u32 {
        self.snapshot().active_rank
    }

    pub fn snapshot(&self) -> ActiveRankState {
        *self.lock()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ActiveRankState> {
        self.notifier.subscribe()
    }

    /// The active signer produced a timely, valid signature.
    pub fn record_success(&self) {
        let mut state = self.lock();
        if state.consecutive_misses != 0 {
            debug!(
                "Active rank {} recovered after {} misses",
                state.active_rank, state.consecutive_misses
            );
            state.consecutive_misses = 0;
            self.notifier.send_replace(*state);
        }
    }

    /// The active signer missed an expected signing opportunity.
    pub fn record_miss(&self) -> RankTransition {
        let mut state = self.lock();
        state.consecutive_misses += 1;

        let transition = if state.consecutive_misses >= state.threshold {
            let from = state.active_rank;
            let to = (from % self.set_size) + 1;
            state.active_rank = to;
            state.consecutive_misses = 0;
            warn!(
                "Rank {} missed {} consecutive signatures, promoting rank {}",
                from, state.threshold, to
            );
            RankTransition::Promoted { from, to }
        } else {
            debug!(
                "Rank {} missed a signature ({}/{})",
                state.active_rank, state.consecutive_misses, state.threshold
            );
            RankTransition::Unchanged
        };

        self.notifier.send_replace(*state);
        transition
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ActiveRankState> {
        // The state is plain data and every mutation completes before the
        // guard drops, so a poisoned lock still holds a consistent value.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
