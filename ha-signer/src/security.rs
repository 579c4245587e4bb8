//! Double-sign protection.
//!
//! Keeps, per chain, the last (height, round, step) this validator signed
//! together with the payload hash and signature. A request is admitted
//! only if it is strictly ahead of that position. A request at exactly the
//! same position is a replay: it is answered with the cached signature
//! when the payload hash matches and refused otherwise.
//!
//! The check-then-commit sequence is a critical section per chain. Callers
//! obtain a [`ChainLock`] first and hold it until the signature is recorded,
//! so no two requests for one chain are ever in flight together.
//!
//! State is written through a [`SignStateStore`] before a request is
//! admitted. If the write fails the request is not admitted.

use crate::protocol::Step;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// Errors related to double-sign protection.
#[derive(Debug, Error)]
pub enum DoubleSignError {
    #[error("Failed to persist state: {0}")]
    PersistError(#[from] std::io::Error),

    #[error("Failed to parse state file: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid validator state file: {0}")]
    InvalidValidatorState(String),
}

/// Ordered consensus position. Field order gives the comparison order:
/// height, then round, then step. A `None` step sorts before every step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SignedPosition {
    pub height: i64,
    pub round: i64,
    pub step: Option<Step>,
}

impl SignedPosition {
    pub fn new(height: i64, round: i64, step: Step) -> Self {
        Self {
            height,
            round,
            step: Some(step),
        }
    }
}

/// Record of the last signed message for one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSigned {
    pub height: i64,
    pub round: i64,
    /// `None` when seeded from a validator state that had signed nothing
    /// yet at this round
    pub step: Option<Step>,
    /// SHA-256 of the signed payload; unknown for seeded records
    pub payload_hash: Option<[u8; 32]>,
    /// Signature produced for the payload, once recorded
    pub signature: Option<Vec<u8>>,
    /// Unix timestamp when admitted
    pub timestamp: u64,
}

impl LastSigned {
    pub fn position(&self) -> SignedPosition {
        SignedPosition {
            height: self.height,
            round: self.round,
            step: self.step,
        }
    }
}

/// Persistent state for double-sign protection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoubleSignState {
    /// Map from chain id to last signed record
    pub last_signed: HashMap<String, LastSigned>,
}

/// Why a request was refused by the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Candidate is behind the last signed position
    Stale { last: SignedPosition },
    /// Candidate is at the last signed position with a different payload,
    /// or the payload at that position is unknown
    ConflictingPayload { last: SignedPosition },
}

/// Outcome of [`DoubleSignGuard::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Strictly ahead; the new position is already durable
    Fresh,
    /// Same position and payload as the last signed message. Carries the
    /// cached signature when one was recorded.
    Replay { signature: Option<Vec<u8>> },
    /// Refused
    Reject(Rejection),
}

/// Durable storage for [`DoubleSignState`].
pub trait SignStateStore: Send + Sync {
    /// Load the stored state, `None` if nothing was ever stored.
    fn load(&self) -> Result<Option<DoubleSignState>, DoubleSignError>;

    /// Durably replace the stored state.
    fn store(&self, state: &DoubleSignState) -> Result<(), DoubleSignError>;
}

/// JSON file store with atomic replace.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SignStateStore for FileStateStore {
    fn load(&self) -> Result<Option<DoubleSignState>, DoubleSignError> {
        if !self.path.exists() {
            return Ok(None);
        }
        info!("Loading double-sign protection state from {:?}", self.path);
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        Ok(Some(serde_json::from_reader(reader)?))
    }

    fn store(&self, state: &DoubleSignState) -> Result<(), DoubleSignError> {
        // Write to temp file first, then rename (atomic on POSIX)
        let temp_path = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, state)?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| e.into_error())?
            .sync_all()?;

        fs::rename(&temp_path, &self.path)?;

        debug!("Persisted double-sign protection state");
        Ok(())
    }
}

/// Volatile store, for tests and embedding.
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<DoubleSignState>>,
}

impl SignStateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<DoubleSignState>, DoubleSignError> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }

    fn store(&self, state: &DoubleSignState) -> Result<(), DoubleSignError> {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(state.clone());
        Ok(())
    }
}

/// The validator's own state file (`priv_validator_state.json`).
///
/// Height is a decimal string; step is 0 (nothing signed at this round),
/// 1 propose, 2 prevote or 3 precommit.
#[derive(Debug, Deserialize)]
struct ValidatorStateFile {
    height: String,
    round: i64,
    step: u8,
}

/// Exclusive right to admit requests for one chain.
pub struct ChainLock {
    chain_id: String,
    _permit: OwnedMutexGuard<()>,
}

impl ChainLock {
    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }
}

/// Guard that prevents double-signing.
///
/// Maintains persistent state to ensure the signer never signs
/// conflicting messages, even across restarts.
pub struct DoubleSignGuard {
    store: Box<dyn SignStateStore>,
    state: Mutex<DoubleSignState>,
    chain_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DoubleSignGuard {
    /// Create a guard over `store`. A store that was never written starts
    /// from an empty state: every chain is "never signed".
    pub fn new(store: impl SignStateStore + 'static) -> Result<Self, DoubleSignError> {
        let state = match store.load()? {
            Some(state) => state,
            None => {
                info!("No double-sign protection state found, starting empty");
                DoubleSignState::default()
            }
        };

        Ok(Self {
            store: Box::new(store),
            state: Mutex::new(state),
            chain_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Guard persisted as JSON at `state_file`.
    pub fn open(state_file: impl Into<PathBuf>) -> Result<Self, DoubleSignError> {
        Self::new(FileStateStore::new(state_file))
    }

    /// Seed `chain_id` from the validator state file if the guard holds no
    /// record for it yet. Returns whether a record was seeded.
    pub fn seed_from_validator_state(
        &self,
        chain_id: &str,
        path: impl AsRef<Path>,
    ) -> Result<bool, DoubleSignError> {
        let mut state = self.lock_state();
        if state.last_signed.contains_key(chain_id) {
            return Ok(false);
        }

        let file = File::open(path.as_ref())?;
        let seed: ValidatorStateFile = serde_json::from_reader(BufReader::new(file))?;
        let height: i64 = seed.height.parse().map_err(|_| {
            DoubleSignError::InvalidValidatorState(format!("height {:?}", seed.height))
        })?;
        if height < 0 || seed.round < 0 {
            return Err(DoubleSignError::InvalidValidatorState(format!(
                "negative height/round {}/{}",
                height, seed.round
            )));
        }
        let step = match seed.step {
            0 => None,
            n => Some(Step::from_rank(n).ok_or_else(|| {
                DoubleSignError::InvalidValidatorState(format!("step {}", n))
            })?),
        };

        let record = LastSigned {
            height,
            round: seed.round,
            step,
            payload_hash: None,
            signature: None,
            timestamp: current_timestamp(),
        };
        let mut next = state.clone();
        next.last_signed.insert(chain_id.to_string(), record);
        self.store.store(&next)?;
        *state = next;

        info!(
            "Seeded double-sign protection for chain={} at height={}, round={}, step={:?}",
            chain_id, height, seed.round, step
        );
        Ok(true)
    }

    /// Wait for exclusive access to `chain_id`.
    pub async fn lock_chain(&self, chain_id: &str) -> ChainLock {
        let mutex = {
            let mut locks = self
                .chain_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(chain_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        ChainLock {
            chain_id: chain_id.to_string(),
            _permit: mutex.lock_owned().await,
        }
    }

    /// Decide whether the message at `position` with `payload_hash` may be
    /// signed for the locked chain. A fresh admission is durable before
    /// this returns; a storage failure is returned as an error and nothing
    /// is admitted.
    pub fn admit(
        &self,
        lock: &ChainLock,
        position: SignedPosition,
        payload_hash: [u8; 32],
    ) -> Result<Admission, DoubleSignError> {
        let chain_id = lock.chain_id();
        let mut state = self.lock_state();

        if let Some(last) = state.last_signed.get(chain_id) {
            let last_position = last.position();
            match position.cmp(&last_position) {
                Ordering::Less => {
                    warn!(
                        "Rejecting sign request behind last signed: chain={}, requested={:?}, last={:?}",
                        chain_id, position, last_position
                    );
                    return Ok(Admission::Reject(Rejection::Stale {
                        last: last_position,
                    }));
                }
                Ordering::Equal => {
                    if last.payload_hash == Some(payload_hash) {
                        debug!("Allowing idempotent sign request for same payload");
                        return Ok(Admission::Replay {
                            signature: last.signature.clone(),
                        });
                    }
                    error!(
                        "DOUBLE-SIGN ATTEMPT BLOCKED: chain={}, position={:?}, prev_hash={}, new_hash={}",
                        chain_id,
                        position,
                        last.payload_hash
                            .map(|h| hex::encode(&h[..8]))
                            .unwrap_or_else(|| "unknown".to_string()),
                        hex::encode(&payload_hash[..8])
                    );
                    return Ok(Admission::Reject(Rejection::ConflictingPayload {
                        last: last_position,
                    }));
                }
                Ordering::Greater => {}
            }
        }

        let record = LastSigned {
            height: position.height,
            round: position.round,
            step: position.step,
            payload_hash: Some(payload_hash),
            signature: None,
            timestamp: current_timestamp(),
        };
        let mut next = state.clone();
        next.last_signed.insert(chain_id.to_string(), record);
        self.store.store(&next)?;
        *state = next;

        Ok(Admission::Fresh)
    }

    /// Cache the signature produced for the admitted `position`, so a
    /// replay can be answered without signing again.
    pub fn record_signature(
        &self,
        lock: &ChainLock,
        position: SignedPosition,
        signature: &[u8],
    ) -> Result<(), DoubleSignError> {
        let chain_id = lock.chain_id();
        let mut state = self.lock_state();

        let mut next = state.clone();
        match next.last_signed.get_mut(chain_id) {
            Some(last) if last.position() == position => {
                if last.signature.as_deref() == Some(signature) {
                    return Ok(());
                }
                last.signature = Some(signature.to_vec());
            }
            _ => {
                warn!(
                    "Not caching signature for chain={} at {:?}: no longer the last signed position",
                    chain_id, position
                );
                return Ok(());
            }
        }
        self.store.store(&next)?;
        *state = next;
        Ok(())
    }

    /// Last signed record for `chain_id`.
    pub fn last_signed(&self, chain_id: &str) -> Option<LastSigned> {
        self.lock_state().last_signed.get(chain_id).cloned()
    }

    /// Get the current state (for debugging/monitoring).
    pub fn state(&self) -> DoubleSignState {
        self.lock_state().clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, DoubleSignState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Hash a payload using SHA-256.
pub fn payload_hash(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Get current Unix timestamp.
fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    const CHAIN: &str = "testchain";

    fn create_test_guard() -> (DoubleSignGuard, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let guard = DoubleSignGuard::open(temp_dir.path().join("state.json")).unwrap();
        (guard, temp_dir)
    }

    /// Store whose writes can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStateStore,
        failing: std::sync::atomic::AtomicBool,
    }

    impl SignStateStore for Arc<FlakyStore> {
        fn load(&self) -> Result<Option<DoubleSignState>, DoubleSignError> {
            self.inner.load()
        }

        fn store(&self, state: &DoubleSignState) -> Result<(), DoubleSignError> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(DoubleSignError::PersistError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.inner.store(state)
        }
    }

    async fn sign(guard: &DoubleSignGuard, position: SignedPosition, payload: &[u8]) -> Admission {
        let lock = guard.lock_chain(CHAIN).await;
        let admission = guard.admit(&lock, position, payload_hash(payload)).unwrap();
        if admission == Admission::Fresh {
            let signature = [payload, &b"-sig"[..]].concat();
            guard.record_signature(&lock, position, &signature).unwrap();
        }
        admission
    }

    #[tokio::test]
    async fn test_first_sign_allowed() {
        let (guard, _temp) = create_test_guard();
        let admission = sign(&guard, SignedPosition::new(1, 0, Step::Propose), b"block").await;
        assert_eq!(admission, Admission::Fresh);
    }

    #[tokio::test]
    async fn test_replay_and_conflict_at_same_position() {
        let (guard, _temp) = create_test_guard();
        let position = SignedPosition::new(10, 0, Step::Precommit);
        assert_eq!(sign(&guard, position, b"vote-a").await, Admission::Fresh);

        // Same payload: cached signature, no re-sign.
        assert_eq!(
            sign(&guard, position, b"vote-a").await,
            Admission::Replay {
                signature: Some(b"vote-a-sig".to_vec())
            }
        );

        // Different payload: double sign.
        assert_eq!(
            sign(&guard, position, b"vote-b").await,
            Admission::Reject(Rejection::ConflictingPayload { last: position })
        );

        // Behind: stale.
        assert_eq!(
            sign(&guard, SignedPosition::new(9, 0, Step::Propose), b"old").await,
            Admission::Reject(Rejection::Stale { last: position })
        );

        // Ahead: accepted and state advances.
        let next = SignedPosition::new(11, 0, Step::Propose);
        assert_eq!(sign(&guard, next, b"new").await, Admission::Fresh);
        assert_eq!(guard.last_signed(CHAIN).unwrap().position(), next);
    }

    #[tokio::test]
    async fn test_replay_does_not_mutate_state() {
        let (guard, temp) = create_test_guard();
        let position = SignedPosition::new(5, 1, Step::Prevote);
        sign(&guard, position, b"vote").await;

        let path = temp.path().join("state.json");
        let before = fs::read(&path).unwrap();
        let state_before = guard.state();

        sign(&guard, position, b"vote").await;
        assert_eq!(fs::read(&path).unwrap(), before);
        assert_eq!(guard.state(), state_before);
    }

    #[tokio::test]
    async fn test_step_and_round_ordering() {
        let (guard, _temp) = create_test_guard();
        assert_eq!(
            sign(&guard, SignedPosition::new(3, 0, Step::Prevote), b"a").await,
            Admission::Fresh
        );
        assert!(matches!(
            sign(&guard, SignedPosition::new(3, 0, Step::Propose), b"b").await,
            Admission::Reject(Rejection::Stale { .. })
        ));
        assert_eq!(
            sign(&guard, SignedPosition::new(3, 0, Step::Precommit), b"c").await,
            Admission::Fresh
        );
        assert_eq!(
            sign(&guard, SignedPosition::new(3, 1, Step::Propose), b"d").await,
            Admission::Fresh
        );
        assert!(matches!(
            sign(&guard, SignedPosition::new(3, 0, Step::Precommit), b"c").await,
            Admission::Reject(Rejection::Stale { .. })
        ));
    }

    #[tokio::test]
    async fn test_chains_tracked_separately() {
        let (guard, _temp) = create_test_guard();
        let position = SignedPosition::new(7, 0, Step::Precommit);

        let lock_a = guard.lock_chain("chain-a").await;
        assert_eq!(
            guard.admit(&lock_a, position, payload_hash(b"x")).unwrap(),
            Admission::Fresh
        );
        drop(lock_a);

        let lock_b = guard.lock_chain("chain-b").await;
        assert_eq!(
            guard.admit(&lock_b, position, payload_hash(b"y")).unwrap(),
            Admission::Fresh
        );
    }

    #[tokio::test]
    async fn test_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let state_file = temp_dir.path().join("state.json");
        let position = SignedPosition::new(10, 0, Step::Precommit);

        {
            let guard = DoubleSignGuard::open(state_file.clone()).unwrap();
            assert_eq!(sign(&guard, position, b"vote").await, Admission::Fresh);
        }

        {
            let guard = DoubleSignGuard::open(state_file).unwrap();
            assert_eq!(
                sign(&guard, position, b"other-vote").await,
                Admission::Reject(Rejection::ConflictingPayload { last: position })
            );
            assert_eq!(
                sign(&guard, position, b"vote").await,
                Admission::Replay {
                    signature: Some(b"vote-sig".to_vec())
                }
            );
        }
    }

    #[tokio::test]
    async fn test_replay_without_cached_signature() {
        let (guard, _temp) = create_test_guard();
        let position = SignedPosition::new(2, 0, Step::Prevote);

        let lock = guard.lock_chain(CHAIN).await;
        assert_eq!(
            guard.admit(&lock, position, payload_hash(b"v")).unwrap(),
            Admission::Fresh
        );
        // Crash before the signature was cached.
        assert_eq!(
            guard.admit(&lock, position, payload_hash(b"v")).unwrap(),
            Admission::Replay { signature: None }
        );
    }

    #[tokio::test]
    async fn test_persist_failure_admits_nothing() {
        let store = Arc::new(FlakyStore::default());
        let guard = DoubleSignGuard::new(store.clone()).unwrap();
        let position = SignedPosition::new(1, 0, Step::Propose);

        store
            .failing
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let lock = guard.lock_chain(CHAIN).await;
        assert!(matches!(
            guard.admit(&lock, position, payload_hash(b"p")),
            Err(DoubleSignError::PersistError(_))
        ));
        assert!(guard.last_signed(CHAIN).is_none());

        store
            .failing
            .store(false, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(
            guard.admit(&lock, position, payload_hash(b"p")).unwrap(),
            Admission::Fresh
        );
    }

    #[tokio::test]
    async fn test_seed_from_validator_state() {
        let (guard, temp) = create_test_guard();
        let seed_path = temp.path().join("priv_validator_state.json");
        fs::write(
            &seed_path,
            r#"{ "height": "10", "round": 0, "step": 3 }"#,
        )
        .unwrap();

        assert!(guard.seed_from_validator_state(CHAIN, &seed_path).unwrap());
        // Only seeds once.
        assert!(!guard.seed_from_validator_state(CHAIN, &seed_path).unwrap());

        let seeded = SignedPosition::new(10, 0, Step::Precommit);
        // Payload at the seeded position is unknown, so even a replay is refused.
        assert_eq!(
            sign(&guard, seeded, b"vote").await,
            Admission::Reject(Rejection::ConflictingPayload { last: seeded })
        );
        assert!(matches!(
            sign(&guard, SignedPosition::new(9, 0, Step::Propose), b"old").await,
            Admission::Reject(Rejection::Stale { .. })
        ));
        assert_eq!(
            sign(&guard, SignedPosition::new(11, 0, Step::Propose), b"new").await,
            Admission::Fresh
        );
    }

    #[tokio::test]
    async fn test_seed_with_nothing_signed_at_round() {
        let (guard, temp) = create_test_guard();
        let seed_path = temp.path().join("priv_validator_state.json");
        fs::write(&seed_path, r#"{ "height": "0", "round": 0, "step": 0 }"#).unwrap();
        guard.seed_from_validator_state(CHAIN, &seed_path).unwrap();

        assert_eq!(
            sign(&guard, SignedPosition::new(0, 0, Step::Propose), b"first").await,
            Admission::Fresh
        );
    }

    #[test]
    fn test_seed_rejects_bad_step() {
        let (guard, temp) = create_test_guard();
        let seed_path = temp.path().join("priv_validator_state.json");
        fs::write(&seed_path, r#"{ "height": "1", "round": 0, "step": 9 }"#).unwrap();

        assert!(matches!(
            guard.seed_from_validator_state(CHAIN, &seed_path),
            Err(DoubleSignError::InvalidValidatorState(_))
        ));
    }

    #[tokio::test]
    async fn test_random_sequences_stay_monotonic() {
        let (guard, _temp) = create_test_guard();
        let mut rng = StdRng::seed_from_u64(7);
        let steps = [Step::Propose, Step::Prevote, Step::Precommit];
        let mut history: Vec<SignedPosition> = Vec::new();

        for _ in 0..300 {
            let position = SignedPosition::new(
                rng.gen_range(0..20),
                rng.gen_range(0..3),
                steps[rng.gen_range(0..3)],
            );
            let payload = [rng.gen_range(0..2u8)];
            let before = guard.last_signed(CHAIN).map(|l| l.position());

            match sign(&guard, position, &payload).await {
                Admission::Fresh => {
                    assert!(before.map_or(true, |b| position > b));
                    history.push(position);
                }
                Admission::Replay { .. } => assert_eq!(before, Some(position)),
                Admission::Reject(_) => {
                    assert!(before.map_or(false, |b| position <= b));
                }
            }
        }

        assert!(history.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_concurrent_requests_serialized() {
        let (guard, _temp) = create_test_guard();
        let guard = Arc::new(guard);
        let position = SignedPosition::new(42, 0, Step::Precommit);

        let mut handles = Vec::new();
        for i in 0..16u8 {
            let guard = guard.clone();
            handles.push(tokio::spawn(async move {
                let lock = guard.lock_chain(CHAIN).await;
                guard.admit(&lock, position, payload_hash(&[i])).unwrap()
            }));
        }

        let mut fresh = 0;
        for handle in handles {
            if handle.await.unwrap() == Admission::Fresh {
                fresh += 1;
            }
        }
        // Exactly one conflicting payload wins the position.
        assert_eq!(fresh, 1);
    }
}
