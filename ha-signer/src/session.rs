//! Signing session: turns wire requests into signatures or refusals.
//!
//! A sign request passes, in order:
//!
//! 1. shape validation and chain check (refused as `Malformed` /
//!    `UnknownChain`),
//! 2. the rank check (refused as `NotActiveSigner` while on standby),
//! 3. the double-sign guard, under the chain's lock (refused as
//!    `DoubleSignRefused`, or answered from cache on replay),
//! 4. the signing capability, bounded by a timeout,
//! 5. caching of the signature in the guard.
//!
//! The guard commit in step 3 is durable before the signature leaves this
//! process, so a crash after signing is answered by a replay and a crash
//! before the commit never signs at all.

use crate::channel::{ChannelError, SecureSession};
use crate::protocol::{
    ProtocolError, PubKeyResponse, RefusalReason, Request, Response, SignResponse,
    SignVoteRequest,
};
use crate::rank::RankController;
use crate::security::{payload_hash, Admission, DoubleSignGuard, Rejection, SignedPosition};
use crate::signer::ConsensusSigner;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default bound on one call into the signing capability.
pub const DEFAULT_SIGN_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors that end a session's serve loop.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Outcome of one sign attempt as seen by failover.
enum Outcome {
    /// Not a signing opportunity of the active signer
    Ignored,
    Success,
    Miss,
}

/// Request handler for one signer process.
pub struct SigningSession {
    chain_id: String,
    rank: Arc<RankController>,
    guard: Arc<DoubleSignGuard>,
    signer: Arc<dyn ConsensusSigner>,
    sign_timeout: Duration,
    feed_outcomes: bool,
}

impl SigningSession {
    pub fn new(
        chain_id: impl Into<String>,
        rank: Arc<RankController>,
        guard: Arc<DoubleSignGuard>,
        signer: Arc<dyn ConsensusSigner>,
    ) -> Self {
        Self {
            chain_id: chain_id.into(),
            rank,
            guard,
            signer,
            sign_timeout: DEFAULT_SIGN_TIMEOUT,
            feed_outcomes: true,
        }
    }

    pub fn with_sign_timeout(mut self, timeout: Duration) -> Self {
        self.sign_timeout = timeout;
        self
    }

    /// Whether sign outcomes are fed to the rank controller. Disabled when
    /// another source (the commit watcher) reports misses.
    pub fn with_outcome_feed(mut self, enabled: bool) -> Self {
        self.feed_outcomes = enabled;
        self
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Decode and handle one request frame. Undecodable frames are answered
    /// with [`Response::Malformed`].
    pub async fn handle_frame(&self, frame: &[u8]) -> Response {
        match Request::decode(frame) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                warn!("Undecodable request frame ({} bytes): {}", frame.len(), e);
                Response::Malformed {
                    message: e.to_string(),
                }
            }
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::SignVote(req) => Response::Sign(self.handle_sign(req).await),
            Request::GetPubKey => Response::PubKey(PubKeyResponse {
                pubkey: self.signer.public_key(),
            }),
            Request::Ping => Response::Pong,
        }
    }

    async fn handle_sign(&self, req: SignVoteRequest) -> SignResponse {
        debug!(
            "Sign request: chain={}, height={}, round={}, step={}, id={}",
            req.chain_id, req.height, req.round, req.step, req.request_id
        );

        let (response, outcome) = self.sign_vote(&req).await;

        if self.feed_outcomes {
            match outcome {
                Outcome::Success => self.rank.record_success(),
                Outcome::Miss => {
                    self.rank.record_miss();
                }
                Outcome::Ignored => {}
            }
        }
        response
    }

    async fn sign_vote(&self, req: &SignVoteRequest) -> (SignResponse, Outcome) {
        let id = req.request_id;

        if let Err(e) = req.validate() {
            return (
                SignResponse::refused(RefusalReason::Malformed, e.to_string(), id),
                Outcome::Ignored,
            );
        }
        if req.chain_id != self.chain_id {
            warn!(
                "Refusing sign request for unknown chain {} (serving {})",
                req.chain_id, self.chain_id
            );
            return (
                SignResponse::refused(
                    RefusalReason::UnknownChain,
                    format!("signer serves chain {}", self.chain_id),
                    id,
                ),
                Outcome::Ignored,
            );
        }

        if let Some(refusal) = self.standby_refusal(id) {
            return refusal;
        }

        let position = SignedPosition::new(req.height, req.round, req.step);
        let lock = self.guard.lock_chain(&req.chain_id).await;

        // The commit watcher may have promoted another rank while we waited.
        if let Some(refusal) = self.standby_refusal(id) {
            return refusal;
        }

        match self.guard.admit(&lock, position, payload_hash(&req.payload)) {
            Ok(Admission::Fresh) => {}
            Ok(Admission::Replay {
                signature: Some(signature),
            }) => {
                info!(
                    "Replaying cached signature: chain={}, height={}, round={}, step={}",
                    req.chain_id, req.height, req.round, req.step
                );
                return (
                    SignResponse::Success {
                        signature,
                        request_id: id,
                    },
                    Outcome::Success,
                );
            }
            Ok(Admission::Replay { signature: None }) => {
                debug!("Replay without cached signature, signing same payload again");
            }
            Ok(Admission::Reject(rejection)) => {
                let detail = match rejection {
                    Rejection::Stale { last } => format!(
                        "behind last signed {}/{}/{:?}",
                        last.height, last.round, last.step
                    ),
                    Rejection::ConflictingPayload { last } => format!(
                        "conflicts with payload signed at {}/{}/{:?}",
                        last.height, last.round, last.step
                    ),
                };
                error!(
                    "Double-sign attempt blocked: chain={}, height={}, round={}, step={}: {}",
                    req.chain_id, req.height, req.round, req.step, detail
                );
                return (
                    SignResponse::refused(RefusalReason::DoubleSignRefused, detail, id),
                    Outcome::Ignored,
                );
            }
            Err(e) => {
                error!("Failed to commit double-sign state, refusing to sign: {}", e);
                return (
                    SignResponse::refused(RefusalReason::PersistenceFailed, e.to_string(), id),
                    Outcome::Miss,
                );
            }
        }

        let signature =
            match tokio::time::timeout(self.sign_timeout, self.signer.sign(&req.payload)).await {
                Ok(Ok(signature)) => signature,
                Ok(Err(e)) => {
                    error!("Signing failed: {}", e);
                    return (
                        SignResponse::refused(RefusalReason::SigningFailed, e.to_string(), id),
                        Outcome::Miss,
                    );
                }
                Err(_) => {
                    warn!("Signing timed out after {:?}", self.sign_timeout);
                    return (
                        SignResponse::refused(
                            RefusalReason::SigningTimeout,
                            format!("no signature within {:?}", self.sign_timeout),
                            id,
                        ),
                        Outcome::Miss,
                    );
                }
            };

        if let Err(e) = self.guard.record_signature(&lock, position, &signature) {
            error!("Failed to cache signature, withholding it: {}", e);
            return (
                SignResponse::refused(RefusalReason::PersistenceFailed, e.to_string(), id),
                Outcome::Miss,
            );
        }

        debug!(
            "Signed successfully: id={}, sig_len={}",
            id,
            signature.len()
        );
        (
            SignResponse::Success {
                signature,
                request_id: id,
            },
            Outcome::Success,
        )
    }

    fn standby_refusal(&self, id: u64) -> Option<(SignResponse, Outcome)> {
        if self.rank.is_self_active() {
            return None;
        }
        let active = self.rank.active_rank();
        debug!(
            "Standby rank {} declining sign request, active rank is {}",
            self.rank.self_rank(),
            active
        );
        Some((
            SignResponse::refused(
                RefusalReason::NotActiveSigner,
                format!("active rank is {}", active),
                id,
            ),
            Outcome::Ignored,
        ))
    }

    /// Answer requests on `session` one at a time, in arrival order, until
    /// the channel fails or `cancel` fires.
    pub async fn serve<S>(
        &self,
        session: &mut SecureSession<S>,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                frame = session.receive_frame() => frame?,
            };
            let response = self.handle_frame(&frame).await;
            session.send_frame(&response.encode()?).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PeerPolicy;
    use crate::identity::SignerIdentity;
    use crate::protocol::Step;
    use crate::security::{DoubleSignError, DoubleSignState, MemoryStateStore, SignStateStore};
    use crate::signer::tests::TEST_KEY_FILE;
    use crate::signer::{FileValidatorKey, SignerError};
    use async_trait::async_trait;
    use tokio::io::duplex;

    const CHAIN: &str = "testchain";

    struct FailingSigner;

    #[async_trait]
    impl ConsensusSigner for FailingSigner {
        async fn sign(&self, _payload: &[u8]) -> Result<Vec<u8>, SignerError> {
            Err(SignerError::Signing("hsm unavailable".to_string()))
        }

        fn public_key(&self) -> Vec<u8> {
            vec![0; 32]
        }
    }

    struct StalledSigner;

    #[async_trait]
    impl ConsensusSigner for StalledSigner {
        async fn sign(&self, _payload: &[u8]) -> Result<Vec<u8>, SignerError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(vec![])
        }

        fn public_key(&self) -> Vec<u8> {
            vec![0; 32]
        }
    }

    struct BrokenStore;

    impl SignStateStore for BrokenStore {
        fn load(&self) -> Result<Option<DoubleSignState>, DoubleSignError> {
            Ok(None)
        }

        fn store(&self, _state: &DoubleSignState) -> Result<(), DoubleSignError> {
            Err(DoubleSignError::PersistError(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only filesystem",
            )))
        }
    }

    fn validator_key() -> Arc<dyn ConsensusSigner> {
        Arc::new(FileValidatorKey::from_json(TEST_KEY_FILE).unwrap())
    }

    fn create_session(
        signer: Arc<dyn ConsensusSigner>,
        set_size: u32,
        threshold: u32,
        rank: u32,
    ) -> (SigningSession, Arc<RankController>, Arc<DoubleSignGuard>) {
        let rank = Arc::new(RankController::new(set_size, threshold, rank).unwrap());
        let guard = Arc::new(DoubleSignGuard::new(MemoryStateStore::default()).unwrap());
        let session = SigningSession::new(CHAIN, rank.clone(), guard.clone(), signer);
        (session, rank, guard)
    }

    fn vote(height: i64, round: i64, step: Step, payload: &[u8]) -> Request {
        Request::SignVote(SignVoteRequest::new(
            CHAIN,
            height,
            round,
            step,
            payload.to_vec(),
        ))
    }

    async fn sign(session: &SigningSession, request: Request) -> SignResponse {
        match session.handle(request).await {
            Response::Sign(response) => response,
            other => panic!("Expected Sign response, got {:?}", other),
        }
    }

    fn refusal(response: &SignResponse) -> Option<RefusalReason> {
        match response {
            SignResponse::Refused { reason, .. } => Some(*reason),
            SignResponse::Success { .. } => None,
        }
    }

    fn signature(response: SignResponse) -> Vec<u8> {
        match response {
            SignResponse::Success { signature, .. } => signature,
            other => panic!("Expected signature, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_two_misses_hand_over_to_rank_two() {
        let (session, rank, _) = create_session(Arc::new(FailingSigner), 3, 2, 1);

        for height in 1..=2 {
            let response = sign(&session, vote(height, 0, Step::Prevote, b"v")).await;
            assert_eq!(refusal(&response), Some(RefusalReason::SigningFailed));
        }
        assert_eq!(rank.active_rank(), 2);

        let response = sign(&session, vote(3, 0, Step::Prevote, b"v")).await;
        assert_eq!(refusal(&response), Some(RefusalReason::NotActiveSigner));
        // A standby declining is not a miss.
        assert_eq!(rank.snapshot().consecutive_misses, 0);
    }

    #[tokio::test]
    async fn test_replay_conflict_and_progress() {
        let (session, _, guard) = create_session(validator_key(), 1, 1, 1);

        let first = signature(sign(&session, vote(10, 0, Step::Precommit, b"block-a")).await);
        let replayed = signature(sign(&session, vote(10, 0, Step::Precommit, b"block-a")).await);
        assert_eq!(first, replayed);

        let conflicting = sign(&session, vote(10, 0, Step::Precommit, b"block-b")).await;
        assert_eq!(
            refusal(&conflicting),
            Some(RefusalReason::DoubleSignRefused)
        );

        let stale = sign(&session, vote(9, 0, Step::Propose, b"old")).await;
        assert_eq!(refusal(&stale), Some(RefusalReason::DoubleSignRefused));

        signature(sign(&session, vote(11, 0, Step::Propose, b"next")).await);
        assert_eq!(
            guard.last_signed(CHAIN).unwrap().position(),
            SignedPosition::new(11, 0, Step::Propose)
        );
    }

    #[tokio::test]
    async fn test_standby_refuses_without_touching_guard() {
        let (session, _, guard) = create_session(validator_key(), 2, 1, 2);

        let response = sign(&session, vote(1, 0, Step::Propose, b"p")).await;
        assert_eq!(refusal(&response), Some(RefusalReason::NotActiveSigner));
        assert!(guard.last_signed(CHAIN).is_none());
    }

    #[tokio::test]
    async fn test_demotion_while_waiting_for_chain_lock() {
        let (session, rank, guard) = create_session(validator_key(), 2, 1, 1);
        let session = Arc::new(session.with_outcome_feed(false));

        let held = guard.lock_chain(CHAIN).await;
        let pending = {
            let session = session.clone();
            tokio::spawn(async move { sign(&session, vote(1, 0, Step::Prevote, b"v")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Another rank takes over before the request reaches the guard.
        rank.record_miss();
        assert_eq!(rank.active_rank(), 2);
        drop(held);

        let response = pending.await.unwrap();
        assert_eq!(refusal(&response), Some(RefusalReason::NotActiveSigner));
        assert!(guard.last_signed(CHAIN).is_none());
    }

    #[tokio::test]
    async fn test_success_clears_misses() {
        let (session, rank, _) = create_session(validator_key(), 2, 3, 1);
        rank.record_miss();
        rank.record_miss();

        signature(sign(&session, vote(1, 0, Step::Propose, b"p")).await);
        assert_eq!(rank.snapshot().consecutive_misses, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signing_timeout_counts_as_miss() {
        let (session, rank, _) = create_session(Arc::new(StalledSigner), 2, 5, 1);
        let session = session.with_sign_timeout(Duration::from_millis(100));

        let response = sign(&session, vote(1, 0, Step::Prevote, b"v")).await;
        assert_eq!(refusal(&response), Some(RefusalReason::SigningTimeout));
        assert_eq!(rank.snapshot().consecutive_misses, 1);
    }

    #[tokio::test]
    async fn test_outcome_feed_disabled() {
        let (session, rank, _) = create_session(Arc::new(FailingSigner), 2, 1, 1);
        let session = session.with_outcome_feed(false);

        sign(&session, vote(1, 0, Step::Prevote, b"v")).await;
        assert_eq!(rank.active_rank(), 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_refuses_to_sign() {
        let rank = Arc::new(RankController::new(1, 10, 1).unwrap());
        let guard = Arc::new(DoubleSignGuard::new(BrokenStore).unwrap());
        let session = SigningSession::new(CHAIN, rank.clone(), guard, validator_key());

        let response = sign(&session, vote(1, 0, Step::Propose, b"p")).await;
        assert_eq!(refusal(&response), Some(RefusalReason::PersistenceFailed));
        assert_eq!(rank.snapshot().consecutive_misses, 1);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_chain() {
        let (session, rank, _) = create_session(validator_key(), 1, 1, 1);

        let response = sign(&session, vote(1, 0, Step::Propose, b"")).await;
        assert_eq!(refusal(&response), Some(RefusalReason::Malformed));

        let other = Request::SignVote(SignVoteRequest::new(
            "otherchain",
            1,
            0,
            Step::Propose,
            b"p".to_vec(),
        ));
        let response = sign(&session, other).await;
        assert_eq!(refusal(&response), Some(RefusalReason::UnknownChain));

        assert!(matches!(
            session.handle_frame(&[0xff, 0xff, 0xff]).await,
            Response::Malformed { .. }
        ));
        assert_eq!(rank.snapshot().consecutive_misses, 0);
    }

    #[tokio::test]
    async fn test_ping_and_pubkey() {
        let signer = validator_key();
        let (session, _, _) = create_session(signer.clone(), 1, 1, 1);

        assert_eq!(session.handle(Request::Ping).await, Response::Pong);
        assert_eq!(
            session.handle(Request::GetPubKey).await,
            Response::PubKey(PubKeyResponse {
                pubkey: signer.public_key()
            })
        );
    }

    #[tokio::test]
    async fn test_serve_over_secure_session() {
        let (session, _, _) = create_session(validator_key(), 1, 1, 1);
        let signer_identity = SignerIdentity::generate();
        let node_identity = SignerIdentity::generate();

        let (left, right) = duplex(64 * 1024);
        let (signer_side, node_side) = tokio::join!(
            SecureSession::handshake(left, &signer_identity, &PeerPolicy::Any),
            SecureSession::handshake(right, &node_identity, &PeerPolicy::Any),
        );
        let mut signer_side = signer_side.unwrap();
        let mut node_side = node_side.unwrap();

        let cancel = CancellationToken::new();
        let serve_cancel = cancel.clone();
        let server = tokio::spawn(async move {
            session.serve(&mut signer_side, &serve_cancel).await
        });

        node_side.send_frame(&Request::Ping.encode().unwrap()).await.unwrap();
        let reply = Response::decode(&node_side.receive_frame().await.unwrap()).unwrap();
        assert_eq!(reply, Response::Pong);

        let request = vote(5, 0, Step::Prevote, b"vote");
        node_side.send_frame(&request.encode().unwrap()).await.unwrap();
        let reply = Response::decode(&node_side.receive_frame().await.unwrap()).unwrap();
        assert!(matches!(reply, Response::Sign(SignResponse::Success { .. })));

        cancel.cancel();
        assert!(server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_serve_ends_when_peer_closes() {
        let (session, _, _) = create_session(validator_key(), 1, 1, 1);
        let a = SignerIdentity::generate();
        let b = SignerIdentity::generate();

        let (left, right) = duplex(64 * 1024);
        let (signer_side, node_side) = tokio::join!(
            SecureSession::handshake(left, &a, &PeerPolicy::Any),
            SecureSession::handshake(right, &b, &PeerPolicy::Any),
        );
        let mut signer_side = signer_side.unwrap();
        drop(node_side);

        let result = session
            .serve(&mut signer_side, &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(SessionError::Channel(ChannelError::Closed))
        ));
    }
}
