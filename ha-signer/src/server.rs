//! Signer daemon lifecycle.
//!
//! Dials the validator, authenticates, serves sign requests until the
//! session drops, then dials again. Runs until the cancellation token
//! fires.

use crate::channel::{self, ChannelError, DialConfig};
use crate::config::{
    self, Config, ConfigError, MissFeed, SEED_FILE_NAME, SIGN_STATE_FILE_NAME,
};
use crate::identity::{IdentityError, SignerIdentity};
use crate::liveness::{LivenessError, LivenessMonitor, RpcCommitSource};
use crate::rank::{ActiveRankState, RankController, RankError};
use crate::security::{DoubleSignError, DoubleSignGuard};
use crate::session::{SessionError, SigningSession};
use crate::signer::{ConsensusSigner, FileValidatorKey, SignerError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Chain this signer serves
    pub chain_id: String,
    /// How to reach the validator
    pub dial: DialConfig,
    /// Signers in the set
    pub set_size: u32,
    /// Consecutive misses before promotion
    pub threshold: u32,
    /// This signer's rank
    pub rank: u32,
    /// Bound on one signing call
    pub sign_timeout: Duration,
    /// Source of miss signals
    pub miss_feed: MissFeed,
    /// Validator RPC `host:port`, polled when `miss_feed` is `Commits`
    pub rpc_addr: String,
    /// First committed height counted for failover, shared by the set
    pub commit_start_height: Option<i64>,
    pub commit_poll_interval: Duration,
    /// Validator key file
    pub key_file: PathBuf,
    /// Validator state file, seeds the guard on first start
    pub validator_state_file: PathBuf,
    /// Guard state written by this signer
    pub sign_state_file: PathBuf,
    /// Connection seed file
    pub seed_file: PathBuf,
}

impl ServerConfig {
    /// Derive the server configuration from a validated [`Config`].
    /// Daemon-owned files live in `config_dir`.
    pub fn from_config(config: &Config, config_dir: &Path) -> Result<Self, ConfigError> {
        let mut dial = DialConfig::new(config.init.validator_listen_addr.clone());
        dial.retry_interval = config.retry_dial_interval();
        dial.peer_policy = config.peer_policy()?;

        Ok(Self {
            chain_id: config.file_pv.chain_id.clone(),
            dial,
            set_size: config.init.set_size,
            threshold: config.init.threshold,
            rank: config.init.rank,
            sign_timeout: config.request_timeout(),
            miss_feed: config.init.miss_feed,
            rpc_addr: config.init.validator_listen_addr_rpc.clone(),
            commit_start_height: config.commit_start_height(),
            commit_poll_interval: config.commit_poll_interval(),
            key_file: config.file_pv.key_file_path.clone(),
            validator_state_file: config.file_pv.state_file_path.clone(),
            sign_state_file: config_dir.join(SIGN_STATE_FILE_NAME),
            seed_file: config_dir.join(SEED_FILE_NAME),
        })
    }
}

/// Errors from the signer server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Validator key error: {0}")]
    Signer(#[from] SignerError),

    #[error("Rank error: {0}")]
    Rank(#[from] RankError),

    #[error("Double-sign error: {0}")]
    DoubleSign(#[from] DoubleSignError),

    #[error("Liveness error: {0}")]
    Liveness(#[from] LivenessError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Remote signer server.
pub struct SignerServer {
    identity: SignerIdentity,
    dial: DialConfig,
    rank: Arc<RankController>,
    session: SigningSession,
    liveness: Option<LivenessMonitor<RpcCommitSource>>,
}

impl SignerServer {
    /// Load keys and state and build every component. Fails on the first
    /// missing or invalid input.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config::validate_miss_feed(
            config.miss_feed,
            config.set_size,
            config.commit_start_height,
        )?;
        let identity = SignerIdentity::load_seed_file(&config.seed_file)?;
        let key = FileValidatorKey::load(&config.key_file)?;
        info!(
            "Loaded validator key, address: {}, pubkey: {}",
            key.address(),
            hex::encode(key.public_key())
        );
        let address = key.address().to_string();

        let rank = Arc::new(RankController::new(
            config.set_size,
            config.threshold,
            config.rank,
        )?);

        let guard = DoubleSignGuard::open(&config.sign_state_file)?;
        guard.seed_from_validator_state(&config.chain_id, &config.validator_state_file)?;

        let session = SigningSession::new(
            config.chain_id,
            rank.clone(),
            Arc::new(guard),
            Arc::new(key),
        )
        .with_sign_timeout(config.sign_timeout)
        .with_outcome_feed(config.miss_feed == MissFeed::Session);

        let liveness = match config.miss_feed {
            MissFeed::Session => None,
            MissFeed::Commits => {
                let source = RpcCommitSource::new(&config.rpc_addr, config.sign_timeout)?;
                Some(
                    LivenessMonitor::new(
                        source,
                        rank.clone(),
                        address,
                        config.commit_poll_interval,
                    )
                    .with_start_height(config.commit_start_height),
                )
            }
        };

        Ok(Self {
            identity,
            dial: config.dial,
            rank,
            session,
            liveness,
        })
    }

    /// Run until `cancel` fires. With the commit feed, the rank is brought
    /// up to the chain tip before the first dial.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ServerError> {
        info!(
            "Signer server starting: chain={}, rank={}/{}, validator={}, channel key: {}",
            self.session.chain_id(),
            self.rank.self_rank(),
            self.rank.set_size(),
            self.dial.address,
            hex::encode(self.identity.public_key_bytes())
        );

        let liveness = match self.liveness.take() {
            Some(mut monitor) => {
                if !monitor.catch_up(&cancel).await {
                    info!("Signer server stopped before catching up with commits");
                    return Ok(());
                }
                Some(monitor)
            }
            None => None,
        };

        let mut background = Vec::new();
        background.push(tokio::spawn(watch_rank(
            self.rank.subscribe(),
            self.rank.self_rank(),
            cancel.clone(),
        )));
        if let Some(monitor) = liveness {
            background.push(tokio::spawn(monitor.run(cancel.clone())));
        }

        loop {
            let mut session =
                match channel::connect_until_established(&self.dial, &self.identity, &cancel)
                    .await
                {
                    Ok(session) => session,
                    Err(ChannelError::Cancelled) => break,
                    Err(e) => return Err(e.into()),
                };

            match self.session.serve(&mut session, &cancel).await {
                Ok(()) => break,
                Err(SessionError::Channel(ChannelError::Closed)) => {
                    info!("Validator closed the connection, reconnecting");
                }
                Err(e) => {
                    warn!("Session with validator ended: {}, reconnecting", e);
                }
            }
        }

        for handle in background {
            if let Err(e) = handle.await {
                error!("Background task failed: {}", e);
            }
        }
        info!("Signer server stopped");
        Ok(())
    }
}

/// Log whenever this signer moves between active and standby.
async fn watch_rank(
    mut rx: watch::Receiver<ActiveRankState>,
    self_rank: u32,
    cancel: CancellationToken,
) {
    let mut was_active = rx.borrow().is_active(self_rank);
    info!(
        "Rank {} starting as {}",
        self_rank,
        if was_active { "active" } else { "standby" }
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }

        let is_active = rx.borrow_and_update().is_active(self_rank);
        if is_active && !was_active {
            warn!("Rank {} is now the active signer", self_rank);
        } else if !is_active && was_active {
            warn!("Rank {} stepped down to standby", self_rank);
        }
        was_active = is_active;
    }
}
