//! Daemon configuration.
//!
//! Loaded from `config.toml` in the config directory, which is
//! `$HA_SIGNER_CONFIG_DIR` or `$HOME/.ha-signer`. Relative file paths in
//! the `[file_pv]` section are resolved against that directory.

use crate::channel::PeerPolicy;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding the config directory.
pub const CONFIG_DIR_ENV: &str = "HA_SIGNER_CONFIG_DIR";
/// Config directory name under `$HOME`.
pub const DEFAULT_DIR_NAME: &str = ".ha-signer";
pub const CONFIG_FILE_NAME: &str = "config.toml";
/// Connection seed file name inside the config directory.
pub const SEED_FILE_NAME: &str = "conn.key";
/// Guard state file name inside the config directory.
pub const SIGN_STATE_FILE_NAME: &str = "sign_state.json";

/// Template written by `ha-signer init`.
pub const CONFIG_TEMPLATE: &str = r#"[init]
# Minimum log level: TRACE, DEBUG, INFO, WARN or ERROR. RUST_LOG overrides it.
log_level = "INFO"

# Number of signers in the set.
set_size = 2

# Consecutive misses of the active signer before the next rank takes over.
threshold = 10

# This signer's rank in the set, 1 starts active.
rank = 1

# Endpoint the validator exposes for remote signers.
validator_listen_addr = "127.0.0.1:4000"

# Validator RPC endpoint, used when miss_feed = "commits".
validator_listen_addr_rpc = "127.0.0.1:26657"

# Pause between failed dials, in milliseconds.
retry_dial_interval_ms = 1000

# Bound on a single signing call, in milliseconds.
request_timeout_ms = 3000

# Where misses come from: "commits" (validator presence in committed blocks)
# or "session" (own sign outcomes, only valid when set_size = 1).
miss_feed = "commits"

# First committed height counted for failover. Every signer in the set must
# use the same value; the node must still serve commits from this height.
commit_start_height = 1

# Commit poll interval for miss_feed = "commits", in milliseconds.
commit_poll_interval_ms = 1000

# Hex ed25519 key the validator uses on the secure channel. Unset accepts
# any authenticated peer.
# validator_peer_key = ""

[file_pv]
chain_id = ""
key_file_path = "./priv_validator_key.json"
state_file_path = "./priv_validator_state.json"
"#;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("{field} does not exist: {path:?}")]
    MissingFile { field: &'static str, path: PathBuf },

    #[error("Cannot resolve config directory: set {CONFIG_DIR_ENV} or HOME")]
    NoConfigDir,
}

pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Source of miss signals for the rank controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissFeed {
    /// Outcomes of this signer's own sign requests. Standbys never see
    /// them, so this only works for a set of one.
    Session,
    /// Presence of the validator in committed blocks, via RPC
    #[default]
    Commits,
}

fn default_retry_dial_interval_ms() -> u64 {
    1000
}

fn default_request_timeout_ms() -> u64 {
    3000
}

fn default_commit_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitConfig {
    pub log_level: String,
    pub set_size: u32,
    pub threshold: u32,
    pub rank: u32,
    pub validator_listen_addr: String,
    pub validator_listen_addr_rpc: String,
    #[serde(default = "default_retry_dial_interval_ms")]
    pub retry_dial_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub miss_feed: MissFeed,
    #[serde(default)]
    pub commit_start_height: Option<i64>,
    #[serde(default = "default_commit_poll_interval_ms")]
    pub commit_poll_interval_ms: u64,
    #[serde(default)]
    pub validator_peer_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePvConfig {
    pub chain_id: String,
    pub key_file_path: PathBuf,
    pub state_file_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub init: InitConfig,
    pub file_pv: FilePvConfig,
}

impl Config {
    /// Parse a config file without validating it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load `config.toml` from `dir`, resolve relative paths against `dir`
    /// and validate.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        let mut config = Self::load(dir.join(CONFIG_FILE_NAME))?;
        config.resolve_paths(dir);
        config.validate()?;
        Ok(config)
    }

    /// Make relative key/state file paths relative to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.file_pv.key_file_path,
            &mut self.file_pv.state_file_path,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// Check every field. Returns the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let init = &self.init;

        init.log_level
            .parse::<tracing::Level>()
            .map_err(|_| invalid("log_level", format!("{:?}", init.log_level)))?;

        if init.set_size < 1 {
            return Err(invalid("set_size", "must be at least 1"));
        }
        if init.threshold < 1 {
            return Err(invalid("threshold", "must be at least 1"));
        }
        if init.rank < 1 || init.rank > init.set_size {
            return Err(invalid(
                "rank",
                format!("{} not in [1, {}]", init.rank, init.set_size),
            ));
        }

        validate_address("validator_listen_addr", &init.validator_listen_addr)?;
        validate_address("validator_listen_addr_rpc", &init.validator_listen_addr_rpc)?;

        if init.retry_dial_interval_ms == 0 {
            return Err(invalid("retry_dial_interval_ms", "must be positive"));
        }
        if init.request_timeout_ms == 0 {
            return Err(invalid("request_timeout_ms", "must be positive"));
        }
        if init.commit_poll_interval_ms == 0 {
            return Err(invalid("commit_poll_interval_ms", "must be positive"));
        }
        validate_miss_feed(init.miss_feed, init.set_size, init.commit_start_height)?;
        self.peer_policy()?;

        if self.file_pv.chain_id.is_empty() {
            return Err(invalid("chain_id", "must not be empty"));
        }
        if !self.file_pv.key_file_path.exists() {
            return Err(ConfigError::MissingFile {
                field: "key_file_path",
                path: self.file_pv.key_file_path.clone(),
            });
        }
        if !self.file_pv.state_file_path.exists() {
            return Err(ConfigError::MissingFile {
                field: "state_file_path",
                path: self.file_pv.state_file_path.clone(),
            });
        }
        Ok(())
    }

    pub fn log_level(&self) -> &str {
        &self.init.log_level
    }

    pub fn retry_dial_interval(&self) -> Duration {
        Duration::from_millis(self.init.retry_dial_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.init.request_timeout_ms)
    }

    pub fn commit_start_height(&self) -> Option<i64> {
        self.init.commit_start_height
    }

    pub fn commit_poll_interval(&self) -> Duration {
        Duration::from_millis(self.init.commit_poll_interval_ms)
    }

    /// Channel peer policy: pinned when `validator_peer_key` is set.
    pub fn peer_policy(&self) -> Result<PeerPolicy, ConfigError> {
        let Some(hex_key) = self.init.validator_peer_key.as_deref() else {
            return Ok(PeerPolicy::Any);
        };
        if hex_key.is_empty() {
            return Ok(PeerPolicy::Any);
        }
        let bytes: [u8; 32] = hex::decode(hex_key)
            .map_err(|e| invalid("validator_peer_key", e.to_string()))?
            .try_into()
            .map_err(|_| invalid("validator_peer_key", "must be 32 bytes"))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| invalid("validator_peer_key", e.to_string()))?;
        Ok(PeerPolicy::Pinned(key))
    }
}

/// Every signer in a set of more than one must derive the active rank from
/// the same miss history: the commit feed, counted from a shared height.
pub(crate) fn validate_miss_feed(
    feed: MissFeed,
    set_size: u32,
    start_height: Option<i64>,
) -> Result<(), ConfigError> {
    if let Some(height) = start_height {
        if height < 1 {
            return Err(invalid("commit_start_height", "must be at least 1"));
        }
    }
    if set_size <= 1 {
        return Ok(());
    }
    match (feed, start_height) {
        (MissFeed::Session, _) => Err(invalid(
            "miss_feed",
            "\"session\" is only valid when set_size = 1, use \"commits\"",
        )),
        (MissFeed::Commits, None) => Err(invalid(
            "commit_start_height",
            "required when set_size > 1",
        )),
        (MissFeed::Commits, Some(_)) => Ok(()),
    }
}

fn validate_address(field: &'static str, addr: &str) -> Result<(), ConfigError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| invalid(field, format!("{:?} is not host:port", addr)))?;
    if host.is_empty() {
        return Err(invalid(field, format!("{:?} has no host", addr)));
    }
    port.parse::<u16>()
        .map_err(|_| invalid(field, format!("{:?} has no valid port", addr)))?;
    Ok(())
}

/// Create the config directory if it does not exist.
pub fn init_dir(dir: impl AsRef<Path>) -> Result<(), ConfigError> {
    fs::create_dir_all(dir.as_ref())?;
    Ok(())
}

/// Write [`CONFIG_TEMPLATE`] into `dir` unless a config already exists.
/// Returns whether the template was written.
pub fn write_template(dir: impl AsRef<Path>) -> Result<bool, ConfigError> {
    let path = dir.as_ref().join(CONFIG_FILE_NAME);
    if path.exists() {
        return Ok(false);
    }
    fs::write(&path, CONFIG_TEMPLATE)?;
    Ok(true)
}

/// Config directory from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    resolve_config_dir(
        std::env::var_os(CONFIG_DIR_ENV),
        std::env::var_os("HOME"),
    )
}

fn resolve_config_dir(
    override_dir: Option<OsString>,
    home: Option<OsString>,
) -> Result<PathBuf, ConfigError> {
    match (override_dir, home) {
        (Some(dir), _) if !dir.is_empty() => Ok(PathBuf::from(dir)),
        (_, Some(home)) if !home.is_empty() => Ok(PathBuf::from(home).join(DEFAULT_DIR_NAME)),
        _ => Err(ConfigError::NoConfigDir),
    }
}
