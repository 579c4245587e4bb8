//! Authenticated, encrypted channel to the consensus node.
//!
//! ## Handshake
//!
//! ```text
//! Signer (dials)                              Consensus node (listens)
//!   |  -- X25519 ephemeral pubkey (32B) -->      |
//!   |  <-- X25519 ephemeral pubkey (32B) --      |
//!   |        HKDF-SHA256(DH, salt = sorted ephemerals)
//!   |        -> send key, recv key, challenge    |
//!   |  == { identity pubkey, sig(challenge) } => |
//!   |  <= { identity pubkey, sig(challenge) } == |
//! ```
//!
//! After the handshake every frame is `u32` little-endian length followed
//! by a ChaCha20-Poly1305 ciphertext. Nonces are per-direction counters,
//! so a replayed, reordered or dropped frame fails authentication.
//!
//! ## Dialing
//!
//! The consensus node is the only path to the network, so dialing retries
//! until it succeeds or the supplied [`CancellationToken`] fires. A
//! handshake failure ends that attempt; [`connect_until_established`]
//! starts a fresh dial cycle and never hands out an unauthenticated
//! session.

use crate::identity::SignerIdentity;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};
use zeroize::Zeroizing;

/// Largest plaintext accepted in a single frame (1MB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Default bound on one handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const TAG_SIZE: usize = 16;
const KEY_DERIVATION_INFO: &[u8] = b"HA_SIGNER_SECRET_CONNECTION_KEY_AND_CHALLENGE_GEN";

/// Errors from the secure channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Peer key mismatch: expected {expected}, got {actual}")]
    PeerKeyMismatch { expected: String, actual: String },

    #[error("Frame failed authentication")]
    Decrypt,

    #[error("Frame encryption failed")]
    Encrypt,

    #[error("Nonce space exhausted")]
    NonceExhausted,

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Cancelled")]
    Cancelled,
}

/// Which remote identities the handshake accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PeerPolicy {
    /// Any peer that proves possession of its identity key
    #[default]
    Any,
    /// Only the given identity key
    Pinned(VerifyingKey),
}

impl PeerPolicy {
    fn check(&self, remote: &VerifyingKey) -> Result<(), ChannelError> {
        match self {
            PeerPolicy::Any => Ok(()),
            PeerPolicy::Pinned(expected) if expected == remote => Ok(()),
            PeerPolicy::Pinned(expected) => Err(ChannelError::PeerKeyMismatch {
                expected: hex::encode(expected.as_bytes()),
                actual: hex::encode(remote.as_bytes()),
            }),
        }
    }
}

/// Identity proof exchanged once the frames are encrypted.
#[derive(Serialize, Deserialize)]
struct AuthMessage {
    pub_key: [u8; 32],
    signature: Vec<u8>,
}

/// One direction of the encrypted stream.
struct Cipher {
    aead: ChaCha20Poly1305,
    counter: u64,
}

impl Cipher {
    fn new(key: &[u8]) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> Result<Nonce, ChannelError> {
        if self.counter == u64::MAX {
            return Err(ChannelError::NonceExhausted);
        }
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.counter.to_le_bytes());
        self.counter += 1;
        Ok(*Nonce::from_slice(&nonce))
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let nonce = self.next_nonce()?;
        self.aead
            .encrypt(&nonce, plaintext)
            .map_err(|_| ChannelError::Encrypt)
    }

    fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let nonce = self.next_nonce()?;
        self.aead
            .decrypt(&nonce, ciphertext)
            .map_err(|_| ChannelError::Decrypt)
    }
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, body: &[u8]) -> Result<(), ChannelError> {
    let len_bytes = (body.len() as u32).to_le_bytes();
    stream.write_all(&len_bytes).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>, ChannelError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(ChannelError::Closed),
        Err(e) => return Err(e.into()),
    }
    let frame_len = u32::from_le_bytes(len_buf) as usize;
    if frame_len > MAX_FRAME_SIZE + TAG_SIZE {
        return Err(ChannelError::FrameTooLarge(frame_len));
    }

    let mut body = vec![0u8; frame_len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

/// Established, mutually authenticated session.
pub struct SecureSession<S> {
    stream: S,
    send_cipher: Cipher,
    recv_cipher: Cipher,
    remote_key: VerifyingKey,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SecureSession<S> {
    /// Run the handshake over `stream`. Both ends run the same procedure;
    /// roles are decided by comparing ephemeral keys.
    pub async fn handshake(
        mut stream: S,
        identity: &SignerIdentity,
        policy: &PeerPolicy,
    ) -> Result<Self, ChannelError> {
        let local_secret = EphemeralSecret::random_from_rng(OsRng);
        let local_public = X25519PublicKey::from(&local_secret);

        stream.write_all(local_public.as_bytes()).await?;
        stream.flush().await?;

        let mut remote_bytes = [0u8; 32];
        stream.read_exact(&mut remote_bytes).await?;
        if &remote_bytes == local_public.as_bytes() {
            return Err(ChannelError::Handshake(
                "peer reflected our ephemeral key".to_string(),
            ));
        }
        let remote_public = X25519PublicKey::from(remote_bytes);

        let shared = local_secret.diffie_hellman(&remote_public);
        if !shared.was_contributory() {
            return Err(ChannelError::Handshake(
                "non-contributory key exchange".to_string(),
            ));
        }

        let local_is_low = local_public.as_bytes() < &remote_bytes;
        let mut salt = [0u8; 64];
        if local_is_low {
            salt[..32].copy_from_slice(local_public.as_bytes());
            salt[32..].copy_from_slice(&remote_bytes);
        } else {
            salt[..32].copy_from_slice(&remote_bytes);
            salt[32..].copy_from_slice(local_public.as_bytes());
        }

        let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
        let mut okm = Zeroizing::new([0u8; 96]);
        hk.expand(KEY_DERIVATION_INFO, &mut okm[..])
            .map_err(|e| ChannelError::Handshake(format!("key derivation: {e}")))?;

        let (send_key, recv_key) = if local_is_low {
            (&okm[..32], &okm[32..64])
        } else {
            (&okm[32..64], &okm[..32])
        };
        let challenge = &okm[64..96];

        let mut session = Self {
            stream,
            send_cipher: Cipher::new(send_key),
            recv_cipher: Cipher::new(recv_key),
            // Replaced below once the peer has proven its identity.
            remote_key: identity.public_key(),
        };

        let auth = AuthMessage {
            pub_key: identity.public_key_bytes(),
            signature: identity.sign(challenge).to_bytes().to_vec(),
        };
        session.send(&auth).await?;

        let remote_auth: AuthMessage = match session.receive().await {
            Ok(auth) => auth,
            Err(ChannelError::Decrypt) => {
                return Err(ChannelError::Handshake(
                    "peer derived different session keys".to_string(),
                ))
            }
            Err(e) => return Err(e),
        };

        let remote_key = VerifyingKey::from_bytes(&remote_auth.pub_key)
            .map_err(|e| ChannelError::Handshake(format!("invalid peer key: {e}")))?;
        let signature = Signature::from_slice(&remote_auth.signature)
            .map_err(|e| ChannelError::Handshake(format!("invalid peer signature: {e}")))?;
        remote_key
            .verify_strict(challenge, &signature)
            .map_err(|_| ChannelError::Handshake("peer signature does not verify".to_string()))?;
        policy.check(&remote_key)?;

        session.remote_key = remote_key;
        debug!(
            "Secure session established with peer {}",
            hex::encode(remote_key.as_bytes())
        );
        Ok(session)
    }

    /// Authenticated identity key of the peer.
    pub fn remote_key(&self) -> &VerifyingKey {
        &self.remote_key
    }

    /// Encrypt and send one frame.
    pub async fn send_frame(&mut self, plaintext: &[u8]) -> Result<(), ChannelError> {
        if plaintext.len() > MAX_FRAME_SIZE {
            return Err(ChannelError::FrameTooLarge(plaintext.len()));
        }
        let ciphertext = self.send_cipher.seal(plaintext)?;
        write_frame(&mut self.stream, &ciphertext).await
    }

    /// Receive and decrypt one frame.
    pub async fn receive_frame(&mut self) -> Result<Vec<u8>, ChannelError> {
        let ciphertext = read_frame(&mut self.stream).await?;
        self.recv_cipher.open(&ciphertext)
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), ChannelError> {
        let bytes = bincode::serialize(message)?;
        self.send_frame(&bytes).await
    }

    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<T, ChannelError> {
        let bytes = self.receive_frame().await?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Shut down the write half of the underlying stream.
    pub async fn close(mut self) -> Result<(), ChannelError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Where and how to reach the consensus node.
#[derive(Debug, Clone)]
pub struct DialConfig {
    /// `host:port` of the node's signer endpoint
    pub address: String,
    /// Pause between failed dial attempts
    pub retry_interval: Duration,
    /// Bound on the handshake after a successful dial
    pub handshake_timeout: Duration,
    /// Accepted node identities
    pub peer_policy: PeerPolicy,
}

impl DialConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            retry_interval: Duration::from_secs(1),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            peer_policy: PeerPolicy::Any,
        }
    }
}

/// Dial `address` until a TCP connection is made or `cancel` fires.
pub async fn dial_with_retry(
    address: &str,
    retry_interval: Duration,
    cancel: &CancellationToken,
) -> Result<TcpStream, ChannelError> {
    let mut attempts: u64 = 0;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(ChannelError::Cancelled),
            result = TcpStream::connect(address) => result,
        };

        match result {
            Ok(stream) => {
                info!("Connected to {} after {} failed attempts", address, attempts);
                return Ok(stream);
            }
            Err(e) => {
                attempts += 1;
                if attempts == 1 || attempts % 30 == 0 {
                    warn!("Dial {} failed (attempt {}): {}", address, attempts, e);
                } else {
                    debug!("Dial {} failed (attempt {}): {}", address, attempts, e);
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(ChannelError::Cancelled),
            _ = tokio::time::sleep(retry_interval) => {}
        }
    }
}

/// Dial with retry, then run one handshake. A handshake failure is
/// returned to the caller.
pub async fn connect(
    config: &DialConfig,
    identity: &SignerIdentity,
    cancel: &CancellationToken,
) -> Result<SecureSession<TcpStream>, ChannelError> {
    let stream = dial_with_retry(&config.address, config.retry_interval, cancel).await?;
    stream.set_nodelay(true)?;

    let handshake = handshake_within(
        stream,
        identity,
        &config.peer_policy,
        config.handshake_timeout,
    );
    tokio::select! {
        _ = cancel.cancelled() => Err(ChannelError::Cancelled),
        result = handshake => result,
    }
}

/// Run the handshake on `stream`, failing if it does not finish within
/// `limit`.
pub async fn handshake_within<S>(
    stream: S,
    identity: &SignerIdentity,
    policy: &PeerPolicy,
    limit: Duration,
) -> Result<SecureSession<S>, ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(limit, SecureSession::handshake(stream, identity, policy))
        .await
        .map_err(|_| ChannelError::Handshake(format!("timed out after {:?}", limit)))?
}

/// Keep dialing and handshaking until a session is authenticated or
/// `cancel` fires.
pub async fn connect_until_established(
    config: &DialConfig,
    identity: &SignerIdentity,
    cancel: &CancellationToken,
) -> Result<SecureSession<TcpStream>, ChannelError> {
    loop {
        match connect(config, identity, cancel).await {
            Ok(session) => {
                info!(
                    "Secure channel to {} established, node key: {}",
                    config.address,
                    hex::encode(session.remote_key().as_bytes())
                );
                return Ok(session);
            }
            Err(ChannelError::Cancelled) => return Err(ChannelError::Cancelled),
            Err(e) => {
                warn!("Session establishment with {} failed: {}", config.address, e);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ChannelError::Cancelled),
                    _ = tokio::time::sleep(config.retry_interval) => {}
                }
            }
        }
    }
}

/// Accept one connection on `listener` and run the handshake, bounded by
/// `handshake_timeout`. Used by the consensus-node end of the channel.
pub async fn accept(
    listener: &TcpListener,
    identity: &SignerIdentity,
    policy: &PeerPolicy,
    handshake_timeout: Duration,
) -> Result<SecureSession<TcpStream>, ChannelError> {
    let (stream, remote_addr) = listener.accept().await?;
    stream.set_nodelay(true)?;
    debug!("Accepted signer connection from {}", remote_addr);
    handshake_within(stream, identity, policy, handshake_timeout).await
}
