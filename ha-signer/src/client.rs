//! Consensus-node end of the signer channel.
//!
//! The validator listens; signers dial in. [`ValidatorEndpoint`] accepts
//! authenticated sessions and [`SignerConnection`] issues requests over
//! one of them, one at a time, each bounded by a timeout.

use crate::channel::{self, ChannelError, PeerPolicy, SecureSession, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::identity::SignerIdentity;
use crate::protocol::{
    ProtocolError, PubKeyResponse, RefusalReason, Request, Response, SignResponse,
    SignVoteRequest,
};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Default bound on one request/response exchange.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors seen by the consensus node when talking to a signer.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Refused ({reason}): {message}")]
    Refused {
        reason: RefusalReason,
        message: String,
    },

    #[error("Signer could not decode request: {0}")]
    Malformed(String),

    #[error("Response id {actual} does not match request id {expected}")]
    RequestIdMismatch { expected: u64, actual: u64 },

    #[error("Unexpected response")]
    UnexpectedResponse,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

impl ClientError {
    /// Refusal reason, if the signer answered with a refusal.
    pub fn refusal(&self) -> Option<RefusalReason> {
        match self {
            ClientError::Refused { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// Listening endpoint for remote signers.
pub struct ValidatorEndpoint {
    listener: TcpListener,
    identity: SignerIdentity,
    policy: PeerPolicy,
    handshake_timeout: Duration,
}

impl ValidatorEndpoint {
    pub async fn bind(
        addr: &str,
        identity: SignerIdentity,
        policy: PeerPolicy,
    ) -> Result<Self, ClientError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(ChannelError::from)?;
        info!(
            "Validator endpoint listening on {}, key: {}",
            addr,
            hex::encode(identity.public_key_bytes())
        );
        Ok(Self {
            listener,
            identity,
            policy,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        })
    }

    /// Bound on each incoming handshake. A peer that connects and stays
    /// silent is dropped once it expires.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.listener.local_addr().map_err(ChannelError::from)?)
    }

    /// Public identity key signers can pin.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.identity.public_key_bytes()
    }

    /// Wait for the next signer that completes the handshake. Peers that
    /// fail it are dropped and the wait continues.
    pub async fn accept(&self) -> Result<SignerConnection, ClientError> {
        loop {
            let (stream, remote_addr) = self
                .listener
                .accept()
                .await
                .map_err(ChannelError::from)?;
            stream.set_nodelay(true).map_err(ChannelError::from)?;

            let handshake = channel::handshake_within(
                stream,
                &self.identity,
                &self.policy,
                self.handshake_timeout,
            );
            match handshake.await {
                Ok(session) => {
                    info!(
                        "Signer connected from {}, key: {}",
                        remote_addr,
                        hex::encode(session.remote_key().as_bytes())
                    );
                    return Ok(SignerConnection::new(session));
                }
                Err(e) => warn!("Rejected signer connection from {}: {}", remote_addr, e),
            }
        }
    }
}

/// One authenticated session with a signer.
pub struct SignerConnection {
    session: SecureSession<TcpStream>,
    request_timeout: Duration,
}

impl SignerConnection {
    fn new(session: SecureSession<TcpStream>) -> Self {
        Self {
            session,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Channel identity of the connected signer.
    pub fn signer_key(&self) -> [u8; 32] {
        self.session.remote_key().to_bytes()
    }

    /// Send a request and wait for its response.
    pub async fn send_request(&mut self, request: &Request) -> Result<Response, ClientError> {
        let bytes = request.encode()?;
        let timeout = self.request_timeout;
        let session = &mut self.session;
        let exchange = async move {
            session.send_frame(&bytes).await?;
            let reply = session.receive_frame().await?;
            Ok::<_, ClientError>(Response::decode(&reply)?)
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(timeout)),
        }
    }

    /// Request a signature for `req`.
    pub async fn sign(&mut self, req: SignVoteRequest) -> Result<Vec<u8>, ClientError> {
        let expected = req.request_id;
        debug!(
            "Requesting signature: height={}, round={}, step={}, id={}",
            req.height, req.round, req.step, expected
        );

        match self.send_request(&Request::SignVote(req)).await? {
            Response::Sign(SignResponse::Success {
                signature,
                request_id,
            }) => {
                check_request_id(expected, request_id)?;
                Ok(signature)
            }
            Response::Sign(SignResponse::Refused {
                reason,
                message,
                request_id,
            }) => {
                check_request_id(expected, request_id)?;
                Err(ClientError::Refused { reason, message })
            }
            Response::Malformed { message } => Err(ClientError::Malformed(message)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Validator consensus public key held by the signer.
    pub async fn get_pubkey(&mut self) -> Result<Vec<u8>, ClientError> {
        match self.send_request(&Request::GetPubKey).await? {
            Response::PubKey(PubKeyResponse { pubkey }) => Ok(pubkey),
            Response::Malformed { message } => Err(ClientError::Malformed(message)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn ping(&mut self) -> Result<(), ClientError> {
        match self.send_request(&Request::Ping).await? {
            Response::Pong => Ok(()),
            Response::Malformed { message } => Err(ClientError::Malformed(message)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn close(self) -> Result<(), ClientError> {
        Ok(self.session.close().await?)
    }
}

fn check_request_id(expected: u64, actual: u64) -> Result<(), ClientError> {
    if expected != actual {
        return Err(ClientError::RequestIdMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Step;
    use tokio_util::sync::CancellationToken;

    async fn endpoint() -> ValidatorEndpoint {
        ValidatorEndpoint::bind("127.0.0.1:0", SignerIdentity::generate(), PeerPolicy::Any)
            .await
            .unwrap()
    }

    /// Minimal signer side: answers every request with `reply`.
    async fn fake_signer(
        addr: SocketAddr,
        reply: impl Fn(Request) -> Option<Response> + Send + 'static,
    ) -> tokio::task::JoinHandle<()> {
        let identity = SignerIdentity::generate();
        let config = channel::DialConfig::new(addr.to_string());
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let mut session = channel::connect(&config, &identity, &cancel).await.unwrap();
            while let Ok(frame) = session.receive_frame().await {
                let request = Request::decode(&frame).unwrap();
                match reply(request) {
                    Some(response) => session
                        .send_frame(&response.encode().unwrap())
                        .await
                        .unwrap(),
                    None => tokio::time::sleep(Duration::from_secs(3600)).await,
                }
            }
        })
    }

    #[tokio::test]
    async fn test_ping_and_pubkey() {
        let endpoint = endpoint().await;
        let _signer = fake_signer(endpoint.local_addr().unwrap(), |request| {
            Some(match request {
                Request::Ping => Response::Pong,
                Request::GetPubKey => Response::PubKey(PubKeyResponse {
                    pubkey: vec![9; 32],
                }),
                Request::SignVote(_) => Response::Malformed {
                    message: "unexpected".to_string(),
                },
            })
        })
        .await;

        let mut conn = endpoint.accept().await.unwrap();
        conn.ping().await.unwrap();
        assert_eq!(conn.get_pubkey().await.unwrap(), vec![9; 32]);
    }

    #[tokio::test]
    async fn test_refusal_surfaces_reason() {
        let endpoint = endpoint().await;
        let _signer = fake_signer(endpoint.local_addr().unwrap(), |request| match request {
            Request::SignVote(req) => Some(Response::Sign(SignResponse::refused(
                RefusalReason::NotActiveSigner,
                "active rank is 2",
                req.request_id,
            ))),
            _ => None,
        })
        .await;

        let mut conn = endpoint.accept().await.unwrap();
        let err = conn
            .sign(SignVoteRequest::new(
                "testchain",
                1,
                0,
                Step::Prevote,
                b"v".to_vec(),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.refusal(), Some(RefusalReason::NotActiveSigner));
    }

    #[tokio::test]
    async fn test_mismatched_request_id_rejected() {
        let endpoint = endpoint().await;
        let _signer = fake_signer(endpoint.local_addr().unwrap(), |request| match request {
            Request::SignVote(req) => Some(Response::Sign(SignResponse::Success {
                signature: vec![1],
                request_id: req.request_id.wrapping_add(1),
            })),
            _ => None,
        })
        .await;

        let mut conn = endpoint.accept().await.unwrap();
        let result = conn
            .sign(SignVoteRequest::new(
                "testchain",
                1,
                0,
                Step::Prevote,
                b"v".to_vec(),
            ))
            .await;
        assert!(matches!(
            result,
            Err(ClientError::RequestIdMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_silent_signer_times_out() {
        let endpoint = endpoint().await;
        let _signer = fake_signer(endpoint.local_addr().unwrap(), |_| None).await;

        let mut conn = endpoint
            .accept()
            .await
            .unwrap()
            .with_request_timeout(Duration::from_millis(50));
        assert!(matches!(conn.ping().await, Err(ClientError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_accept_skips_failed_handshake() {
        let endpoint = endpoint().await;
        let addr = endpoint.local_addr().unwrap();

        // A peer that hangs up mid-handshake, then a real signer.
        let garbage = TcpStream::connect(addr).await.unwrap();
        drop(garbage);
        let _signer = fake_signer(addr, |_| Some(Response::Pong)).await;

        let mut conn = endpoint.accept().await.unwrap();
        conn.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_peer_does_not_block_accept() {
        let endpoint = endpoint()
            .await
            .with_handshake_timeout(Duration::from_millis(200));
        let addr = endpoint.local_addr().unwrap();

        // Connects first and never speaks.
        let _silent = TcpStream::connect(addr).await.unwrap();
        let _signer = fake_signer(addr, |_| Some(Response::Pong)).await;

        let mut conn = tokio::time::timeout(Duration::from_secs(3), endpoint.accept())
            .await
            .expect("accept blocked behind a silent peer")
            .unwrap();
        conn.ping().await.unwrap();
    }
}
