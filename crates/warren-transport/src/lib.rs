//! Transport contracts.
//!
//! The onion router, the mutually-authenticated HTTPS server, and the client
//! connection pool are external collaborators; the engine only sees the
//! traits here. Factories hand out fresh instances so an engine restart
//! replaces every transport wholesale. [`memory`] provides an in-process
//! loopback implementation for the dev daemon and tests.

pub mod client;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::AsyncRead;
use warren_protocol::ByteRange;

pub use client::{ClientPool, ClientRequest, Dispatcher, Method, WireRequest, WireResponse};

/// Streaming request or response body.
pub type Body = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("circuit not established")]
    CircuitNotEstablished,

    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("request failed with status {0}")]
    Status(u16),

    #[error("transport stopped")]
    Stopped,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors a request handler reports back to the server layer, which maps
/// them onto response statuses.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("unknown peer certificate")]
    UnknownPeer,

    #[error("not available")]
    NotAvailable,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// X.509 key material the server presents on mutual-TLS connections.
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    pub certificate: String,
    pub private_key: String,
}

/// Key material for publishing our own hidden service.
#[derive(Debug, Clone)]
pub struct HiddenServiceKeys {
    pub hostname: String,
    pub auth_cookie: String,
    pub private_key: String,
}

/// Client authorization for connecting to one peer's hidden service.
#[derive(Debug, Clone)]
pub struct HiddenServiceAuth {
    pub hostname: String,
    pub auth_cookie: String,
}

/// Everything the onion router needs for one engine session.
#[derive(Debug, Clone)]
pub struct OnionConfig {
    pub keys: HiddenServiceKeys,
    pub client_auths: Vec<HiddenServiceAuth>,
    /// Local server port the hidden service forwards to.
    pub forward_port: u16,
}

/// Invoked by the onion router once a circuit is established.
pub type CircuitNotifier = Arc<dyn Fn() + Send + Sync>;

/// The onion-routing process supervisor.
#[async_trait]
pub trait OnionRouter: Send + Sync {
    async fn start(&self) -> Result<(), TransportError>;
    async fn stop(&self);
    fn is_circuit_established(&self) -> bool;
    fn socks_proxy_port(&self) -> Result<u16, TransportError>;
}

pub trait OnionRouterFactory: Send + Sync {
    fn create(&self, config: OnionConfig, on_circuit: CircuitNotifier) -> Arc<dyn OnionRouter>;
}

/// The mutually-authenticated HTTPS server fronting a node.
#[async_trait]
pub trait PeerServer: Send + Sync {
    async fn start(&self) -> Result<(), TransportError>;
    async fn stop(&self);
    fn listening_port(&self) -> u16;
}

pub trait ServerFactory: Send + Sync {
    fn bind(
        &self,
        identity: TlsIdentity,
        accepted_peer_certificates: Vec<String>,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Arc<dyn PeerServer>, TransportError>;
}

/// Creates the client connection pool once a circuit is up.
pub trait ClientFactory: Send + Sync {
    fn connect(&self, socks_proxy_port: u16) -> Result<ClientPool, TransportError>;
}

/// Response to a peer's download request.
pub struct DownloadReply {
    pub available: bool,
    pub mime_type: Option<String>,
    pub body: Option<Body>,
}

impl DownloadReply {
    /// The service is switched off for this peer right now (policy gate).
    pub fn unavailable() -> Self {
        Self {
            available: false,
            mime_type: None,
            body: None,
        }
    }

    pub fn stream(mime_type: impl Into<String>, body: Body) -> Self {
        Self {
            available: true,
            mime_type: Some(mime_type.into()),
            body: Some(body),
        }
    }
}

/// Contract the server delegates incoming peer requests to.
///
/// Every method receives the PEM certificate the peer authenticated with;
/// implementations resolve it to a friend and reject unknown certificates.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Friend nickname for the server layer's logging.
    async fn friend_nickname(&self, certificate: &str) -> Result<String, HandlerError>;

    /// Bookkeeping after bytes were sent to the peer.
    async fn update_friend_sent(
        &self,
        certificate: &str,
        at: DateTime<Utc>,
        bytes: u64,
    ) -> Result<(), HandlerError>;

    /// Bookkeeping after bytes were received from the peer.
    async fn update_friend_received(
        &self,
        certificate: &str,
        at: DateTime<Utc>,
        bytes: u64,
    ) -> Result<(), HandlerError>;

    async fn handle_ask_pull(&self, certificate: &str) -> Result<(), HandlerError>;

    async fn handle_ask_location(&self, certificate: &str) -> Result<(), HandlerError>;

    /// Consume and apply a pushed payload stream.
    async fn handle_push(&self, certificate: &str, body: Body) -> Result<(), HandlerError>;

    /// Apply the peer's pull request and return the response payload stream.
    async fn handle_pull(&self, certificate: &str, body: Vec<u8>) -> Result<Body, HandlerError>;

    async fn handle_download(
        &self,
        certificate: &str,
        resource_id: &str,
        range: ByteRange,
    ) -> Result<DownloadReply, HandlerError>;
}
