//! Client connection pool and request builder.
//!
//! A [`ClientPool`] is created per circuit (and replaced on every engine
//! restart); requests are composed with [`ClientRequest`] and dispatched
//! through the pool's [`Dispatcher`], which owns connection reuse and the
//! SOCKS tunnel.

use std::sync::Arc;

use async_trait::async_trait;
use warren_protocol::ByteRange;

use crate::{Body, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
}

/// One request as handed to the dispatcher.
pub struct WireRequest {
    pub hostname: String,
    pub port: u16,
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub range: Option<ByteRange>,
    pub body: Option<Vec<u8>>,
}

pub struct WireResponse {
    pub status: u16,
    pub mime_type: Option<String>,
    pub body: Body,
}

impl std::fmt::Debug for WireResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireResponse")
            .field("status", &self.status)
            .field("mime_type", &self.mime_type)
            .field("body", &"<body>")
            .finish()
    }
}

impl WireResponse {
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            mime_type: None,
            body: Box::new(tokio::io::empty()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Issues requests over established circuits; implementations own connection
/// reuse and are safe to call concurrently.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, request: WireRequest) -> Result<WireResponse, TransportError>;

    /// Release held connections; subsequent dispatches fail fast.
    async fn shutdown(&self);
}

#[derive(Clone)]
pub struct ClientPool {
    dispatcher: Arc<dyn Dispatcher>,
}

impl ClientPool {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn request(
        &self,
        hostname: impl Into<String>,
        port: u16,
        method: Method,
        path: impl Into<String>,
    ) -> ClientRequest<'_> {
        ClientRequest {
            pool: self,
            inner: WireRequest {
                hostname: hostname.into(),
                port,
                method,
                path: path.into(),
                query: Vec::new(),
                range: None,
                body: None,
            },
        }
    }

    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }
}

/// Builder for one peer request.
pub struct ClientRequest<'a> {
    pool: &'a ClientPool,
    inner: WireRequest,
}

impl ClientRequest<'_> {
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.query.push((key.into(), value.into()));
        self
    }

    pub fn range(mut self, range: ByteRange) -> Self {
        self.inner.range = Some(range);
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.inner.body = Some(body);
        self
    }

    /// Dispatch the request. Non-2xx statuses are errors.
    pub async fn send(self) -> Result<WireResponse, TransportError> {
        let response = self.pool.dispatcher.dispatch(self.inner).await?;
        if !response.is_success() {
            return Err(TransportError::Status(response.status));
        }
        Ok(response)
    }
}
