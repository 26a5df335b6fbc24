//! In-process loopback transport.
//!
//! Routes client requests straight into the target node's request handler,
//! enforcing the accepted-certificate set the way the mutual-TLS handshake
//! would. Used by the test harness and the dev daemon; production deployments
//! implement the same factories over a real onion router and TLS stack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use warren_protocol::{ByteRange, paths};

use crate::client::{ClientPool, Dispatcher, Method, WireRequest, WireResponse};
use crate::{
    ClientFactory, CircuitNotifier, HandlerError, OnionConfig, OnionRouter, OnionRouterFactory,
    PeerServer, RequestHandler, ServerFactory, TlsIdentity, TransportError,
};

const MEMORY_SOCKS_PORT: u16 = 9050;

#[derive(Clone)]
struct HostEntry {
    handler: Arc<dyn RequestHandler>,
    accepted_certificates: Vec<String>,
}

/// Shared registry of reachable hosts, keyed by hidden-service hostname.
pub struct MemoryNet {
    hosts: Mutex<HashMap<String, HostEntry>>,
    next_port: AtomicU16,
}

impl MemoryNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            hosts: Mutex::new(HashMap::new()),
            next_port: AtomicU16::new(20_000),
        })
    }

    /// Server factory for the node publishing `hostname`.
    pub fn server_factory(self: &Arc<Self>, hostname: impl Into<String>) -> Arc<dyn ServerFactory> {
        Arc::new(MemoryServerFactory {
            net: Arc::clone(self),
            hostname: hostname.into(),
        })
    }

    /// Client factory for a node authenticating with `certificate`.
    pub fn client_factory(self: &Arc<Self>, certificate: impl Into<String>) -> Arc<dyn ClientFactory> {
        Arc::new(MemoryClientFactory {
            net: Arc::clone(self),
            certificate: certificate.into(),
        })
    }

    /// Onion router factory whose circuits come up after `circuit_delay`.
    pub fn onion_factory(circuit_delay: Duration) -> Arc<dyn OnionRouterFactory> {
        Arc::new(MemoryOnionRouterFactory { circuit_delay })
    }

    fn lookup(&self, hostname: &str) -> Option<HostEntry> {
        self.hosts.lock().unwrap_or_else(|e| e.into_inner()).get(hostname).cloned()
    }

    fn register(&self, hostname: String, entry: HostEntry) {
        self.hosts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(hostname, entry);
    }

    fn deregister(&self, hostname: &str) {
        self.hosts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(hostname);
    }
}

struct MemoryServerFactory {
    net: Arc<MemoryNet>,
    hostname: String,
}

impl ServerFactory for MemoryServerFactory {
    fn bind(
        &self,
        _identity: TlsIdentity,
        accepted_peer_certificates: Vec<String>,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Arc<dyn PeerServer>, TransportError> {
        let port = self.net.next_port.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(MemoryServer {
            net: Arc::clone(&self.net),
            hostname: self.hostname.clone(),
            entry: HostEntry {
                handler,
                accepted_certificates: accepted_peer_certificates,
            },
            port,
        }))
    }
}

struct MemoryServer {
    net: Arc<MemoryNet>,
    hostname: String,
    entry: HostEntry,
    port: u16,
}

#[async_trait]
impl PeerServer for MemoryServer {
    async fn start(&self) -> Result<(), TransportError> {
        self.net.register(self.hostname.clone(), self.entry.clone());
        tracing::debug!(host = %self.hostname, port = self.port, "loopback server up");
        Ok(())
    }

    async fn stop(&self) {
        self.net.deregister(&self.hostname);
    }

    fn listening_port(&self) -> u16 {
        self.port
    }
}

struct MemoryOnionRouterFactory {
    circuit_delay: Duration,
}

impl OnionRouterFactory for MemoryOnionRouterFactory {
    fn create(&self, config: OnionConfig, on_circuit: CircuitNotifier) -> Arc<dyn OnionRouter> {
        Arc::new(MemoryOnionRouter {
            hostname: config.keys.hostname,
            circuit_delay: self.circuit_delay,
            on_circuit,
            established: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        })
    }
}

struct MemoryOnionRouter {
    hostname: String,
    circuit_delay: Duration,
    on_circuit: CircuitNotifier,
    established: Arc<AtomicBool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait]
impl OnionRouter for MemoryOnionRouter {
    async fn start(&self) -> Result<(), TransportError> {
        let delay = self.circuit_delay;
        let notify = Arc::clone(&self.on_circuit);
        let established = Arc::clone(&self.established);
        let hostname = self.hostname.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            established.store(true, Ordering::SeqCst);
            tracing::debug!(host = %hostname, "loopback circuit established");
            notify();
        });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        self.established.store(false, Ordering::SeqCst);
    }

    fn is_circuit_established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    fn socks_proxy_port(&self) -> Result<u16, TransportError> {
        Ok(MEMORY_SOCKS_PORT)
    }
}

struct MemoryClientFactory {
    net: Arc<MemoryNet>,
    certificate: String,
}

impl ClientFactory for MemoryClientFactory {
    fn connect(&self, _socks_proxy_port: u16) -> Result<ClientPool, TransportError> {
        Ok(ClientPool::new(Arc::new(MemoryDispatcher {
            net: Arc::clone(&self.net),
            certificate: self.certificate.clone(),
            open: AtomicBool::new(true),
        })))
    }
}

struct MemoryDispatcher {
    net: Arc<MemoryNet>,
    certificate: String,
    open: AtomicBool,
}

#[async_trait]
impl Dispatcher for MemoryDispatcher {
    async fn dispatch(&self, request: WireRequest) -> Result<WireResponse, TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Stopped);
        }
        let entry = self
            .net
            .lookup(&request.hostname)
            .ok_or_else(|| TransportError::Unreachable(request.hostname.clone()))?;
        if !entry.accepted_certificates.contains(&self.certificate) {
            return Err(TransportError::Unreachable(format!(
                "{}: client certificate rejected",
                request.hostname
            )));
        }
        route(&entry.handler, &self.certificate, request).await
    }

    async fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

async fn route(
    handler: &Arc<dyn RequestHandler>,
    certificate: &str,
    request: WireRequest,
) -> Result<WireResponse, TransportError> {
    let response = match (request.method, request.path.as_str()) {
        (Method::Get, paths::ASK_PULL_PATH) => match handler.handle_ask_pull(certificate).await {
            Ok(()) => WireResponse::empty(200),
            Err(e) => WireResponse::empty(status_for(&e)),
        },
        (Method::Get, paths::ASK_LOCATION_PATH) => {
            match handler.handle_ask_location(certificate).await {
                Ok(()) => WireResponse::empty(200),
                Err(e) => WireResponse::empty(status_for(&e)),
            }
        }
        (Method::Put, paths::PUSH_PATH) => {
            let body = request.body.unwrap_or_default();
            let len = body.len() as u64;
            match handler
                .handle_push(certificate, Box::new(std::io::Cursor::new(body)))
                .await
            {
                Ok(()) => {
                    // Transfer bookkeeping the server layer owns.
                    let _ = handler
                        .update_friend_received(certificate, Utc::now(), len)
                        .await;
                    WireResponse::empty(200)
                }
                Err(e) => WireResponse::empty(status_for(&e)),
            }
        }
        (Method::Put, paths::PULL_PATH) => {
            let body = request.body.unwrap_or_default();
            match handler.handle_pull(certificate, body).await {
                Ok(stream) => WireResponse {
                    status: 200,
                    mime_type: None,
                    body: stream,
                },
                Err(e) => WireResponse::empty(status_for(&e)),
            }
        }
        (Method::Get, paths::DOWNLOAD_PATH) => {
            let resource_id = request
                .query
                .iter()
                .find(|(k, _)| k == paths::DOWNLOAD_RESOURCE_ID_PARAM)
                .map(|(_, v)| v.clone());
            let Some(resource_id) = resource_id else {
                return Ok(WireResponse::empty(400));
            };
            let range = request.range.unwrap_or(ByteRange::from_offset(0));
            match handler
                .handle_download(certificate, &resource_id, range)
                .await
            {
                Ok(reply) if reply.available => WireResponse {
                    status: 200,
                    mime_type: reply.mime_type,
                    body: reply.body.unwrap_or_else(|| Box::new(tokio::io::empty())),
                },
                Ok(_) => WireResponse::empty(404),
                Err(e) => WireResponse::empty(status_for(&e)),
            }
        }
        _ => WireResponse::empty(404),
    };
    Ok(response)
}

fn status_for(error: &HandlerError) -> u16 {
    match error {
        HandlerError::UnknownPeer => 403,
        HandlerError::NotAvailable => 404,
        HandlerError::Invalid(_) => 400,
        HandlerError::Internal(_) => 500,
    }
}
