// ABOUTME: Transport seam: request/response values, the packet-channel
// ABOUTME: connection contract, and the ordered transport registry

use crate::error::Result;
use crate::packet::Packet;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::time::Instant;

pub mod polling;
pub mod socket;

pub use polling::PollingTransport;
pub use socket::{socket_pair, SocketEndpoint, SocketTransport};

/// HTTP method of an incoming request, as far as dispatch cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One HTTP request, already parsed by the embedder's HTTP layer.
///
/// The outer multiplexer (path routing, CORS preflight, query parsing) is
/// the embedder's business; by the time a request reaches
/// [`Server::dispatch`](crate::server::Server::dispatch) it has been reduced
/// to this record. A socket transport request additionally carries the
/// framed endpoint the HTTP layer hijacked for it.
#[derive(Debug)]
pub struct EngineRequest {
    pub method: Method,
    /// `sid` query parameter; absent on the opening handshake.
    pub sid: Option<String>,
    /// `transport` query parameter.
    pub transport: String,
    /// Remaining query parameters, transport-specific.
    pub query: HashMap<String, String>,
    /// Request headers, lower-cased keys.
    pub headers: HashMap<String, String>,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub body: Bytes,
    /// Framed endpoint for a socket transport, installed by the HTTP layer
    /// when it hijacks the connection.
    pub socket: Option<SocketEndpoint>,
}

impl EngineRequest {
    fn new(method: Method, transport: &str) -> EngineRequest {
        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        EngineRequest {
            method,
            sid: None,
            transport: transport.to_string(),
            query: HashMap::new(),
            headers: HashMap::new(),
            remote_addr: unspecified,
            local_addr: unspecified,
            body: Bytes::new(),
            socket: None,
        }
    }

    pub fn get(transport: &str) -> EngineRequest {
        EngineRequest::new(Method::Get, transport)
    }

    pub fn post(transport: &str, body: impl Into<Bytes>) -> EngineRequest {
        let mut req = EngineRequest::new(Method::Post, transport);
        req.body = body.into();
        req
    }

    pub fn with_sid(mut self, sid: &str) -> EngineRequest {
        self.sid = Some(sid.to_string());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> EngineRequest {
        self.headers.insert(name.to_lowercase(), value.to_string());
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> EngineRequest {
        self.remote_addr = addr;
        self
    }

    pub fn with_socket(mut self, endpoint: SocketEndpoint) -> EngineRequest {
        self.socket = Some(endpoint);
        self
    }
}

/// Response handed back to the embedder's HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl EngineResponse {
    /// 200 with a polling payload body.
    pub fn ok(body: Bytes) -> EngineResponse {
        EngineResponse {
            status: 200,
            headers: vec![(
                "content-type".to_string(),
                "text/plain; charset=UTF-8".to_string(),
            )],
            body,
        }
    }

    /// 101 for an accepted socket transport.
    pub fn switching_protocols() -> EngineResponse {
        EngineResponse {
            status: 101,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn error(status: u16, message: &str) -> EngineResponse {
        EngineResponse {
            status,
            headers: vec![(
                "content-type".to_string(),
                "text/plain; charset=UTF-8".to_string(),
            )],
            body: Bytes::from(message.to_string()),
        }
    }
}

/// Packet-level connection contract every transport variant satisfies.
///
/// A connection is a bidirectional packet channel with single-reader,
/// single-writer discipline enforced by the owning session: the session
/// never issues a second `read_packet` before the first resolves, and
/// serializes `write_packet` calls behind its writer lock.
#[async_trait]
pub trait TransportConn: Send + Sync {
    /// Block until the next packet arrives, the read deadline fires
    /// ([`Error::Timeout`](crate::Error::Timeout)), or the connection dies
    /// ([`Error::Closed`](crate::Error::Closed)).
    async fn read_packet(&self) -> Result<Packet>;

    /// Send one packet. At most one write is in flight at a time.
    async fn write_packet(&self, packet: Packet) -> Result<()>;

    /// Arm the deadline for subsequent `read_packet` calls. Advisory; takes
    /// effect on the next read.
    fn set_read_deadline(&self, deadline: Instant);

    /// Route an HTTP request on this connection's session into the
    /// connection (polling GET/POST exchange; socket handshake answer).
    async fn handle_request(&self, req: EngineRequest) -> Result<EngineResponse>;

    /// Tear the connection down. Idempotent; subsequent reads and writes
    /// fail with [`Error::Closed`](crate::Error::Closed).
    async fn close(&self) -> Result<()>;

    fn name(&self) -> &'static str;
    fn remote_addr(&self) -> SocketAddr;
    fn local_addr(&self) -> SocketAddr;
    fn remote_header(&self) -> &HashMap<String, String>;
}

/// A transport: a named way of carrying packets, able to accept an incoming
/// request into a fresh connection.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Accept the request into a new connection. Consumes request resources
    /// (the socket endpoint) where the variant needs them.
    fn accept(&self, req: &mut EngineRequest) -> Result<Arc<dyn TransportConn>>;
}

/// Ordered set of transports. Order is significant: a session may only
/// upgrade to a transport strictly later in the order than its current one.
pub struct TransportManager {
    order: Vec<&'static str>,
    transports: HashMap<&'static str, Arc<dyn Transport>>,
}

impl TransportManager {
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> TransportManager {
        let order: Vec<&'static str> = transports.iter().map(|t| t.name()).collect();
        let transports = transports.into_iter().map(|t| (t.name(), t)).collect();
        TransportManager { order, transports }
    }

    /// Polling then socket, the standard order.
    pub fn default_transports() -> TransportManager {
        TransportManager::new(vec![
            Arc::new(PollingTransport::new()),
            Arc::new(SocketTransport::new()),
        ])
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.transports.get(name).cloned()
    }

    /// Names a session currently on `name` may upgrade to: everything
    /// strictly later in the registration order.
    pub fn upgrade_targets(&self, name: &str) -> Vec<String> {
        match self.order.iter().position(|n| *n == name) {
            Some(i) => self.order[i + 1..].iter().map(|n| n.to_string()).collect(),
            None => Vec::new(),
        }
    }
}
