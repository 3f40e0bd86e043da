// ABOUTME: Server dispatch: session directory, opening handshake, routing
// ABOUTME: into current transports, upgrade initiation, and the accept queue

use crate::error::{Error, Result};
use crate::packet::ConnParameters;
use crate::session::Session;
use crate::transport::{EngineRequest, EngineResponse, TransportManager};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Callback run against every opening handshake. Returns extra headers to
/// copy onto the response, or an error to reject the request.
pub type RequestChecker = dyn Fn(&EngineRequest) -> Result<Vec<(String, String)>> + Send + Sync;

/// Session id source.
pub type SessionIdGenerator = dyn Fn() -> String + Send + Sync;

/// Server tuning knobs.
///
/// ```rust
/// use eio::Config;
/// use std::time::Duration;
///
/// let config = Config::default()
///     .with_ping_interval(Duration::from_secs(25))
///     .with_request_check(|req| {
///         match req.headers.get("origin") {
///             Some(origin) => Ok(vec![(
///                 "access-control-allow-origin".to_string(),
///                 origin.clone(),
///             )]),
///             None => Ok(Vec::new()),
///         }
///     });
/// # let _ = config;
/// ```
#[derive(Clone)]
pub struct Config {
    /// Expected interval between client pings. Default 20 s.
    pub ping_interval: Duration,
    /// Grace past the interval before a silent peer is declared dead.
    /// Default 60 s.
    pub ping_timeout: Duration,
    request_check: Arc<RequestChecker>,
    session_id: Arc<SessionIdGenerator>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(60),
            request_check: Arc::new(|_| Ok(Vec::new())),
            session_id: Arc::new(random_session_id),
        }
    }
}

impl Config {
    pub fn with_ping_interval(mut self, interval: Duration) -> Config {
        self.ping_interval = interval;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Config {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_request_check<F>(mut self, check: F) -> Config
    where
        F: Fn(&EngineRequest) -> Result<Vec<(String, String)>> + Send + Sync + 'static,
    {
        self.request_check = Arc::new(check);
        self
    }

    pub fn with_session_id<F>(mut self, generator: F) -> Config
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.session_id = Arc::new(generator);
        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("ping_interval", &self.ping_interval)
            .field("ping_timeout", &self.ping_timeout)
            .finish_non_exhaustive()
    }
}

/// Random URL-safe session id, 120 bits of entropy.
fn random_session_id() -> String {
    let mut raw = [0u8; 15];
    rand::thread_rng().fill(&mut raw[..]);
    URL_SAFE_NO_PAD.encode(raw)
}

/// Server-scoped session directory. Lookups dominate; mutation happens only
/// at open and close.
pub(crate) struct SessionDirectory {
    inner: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionDirectory {
    pub(crate) fn new() -> Arc<SessionDirectory> {
        Arc::new(SessionDirectory {
            inner: RwLock::new(HashMap::new()),
        })
    }

    fn insert(&self, session: Arc<Session>) {
        self.inner
            .write()
            .expect("directory poisoned")
            .insert(session.id().to_string(), session);
    }

    pub(crate) fn get(&self, sid: &str) -> Option<Arc<Session>> {
        self.inner.read().expect("directory poisoned").get(sid).cloned()
    }

    pub(crate) fn remove(&self, sid: &str) {
        self.inner.write().expect("directory poisoned").remove(sid);
    }

    fn len(&self) -> usize {
        self.inner.read().expect("directory poisoned").len()
    }

    fn drain(&self) -> Vec<Arc<Session>> {
        let mut map = self.inner.write().expect("directory poisoned");
        map.drain().map(|(_, session)| session).collect()
    }
}

/// The protocol server: accepts handshakes, owns the session directory, and
/// routes every subsequent request to the right session and transport.
pub struct Server {
    config: Config,
    transports: TransportManager,
    directory: Arc<SessionDirectory>,
    accept_tx: Mutex<Option<mpsc::Sender<Arc<Session>>>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Session>>>,
}

impl Server {
    /// Server with the standard transports, polling then socket.
    pub fn new(config: Config) -> Server {
        Server::with_transports(config, TransportManager::default_transports())
    }

    pub fn with_transports(config: Config, transports: TransportManager) -> Server {
        let (accept_tx, accept_rx) = mpsc::channel(1);
        Server {
            config,
            transports,
            directory: SessionDirectory::new(),
            accept_tx: Mutex::new(Some(accept_tx)),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    /// Next freshly opened session, in handshake order. Returns
    /// [`Error::Closed`] once the server is closed and the queue is empty.
    pub async fn accept(&self) -> Result<Arc<Session>> {
        self.accept_rx.lock().await.recv().await.ok_or(Error::Closed)
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.directory.len()
    }

    /// Handle one parsed HTTP request. Errors are folded into the response
    /// with the status mapping of [`Error::http_status`].
    pub async fn dispatch(&self, req: EngineRequest) -> EngineResponse {
        match self.handle(req).await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(error = %e, "request rejected");
                EngineResponse::error(e.http_status(), &e.to_string())
            }
        }
    }

    async fn handle(&self, req: EngineRequest) -> Result<EngineResponse> {
        match req.sid.clone() {
            None => self.handshake(req).await,
            Some(sid) => {
                let session = self
                    .directory
                    .get(&sid)
                    .ok_or_else(|| Error::InvalidSid(sid))?;
                if req.transport == session.transport_name() {
                    session.handle_request(req).await
                } else {
                    self.upgrade(session, req).await
                }
            }
        }
    }

    /// Opening handshake: check the request, accept the transport, create
    /// and announce the session, publish it to `accept()`.
    async fn handshake(&self, mut req: EngineRequest) -> Result<EngineResponse> {
        let extra_headers = (self.config.request_check)(&req).map_err(|e| match e {
            Error::Unauthorized(_) => e,
            other => Error::Unauthorized(other.to_string()),
        })?;
        let transport = self
            .transports
            .get(&req.transport)
            .ok_or_else(|| Error::InvalidTransport(req.transport.clone()))?;
        let conn = transport.accept(&mut req)?;

        let sid = (self.config.session_id)();
        let params = ConnParameters::new(
            sid.clone(),
            self.transports.upgrade_targets(&req.transport),
            self.config.ping_interval,
            self.config.ping_timeout,
        );
        let session = Session::new(
            sid.clone(),
            req.transport.clone(),
            conn.clone(),
            params,
            self.directory.clone(),
        );
        self.directory.insert(session.clone());
        if let Err(e) = session.send_open().await {
            let _ = session.close().await;
            return Err(e);
        }
        debug!(sid = %sid, transport = %req.transport, "session opened");

        // Publish without making this request wait on the application.
        let tx = self.accept_tx.lock().expect("accept poisoned").clone();
        if let Some(tx) = tx {
            let published = session.clone();
            tokio::spawn(async move {
                let _ = tx.send(published).await;
            });
        }

        let mut resp = conn.handle_request(req).await?;
        resp.headers.extend(extra_headers);
        Ok(resp)
    }

    /// Same session, different transport: attach an upgrade probe.
    async fn upgrade(
        &self,
        session: Arc<Session>,
        mut req: EngineRequest,
    ) -> Result<EngineResponse> {
        let legal = self
            .transports
            .upgrade_targets(&session.transport_name())
            .into_iter()
            .any(|t| t == req.transport);
        if !legal {
            return Err(Error::InvalidTransport(req.transport.clone()));
        }
        let transport = self
            .transports
            .get(&req.transport)
            .ok_or_else(|| Error::InvalidTransport(req.transport.clone()))?;
        let probe = transport.accept(&mut req)?;
        if let Err(e) = session.start_upgrade(req.transport.clone(), probe.clone()) {
            let _ = probe.close().await;
            return Err(e);
        }
        probe.handle_request(req).await
    }

    /// Close every session and end the accept stream.
    pub async fn close(&self) {
        self.accept_tx.lock().expect("accept poisoned").take();
        for session in self.directory.drain() {
            let _ = session.close().await;
        }
    }
}
