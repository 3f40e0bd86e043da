// ABOUTME: Session state machine: packet read/write surface, ping/pong
// ABOUTME: liveness, and the atomic transport swap during upgrade

use crate::error::{Error, Result};
use crate::packet::{ConnParameters, FrameType, Packet, PacketType};
use crate::server::SessionDirectory;
use crate::transport::{EngineRequest, EngineResponse, TransportConn};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Session lifecycle.
///
/// ```text
/// Opening → Open ⇄ Upgrading
///             ↓
///          Closing → Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, Open packet not yet written.
    Opening,
    /// Normal operation on a single transport.
    Open,
    /// A probe transport is attached; the current transport still carries
    /// traffic until commit.
    Upgrading,
    /// Teardown requested, goodbye in progress.
    Closing,
    /// Terminal.
    Closed,
}

struct Shared {
    state: SessionState,
    close_reason: Option<Error>,
    probe: Option<Arc<dyn TransportConn>>,
}

/// The active transport plus the metadata captured from it. Swapped as a
/// unit at upgrade commit; `generation` lets a reader blocked on the old
/// transport tell a swap from a genuine failure.
struct Current {
    name: String,
    conn: Arc<dyn TransportConn>,
    generation: u64,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    remote_header: HashMap<String, String>,
}

/// One logical connection, long-lived across transport switches.
///
/// The application drives a session through [`next_reader`](Session::next_reader)
/// and [`next_writer`](Session::next_writer); control packets (ping, noop,
/// upgrade, close) are consumed internally and never surface.
pub struct Session {
    id: String,
    params: ConnParameters,
    shared: Mutex<Shared>,
    current: RwLock<Current>,
    /// Serializes writers with each other and with the upgrade committer.
    writer_lock: Arc<tokio::sync::Mutex<()>>,
    /// Serializes concurrent `next_reader` callers.
    reader_lock: tokio::sync::Mutex<()>,
    directory: Arc<SessionDirectory>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        transport_name: String,
        conn: Arc<dyn TransportConn>,
        params: ConnParameters,
        directory: Arc<SessionDirectory>,
    ) -> Arc<Session> {
        Arc::new(Session {
            id,
            params,
            shared: Mutex::new(Shared {
                state: SessionState::Opening,
                close_reason: None,
                probe: None,
            }),
            current: RwLock::new(Current {
                name: transport_name,
                generation: 0,
                remote_addr: conn.remote_addr(),
                local_addr: conn.local_addr(),
                remote_header: conn.remote_header().clone(),
                conn,
            }),
            writer_lock: Arc::new(tokio::sync::Mutex::new(())),
            reader_lock: tokio::sync::Mutex::new(()),
            directory,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn params(&self) -> &ConnParameters {
        &self.params
    }

    /// Name of the transport currently carrying the session.
    pub fn transport_name(&self) -> String {
        self.current.read().expect("current poisoned").name.clone()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.current.read().expect("current poisoned").remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.current.read().expect("current poisoned").local_addr
    }

    /// Peer headers captured at open, refreshed when an upgrade commits.
    pub fn remote_header(&self) -> HashMap<String, String> {
        self.current
            .read()
            .expect("current poisoned")
            .remote_header
            .clone()
    }

    pub(crate) fn state(&self) -> SessionState {
        self.shared.lock().expect("shared poisoned").state
    }

    fn current_conn(&self) -> Arc<dyn TransportConn> {
        self.current.read().expect("current poisoned").conn.clone()
    }

    fn current_snapshot(&self) -> (u64, Arc<dyn TransportConn>) {
        let cur = self.current.read().expect("current poisoned");
        (cur.generation, cur.conn.clone())
    }

    fn generation(&self) -> u64 {
        self.current.read().expect("current poisoned").generation
    }

    fn close_reason(&self) -> Option<Error> {
        let sh = self.shared.lock().expect("shared poisoned");
        match sh.state {
            SessionState::Closed => Some(sh.close_reason.clone().unwrap_or(Error::Closed)),
            _ => None,
        }
    }

    /// Next Message packet from the peer.
    ///
    /// Consumes control packets on the way: answers Ping with Pong,
    /// discards Noop, and turns a peer Close into [`Error::Closed`]. The
    /// liveness deadline is re-armed before every transport read, so any
    /// packet from the peer keeps the session alive.
    pub async fn next_reader(&self) -> Result<(FrameType, Bytes)> {
        let _reader = self.reader_lock.lock().await;
        loop {
            if let Some(reason) = self.close_reason() {
                return Err(reason);
            }
            let (generation, conn) = self.current_snapshot();
            conn.set_read_deadline(Instant::now() + self.params.liveness_window());
            match conn.read_packet().await {
                Ok(packet) => match packet.packet_type {
                    PacketType::Message => return Ok((packet.frame_type, packet.data)),
                    PacketType::Ping => {
                        let pong = Packet::text(PacketType::Pong, packet.data);
                        if let Err(e) = self.write_control(pong).await {
                            return Err(self.shutdown(e).await);
                        }
                    }
                    PacketType::Close => return Err(self.shutdown(Error::Closed).await),
                    // Pong, Noop, and a stray Upgrade or Open on the
                    // current transport carry nothing for the reader.
                    _ => {}
                },
                Err(e) => {
                    if self.generation() != generation {
                        // The transport was swapped out from under this
                        // read; continue on the new one.
                        continue;
                    }
                    if let Some(reason) = self.close_reason() {
                        return Err(reason);
                    }
                    return Err(self.shutdown(e).await);
                }
            }
        }
    }

    /// Body-writer for one Message packet.
    ///
    /// The writer is bound to the transport that is current at this call,
    /// and holds the session writer lock until closed; an upgrade that
    /// commits in between still lets this writer finish on the old
    /// transport.
    pub async fn next_writer(&self, frame_type: FrameType) -> Result<PacketWriter> {
        self.check_writable()?;
        let guard = self.writer_lock.clone().lock_owned().await;
        self.check_writable()?;
        Ok(PacketWriter {
            conn: self.current_conn(),
            frame_type,
            buf: BytesMut::new(),
            _guard: guard,
        })
    }

    fn check_writable(&self) -> Result<()> {
        let sh = self.shared.lock().expect("shared poisoned");
        match sh.state {
            SessionState::Closing | SessionState::Closed => {
                Err(sh.close_reason.clone().unwrap_or(Error::Closed))
            }
            _ => Ok(()),
        }
    }

    async fn write_control(&self, packet: Packet) -> Result<()> {
        let _guard = self.writer_lock.lock().await;
        self.current_conn().write_packet(packet).await
    }

    /// Send a Close packet (best-effort) and tear the session down.
    pub async fn close(&self) -> Result<()> {
        {
            let mut sh = self.shared.lock().expect("shared poisoned");
            match sh.state {
                SessionState::Closing | SessionState::Closed => return Ok(()),
                _ => sh.state = SessionState::Closing,
            }
        }
        let goodbye = Packet::text(PacketType::Close, Bytes::new());
        let _ = self.write_control(goodbye).await;
        self.shutdown(Error::Closed).await;
        Ok(())
    }

    /// Terminal teardown. First caller wins; everyone gets the reason the
    /// session actually closed with.
    async fn shutdown(&self, reason: Error) -> Error {
        let probe = {
            let mut sh = self.shared.lock().expect("shared poisoned");
            if sh.state == SessionState::Closed {
                return sh.close_reason.clone().unwrap_or(Error::Closed);
            }
            sh.state = SessionState::Closed;
            sh.close_reason = Some(reason.clone());
            sh.probe.take()
        };
        self.directory.remove(&self.id);
        let _ = self.current_conn().close().await;
        if let Some(probe) = probe {
            let _ = probe.close().await;
        }
        debug!(sid = %self.id, reason = %reason, "session closed");
        reason
    }

    /// Open-packet announcement; transitions Opening → Open once written.
    pub(crate) async fn send_open(&self) -> Result<()> {
        let body = self.params.to_json()?;
        self.write_control(Packet::text(PacketType::Open, body)).await?;
        let mut sh = self.shared.lock().expect("shared poisoned");
        if sh.state == SessionState::Opening {
            sh.state = SessionState::Open;
        }
        Ok(())
    }

    /// Route an HTTP request into the current transport.
    pub(crate) async fn handle_request(&self, req: EngineRequest) -> Result<EngineResponse> {
        self.current_conn().handle_request(req).await
    }

    /// Attach `probe` as the upgrade candidate and run the probe handshake
    /// in the background. The probe is read-only for the session until the
    /// client commits with an Upgrade packet.
    pub(crate) fn start_upgrade(
        self: Arc<Session>,
        name: String,
        probe: Arc<dyn TransportConn>,
    ) -> Result<()> {
        {
            let mut sh = self.shared.lock().expect("shared poisoned");
            match sh.state {
                SessionState::Open => {
                    sh.state = SessionState::Upgrading;
                    sh.probe = Some(probe.clone());
                }
                SessionState::Upgrading => return Err(Error::InvalidTransport(name)),
                _ => return Err(Error::Closed),
            }
        }
        debug!(sid = %self.id, transport = %name, "upgrade probe attached");
        tokio::spawn(async move {
            self.run_probe(name, probe).await;
        });
        Ok(())
    }

    async fn run_probe(self: Arc<Session>, name: String, probe: Arc<dyn TransportConn>) {
        match self.probe_handshake(probe.as_ref()).await {
            Ok(()) => self.commit_upgrade(name, probe).await,
            Err(e) => {
                warn!(sid = %self.id, transport = %name, error = %e, "upgrade aborted");
                let _ = probe.close().await;
                let mut sh = self.shared.lock().expect("shared poisoned");
                if sh.state == SessionState::Upgrading {
                    sh.state = SessionState::Open;
                    sh.probe = None;
                }
            }
        }
    }

    /// Expect `Ping "probe"`, answer `Pong` echoing the payload, then wait
    /// for the Upgrade packet. Anything else aborts the upgrade.
    async fn probe_handshake(&self, probe: &dyn TransportConn) -> Result<()> {
        probe.set_read_deadline(Instant::now() + self.params.liveness_window());
        let ping = probe.read_packet().await?;
        if ping.packet_type != PacketType::Ping {
            return Err(Error::InvalidPayload);
        }
        probe
            .write_packet(Packet::text(PacketType::Pong, ping.data))
            .await?;
        probe.set_read_deadline(Instant::now() + self.params.liveness_window());
        let commit = probe.read_packet().await?;
        if commit.packet_type != PacketType::Upgrade {
            return Err(Error::InvalidPayload);
        }
        Ok(())
    }

    /// The atomic swap: wait out any in-flight writer, flip the current
    /// transport, then close the old one. The old polling transport
    /// releases its parked GET with a Noop as it closes.
    async fn commit_upgrade(&self, name: String, probe: Arc<dyn TransportConn>) {
        let guard = self.writer_lock.lock().await;
        {
            let sh = self.shared.lock().expect("shared poisoned");
            if sh.state != SessionState::Upgrading {
                // Closed while the handshake was finishing; shutdown owns
                // the cleanup of both connections.
                return;
            }
        }
        let old = {
            let mut cur = self.current.write().expect("current poisoned");
            cur.name = name.clone();
            cur.generation += 1;
            cur.remote_addr = probe.remote_addr();
            cur.local_addr = probe.local_addr();
            cur.remote_header = probe.remote_header().clone();
            std::mem::replace(&mut cur.conn, probe)
        };
        {
            let mut sh = self.shared.lock().expect("shared poisoned");
            if sh.state == SessionState::Upgrading {
                sh.state = SessionState::Open;
            }
            sh.probe = None;
        }
        drop(guard);
        let _ = old.close().await;
        debug!(sid = %self.id, transport = %name, "upgrade committed");
    }
}

/// Body-writer for one outgoing Message packet.
///
/// Holds the session's writer lock; the packet is framed and sent when
/// [`close`](PacketWriter::close) is called. Dropping the writer without
/// closing sends nothing and releases the lock.
pub struct PacketWriter {
    conn: Arc<dyn TransportConn>,
    frame_type: FrameType,
    buf: BytesMut,
    _guard: OwnedMutexGuard<()>,
}

impl PacketWriter {
    /// Append body bytes.
    pub fn write(&mut self, data: &[u8]) -> &mut PacketWriter {
        self.buf.put_slice(data);
        self
    }

    /// Frame the buffered bytes as a Message packet and send it on the
    /// transport this writer was bound to.
    pub async fn close(self) -> Result<()> {
        let PacketWriter {
            conn,
            frame_type,
            buf,
            _guard,
        } = self;
        let packet = Packet::new(frame_type, PacketType::Message, buf.freeze());
        conn.write_packet(packet).await
    }
}
