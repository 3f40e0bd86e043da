// ABOUTME: Long-polling transport: adapts the payload codec onto pairs of
// ABOUTME: HTTP request/response bodies with serialized concurrent GETs

use crate::error::{Error, Result};
use crate::packet::{FrameType, Packet};
use crate::payload::{PayloadDecoder, PayloadEncoder};
use crate::transport::{
    EngineRequest, EngineResponse, Method, Transport, TransportConn,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

/// How many decoded inbound packets may queue between a POST body and the
/// session's read loop before the POST parks.
const INBOUND_QUEUE: usize = 8;

/// The long-polling transport.
pub struct PollingTransport;

impl PollingTransport {
    pub fn new() -> PollingTransport {
        PollingTransport
    }
}

impl Default for PollingTransport {
    fn default() -> Self {
        PollingTransport::new()
    }
}

impl Transport for PollingTransport {
    fn name(&self) -> &'static str {
        "polling"
    }

    fn accept(&self, req: &mut EngineRequest) -> Result<Arc<dyn TransportConn>> {
        Ok(Arc::new(PollingConn::new(req)))
    }
}

struct PollingState {
    encoder: PayloadEncoder,
    /// A GET is parked waiting for the next outbound packet. At most one;
    /// a surplus GET completes immediately with a Noop body.
    get_parked: bool,
    closed: bool,
}

/// One polling connection: POST bodies feed the decoder, GETs drain the
/// encoder, and the session reads/writes packets in between.
pub struct PollingConn {
    state: Mutex<PollingState>,
    /// Wakes the parked GET when the encoder gains a packet or the
    /// connection closes.
    flush: Notify,
    inbound_tx: Mutex<Option<mpsc::Sender<Packet>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
    read_deadline: Mutex<Option<Instant>>,
    closed_tx: watch::Sender<bool>,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    remote_header: HashMap<String, String>,
}

impl PollingConn {
    fn new(req: &EngineRequest) -> PollingConn {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (closed_tx, _) = watch::channel(false);
        PollingConn {
            state: Mutex::new(PollingState {
                encoder: PayloadEncoder::new(FrameType::String),
                get_parked: false,
                closed: false,
            }),
            flush: Notify::new(),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            read_deadline: Mutex::new(None),
            closed_tx,
            remote_addr: req.remote_addr,
            local_addr: req.local_addr,
            remote_header: req.headers.clone(),
        }
    }

    /// GET: drain whatever the encoder has buffered, or park until a packet
    /// shows up. A second concurrent GET answers immediately with a Noop so
    /// exactly one request is ever parked.
    async fn handle_get(&self) -> Result<EngineResponse> {
        {
            let mut state = self.state.lock().expect("polling state poisoned");
            if !state.encoder.is_empty() {
                let body = state.encoder.take();
                return Ok(EngineResponse::ok(body));
            }
            if state.closed {
                return Err(Error::Closed);
            }
            if state.get_parked {
                let mut enc = PayloadEncoder::new(FrameType::String);
                enc.encode(&Packet::noop())?;
                return Ok(EngineResponse::ok(enc.take()));
            }
            state.get_parked = true;
        }
        loop {
            self.flush.notified().await;
            let mut state = self.state.lock().expect("polling state poisoned");
            if !state.encoder.is_empty() {
                state.get_parked = false;
                let body = state.encoder.take();
                return Ok(EngineResponse::ok(body));
            }
            if state.closed {
                state.get_parked = false;
                return Err(Error::Closed);
            }
        }
    }

    /// POST: decode the body with the dialect named by the content type and
    /// hand every packet to the session's read loop. Parks when the inbound
    /// queue is full; aborts if the connection closes first.
    async fn handle_post(&self, req: EngineRequest) -> Result<EngineResponse> {
        let dialect = match req.headers.get("content-type").map(String::as_str) {
            Some("application/octet-stream") => FrameType::Binary,
            _ => FrameType::String,
        };
        let packets = match PayloadDecoder::decode(dialect, &req.body) {
            Ok(packets) => packets,
            Err(e) => {
                // Malformed body is fatal for the whole connection.
                debug!(error = %e, "polling body rejected");
                let _ = self.close().await;
                return Err(e);
            }
        };

        let tx = {
            let guard = self.inbound_tx.lock().expect("polling sender poisoned");
            guard.clone().ok_or(Error::Closed)?
        };
        let mut closed = self.closed_tx.subscribe();
        for packet in packets {
            tokio::select! {
                res = tx.send(packet) => res.map_err(|_| Error::Closed)?,
                _ = closed.wait_for(|c| *c) => return Err(Error::Closed),
            }
        }
        Ok(EngineResponse::ok(Bytes::from_static(b"ok")))
    }
}

#[async_trait]
impl TransportConn for PollingConn {
    async fn read_packet(&self) -> Result<Packet> {
        let deadline = *self.read_deadline.lock().expect("deadline poisoned");
        let mut rx = self.inbound_rx.lock().await;
        let received = match deadline {
            Some(at) => timeout_at(at, rx.recv()).await.map_err(|_| Error::Timeout)?,
            None => rx.recv().await,
        };
        received.ok_or(Error::Closed)
    }

    async fn write_packet(&self, packet: Packet) -> Result<()> {
        {
            let mut state = self.state.lock().expect("polling state poisoned");
            if state.closed {
                return Err(Error::Closed);
            }
            state.encoder.encode(&packet)?;
        }
        self.flush.notify_one();
        Ok(())
    }

    fn set_read_deadline(&self, deadline: Instant) {
        *self.read_deadline.lock().expect("deadline poisoned") = Some(deadline);
    }

    async fn handle_request(&self, req: EngineRequest) -> Result<EngineResponse> {
        match req.method {
            Method::Get => self.handle_get().await,
            Method::Post => self.handle_post(req).await,
        }
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("polling state poisoned");
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            // Release a parked GET with a Noop so the poll cycle ends
            // cleanly instead of erroring.
            if state.get_parked && state.encoder.is_empty() {
                state.encoder.encode(&Packet::noop())?;
            }
        }
        self.inbound_tx.lock().expect("polling sender poisoned").take();
        let _ = self.closed_tx.send(true);
        self.flush.notify_one();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "polling"
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_header(&self) -> &HashMap<String, String> {
        &self.remote_header
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;
    use std::time::Duration;

    fn conn() -> PollingConn {
        let req = EngineRequest::get("polling");
        PollingConn::new(&req)
    }

    #[tokio::test]
    async fn post_feeds_read_packet() {
        let conn = conn();
        let resp = conn
            .handle_request(EngineRequest::post("polling", &b"2:4a"[..]))
            .await
            .unwrap();
        assert_eq!(resp.body, Bytes::from_static(b"ok"));

        let packet = conn.read_packet().await.unwrap();
        assert_eq!(packet.packet_type, PacketType::Message);
        assert_eq!(packet.data, Bytes::from_static(b"a"));
    }

    #[tokio::test]
    async fn get_drains_written_packet() {
        let conn = conn();
        conn.write_packet(Packet::text(PacketType::Message, Bytes::from_static(b"a")))
            .await
            .unwrap();
        let resp = conn.handle_request(EngineRequest::get("polling")).await.unwrap();
        assert_eq!(resp.body, Bytes::from_static(b"2:4a"));
    }

    #[tokio::test]
    async fn parked_get_wakes_on_write() {
        let conn = Arc::new(conn());
        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.handle_get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        conn.write_packet(Packet::text(PacketType::Message, Bytes::from_static(b"hi")))
            .await
            .unwrap();
        let resp = reader.await.unwrap().unwrap();
        assert_eq!(resp.body, Bytes::from_static(b"3:4hi"));
    }

    #[tokio::test]
    async fn surplus_get_answers_noop() {
        let conn = Arc::new(conn());
        let parked = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.handle_get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let resp = conn.handle_get().await.unwrap();
        assert_eq!(resp.body, Bytes::from_static(b"1:6"));

        conn.close().await.unwrap();
        let parked = parked.await.unwrap().unwrap();
        assert_eq!(parked.body, Bytes::from_static(b"1:6"));
    }

    #[tokio::test]
    async fn malformed_post_closes_connection() {
        let conn = conn();
        let err = conn
            .handle_request(EngineRequest::post("polling", &b"x:4a"[..]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPayload));
        assert!(matches!(conn.read_packet().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn read_deadline_fires() {
        let conn = conn();
        conn.set_read_deadline(Instant::now() + Duration::from_millis(20));
        assert!(matches!(conn.read_packet().await, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let conn = conn();
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(matches!(
            conn.write_packet(Packet::noop()).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn octet_stream_body_uses_binary_dialect() {
        let conn = conn();
        let body: &[u8] = &[0x01, 0x04, 0xFF, 0x04, 0x01, 0x02, 0x03];
        let req = EngineRequest::post("polling", body)
            .with_header("content-type", "application/octet-stream");
        conn.handle_request(req).await.unwrap();
        let packet = conn.read_packet().await.unwrap();
        assert_eq!(packet.frame_type, FrameType::Binary);
        assert_eq!(packet.data, Bytes::from_static(&[0x01, 0x02, 0x03]));
    }
}
