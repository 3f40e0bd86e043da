// ABOUTME: Socket transport: wraps a bidirectional framed channel where one
// ABOUTME: native frame carries exactly one packet

use crate::error::{Error, Result};
use crate::packet::{FrameType, Packet, PacketType};
use crate::transport::{EngineRequest, EngineResponse, Transport, TransportConn};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

const FRAME_QUEUE: usize = 16;

/// One native frame on the socket channel. Text and binary carry packets;
/// control frames are transport chatter the packet layer skips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    Text(Bytes),
    Binary(Bytes),
    Control(Bytes),
}

/// One half of a framed bidirectional channel.
///
/// This is the seam where a real websocket (or any frame-preserving byte
/// channel) plugs in: the embedder's HTTP layer performs the native
/// handshake, wraps the connection into an endpoint, and installs it on the
/// request. [`socket_pair`] builds an in-process pair, which is also the
/// client side for tests.
#[derive(Debug)]
pub struct SocketEndpoint {
    tx: Mutex<Option<mpsc::Sender<RawFrame>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<RawFrame>>,
}

/// Two endpoints wired back to back.
pub fn socket_pair() -> (SocketEndpoint, SocketEndpoint) {
    let (a_tx, b_rx) = mpsc::channel(FRAME_QUEUE);
    let (b_tx, a_rx) = mpsc::channel(FRAME_QUEUE);
    (
        SocketEndpoint::new(a_tx, a_rx),
        SocketEndpoint::new(b_tx, b_rx),
    )
}

impl SocketEndpoint {
    fn new(tx: mpsc::Sender<RawFrame>, rx: mpsc::Receiver<RawFrame>) -> SocketEndpoint {
        SocketEndpoint {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub async fn send(&self, frame: RawFrame) -> Result<()> {
        let tx = {
            let guard = self.tx.lock().expect("socket sender poisoned");
            guard.clone().ok_or(Error::Closed)?
        };
        tx.send(frame).await.map_err(|_| Error::Closed)
    }

    pub async fn recv(&self) -> Option<RawFrame> {
        self.rx.lock().await.recv().await
    }

    /// Drop the outbound half so the peer observes end of stream.
    pub fn shutdown(&self) {
        self.tx.lock().expect("socket sender poisoned").take();
    }

    /// Frame and send one packet, the way the peer of a server connection
    /// would.
    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        self.send(frame_packet(packet)).await
    }

    /// Receive the next packet, skipping control frames.
    pub async fn recv_packet(&self) -> Result<Packet> {
        loop {
            match self.recv().await {
                Some(RawFrame::Control(_)) => continue,
                Some(frame) => return unframe_packet(frame),
                None => return Err(Error::Closed),
            }
        }
    }
}

fn frame_packet(packet: &Packet) -> RawFrame {
    let mut buf = BytesMut::with_capacity(packet.data.len() + 1);
    match packet.frame_type {
        FrameType::String => {
            buf.put_u8(packet.packet_type.digit());
            buf.put_slice(&packet.data);
            RawFrame::Text(buf.freeze())
        }
        FrameType::Binary => {
            buf.put_u8(packet.packet_type.byte());
            buf.put_slice(&packet.data);
            RawFrame::Binary(buf.freeze())
        }
    }
}

fn unframe_packet(frame: RawFrame) -> Result<Packet> {
    match frame {
        RawFrame::Text(data) => {
            let (&type_byte, _) = data.split_first().ok_or(Error::InvalidPayload)?;
            let packet_type = PacketType::from_digit(type_byte)?;
            Ok(Packet::text(packet_type, data.slice(1..)))
        }
        RawFrame::Binary(data) => {
            let (&type_byte, _) = data.split_first().ok_or(Error::InvalidPayload)?;
            let packet_type = PacketType::from_byte(type_byte)?;
            Ok(Packet::binary(packet_type, data.slice(1..)))
        }
        RawFrame::Control(_) => Err(Error::InvalidPayload),
    }
}

/// The socket transport.
pub struct SocketTransport;

impl SocketTransport {
    pub fn new() -> SocketTransport {
        SocketTransport
    }
}

impl Default for SocketTransport {
    fn default() -> Self {
        SocketTransport::new()
    }
}

impl Transport for SocketTransport {
    fn name(&self) -> &'static str {
        "socket"
    }

    fn accept(&self, req: &mut EngineRequest) -> Result<Arc<dyn TransportConn>> {
        let endpoint = req
            .socket
            .take()
            .ok_or_else(|| Error::Io(std::io::Error::other("request carries no socket")))?;
        Ok(Arc::new(SocketConn::new(endpoint, req)))
    }
}

/// Server side of an accepted socket transport.
pub struct SocketConn {
    endpoint: SocketEndpoint,
    read_deadline: Mutex<Option<Instant>>,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    remote_header: HashMap<String, String>,
}

impl SocketConn {
    fn new(endpoint: SocketEndpoint, req: &EngineRequest) -> SocketConn {
        SocketConn {
            endpoint,
            read_deadline: Mutex::new(None),
            remote_addr: req.remote_addr,
            local_addr: req.local_addr,
            remote_header: req.headers.clone(),
        }
    }
}

#[async_trait]
impl TransportConn for SocketConn {
    async fn read_packet(&self) -> Result<Packet> {
        loop {
            let deadline = *self.read_deadline.lock().expect("deadline poisoned");
            let mut rx = self.endpoint.rx.lock().await;
            let frame = match deadline {
                Some(at) => timeout_at(at, rx.recv()).await.map_err(|_| Error::Timeout)?,
                None => rx.recv().await,
            };
            drop(rx);
            match frame {
                // Native control frames are not packets.
                Some(RawFrame::Control(_)) => continue,
                Some(frame) => return unframe_packet(frame),
                None => return Err(Error::Closed),
            }
        }
    }

    async fn write_packet(&self, packet: Packet) -> Result<()> {
        self.endpoint.send(frame_packet(&packet)).await
    }

    fn set_read_deadline(&self, deadline: Instant) {
        *self.read_deadline.lock().expect("deadline poisoned") = Some(deadline);
    }

    async fn handle_request(&self, _req: EngineRequest) -> Result<EngineResponse> {
        // The native handshake already happened in the HTTP layer; all that
        // is left is confirming the protocol switch.
        Ok(EngineResponse::switching_protocols())
    }

    async fn close(&self) -> Result<()> {
        self.endpoint.shutdown();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "socket"
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
