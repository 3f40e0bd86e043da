// ABOUTME: Crate root for the bidirectional session protocol server
// ABOUTME: Wires together codec, transports, sessions, and dispatch

//! A low-latency, bidirectional message channel between a browser-like
//! client and this server, multiplexed over plain HTTP.
//!
//! A client opens one logical session on a long-polling transport and may
//! upgrade it to a socket transport mid-flight without losing messages.
//! The embedder's HTTP layer parses each request into an [`EngineRequest`]
//! and feeds it to [`Server::dispatch`]; the application consumes sessions
//! from [`Server::accept`] and exchanges Message packets through
//! [`Session::next_reader`] and [`Session::next_writer`].
//!
//! # Examples
//!
//! An echo server:
//!
//! ```rust,no_run
//! use eio::{Config, Server};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> eio::Result<()> {
//!     let server = Arc::new(Server::new(Config::default()));
//!     // Hand `server.dispatch(request)` to your HTTP layer, then:
//!     loop {
//!         let session = server.accept().await?;
//!         tokio::spawn(async move {
//!             while let Ok((frame_type, body)) = session.next_reader().await {
//!                 let mut writer = session.next_writer(frame_type).await?;
//!                 writer.write(&body);
//!                 writer.close().await?;
//!             }
//!             Ok::<_, eio::Error>(())
//!         });
//!     }
//! }
//! ```

pub mod error;
pub mod packet;
pub mod payload;
pub mod server;
pub mod session;
pub mod transport;


pub use error::{Error, Result};
pub use packet::{ConnParameters, FrameType, Packet, PacketType};
pub use server::{Config, Server};
pub use session::{PacketWriter, Session, SessionState};
pub use transport::{
    socket_pair, EngineRequest, EngineResponse, Method, PollingTransport, SocketEndpoint,
    SocketTransport, Transport, TransportConn, TransportManager,
};
