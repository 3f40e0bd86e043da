// ABOUTME: Core wire vocabulary: frame types, packet types, packets, and the
// ABOUTME: connection parameters carried by the Open packet

use crate::error::{Error, Result};
use bytes::Bytes;
use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transport-level framing of a packet.
///
/// Determines the wire encoding on a polling transport (plain text vs
/// base64-wrapped) and the native frame kind on a socket transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Text frame. Packet type is carried as an ASCII digit.
    String,
    /// Binary frame. Packet type is carried as a raw byte.
    Binary,
}

impl FrameType {
    /// Decode the leading frame-type byte of the binary polling dialect.
    /// Only `0` and `1` are assigned.
    pub(crate) fn from_byte(b: u8) -> Result<FrameType> {
        match b {
            0 => Ok(FrameType::String),
            1 => Ok(FrameType::Binary),
            _ => Err(Error::InvalidPayload),
        }
    }

    pub(crate) fn byte(self) -> u8 {
        match self {
            FrameType::String => 0,
            FrameType::Binary => 1,
        }
    }
}

/// Protocol packet types.
///
/// Encoded as the digit characters `'0'`-`'6'` inside string frames and as
/// the raw bytes `0x00`-`0x06` inside binary frames.
#[derive(TryFromPrimitive)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Sent by the server as the first packet of a session, carrying the
    /// serialized [`ConnParameters`].
    Open = 0,
    /// Either side requests teardown of the session.
    Close = 1,
    /// Client-initiated liveness probe; the server echoes the payload back
    /// in a `Pong`.
    Ping = 2,
    /// Server reply to `Ping`.
    Pong = 3,
    /// Application payload.
    Message = 4,
    /// Sent by the client on a probe transport to commit a transport
    /// upgrade.
    Upgrade = 5,
    /// Filler packet; discarded by the receiver. Used to release a parked
    /// long-poll request.
    Noop = 6,
}

impl PacketType {
    /// Decode from the ASCII digit used inside string frames.
    pub(crate) fn from_digit(b: u8) -> Result<PacketType> {
        let v = b.wrapping_sub(b'0');
        PacketType::try_from(v).map_err(|_| Error::InvalidPayload)
    }

    /// Decode from the raw byte used inside binary frames.
    pub(crate) fn from_byte(b: u8) -> Result<PacketType> {
        PacketType::try_from(b).map_err(|_| Error::InvalidPayload)
    }

    pub(crate) fn digit(self) -> u8 {
        self as u8 + b'0'
    }

    pub(crate) fn byte(self) -> u8 {
        self as u8
    }
}

/// One decoded protocol packet: framing, type, and the (already unwrapped)
/// payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub frame_type: FrameType,
    pub packet_type: PacketType,
    pub data: Bytes,
}

impl Packet {
    pub fn new(frame_type: FrameType, packet_type: PacketType, data: Bytes) -> Packet {
        Packet {
            frame_type,
            packet_type,
            data,
        }
    }

    /// Packet carried in a string frame.
    pub fn text(packet_type: PacketType, data: Bytes) -> Packet {
        Packet::new(FrameType::String, packet_type, data)
    }

    /// Packet carried in a binary frame.
    pub fn binary(packet_type: PacketType, data: Bytes) -> Packet {
        Packet::new(FrameType::Binary, packet_type, data)
    }

    /// Empty Noop packet.
    pub fn noop() -> Packet {
        Packet::text(PacketType::Noop, Bytes::new())
    }
}

/// Parameters negotiated at session open, carried as the body of the Open
/// packet.
///
/// The wire form is a fixed-order camelCase JSON record with millisecond
/// integers:
/// `{"sid":…,"upgrades":[…],"pingInterval":…,"pingTimeout":…}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnParameters {
    /// Session id, the directory's primary key.
    pub sid: String,
    /// Transport names the client may upgrade to, in registry order.
    pub upgrades: Vec<String>,
    /// Expected interval between client pings, in milliseconds.
    pub ping_interval: u64,
    /// Grace past the interval before the session is considered dead, in
    /// milliseconds.
    pub ping_timeout: u64,
}

impl ConnParameters {
    pub fn new(
        sid: String,
        upgrades: Vec<String>,
        ping_interval: Duration,
        ping_timeout: Duration,
    ) -> ConnParameters {
        ConnParameters {
            sid,
            upgrades,
            ping_interval: ping_interval.as_millis() as u64,
            ping_timeout: ping_timeout.as_millis() as u64,
        }
    }

    /// Absence of any packet for this long means the peer is dead.
    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.ping_interval + self.ping_timeout)
    }

    pub(crate) fn to_json(&self) -> Result<Bytes> {
        let body = serde_json::to_vec(self).map_err(std::io::Error::other)?;
        Ok(Bytes::from(body))
    }

    pub(crate) fn from_json(body: &[u8]) -> Result<ConnParameters> {
        serde_json::from_slice(body).map_err(|_| Error::InvalidPayload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_type_digits_round_trip() {
        for pt in [
            PacketType::Open,
            PacketType::Close,
            PacketType::Ping,
            PacketType::Pong,
            PacketType::Message,
            PacketType::Upgrade,
            PacketType::Noop,
        ] {
            assert_eq!(PacketType::from_digit(pt.digit()).unwrap(), pt);
            assert_eq!(PacketType::from_byte(pt.byte()).unwrap(), pt);
        }
    }

    #[test]
    fn out_of_range_packet_types_rejected() {
        assert!(PacketType::from_digit(b'7').is_err());
        assert!(PacketType::from_digit(b'a').is_err());
        assert!(PacketType::from_byte(7).is_err());
    }

    #[test]
    fn frame_type_bytes() {
        assert_eq!(FrameType::from_byte(0).unwrap(), FrameType::String);
        assert_eq!(FrameType::from_byte(1).unwrap(), FrameType::Binary);
        assert!(FrameType::from_byte(2).is_err());
    }

    #[test]
    fn conn_parameters_wire_order_is_fixed() {
        let params = ConnParameters::new(
            "abc123".to_string(),
            vec!["socket".to_string()],
            Duration::from_secs(20),
            Duration::from_secs(60),
        );
        let json = params.to_json().unwrap();
        assert_eq!(
            std::str::from_utf8(&json).unwrap(),
            r#"{"sid":"abc123","upgrades":["socket"],"pingInterval":20000,"pingTimeout":60000}"#
        );
        assert_eq!(ConnParameters::from_json(&json).unwrap(), params);
    }
}
