// ABOUTME: Polling wire codec: packs packets into HTTP bodies and back
// ABOUTME: Implements the text dialect (length:payload) and the binary dialect

use crate::error::{Error, Result};
use crate::packet::{FrameType, Packet, PacketType};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;

/// Maximum accepted payload length for a single packet, guarding the
/// decoder against hostile length headers.
pub const MAX_PACKET_SIZE: usize = 1 << 20;

/// Decoder for a polling HTTP body carrying one or more concatenated
/// packets.
///
/// Two dialects exist and are selected per body by the caller: the text
/// dialect (`<len>':'<payload>`) and the binary dialect
/// (`<frame-byte><len-digit-bytes><0xFF><payload>`). The codec never sniffs;
/// the caller decides from the request it received.
///
/// A body either decodes completely or not at all: a trailing partial
/// packet, a malformed length, or an out-of-range frame byte is an
/// [`Error::InvalidPayload`] and the connection it arrived on must be torn
/// down.
pub struct PayloadDecoder;

impl PayloadDecoder {
    /// Decode every packet in `body` using the named dialect.
    pub fn decode(dialect: FrameType, body: &[u8]) -> Result<Vec<Packet>> {
        let mut cur = Cursor::new(body);
        let mut packets = Vec::new();
        while cur.has_remaining() {
            let packet = match dialect {
                FrameType::String => Self::decode_text(&mut cur)?,
                FrameType::Binary => Self::decode_binary(&mut cur)?,
            };
            packets.push(packet);
        }
        Ok(packets)
    }

    /// One text-dialect packet: `<decimal-length>':'<payload>`.
    ///
    /// The payload starts with the packet-type digit, or with `'b'` when it
    /// wraps a base64-encoded binary frame. Length counts the type byte and
    /// the `'b'` marker.
    fn decode_text(cur: &mut Cursor<&[u8]>) -> Result<Packet> {
        let len = Self::read_text_len(cur)?;
        if cur.remaining() < len {
            return Err(Error::InvalidPayload);
        }
        let payload = cur.copy_to_bytes(len);

        if payload[0] == b'b' {
            if len < 2 {
                return Err(Error::InvalidPayload);
            }
            let packet_type = PacketType::from_digit(payload[1])?;
            let data = STANDARD
                .decode(&payload[2..])
                .map_err(|_| Error::InvalidPayload)?;
            Ok(Packet::binary(packet_type, Bytes::from(data)))
        } else {
            let packet_type = PacketType::from_digit(payload[0])?;
            Ok(Packet::text(packet_type, payload.slice(1..)))
        }
    }

    /// One binary-dialect packet:
    /// `<frame-byte><digit-bytes…><0xFF><type-byte><payload>`.
    ///
    /// The frame byte must be 0 or 1; the length digits are the raw bytes
    /// `0x00`-`0x09`; the type byte is an ASCII digit for string frames and
    /// a raw byte for binary frames; length counts the type byte.
    fn decode_binary(cur: &mut Cursor<&[u8]>) -> Result<Packet> {
        if !cur.has_remaining() {
            return Err(Error::InvalidPayload);
        }
        let frame_type = FrameType::from_byte(cur.get_u8())?;

        let len = Self::read_binary_len(cur)?;
        if len < 1 || cur.remaining() < len {
            return Err(Error::InvalidPayload);
        }
        let type_byte = cur.get_u8();
        let packet_type = match frame_type {
            FrameType::String => PacketType::from_digit(type_byte)?,
            FrameType::Binary => PacketType::from_byte(type_byte)?,
        };
        let data = cur.copy_to_bytes(len - 1);
        Ok(Packet::new(frame_type, packet_type, data))
    }

    /// Decimal ASCII length terminated by `':'`. At least one digit and a
    /// non-empty payload are required.
    fn read_text_len(cur: &mut Cursor<&[u8]>) -> Result<usize> {
        let mut len: usize = 0;
        let mut digits = 0;
        loop {
            if !cur.has_remaining() {
                return Err(Error::InvalidPayload);
            }
            match cur.get_u8() {
                b':' => break,
                b @ b'0'..=b'9' => {
                    len = len * 10 + usize::from(b - b'0');
                    digits += 1;
                    if len > MAX_PACKET_SIZE {
                        return Err(Error::InvalidPayload);
                    }
                }
                _ => return Err(Error::InvalidPayload),
            }
        }
        if digits == 0 || len == 0 {
            return Err(Error::InvalidPayload);
        }
        Ok(len)
    }

    /// Decimal length encoded as one byte per digit (`0x00`-`0x09`),
    /// terminated by the `0xFF` sentinel.
    fn read_binary_len(cur: &mut Cursor<&[u8]>) -> Result<usize> {
        let mut len: usize = 0;
        let mut digits = 0;
        loop {
            if !cur.has_remaining() {
                return Err(Error::InvalidPayload);
            }
            match cur.get_u8() {
                0xFF => break,
                b @ 0x00..=0x09 => {
                    len = len * 10 + usize::from(b);
                    digits += 1;
                    if len > MAX_PACKET_SIZE {
                        return Err(Error::InvalidPayload);
                    }
                }
                _ => return Err(Error::InvalidPayload),
            }
        }
        if digits == 0 {
            return Err(Error::InvalidPayload);
        }
        Ok(len)
    }
}

/// Encoder buffering packets for the next outgoing HTTP body.
///
/// Constructed with the dialect the response body will use. Binary frames
/// encoded into a text-dialect body are wrapped in base64 with the `'b'`
/// marker; in a binary-dialect body they pass through untouched.
pub struct PayloadEncoder {
    dialect: FrameType,
    buf: BytesMut,
}

impl PayloadEncoder {
    pub fn new(dialect: FrameType) -> PayloadEncoder {
        PayloadEncoder {
            dialect,
            buf: BytesMut::new(),
        }
    }

    /// Append one packet in wire form.
    pub fn encode(&mut self, packet: &Packet) -> Result<()> {
        if packet.data.len() > MAX_PACKET_SIZE {
            return Err(Error::InvalidPayload);
        }
        match self.dialect {
            FrameType::String => self.encode_text(packet),
            FrameType::Binary => self.encode_binary(packet),
        }
        Ok(())
    }

    fn encode_text(&mut self, packet: &Packet) {
        match packet.frame_type {
            FrameType::String => {
                let len = packet.data.len() + 1;
                self.buf.put_slice(len.to_string().as_bytes());
                self.buf.put_u8(b':');
                self.buf.put_u8(packet.packet_type.digit());
                self.buf.put_slice(&packet.data);
            }
            FrameType::Binary => {
                let body = STANDARD.encode(&packet.data);
                let len = body.len() + 2;
                self.buf.put_slice(len.to_string().as_bytes());
                self.buf.put_u8(b':');
                self.buf.put_u8(b'b');
                self.buf.put_u8(packet.packet_type.digit());
                self.buf.put_slice(body.as_bytes());
            }
        }
    }

    fn encode_binary(&mut self, packet: &Packet) {
        self.buf.put_u8(packet.frame_type.byte());
        let len = packet.data.len() + 1;
        for digit in len.to_string().bytes() {
            self.buf.put_u8(digit - b'0');
        }
        self.buf.put_u8(0xFF);
        match packet.frame_type {
            FrameType::String => self.buf.put_u8(packet.packet_type.digit()),
            FrameType::Binary => self.buf.put_u8(packet.packet_type.byte()),
        }
        self.buf.put_slice(&packet.data);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drain everything buffered so far as one HTTP body.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(dialect: FrameType, packets: &[Packet]) {
        let mut enc = PayloadEncoder::new(dialect);
        for p in packets {
            enc.encode(p).unwrap();
        }
        let body = enc.take();
        let decoded = PayloadDecoder::decode(dialect, &body).unwrap();
        assert_eq!(decoded, packets);
    }

    #[test]
    fn text_message_wire_form() {
        let mut enc = PayloadEncoder::new(FrameType::String);
        enc.encode(&Packet::text(PacketType::Message, Bytes::from_static(b"a")))
            .unwrap();
        assert_eq!(&enc.take()[..], b"2:4a");
    }

    #[test]
    fn text_message_decodes() {
        let packets = PayloadDecoder::decode(FrameType::String, b"2:4a").unwrap();
        assert_eq!(
            packets,
            vec![Packet::text(PacketType::Message, Bytes::from_static(b"a"))]
        );
    }

    #[test]
    fn base64_wrapped_binary_in_text_body() {
        let packets = PayloadDecoder::decode(FrameType::String, b"6:b4SGVsbG8=").unwrap();
        assert_eq!(
            packets,
            vec![Packet::binary(
                PacketType::Message,
                Bytes::from_static(b"Hello")
            )]
        );
    }

    #[test]
    fn binary_frame_encodes_as_base64_in_text_body() {
        let mut enc = PayloadEncoder::new(FrameType::String);
        enc.encode(&Packet::binary(
            PacketType::Message,
            Bytes::from_static(b"Hello"),
        ))
        .unwrap();
        assert_eq!(&enc.take()[..], b"6:b4SGVsbG8=");
    }

    #[test]
    fn multiple_packets_in_one_body() {
        let packets = PayloadDecoder::decode(FrameType::String, b"1:2:6:b4SGVsbG8=2:4a").unwrap();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].packet_type, PacketType::Ping);
        assert_eq!(packets[1].data, Bytes::from_static(b"Hello"));
        assert_eq!(packets[2].data, Bytes::from_static(b"a"));
    }

    #[test]
    fn binary_dialect_string_frame() {
        // frame byte 0, length 2 (digits 0x02), sentinel, digit '4', "a"
        let body = [0x00, 0x02, 0xFF, b'4', b'a'];
        let packets = PayloadDecoder::decode(FrameType::Binary, &body).unwrap();
        assert_eq!(
            packets,
            vec![Packet::text(PacketType::Message, Bytes::from_static(b"a"))]
        );
    }

    #[test]
    fn binary_dialect_binary_frame() {
        let body = [0x01, 0x04, 0xFF, 0x04, 0xDE, 0xAD, 0xBE];
        let packets = PayloadDecoder::decode(FrameType::Binary, &body).unwrap();
        assert_eq!(
            packets,
            vec![Packet::binary(
                PacketType::Message,
                Bytes::from_static(&[0xDE, 0xAD, 0xBE])
            )]
        );
    }

    #[test]
    fn binary_dialect_multi_digit_length() {
        let data: Vec<u8> = (0..11).collect();
        let mut enc = PayloadEncoder::new(FrameType::Binary);
        enc.encode(&Packet::binary(
            PacketType::Message,
            Bytes::from(data.clone()),
        ))
        .unwrap();
        let body = enc.take();
        // 12 bytes of payload incl. type byte: digits 1, 2
        assert_eq!(&body[..4], &[0x01, 0x01, 0x02, 0xFF]);
        let packets = PayloadDecoder::decode(FrameType::Binary, &body).unwrap();
        assert_eq!(packets[0].data, Bytes::from(data));
    }

    #[test]
    fn round_trips_both_dialects() {
        let packets = vec![
            Packet::text(PacketType::Open, Bytes::from_static(b"{}")),
            Packet::text(PacketType::Ping, Bytes::from_static(b"probe")),
            Packet::binary(PacketType::Message, Bytes::from_static(&[0, 1, 2, 0xFF])),
            Packet::text(PacketType::Message, Bytes::from_static("héllo".as_bytes())),
            Packet::noop(),
        ];
        round_trip(FrameType::String, &packets);
        round_trip(FrameType::Binary, &packets);
    }

    #[test]
    fn invalid_frame_type_byte_rejected() {
        let body = [0x02, 0x02, 0xFF, b'4', b'a'];
        assert!(matches!(
            PayloadDecoder::decode(FrameType::Binary, &body),
            Err(Error::InvalidPayload)
        ));
    }

    #[test]
    fn short_read_rejected() {
        assert!(matches!(
            PayloadDecoder::decode(FrameType::String, b"5:4ab"),
            Err(Error::InvalidPayload)
        ));
        assert!(matches!(
            PayloadDecoder::decode(FrameType::Binary, &[0x00, 0x05, 0xFF, b'4']),
            Err(Error::InvalidPayload)
        ));
    }

    #[test]
    fn malformed_length_rejected() {
        assert!(PayloadDecoder::decode(FrameType::String, b":4a").is_err());
        assert!(PayloadDecoder::decode(FrameType::String, b"x:4a").is_err());
        assert!(PayloadDecoder::decode(FrameType::String, b"0:").is_err());
        assert!(PayloadDecoder::decode(FrameType::Binary, &[0x00, 0xFF, b'4']).is_err());
        assert!(PayloadDecoder::decode(FrameType::Binary, &[0x00, 0x0A, 0xFF]).is_err());
    }

    #[test]
    fn bad_base64_rejected() {
        assert!(PayloadDecoder::decode(FrameType::String, b"4:b4!!").is_err());
    }

    #[test]
    fn oversized_length_rejected() {
        let body = format!("{}:4", MAX_PACKET_SIZE * 2);
        assert!(PayloadDecoder::decode(FrameType::String, body.as_bytes()).is_err());
    }
}
