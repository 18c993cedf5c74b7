// RTP packet construction and parsing.
// Header layout per RFC 3550: 12 fixed bytes, then 4 bytes per CSRC,
// then an optional extension block, then the payload.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const RTP_VERSION: u8 = 2;
const RTP_HEADER_LEN: usize = 12;
const RTP_EXTENSION_HEADER_LEN: usize = 4;

// RTP header field offsets
const SEQUENCE_OFFSET: usize = 2;
const TIMESTAMP_OFFSET: usize = 4;
const SSRC_OFFSET: usize = 8;

// RTP header bit masks
const PT_MASK: u8 = 0x7f;
const CC_MASK: u8 = 0x0f;
const PADDING_BIT: u8 = 0x20;
const EXTENSION_BIT: u8 = 0x10;
const MARKER_BIT: u8 = 0x80;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("rtp packet shorter than the fixed header")]
    PacketTooShort,
    #[error("rtp header fields overrun the packet")]
    Truncated,
}

/// Static audio payload type assignments plus the dynamic ones we name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    Pcmu,
    Pcma,
    G722,
    G729,
    Opus,
    TelephoneEvent,
    Unknown(u8),
}

impl PayloadType {
    pub fn from_number(pt: u8) -> PayloadType {
        match pt {
            0 => PayloadType::Pcmu,
            8 => PayloadType::Pcma,
            9 => PayloadType::G722,
            18 => PayloadType::G729,
            111 => PayloadType::Opus,
            101 => PayloadType::TelephoneEvent,
            n => PayloadType::Unknown(n),
        }
    }

    pub fn number(&self) -> u8 {
        match self {
            PayloadType::Pcmu => 0,
            PayloadType::Pcma => 8,
            PayloadType::G722 => 9,
            PayloadType::G729 => 18,
            PayloadType::Opus => 111,
            PayloadType::TelephoneEvent => 101,
            PayloadType::Unknown(n) => *n,
        }
    }

    /// RTP timestamp units per packet at the usual 20 ms (10 ms for G.729)
    /// packetization.
    pub fn samples_per_packet(&self) -> u32 {
        match self {
            PayloadType::Pcmu | PayloadType::Pcma => 160,
            PayloadType::G729 => 80,
            PayloadType::G722 => 320,
            _ => 160,
        }
    }

    pub fn clock_rate(&self) -> u32 {
        match self {
            PayloadType::G722 => 16000,
            PayloadType::Opus => 48000,
            _ => 8000,
        }
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PayloadType::Pcmu => write!(f, "PCMU"),
            PayloadType::Pcma => write!(f, "PCMA"),
            PayloadType::G722 => write!(f, "G722"),
            PayloadType::G729 => write!(f, "G729"),
            PayloadType::Opus => write!(f, "OPUS"),
            PayloadType::TelephoneEvent => write!(f, "telephone-event"),
            PayloadType::Unknown(n) => write!(f, "Unknown({})", n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpExtension {
    pub id: u16,
    /// Extension payload, a whole number of 32-bit words.
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub version: u8,
    pub padding: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    pub extension: Option<RtpExtension>,
    pub payload: Bytes,
}

impl Default for RtpPacket {
    fn default() -> Self {
        RtpPacket {
            version: RTP_VERSION,
            padding: false,
            marker: false,
            payload_type: 0,
            sequence: 0,
            timestamp: 0,
            ssrc: 0,
            csrc: Vec::new(),
            extension: None,
            payload: Bytes::new(),
        }
    }
}

impl RtpPacket {
    /// Parse a wire buffer. Parsing is permissive about the version field so
    /// that bad packets can still be inspected; `is_valid` is the gate.
    pub fn parse(buf: &[u8]) -> Result<RtpPacket, PacketError> {
        if buf.len() < RTP_HEADER_LEN {
            return Err(PacketError::PacketTooShort);
        }

        let version = buf[0] >> 6;
        let padding = buf[0] & PADDING_BIT != 0;
        let has_extension = buf[0] & EXTENSION_BIT != 0;
        let csrc_count = (buf[0] & CC_MASK) as usize;
        let marker = buf[1] & MARKER_BIT != 0;
        let payload_type = buf[1] & PT_MASK;
        let sequence = BigEndian::read_u16(&buf[SEQUENCE_OFFSET..]);
        let timestamp = BigEndian::read_u32(&buf[TIMESTAMP_OFFSET..]);
        let ssrc = BigEndian::read_u32(&buf[SSRC_OFFSET..]);

        let mut offset = RTP_HEADER_LEN;
        if buf.len() < offset + csrc_count * 4 {
            return Err(PacketError::Truncated);
        }
        let mut csrc = Vec::with_capacity(csrc_count);
        for _ in 0..csrc_count {
            csrc.push(BigEndian::read_u32(&buf[offset..]));
            offset += 4;
        }

        let extension = if has_extension {
            if buf.len() < offset + RTP_EXTENSION_HEADER_LEN {
                return Err(PacketError::Truncated);
            }
            let id = BigEndian::read_u16(&buf[offset..]);
            let words = BigEndian::read_u16(&buf[offset + 2..]) as usize;
            offset += RTP_EXTENSION_HEADER_LEN;
            if buf.len() < offset + words * 4 {
                return Err(PacketError::Truncated);
            }
            let data = Bytes::copy_from_slice(&buf[offset..offset + words * 4]);
            offset += words * 4;
            Some(RtpExtension { id, data })
        } else {
            None
        };

        let mut payload = &buf[offset..];
        if padding {
            // The final byte names the padding run, itself included.
            let pad = *payload.last().ok_or(PacketError::Truncated)? as usize;
            if pad == 0 || pad > payload.len() {
                return Err(PacketError::Truncated);
            }
            payload = &payload[..payload.len() - pad];
        }

        Ok(RtpPacket {
            version,
            padding,
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            csrc,
            extension,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    pub fn is_valid(&self) -> bool {
        self.version == RTP_VERSION
    }

    pub fn payload_type(&self) -> PayloadType {
        PayloadType::from_number(self.payload_type)
    }

    pub fn header_len(&self) -> usize {
        RTP_HEADER_LEN
            + 4 * self.csrc.len()
            + self
                .extension
                .as_ref()
                .map(|e| RTP_EXTENSION_HEADER_LEN + e.data.len())
                .unwrap_or(0)
    }

    /// Emit the wire form. A set padding flag re-appends a minimal one-byte
    /// padding run, since the original run length is not kept after parse.
    pub fn serialize(&self) -> Bytes {
        let pad_len = if self.padding { 1 } else { 0 };
        let mut buf =
            BytesMut::with_capacity(self.header_len() + self.payload.len() + pad_len);

        let mut b0 = (self.version << 6) | (self.csrc.len() as u8 & CC_MASK);
        if self.padding {
            b0 |= PADDING_BIT;
        }
        if self.extension.is_some() {
            b0 |= EXTENSION_BIT;
        }
        buf.put_u8(b0);

        let mut b1 = self.payload_type & PT_MASK;
        if self.marker {
            b1 |= MARKER_BIT;
        }
        buf.put_u8(b1);

        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }
        if let Some(ext) = &self.extension {
            buf.put_u16(ext.id);
            buf.put_u16((ext.data.len() / 4) as u16);
            buf.put_slice(&ext.data);
        }
        buf.put_slice(&self.payload);
        if self.padding {
            buf.put_u8(1);
        }

        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let packet = RtpPacket {
            payload_type: 0,
            sequence: 12345,
            timestamp: 987654321,
            ssrc: 0x12345678,
            payload: Bytes::from_static(b"test audio data"),
            ..Default::default()
        };

        let wire = packet.serialize();
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert!(parsed.is_valid());
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_roundtrip_csrc_extension() {
        let packet = RtpPacket {
            marker: true,
            payload_type: 8,
            sequence: 65535,
            timestamp: u32::MAX,
            ssrc: 42,
            csrc: (0..15).collect(),
            extension: Some(RtpExtension {
                id: 0xBEDE,
                data: Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]),
            }),
            payload: Bytes::from_static(b"x"),
            ..Default::default()
        };

        let parsed = RtpPacket::parse(&packet.serialize()).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_padding_stripped() {
        // 12-byte header plus payload "abc" plus a 5-byte padding run.
        let mut wire = vec![RTP_VERSION << 6 | PADDING_BIT, 0];
        wire.extend_from_slice(&[0, 7]); // sequence
        wire.extend_from_slice(&[0, 0, 0, 1]); // timestamp
        wire.extend_from_slice(&[0, 0, 0, 9]); // ssrc
        wire.extend_from_slice(b"abc");
        wire.extend_from_slice(&[0, 0, 0, 0, 5]);

        let parsed = RtpPacket::parse(&wire).unwrap();
        assert!(parsed.padding);
        assert_eq!(&parsed.payload[..], b"abc");

        let reparsed = RtpPacket::parse(&parsed.serialize()).unwrap();
        assert_eq!(reparsed, parsed);
    }

    #[test]
    fn test_padding_overrun_rejected() {
        let mut wire = vec![RTP_VERSION << 6 | PADDING_BIT, 0];
        wire.resize(12, 0);
        wire.extend_from_slice(&[200]);
        assert!(matches!(
            RtpPacket::parse(&wire),
            Err(PacketError::Truncated)
        ));
    }

    #[test]
    fn test_too_short() {
        assert!(matches!(
            RtpPacket::parse(&[0x80; 11]),
            Err(PacketError::PacketTooShort)
        ));
    }

    #[test]
    fn test_wrong_version_parses_but_invalid() {
        let mut wire = vec![0x40, 0];
        wire.resize(12, 0);
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert!(!parsed.is_valid());
        assert_eq!(parsed.version, 1);
    }

    #[test]
    fn test_payload_type_names() {
        assert_eq!(PayloadType::from_number(0).to_string(), "PCMU");
        assert_eq!(PayloadType::from_number(8).to_string(), "PCMA");
        assert_eq!(PayloadType::from_number(9).to_string(), "G722");
        assert_eq!(PayloadType::from_number(18).to_string(), "G729");
        assert_eq!(PayloadType::from_number(111).to_string(), "OPUS");
        assert_eq!(
            PayloadType::from_number(101).to_string(),
            "telephone-event"
        );
        assert_eq!(PayloadType::from_number(77).to_string(), "Unknown(77)");
    }
}
