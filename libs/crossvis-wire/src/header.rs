// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Fixed-size handshake header.
//!
//! Layout (little-endian, 32 bytes):
//!
//! ```text
//! 0   magic        u32   "XVHS"
//! 4   version      u16
//! 6   reserved     u16
//! 8   tag          u32
//! 12  sender_pid   u32
//! 16  payload_len  u32   0..=8
//! 20  reserved     u32
//! 24  payload      u64
//! ```

use crate::WireError;

pub const MAGIC: u32 = u32::from_le_bytes(*b"XVHS");
pub const WIRE_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 32;
pub const MAX_PAYLOAD_LEN: u32 = 8;

/// Worker -> host: "my channel is bound, send the reference".
pub const TAG_READY: u32 = 0x1;
/// Host -> worker: payload is the resource id, one fd rides along.
pub const TAG_RESOURCE_REFERENCE: u32 = 0x123987;
/// Worker -> host: content is bound as the shared resource's root.
pub const TAG_BOUND: u32 = 0x3;

/// One handshake datagram, minus any ancillary fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeHeader {
    pub tag: u32,
    pub sender_pid: u32,
    pub payload_len: u32,
    pub payload: u64,
}

impl HandshakeHeader {
    /// Header with no payload, stamped with the calling process's pid.
    pub fn new(tag: u32) -> Self {
        Self {
            tag,
            sender_pid: std::process::id(),
            payload_len: 0,
            payload: 0,
        }
    }

    /// Header carrying a native-width value, stamped with the calling process's pid.
    pub fn with_payload(tag: u32, payload: u64) -> Self {
        Self {
            tag,
            sender_pid: std::process::id(),
            payload_len: MAX_PAYLOAD_LEN,
            payload,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&WIRE_VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&self.tag.to_le_bytes());
        buf[12..16].copy_from_slice(&self.sender_pid.to_le_bytes());
        buf[16..20].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[24..32].copy_from_slice(&self.payload.to_le_bytes());
        buf
    }

    /// Decode a received datagram. Unknown tags are accepted; filtering by
    /// tag is the receiver's business.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::Truncated(buf.len(), HEADER_LEN));
        }

        let magic = read_u32(buf, 0);
        if magic != MAGIC {
            return Err(WireError::BadMagic(magic));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }

        let payload_len = read_u32(buf, 16);
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(WireError::PayloadTooLarge(payload_len));
        }

        let mut payload = [0u8; 8];
        payload.copy_from_slice(&buf[24..32]);

        Ok(Self {
            tag: read_u32(buf, 8),
            sender_pid: read_u32(buf, 12),
            payload_len,
            payload: u64::from_le_bytes(payload),
        })
    }

    pub fn has_payload(&self) -> bool {
        self.payload_len > 0
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_header_survives_encoding() {
        let header = HandshakeHeader::with_payload(TAG_RESOURCE_REFERENCE, 0xDEAD_BEEF_0042);
        let decoded = HandshakeHeader::decode(&header.encode()).unwrap();

        assert_eq!(decoded, header);
        assert_eq!(decoded.sender_pid, std::process::id());
        assert!(decoded.has_payload());
    }

    #[test]
    fn ready_header_has_no_payload() {
        let decoded = HandshakeHeader::decode(&HandshakeHeader::new(TAG_READY).encode()).unwrap();
        assert_eq!(decoded.tag, TAG_READY);
        assert!(!decoded.has_payload());
    }

    #[test]
    fn short_datagram_is_rejected() {
        let bytes = HandshakeHeader::new(TAG_READY).encode();
        assert!(matches!(
            HandshakeHeader::decode(&bytes[..HEADER_LEN - 1]),
            Err(WireError::Truncated(31, HEADER_LEN))
        ));
    }

    #[test]
    fn foreign_datagram_is_rejected() {
        let mut bytes = HandshakeHeader::new(TAG_READY).encode();
        bytes[0] = b'Z';
        assert!(matches!(
            HandshakeHeader::decode(&bytes),
            Err(WireError::BadMagic(_))
        ));
    }

    #[test]
    fn future_version_is_rejected() {
        let mut bytes = HandshakeHeader::new(TAG_READY).encode();
        bytes[4..6].copy_from_slice(&2u16.to_le_bytes());
        assert!(matches!(
            HandshakeHeader::decode(&bytes),
            Err(WireError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn oversized_payload_len_is_rejected() {
        let mut bytes = HandshakeHeader::new(TAG_READY).encode();
        bytes[16..20].copy_from_slice(&9u32.to_le_bytes());
        assert!(matches!(
            HandshakeHeader::decode(&bytes),
            Err(WireError::PayloadTooLarge(9))
        ));
    }

    #[test]
    fn unknown_tag_still_decodes() {
        let decoded = HandshakeHeader::decode(&HandshakeHeader::new(0xABCD).encode()).unwrap();
        assert_eq!(decoded.tag, 0xABCD);
    }
}
