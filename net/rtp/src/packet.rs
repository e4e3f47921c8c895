// Copyright (C) 2025 streamrelay developers
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Thin view over an RTP datagram.
//!
//! The relay never copies media bytes out of the receive buffer; parsing
//! yields offsets into the original datagram so the payload can be queued
//! by reference.

use rtp_types::RtpPacket;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RtpError {
    #[error("invalid RTP packet: {0}")]
    Malformed(#[from] rtp_types::RtpParseError),

    #[error("unexpected payload type {got} (want {want})")]
    PayloadType { got: u8, want: u8 },
}

/// Parsed RTP header summary. Offsets index into the datagram the header was
/// parsed from; the datagram itself is not retained here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload_offset: usize,
    pub payload_len: usize,
    pub has_extension: bool,
}

impl RtpHeader {
    /// Parse the fixed header, CSRC list, extension and padding of `buf`.
    ///
    /// The payload range excludes all of those, so
    /// `&buf[h.payload_offset..h.payload_offset + h.payload_len]` is the raw
    /// MPEG-TS payload.
    pub fn parse(buf: &[u8]) -> Result<RtpHeader, RtpError> {
        let pkt = RtpPacket::parse(buf)?;
        let payload = pkt.payload();
        let pad = pkt.padding().unwrap_or(0) as usize;
        let payload_offset = buf.len() - pad - payload.len();

        Ok(RtpHeader {
            payload_type: pkt.payload_type(),
            marker: pkt.marker_bit(),
            sequence: pkt.sequence_number(),
            timestamp: pkt.timestamp(),
            ssrc: pkt.ssrc(),
            payload_offset,
            payload_len: payload.len(),
            has_extension: pkt.extension().is_some(),
        })
    }

    /// Like [`RtpHeader::parse`] but additionally enforces the payload type
    /// the service was configured with.
    pub fn parse_expecting(buf: &[u8], payload_type: u8) -> Result<RtpHeader, RtpError> {
        let header = Self::parse(buf)?;
        if header.payload_type != payload_type {
            return Err(RtpError::PayloadType {
                got: header.payload_type,
                want: payload_type,
            });
        }
        Ok(header)
    }
}

/// Header extension bytes of `buf`, if any: `(profile, data)`.
pub fn extension(buf: &[u8]) -> Option<(u16, Vec<u8>)> {
    let pkt = RtpPacket::parse(buf).ok()?;
    pkt.extension().map(|(profile, data)| (profile, data.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtp_types::RtpPacketBuilder;

    fn build(seq: u16, pt: u8, payload: &[u8]) -> Vec<u8> {
        RtpPacketBuilder::new()
            .payload_type(pt)
            .sequence_number(seq)
            .timestamp(90_000)
            .ssrc(0xdecafbad)
            .payload(payload)
            .write_vec()
            .unwrap()
    }

    #[test]
    fn parses_fixed_header() {
        let payload = [0x47u8; 188];
        let buf = build(1234, 33, &payload);
        let h = RtpHeader::parse(&buf).unwrap();
        assert_eq!(h.sequence, 1234);
        assert_eq!(h.payload_type, 33);
        assert_eq!(h.timestamp, 90_000);
        assert_eq!(h.ssrc, 0xdecafbad);
        assert_eq!(h.payload_len, 188);
        assert_eq!(&buf[h.payload_offset..h.payload_offset + h.payload_len], &payload[..]);
    }

    #[test]
    fn rejects_short_and_wrong_version() {
        assert!(RtpHeader::parse(&[0x80, 33]).is_err());
        // version bits = 1
        let mut buf = build(1, 33, &[0u8; 4]);
        buf[0] = (buf[0] & 0x3f) | 0x40;
        assert!(RtpHeader::parse(&buf).is_err());
    }

    #[test]
    fn payload_type_mismatch() {
        let buf = build(7, 96, &[0u8; 8]);
        assert!(matches!(
            RtpHeader::parse_expecting(&buf, 33),
            Err(RtpError::PayloadType { got: 96, want: 33 })
        ));
        assert!(RtpHeader::parse_expecting(&buf, 96).is_ok());
    }

    #[test]
    fn extension_roundtrip() {
        let ext = [0x12u8, 0x34, 0x56, 0x78];
        let buf = RtpPacketBuilder::new()
            .payload_type(33)
            .sequence_number(9)
            .ssrc(1)
            .extension(0xbede, &ext[..])
            .payload(&[0u8; 16][..])
            .write_vec()
            .unwrap();
        let h = RtpHeader::parse(&buf).unwrap();
        assert!(h.has_extension);
        let (profile, data) = extension(&buf).unwrap();
        assert_eq!(profile, 0xbede);
        assert_eq!(&data[..4], &ext[..]);
    }
}
