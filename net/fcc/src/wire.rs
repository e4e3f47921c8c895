// Copyright (C) 2025 streamrelay developers
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! RTCP Generic Feedback codec for the two FCC dialects.
//!
//! Every signalling message is `V=2 | P | FMT` + PT 205 + length + sender
//! SSRC + the media source expressed as an IPv4 multicast address, followed
//! by a vendor FCI. FMT values overlap between dialects: an FMT 5 packet is
//! a Telecom termination at 16 bytes total and a Huawei client request at
//! 32 bytes total. Anything else with FMT 5 is undecodable and dropped.

use std::net::Ipv4Addr;

use thiserror::Error;

/// RTCP payload type for transport-layer feedback.
pub const RTCP_PT_FB: u8 = 205;

/// Magic leading the 8-byte Huawei NAT keepalive datagram.
pub const NAT_KEEPALIVE_MAGIC: u16 = 0x0003;

const FB_HEADER_LEN: usize = 12;

const FMT_TELECOM_REQUEST: u8 = 2;
const FMT_TELECOM_RESPONSE: u8 = 3;
const FMT_TELECOM_SYNC: u8 = 4;
const FMT_TELECOM_TERMINATION: u8 = 5;
const FMT_HUAWEI_REQUEST: u8 = 5;
const FMT_HUAWEI_RESPONSE: u8 = 6;
const FMT_HUAWEI_SYNC: u8 = 8;
const FMT_HUAWEI_TERMINATION: u8 = 9;

const TELECOM_TERMINATION_LEN: usize = 16;
const HUAWEI_REQUEST_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram of {0} bytes is too short for an RTCP feedback message")]
    Truncated(usize),

    #[error("unsupported RTCP version {0}")]
    Version(u8),

    #[error("not a feedback packet (payload type {0})")]
    PayloadType(u8),

    #[error("length field covers {expected} bytes but datagram has {got}")]
    Length { expected: usize, got: usize },

    #[error("FMT {fmt} with total length {len} matches no known dialect")]
    UnknownFormat { fmt: u8, len: usize },
}

/// Which FCC dialect a service speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FccVariant {
    Telecom,
    Huawei,
}

/// Server instruction in a Telecom FMT 3 response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelecomAction {
    /// No burst; join the multicast group immediately.
    JoinImmediately,
    /// Burst follows on the media port.
    StartUnicast,
    /// Re-request against `server_ip:signal_port`.
    Redirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelecomResponse {
    pub result: u8,
    pub action: TelecomAction,
    pub signal_port: u16,
    pub media_port: u16,
    pub valid_time: u16,
    pub server_ip: Ipv4Addr,
    /// Advisory burst rate; never used for flow control.
    pub burst_kbps: u16,
    pub post_sync_kbps: u16,
}

/// Server instruction in a Huawei FMT 6 response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HuaweiMode {
    NoUnicast,
    Unicast,
    Redirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HuaweiResponse {
    pub result: u8,
    pub mode: HuaweiMode,
    /// Server saw the request arrive from behind a NAT; keepalives required.
    pub nat: bool,
    pub server_port: u16,
    pub session_id: u16,
    pub server_ip: Ipv4Addr,
}

/// Any server-to-client FCC signalling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FccMessage {
    TelecomResponse(TelecomResponse),
    TelecomSync { first_mcast_seq: u16 },
    TelecomTermination { stop: bool, first_mcast_seq: u16 },
    HuaweiResponse(HuaweiResponse),
    HuaweiSync { first_mcast_seq: u16 },
    HuaweiTermination { first_mcast_seq: u16 },
}

/// `true` if this datagram looks like RTCP feedback rather than RTP media.
/// Both arrive on the same unicast socket; the payload-type octet tells them
/// apart (RTCP types sit in 200..=210 where RTP would have its marker bit).
pub fn is_feedback(datagram: &[u8]) -> bool {
    datagram.len() >= 2 && datagram[1] == RTCP_PT_FB
}

fn header(fmt: u8, fci_len: usize, sender_ssrc: u32, media_source: Ipv4Addr) -> Vec<u8> {
    debug_assert!(fci_len % 4 == 0);
    let words = ((FB_HEADER_LEN + fci_len) / 4 - 1) as u16;
    let mut out = Vec::with_capacity(FB_HEADER_LEN + fci_len);
    out.push(0x80 | (fmt & 0x1f));
    out.push(RTCP_PT_FB);
    out.extend_from_slice(&words.to_be_bytes());
    out.extend_from_slice(&sender_ssrc.to_be_bytes());
    out.extend_from_slice(&media_source.octets());
    out
}

/// Telecom FMT 2 client request.
pub fn telecom_request(
    sender_ssrc: u32,
    mcast_ip: Ipv4Addr,
    mcast_port: u16,
    client_port: u16,
    stb_id: &[u8; 16],
) -> Vec<u8> {
    let mut out = header(FMT_TELECOM_REQUEST, 28, sender_ssrc, mcast_ip);
    out.push(1); // protocol version
    out.push(0);
    out.extend_from_slice(&client_port.to_be_bytes());
    out.extend_from_slice(&mcast_port.to_be_bytes());
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&mcast_ip.octets());
    out.extend_from_slice(stb_id);
    out
}

/// Telecom FMT 5 termination. `stop` asks the server to cease the burst;
/// `first_mcast_seq` reports where multicast took over.
pub fn telecom_termination(
    sender_ssrc: u32,
    mcast_ip: Ipv4Addr,
    stop: bool,
    first_mcast_seq: u16,
) -> Vec<u8> {
    let mut out = header(FMT_TELECOM_TERMINATION, 4, sender_ssrc, mcast_ip);
    out.push(if stop { 0x80 } else { 0 });
    out.push(0);
    out.extend_from_slice(&first_mcast_seq.to_be_bytes());
    out
}

/// Huawei FMT 5 client request (32 bytes total; the length is what keeps it
/// apart from a Telecom termination).
pub fn huawei_request(
    sender_ssrc: u32,
    mcast_ip: Ipv4Addr,
    local_ip: Ipv4Addr,
    client_port: u16,
    redirect_supported: bool,
) -> Vec<u8> {
    let mut out = header(FMT_HUAWEI_REQUEST, 20, sender_ssrc, mcast_ip);
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(&local_ip.octets());
    out.extend_from_slice(&client_port.to_be_bytes());
    out.extend_from_slice(&[0, 0]);
    out.push(u8::from(redirect_supported));
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&[0, 0, 0, 0]);
    debug_assert_eq!(out.len(), HUAWEI_REQUEST_LEN);
    out
}

/// Huawei FMT 9 termination.
pub fn huawei_termination(sender_ssrc: u32, mcast_ip: Ipv4Addr, first_mcast_seq: u16) -> Vec<u8> {
    let mut out = header(FMT_HUAWEI_TERMINATION, 4, sender_ssrc, mcast_ip);
    out.push(0x80);
    out.push(0);
    out.extend_from_slice(&first_mcast_seq.to_be_bytes());
    out
}

/// Huawei NAT keepalive: not RTCP, just an 8-byte punch.
pub fn nat_keepalive(session_id: u16) -> [u8; 8] {
    let magic = NAT_KEEPALIVE_MAGIC.to_be_bytes();
    let session = session_id.to_be_bytes();
    [magic[0], magic[1], session[0], session[1], 0, 0, 0, 0]
}

/// Parse a server-to-client signalling datagram.
pub fn parse(datagram: &[u8]) -> Result<FccMessage, WireError> {
    if datagram.len() < FB_HEADER_LEN {
        return Err(WireError::Truncated(datagram.len()));
    }
    let version = datagram[0] >> 6;
    if version != 2 {
        return Err(WireError::Version(version));
    }
    if datagram[1] != RTCP_PT_FB {
        return Err(WireError::PayloadType(datagram[1]));
    }
    let fmt = datagram[0] & 0x1f;
    let words = u16::from_be_bytes([datagram[2], datagram[3]]) as usize;
    let expected = (words + 1) * 4;
    if expected > datagram.len() {
        return Err(WireError::Length {
            expected,
            got: datagram.len(),
        });
    }
    let fci = &datagram[FB_HEADER_LEN..expected];

    match (fmt, expected) {
        (FMT_TELECOM_RESPONSE, _) if fci.len() >= 16 => {
            let action = match fci[1] {
                0 => TelecomAction::JoinImmediately,
                1 => TelecomAction::StartUnicast,
                2 => TelecomAction::Redirect,
                _ => {
                    return Err(WireError::UnknownFormat {
                        fmt,
                        len: expected,
                    })
                }
            };
            Ok(FccMessage::TelecomResponse(TelecomResponse {
                result: fci[0],
                action,
                signal_port: u16::from_be_bytes([fci[2], fci[3]]),
                media_port: u16::from_be_bytes([fci[4], fci[5]]),
                valid_time: u16::from_be_bytes([fci[6], fci[7]]),
                server_ip: Ipv4Addr::new(fci[8], fci[9], fci[10], fci[11]),
                burst_kbps: u16::from_be_bytes([fci[12], fci[13]]),
                post_sync_kbps: u16::from_be_bytes([fci[14], fci[15]]),
            }))
        }
        (FMT_TELECOM_SYNC, _) if fci.len() >= 4 => Ok(FccMessage::TelecomSync {
            first_mcast_seq: u16::from_be_bytes([fci[0], fci[1]]),
        }),
        (FMT_TELECOM_TERMINATION, TELECOM_TERMINATION_LEN) => {
            Ok(FccMessage::TelecomTermination {
                stop: fci[0] & 0x80 != 0,
                first_mcast_seq: u16::from_be_bytes([fci[2], fci[3]]),
            })
        }
        (FMT_HUAWEI_REQUEST, HUAWEI_REQUEST_LEN) => {
            // A request is client-to-server; a server never sends one. Seeing
            // it here means a reflected datagram, not a protocol error worth
            // surfacing.
            Err(WireError::UnknownFormat { fmt, len: expected })
        }
        (FMT_HUAWEI_RESPONSE, _) if fci.len() >= 12 => {
            let mode = match fci[1] {
                0 => HuaweiMode::NoUnicast,
                1 => HuaweiMode::Unicast,
                2 => HuaweiMode::Redirect,
                _ => {
                    return Err(WireError::UnknownFormat {
                        fmt,
                        len: expected,
                    })
                }
            };
            Ok(FccMessage::HuaweiResponse(HuaweiResponse {
                result: fci[0],
                mode,
                nat: fci[2] != 0,
                server_port: u16::from_be_bytes([fci[4], fci[5]]),
                session_id: u16::from_be_bytes([fci[6], fci[7]]),
                server_ip: Ipv4Addr::new(fci[8], fci[9], fci[10], fci[11]),
            }))
        }
        (FMT_HUAWEI_SYNC, _) if fci.len() >= 4 => Ok(FccMessage::HuaweiSync {
            first_mcast_seq: u16::from_be_bytes([fci[0], fci[1]]),
        }),
        (FMT_HUAWEI_TERMINATION, _) if fci.len() >= 4 => Ok(FccMessage::HuaweiTermination {
            first_mcast_seq: u16::from_be_bytes([fci[2], fci[3]]),
        }),
        _ => Err(WireError::UnknownFormat { fmt, len: expected }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MCAST: Ipv4Addr = Ipv4Addr::new(239, 1, 1, 1);

    #[test]
    fn telecom_request_layout() {
        let stb = [0x42u8; 16];
        let buf = telecom_request(0x1234_5678, MCAST, 5000, 40000, &stb);
        assert_eq!(buf.len(), 40);
        assert_eq!(buf[0], 0x80 | 2);
        assert_eq!(buf[1], RTCP_PT_FB);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 9); // (40 / 4) - 1
        assert_eq!(&buf[4..8], &0x1234_5678u32.to_be_bytes());
        assert_eq!(&buf[8..12], &MCAST.octets());
        assert_eq!(u16::from_be_bytes([buf[14], buf[15]]), 40000);
        assert_eq!(u16::from_be_bytes([buf[16], buf[17]]), 5000);
        assert_eq!(&buf[24..40], &stb);
    }

    #[test]
    fn telecom_response_roundtrip() {
        let mut buf = header(FMT_TELECOM_RESPONSE, 16, 7, MCAST);
        buf.extend_from_slice(&[
            0, 1, // result ok, start unicast
            0x3e, 0x62, // signal port 15970
            0x3e, 0x63, // media port 15971
            0, 30, // valid time
            10, 0, 0, 1, // server
            0x07, 0xd0, // 2000 kbps
            0x03, 0xe8, // 1000 kbps
        ]);
        match parse(&buf).unwrap() {
            FccMessage::TelecomResponse(r) => {
                assert_eq!(r.action, TelecomAction::StartUnicast);
                assert_eq!(r.signal_port, 15970);
                assert_eq!(r.media_port, 15971);
                assert_eq!(r.server_ip, Ipv4Addr::new(10, 0, 0, 1));
                assert_eq!(r.burst_kbps, 2000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fmt5_disambiguated_by_length() {
        let term = telecom_termination(1, MCAST, true, 777);
        assert_eq!(term.len(), 16);
        assert_eq!(
            parse(&term).unwrap(),
            FccMessage::TelecomTermination {
                stop: true,
                first_mcast_seq: 777
            }
        );

        // The 32-byte FMT 5 is a Huawei request; a server must not send it,
        // so the parser refuses it rather than misreading a termination.
        let req = huawei_request(1, MCAST, Ipv4Addr::new(192, 168, 1, 2), 4242, true);
        assert_eq!(req.len(), 32);
        assert!(matches!(
            parse(&req),
            Err(WireError::UnknownFormat { fmt: 5, len: 32 })
        ));

        // Any other FMT 5 length is undecodable.
        let mut odd = header(5, 8, 1, MCAST);
        odd.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            parse(&odd),
            Err(WireError::UnknownFormat { fmt: 5, len: 20 })
        ));
    }

    #[test]
    fn huawei_response_roundtrip() {
        let mut buf = header(FMT_HUAWEI_RESPONSE, 12, 9, MCAST);
        buf.extend_from_slice(&[
            0, 1, 1, 0, // ok, unicast, nat
            0x30, 0x39, // port 12345
            0xab, 0xcd, // session id
            100, 64, 0, 9, // server ip
        ]);
        match parse(&buf).unwrap() {
            FccMessage::HuaweiResponse(r) => {
                assert_eq!(r.mode, HuaweiMode::Unicast);
                assert!(r.nat);
                assert_eq!(r.server_port, 12345);
                assert_eq!(r.session_id, 0xabcd);
                assert_eq!(r.server_ip, Ipv4Addr::new(100, 64, 0, 9));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn sync_messages() {
        let mut a = header(FMT_TELECOM_SYNC, 4, 1, MCAST);
        a.extend_from_slice(&[0xff, 0xfe, 0, 0]);
        assert_eq!(
            parse(&a).unwrap(),
            FccMessage::TelecomSync {
                first_mcast_seq: 0xfffe
            }
        );

        let mut h = header(FMT_HUAWEI_SYNC, 4, 1, MCAST);
        h.extend_from_slice(&[0x00, 0x64, 0, 0]);
        assert_eq!(
            parse(&h).unwrap(),
            FccMessage::HuaweiSync {
                first_mcast_seq: 100
            }
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse(&[0x80]), Err(WireError::Truncated(1))));
        let rtp = [0x80u8, 33, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        assert!(matches!(parse(&rtp), Err(WireError::PayloadType(33))));
        assert!(!is_feedback(&rtp));
        assert!(is_feedback(&telecom_termination(1, MCAST, false, 0)));
    }

    #[test]
    fn keepalive_layout() {
        let ka = nat_keepalive(0xbeef);
        assert_eq!(ka, [0x00, 0x03, 0xbe, 0xef, 0, 0, 0, 0]);
    }
}
