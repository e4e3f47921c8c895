// Copyright (C) 2025 streamrelay developers
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Incremental decoder for the RTSP control connection.
//!
//! A TCP segment may carry a fraction of a response, several responses, or a
//! mix of responses and `$<channel><u16 length>` interleaved binary frames
//! when the negotiated transport is TCP. Bytes are accumulated here until a
//! complete message can be cut.

use bytes::{Buf, Bytes, BytesMut};
use rtsp_types::Message;
use thiserror::Error;

const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("undecodable RTSP message")]
    Malformed,

    #[error("peer sent a message larger than {MAX_MESSAGE_SIZE} bytes")]
    Oversized,
}

/// A complete unit received from the control connection.
#[derive(Debug)]
pub enum Frame {
    /// A full RTSP message (request or response).
    Message(Message<Vec<u8>>),
    /// One interleaved binary frame: RTP or RTCP, by channel number.
    Data { channel: u8, payload: Bytes },
}

#[derive(Debug, Default)]
pub struct MessageDecoder {
    buf: BytesMut,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Cut the next complete frame off the front of the buffer, if any.
    pub fn next(&mut self) -> Result<Option<Frame>, FramingError> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let parsed: Result<(Message<Vec<u8>>, usize), _> = Message::parse(&self.buf[..]);
        match parsed {
            Ok((message, consumed)) => {
                let frame = match message {
                    Message::Data(data) => {
                        let channel = data.channel_id();
                        let payload = Bytes::from(data.into_body());
                        Frame::Data { channel, payload }
                    }
                    other => Frame::Message(other),
                };
                self.buf.advance(consumed);
                Ok(Some(frame))
            }
            Err(rtsp_types::ParseError::Incomplete(_)) => {
                if self.buf.len() > MAX_MESSAGE_SIZE {
                    return Err(FramingError::Oversized);
                }
                Ok(None)
            }
            Err(rtsp_types::ParseError::Error) => Err(FramingError::Malformed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &[u8] = b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Length: 0\r\n\r\n";

    #[test]
    fn whole_response() {
        let mut dec = MessageDecoder::new();
        dec.extend(RESPONSE);
        match dec.next().unwrap() {
            Some(Frame::Message(Message::Response(rsp))) => {
                assert_eq!(rsp.status(), rtsp_types::StatusCode::Ok);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(dec.next().unwrap().is_none());
    }

    #[test]
    fn response_split_across_segments() {
        let mut dec = MessageDecoder::new();
        let (a, b) = RESPONSE.split_at(17);
        dec.extend(a);
        assert!(dec.next().unwrap().is_none());
        dec.extend(b);
        assert!(matches!(
            dec.next().unwrap(),
            Some(Frame::Message(Message::Response(_)))
        ));
    }

    #[test]
    fn interleaved_data_frame() {
        let mut dec = MessageDecoder::new();
        let payload = [0x80u8, 33, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1, 0x47];
        let mut wire = vec![b'$', 0];
        wire.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        wire.extend_from_slice(&payload);
        dec.extend(&wire);
        match dec.next().unwrap() {
            Some(Frame::Data { channel, payload: p }) => {
                assert_eq!(channel, 0);
                assert_eq!(&p[..], &payload[..]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn data_then_response_in_one_segment() {
        let mut dec = MessageDecoder::new();
        let mut wire = vec![b'$', 2, 0, 3, 1, 2, 3];
        wire.extend_from_slice(RESPONSE);
        dec.extend(&wire);
        assert!(matches!(
            dec.next().unwrap(),
            Some(Frame::Data { channel: 2, .. })
        ));
        assert!(matches!(
            dec.next().unwrap(),
            Some(Frame::Message(Message::Response(_)))
        ));
        assert!(dec.next().unwrap().is_none());
    }

    #[test]
    fn data_frame_split_in_middle() {
        let mut dec = MessageDecoder::new();
        dec.extend(&[b'$', 0, 0, 4, 0xaa]);
        assert!(dec.next().unwrap().is_none());
        dec.extend(&[0xbb, 0xcc, 0xdd]);
        match dec.next().unwrap() {
            Some(Frame::Data { payload, .. }) => {
                assert_eq!(&payload[..], &[0xaa, 0xbb, 0xcc, 0xdd])
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
