// streamrelay RTSP client
//
// Copyright (C) 2025 streamrelay developers
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0
//
// https://www.rfc-editor.org/rfc/rfc2326.html

//! Minimal RTSP 1.0 client for unicast IPTV and timeshift (catchup) sources.
//!
//! The client drives DESCRIBE -> SETUP -> PLAY against a single media
//! session, preferring UDP transport with an adjacent port pair and falling
//! back to TCP interleaved framing when that is all the server offers.
//! Timeshift range parameters are translated by [`timeshift`] before the
//! DESCRIBE URL is built; [`stun`] can discover the public address to
//! advertise when the operator sits behind a NAT.

pub mod client;
pub mod framing;
pub mod stun;
pub mod timeshift;

pub use client::{RtspClient, RtspConfig, RtspSessionState, RtspTransport};
pub use framing::{Frame, FramingError, MessageDecoder};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RtspError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("server answered {status}: {reason}")]
    Status { status: u16, reason: String },

    #[error("RTSP protocol error: {0}")]
    Protocol(String),

    #[error("SDP parsing failed: {0}")]
    Sdp(#[from] sdp_types::ParserError),

    #[error("no usable transport offered by the server")]
    TransportNegotiation,
}
