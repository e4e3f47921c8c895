// streamrelay Fast Channel Change
//
// Copyright (C) 2025 streamrelay developers
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Carrier fast-channel-change (FCC) support.
//!
//! FCC servers deliver a unicast burst starting at a keyframe so a joining
//! client can decode immediately instead of waiting for the next GOP on the
//! multicast stream. Two deployed protocol dialects share the RTCP Generic
//! Feedback framing (payload type 205) with vendor FCI layouts:
//! the Telecom/ZTE/FiberHome dialect and the Huawei dialect, the latter with
//! an additional NAT-punching keepalive datagram.
//!
//! [`wire`] is the bit-exact codec, [`session`] the sans-I/O state machine
//! the relay drives from its sockets and timers, [`splice`] the filter that
//! makes the burst-to-multicast handover seamless.

pub mod session;
pub mod splice;
pub mod wire;

pub use session::{Action, FallbackReason, FccConfig, FccSession, FccState, SessionParams};
pub use splice::SpliceFilter;
pub use wire::{FccMessage, FccVariant, WireError};
