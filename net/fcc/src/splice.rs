// Copyright (C) 2025 streamrelay developers
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Burst-to-multicast splice filter.
//!
//! During channel change two packet sources run concurrently: the unicast
//! burst and the joined multicast group. The filter enforces the splice
//! contract: once the server has announced the first multicast sequence,
//! every sequence below it may only come from the burst and every sequence
//! at or above it only from multicast, so no packet is delivered twice
//! across the splice point.

use streamrelay_rtp::seq_less;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulticastVerdict {
    /// Deliver; the splice point was already crossed (or there is none).
    Deliver,
    /// Duplicate of a burst-delivered sequence; drop.
    Drop,
    /// This is the announced first multicast sequence: deliver it and tear
    /// the burst down.
    Handover,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SpliceFilter {
    first_mcast_seq: Option<u16>,
    handed_over: bool,
    /// Fallback mode: no burst, multicast passes unconditionally.
    open: bool,
}

impl SpliceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the first multicast sequence from the sync notification.
    pub fn set_splice_point(&mut self, first_mcast_seq: u16) {
        if !self.handed_over {
            self.first_mcast_seq = Some(first_mcast_seq);
        }
    }

    /// Stop filtering entirely (burst abandoned, live multicast only).
    pub fn open(&mut self) {
        self.open = true;
        self.first_mcast_seq = None;
    }

    pub fn handed_over(&self) -> bool {
        self.handed_over
    }

    /// Should a burst packet with this sequence reach the client?
    pub fn accept_burst(&self, seq: u16) -> bool {
        if self.open || self.handed_over {
            return false;
        }
        match self.first_mcast_seq {
            // Splice point known: only the range below it belongs to the burst.
            Some(first) => seq_less(seq, first),
            None => true,
        }
    }

    /// Should a multicast packet with this sequence reach the client?
    pub fn accept_multicast(&mut self, seq: u16) -> MulticastVerdict {
        if self.open || self.handed_over {
            return MulticastVerdict::Deliver;
        }
        match self.first_mcast_seq {
            Some(first) if seq_less(seq, first) => MulticastVerdict::Drop,
            Some(_) => {
                self.handed_over = true;
                MulticastVerdict::Handover
            }
            // No sync yet: multicast ahead of the burst is held back by
            // dropping; the burst is the only legitimate source until the
            // server announces the splice point.
            None => MulticastVerdict::Drop,
        }
    }
}
