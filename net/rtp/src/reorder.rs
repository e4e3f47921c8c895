// Copyright (C) 2025 streamrelay developers
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Sequence-number reorder buffer.
//!
//! UDP delivers IPTV multicast with a small amount of reordering (ECMP,
//! bonding, FEC recovery re-injection). The buffer holds out-of-order packets
//! for at most a configured time budget and emits them in ascending sequence
//! order. It never blocks: emission happens on arrival of the next expected
//! sequence, on window overflow, or on deadline expiry driven by the caller.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::seq_distance;

/// Default time budget an out-of-order packet may spend in the window.
pub const DEFAULT_HOLD: Duration = Duration::from_millis(150);

/// Anything that carries an RTP sequence number. Implemented by the relay's
/// pooled packet handle; tests use plain tuples.
pub trait Sequenced {
    fn sequence(&self) -> u16;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReorderStats {
    /// Packets handed to the consumer, in order.
    pub emitted: u64,
    /// Arrivals below the window (already emitted or expired).
    pub late: u64,
    /// Arrivals for a sequence already held. First one wins.
    pub duplicates: u64,
    /// Sequences skipped over without ever arriving.
    pub gaps: u64,
    /// Packets emitted because their time budget ran out.
    pub timeouts: u64,
    /// Full window resets after a large sequence jump.
    pub resets: u64,
    /// Peak number of packets held at once.
    pub held_peak: usize,
}

pub struct ReorderBuffer<P> {
    // slots[i] holds the packet with sequence next + i
    slots: VecDeque<Option<(P, Instant)>>,
    next: Option<u16>,
    capacity: usize,
    hold: Duration,
    held: usize,
    stats: ReorderStats,
}

impl<P: Sequenced> ReorderBuffer<P> {
    /// `capacity` is the maximum number of sequence positions the window
    /// spans; `hold` is the time budget before a gap is given up on.
    pub fn new(capacity: usize, hold: Duration) -> Self {
        assert!(capacity >= 1 && capacity < 0x4000);
        Self {
            slots: VecDeque::new(),
            next: None,
            capacity,
            hold,
            held: 0,
            stats: ReorderStats::default(),
        }
    }

    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    pub fn held(&self) -> usize {
        self.held
    }

    /// Offer a packet. In-order emissions are appended to `out`.
    pub fn push(&mut self, pkt: P, now: Instant, out: &mut Vec<P>) {
        let seq = pkt.sequence();

        let Some(mut next) = self.next else {
            self.next = Some(seq.wrapping_add(1));
            self.stats.emitted += 1;
            out.push(pkt);
            return;
        };

        // A full window must give up its oldest packet before accepting more.
        while self.held >= self.capacity {
            self.emit_oldest(out);
            next = self.next.unwrap();
        }

        let mut delta = seq_distance(next, seq);
        if delta >= 0x8000 {
            self.stats.late += 1;
            return;
        }

        if delta as usize >= 2 * self.capacity {
            // The stream jumped (source restart, channel splice). Flush what
            // we have and restart the window at the new position.
            self.drain_all(out);
            self.stats.resets += 1;
            self.next = Some(seq.wrapping_add(1));
            self.stats.emitted += 1;
            out.push(pkt);
            return;
        }

        // Above the window: advance until the packet fits, emitting or
        // giving up on whatever falls off the front.
        while delta as usize >= self.capacity {
            self.emit_front_slot(out);
            delta -= 1;
        }

        let idx = delta as usize;
        if self.slots.len() <= idx {
            self.slots.resize_with(idx + 1, || None);
        }
        if self.slots[idx].is_some() {
            self.stats.duplicates += 1;
            return;
        }
        self.slots[idx] = Some((pkt, now));
        self.held += 1;
        self.stats.held_peak = self.stats.held_peak.max(self.held);

        self.drain_in_order(out);
    }

    /// The next instant at which [`ReorderBuffer::on_deadline`] should run,
    /// if anything is being held.
    pub fn poll_deadline(&self) -> Option<Instant> {
        self.slots
            .iter()
            .flatten()
            .map(|(_, arrived)| *arrived + self.hold)
            .min()
    }

    /// Give up on gaps older than the hold budget: emit the oldest held
    /// packet (and everything now contiguous behind it) and advance.
    pub fn on_deadline(&mut self, now: Instant, out: &mut Vec<P>) {
        while let Some(deadline) = self.poll_deadline() {
            if deadline > now {
                break;
            }
            self.stats.timeouts += 1;
            self.emit_oldest(out);
        }
    }

    /// Emit everything still held, in order. The window keeps its position.
    pub fn drain_all(&mut self, out: &mut Vec<P>) {
        while self.held > 0 {
            self.emit_oldest(out);
        }
        self.slots.clear();
    }

    // Pop one leading slot: a packet is emitted, an empty slot is a gap.
    fn emit_front_slot(&mut self, out: &mut Vec<P>) {
        match self.slots.pop_front() {
            Some(Some((pkt, _))) => {
                self.held -= 1;
                self.stats.emitted += 1;
                out.push(pkt);
            }
            Some(None) | None => self.stats.gaps += 1,
        }
        self.next = Some(self.next.unwrap().wrapping_add(1));
    }

    // Skip leading gaps, then emit the contiguous run that follows.
    fn emit_oldest(&mut self, out: &mut Vec<P>) {
        while matches!(self.slots.front(), Some(None)) {
            self.slots.pop_front();
            self.stats.gaps += 1;
            self.next = Some(self.next.unwrap().wrapping_add(1));
        }
        if matches!(self.slots.front(), Some(Some(_))) {
            self.drain_in_order(out);
            // drain_in_order stops at the first gap; if nothing was
            // contiguous we still made progress skipping gaps above.
        } else {
            // Window was all gaps; nothing held any more.
            self.slots.clear();
        }
    }

    fn drain_in_order(&mut self, out: &mut Vec<P>) {
        while matches!(self.slots.front(), Some(Some(_))) {
            let (pkt, _) = self.slots.pop_front().unwrap().unwrap();
            self.held -= 1;
            self.stats.emitted += 1;
            self.next = Some(self.next.unwrap().wrapping_add(1));
            out.push(pkt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    struct Pkt(u16);

    impl Sequenced for Pkt {
        fn sequence(&self) -> u16 {
            self.0
        }
    }

    fn drive(buf: &mut ReorderBuffer<Pkt>, seqs: &[u16]) -> Vec<u16> {
        let now = Instant::now();
        let mut out = Vec::new();
        for &s in seqs {
            buf.push(Pkt(s), now, &mut out);
        }
        out.iter().map(|p| p.0).collect()
    }

    #[test]
    fn in_order_passthrough() {
        let mut buf = ReorderBuffer::new(64, DEFAULT_HOLD);
        assert_eq!(drive(&mut buf, &[0, 1, 2, 3, 4]), vec![0, 1, 2, 3, 4]);
        assert_eq!(buf.held(), 0);
    }

    #[test]
    fn simple_swap_recovered() {
        let mut buf = ReorderBuffer::new(64, DEFAULT_HOLD);
        assert_eq!(drive(&mut buf, &[0, 1, 3, 2, 4]), vec![0, 1, 2, 3, 4]);
        assert_eq!(buf.stats().gaps, 0);
    }

    #[test]
    fn wrap_around_recovered() {
        let mut buf = ReorderBuffer::new(64, DEFAULT_HOLD);
        assert_eq!(
            drive(&mut buf, &[65534, 0, 65535, 1]),
            vec![65534, 65535, 0, 1]
        );
    }

    #[test]
    fn late_packet_dropped() {
        let mut buf = ReorderBuffer::new(64, DEFAULT_HOLD);
        assert_eq!(drive(&mut buf, &[10, 11, 12, 10]), vec![10, 11, 12]);
        assert_eq!(buf.stats().late, 1);
    }

    #[test]
    fn duplicate_in_window_keeps_first() {
        let mut buf = ReorderBuffer::new(64, DEFAULT_HOLD);
        // 13 is held; its duplicate must not displace it
        assert_eq!(drive(&mut buf, &[10, 13, 13, 11, 12]), vec![10, 11, 12, 13]);
        assert_eq!(buf.stats().duplicates, 1);
    }

    #[test]
    fn deadline_gives_up_on_gap() {
        let mut buf = ReorderBuffer::new(64, Duration::from_millis(150));
        let t0 = Instant::now();
        let mut out = Vec::new();
        buf.push(Pkt(0), t0, &mut out);
        buf.push(Pkt(2), t0, &mut out);
        buf.push(Pkt(3), t0, &mut out);
        assert_eq!(out.iter().map(|p| p.0).collect::<Vec<_>>(), vec![0]);

        buf.on_deadline(t0 + Duration::from_millis(100), &mut out);
        assert_eq!(out.len(), 1, "budget not yet exhausted");

        buf.on_deadline(t0 + Duration::from_millis(151), &mut out);
        assert_eq!(out.iter().map(|p| p.0).collect::<Vec<_>>(), vec![0, 2, 3]);
        assert_eq!(buf.stats().gaps, 1);
        assert_eq!(buf.stats().timeouts, 1);

        // 1 is now below the window
        buf.push(Pkt(1), t0, &mut out);
        assert_eq!(out.len(), 3);
        assert_eq!(buf.stats().late, 1);
    }

    #[test]
    fn full_window_emits_oldest() {
        let mut buf = ReorderBuffer::new(4, DEFAULT_HOLD);
        // 0 emitted; 2..=5 would hold 4 packets, but capacity forces the
        // oldest run out when the window is exhausted.
        let out = drive(&mut buf, &[0, 2, 3, 4, 5, 6]);
        assert!(out.starts_with(&[0, 2, 3, 4, 5]), "got {out:?}");
        assert_eq!(buf.stats().gaps, 1);
    }

    #[test]
    fn large_jump_resets_window() {
        let mut buf = ReorderBuffer::new(16, DEFAULT_HOLD);
        let out = drive(&mut buf, &[100, 101, 4000, 4001]);
        assert_eq!(out, vec![100, 101, 4000, 4001]);
        assert_eq!(buf.stats().resets, 1);
    }

    #[test]
    fn emission_order_is_nondecreasing() {
        use rand::seq::SliceRandom;
        let mut rng = rand::rng();
        let mut buf = ReorderBuffer::new(128, DEFAULT_HOLD);
        let mut seqs: Vec<u16> = (0..96).collect();
        // shuffle within a window-sized group so nothing lands below window
        seqs[0..32].shuffle(&mut rng);
        seqs[32..64].shuffle(&mut rng);
        seqs[64..96].shuffle(&mut rng);
        let out = drive(&mut buf, &seqs);
        let mut sorted = out.clone();
        sorted.sort_unstable();
        assert_eq!(out, sorted);
    }
}
