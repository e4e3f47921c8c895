// Copyright (C) 2025 streamrelay developers
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Reed-Solomon block FEC recovery.
//!
//! The carrier sends RS(k, k+m) protected channels: every media packet
//! carries a one-byte-header RTP extension element describing its block id
//! and shard index, and a companion UDP port carries `m` parity packets per
//! block whose payloads are the parity shards. Once at least `k` shards of a
//! block are present, the missing media datagrams are reconstructed and
//! re-enter the reorder pipeline with their original sequence numbers.
//!
//! Shards within a block are equalized to the parity shard size; a data shard
//! is the whole RTP datagram prefixed with its 16-bit length and
//! zero-padded.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use reed_solomon_erasure::galois_8::ReedSolomon;
use thiserror::Error;
use tracing::{debug, trace};

use crate::packet::{self, RtpHeader};

/// One-byte-header extension profile (RFC 8285).
pub const EXT_PROFILE: u16 = 0xbede;
/// Extension element id carrying FEC shard metadata.
pub const EXT_ID_FEC: u8 = 1;

const META_LEN: usize = 5;

#[derive(Debug, Error)]
pub enum FecError {
    #[error("shard geometry k={k} m={m} is not decodable")]
    Geometry { k: u8, m: u8 },

    #[error("data shard of {len} bytes does not fit shard size {shard_size}")]
    Oversize { len: usize, shard_size: usize },

    #[error("reconstruction failed: {0}")]
    Reconstruct(#[from] reed_solomon_erasure::Error),
}

/// Shard metadata carried in the RTP header extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecMeta {
    pub block: u16,
    /// 0..k for data shards, k..k+m for parity shards.
    pub index: u8,
    pub k: u8,
    pub m: u8,
}

impl FecMeta {
    /// Extract shard metadata from a datagram's header extension, if present
    /// and well-formed.
    pub fn from_datagram(buf: &[u8]) -> Option<FecMeta> {
        let (profile, data) = packet::extension(buf)?;
        if profile != EXT_PROFILE {
            return None;
        }
        Self::from_extension(&data)
    }

    /// Scan RFC 8285 one-byte-header elements for the FEC element.
    pub fn from_extension(mut data: &[u8]) -> Option<FecMeta> {
        while let Some((&head, rest)) = data.split_first() {
            if head == 0 {
                data = rest;
                continue;
            }
            let id = head >> 4;
            let len = (head & 0x0f) as usize + 1;
            if rest.len() < len {
                return None;
            }
            if id == EXT_ID_FEC && len == META_LEN {
                let meta = FecMeta {
                    block: u16::from_be_bytes([rest[0], rest[1]]),
                    index: rest[2],
                    k: rest[3],
                    m: rest[4],
                };
                return (meta.k > 0 && meta.m > 0 && meta.index < meta.k + meta.m)
                    .then_some(meta);
            }
            data = &rest[len..];
        }
        None
    }

    /// Serialize as a one-byte-header extension element block, padded to a
    /// 32-bit boundary. Used by the test harness and kept next to the parser
    /// so the two cannot drift apart.
    pub fn to_extension(self) -> Vec<u8> {
        let mut out = vec![(EXT_ID_FEC << 4) | (META_LEN as u8 - 1)];
        out.extend_from_slice(&self.block.to_be_bytes());
        out.extend_from_slice(&[self.index, self.k, self.m]);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }
}

/// A media packet rebuilt from parity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered {
    pub sequence: u16,
    pub datagram: Vec<u8>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FecStats {
    pub recovered: u64,
    pub failed: u64,
    pub evicted: u64,
    pub complete: u64,
}

struct Block {
    k: u8,
    m: u8,
    base_seq: Option<u16>,
    data: Vec<Option<Vec<u8>>>,
    parity: Vec<Option<Vec<u8>>>,
    have: usize,
    done: bool,
    created: Instant,
}

impl Block {
    fn new(meta: FecMeta, now: Instant) -> Self {
        Self {
            k: meta.k,
            m: meta.m,
            base_seq: None,
            data: vec![None; meta.k as usize],
            parity: vec![None; meta.m as usize],
            have: 0,
            done: false,
            created: now,
        }
    }
}

pub struct FecDecoder {
    blocks: HashMap<u16, Block>,
    order: VecDeque<u16>,
    max_blocks: usize,
    max_age: Duration,
    codecs: HashMap<(u8, u8), ReedSolomon>,
    stats: FecStats,
}

impl FecDecoder {
    pub fn new(max_blocks: usize, max_age: Duration) -> Self {
        Self {
            blocks: HashMap::new(),
            order: VecDeque::new(),
            max_blocks: max_blocks.max(1),
            max_age,
            codecs: HashMap::new(),
            stats: FecStats::default(),
        }
    }

    pub fn stats(&self) -> FecStats {
        self.stats
    }

    /// Account a media datagram as a data shard. Returns any packets the
    /// added shard allowed to be reconstructed.
    pub fn push_media(
        &mut self,
        datagram: &[u8],
        header: &RtpHeader,
        now: Instant,
    ) -> Vec<Recovered> {
        let Some(meta) = FecMeta::from_datagram(datagram) else {
            return Vec::new();
        };
        if meta.index >= meta.k {
            trace!(block = meta.block, index = meta.index, "parity-indexed shard on media port");
            return Vec::new();
        }
        self.push_shard(meta, Some(header.sequence), datagram.to_vec(), now)
    }

    /// Account a packet from the companion FEC port as a parity shard.
    pub fn push_parity(&mut self, datagram: &[u8], now: Instant) -> Vec<Recovered> {
        let Ok(header) = RtpHeader::parse(datagram) else {
            return Vec::new();
        };
        let Some(meta) = FecMeta::from_datagram(datagram) else {
            return Vec::new();
        };
        if meta.index < meta.k {
            trace!(block = meta.block, index = meta.index, "data-indexed shard on parity port");
            return Vec::new();
        }
        let payload =
            datagram[header.payload_offset..header.payload_offset + header.payload_len].to_vec();
        self.push_shard(meta, None, payload, now)
    }

    fn push_shard(
        &mut self,
        meta: FecMeta,
        media_seq: Option<u16>,
        bytes: Vec<u8>,
        now: Instant,
    ) -> Vec<Recovered> {
        self.prune(now);

        let geometry_changed = self
            .blocks
            .get(&meta.block)
            .is_some_and(|b| b.k != meta.k || b.m != meta.m);
        if geometry_changed {
            debug!(block = meta.block, "shard geometry changed mid-block, restarting block");
            self.blocks.insert(meta.block, Block::new(meta, now));
        } else if !self.blocks.contains_key(&meta.block) {
            if self.blocks.len() >= self.max_blocks {
                if let Some(oldest) = self.order.pop_front() {
                    self.blocks.remove(&oldest);
                    self.stats.evicted += 1;
                }
            }
            self.order.push_back(meta.block);
            self.blocks.insert(meta.block, Block::new(meta, now));
        }
        let block = self.blocks.get_mut(&meta.block).expect("just inserted");

        if block.done {
            return Vec::new();
        }

        if let Some(seq) = media_seq {
            let base = seq.wrapping_sub(meta.index as u16);
            match block.base_seq {
                None => block.base_seq = Some(base),
                Some(b) if b != base => {
                    debug!(block = meta.block, "inconsistent base sequence, ignoring shard");
                    return Vec::new();
                }
                Some(_) => {}
            }
            let slot = &mut block.data[meta.index as usize];
            if slot.is_none() {
                *slot = Some(bytes);
                block.have += 1;
            }
        } else {
            let slot = &mut block.parity[(meta.index - meta.k) as usize];
            if slot.is_none() {
                *slot = Some(bytes);
                block.have += 1;
            }
        }

        if block.have < block.k as usize {
            return Vec::new();
        }
        if block.data.iter().all(Option::is_some) {
            block.done = true;
            self.stats.complete += 1;
            return Vec::new();
        }
        // Cannot place recovered datagrams without knowing their sequences.
        if block.base_seq.is_none() {
            return Vec::new();
        }

        let id = meta.block;
        match self.reconstruct(id) {
            Ok(recovered) => {
                self.stats.recovered += recovered.len() as u64;
                recovered
            }
            Err(err) => {
                debug!(block = id, %err, "FEC reconstruction failed");
                self.stats.failed += 1;
                if let Some(b) = self.blocks.get_mut(&id) {
                    b.done = true;
                }
                Vec::new()
            }
        }
    }

    fn reconstruct(&mut self, id: u16) -> Result<Vec<Recovered>, FecError> {
        let block = self.blocks.get_mut(&id).expect("block exists");
        let (k, m) = (block.k as usize, block.m as usize);

        let shard_size = block
            .parity
            .iter()
            .flatten()
            .map(Vec::len)
            .next()
            .expect("at least one parity shard present");

        let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(k + m);
        for data in &block.data {
            match data {
                Some(datagram) => {
                    if datagram.len() + 2 > shard_size {
                        return Err(FecError::Oversize {
                            len: datagram.len(),
                            shard_size,
                        });
                    }
                    let mut shard = Vec::with_capacity(shard_size);
                    shard.extend_from_slice(&(datagram.len() as u16).to_be_bytes());
                    shard.extend_from_slice(datagram);
                    shard.resize(shard_size, 0);
                    shards.push(Some(shard));
                }
                None => shards.push(None),
            }
        }
        for parity in &block.parity {
            match parity {
                Some(p) if p.len() == shard_size => shards.push(Some(p.clone())),
                _ => shards.push(None),
            }
        }

        let codec = match self.codecs.entry((block.k, block.m)) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => e.insert(
                ReedSolomon::new(k, m).map_err(|_| FecError::Geometry {
                    k: block.k,
                    m: block.m,
                })?,
            ),
        };
        codec.reconstruct_data(&mut shards)?;

        let base = block.base_seq.expect("checked by caller");
        let mut recovered = Vec::new();
        for (i, slot) in block.data.iter_mut().enumerate() {
            if slot.is_some() {
                continue;
            }
            let shard = shards[i].as_ref().expect("filled by reconstruct_data");
            let len = u16::from_be_bytes([shard[0], shard[1]]) as usize;
            if len + 2 > shard.len() {
                return Err(FecError::Oversize {
                    len,
                    shard_size: shard.len(),
                });
            }
            let datagram = shard[2..2 + len].to_vec();
            *slot = Some(datagram.clone());
            recovered.push(Recovered {
                sequence: base.wrapping_add(i as u16),
                datagram,
            });
        }
        block.done = true;
        Ok(recovered)
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.order.front() {
            let expired = self
                .blocks
                .get(&oldest)
                .is_none_or(|b| now.duration_since(b.created) > self.max_age);
            if !expired {
                break;
            }
            self.order.pop_front();
            if self.blocks.remove(&oldest).is_some() {
                self.stats.evicted += 1;
            }
        }
    }
}
