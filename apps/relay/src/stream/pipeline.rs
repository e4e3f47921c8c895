//! RTP ingress pipeline shared by the multicast, FCC and RTSP drivers:
//! parse, FEC accounting, reorder, payload strip.
//!
//! Packets ride in pooled buffers end to end; only FEC-recovered datagrams
//! are materialized (they are synthesized from parity, there is nothing to
//! reference).

use std::time::Instant;

use bytes::Bytes;
use streamrelay_rtp::fec::FecDecoder;
use streamrelay_rtp::reorder::ReorderBuffer;
use streamrelay_rtp::{RtpError, RtpHeader, Sequenced};
use tracing::{debug, trace};

use crate::buffer::{BufferPool, BufferRef};
use crate::config::{FecConfig, ReorderConfig};
use crate::sendq::ChunkData;

/// Where a packet's bytes live.
#[derive(Debug, Clone)]
enum PacketBytes {
    Pooled(BufferRef),
    Recovered(Bytes),
}

/// One parsed RTP packet travelling through the reorder window.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    bytes: PacketBytes,
    payload_offset: u32,
    payload_len: u32,
    sequence: u16,
}

impl RtpPacket {
    /// The send-queue chunk for this packet's MPEG-TS payload.
    pub fn chunk(&self) -> (ChunkData, usize, usize) {
        let data = match &self.bytes {
            PacketBytes::Pooled(buffer) => ChunkData::Pooled(buffer.clone()),
            PacketBytes::Recovered(bytes) => ChunkData::Shared(bytes.clone()),
        };
        (data, self.payload_offset as usize, self.payload_len as usize)
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len as usize
    }
}

impl Sequenced for RtpPacket {
    fn sequence(&self) -> u16 {
        self.sequence
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineStats {
    pub packets: u64,
    pub malformed: u64,
    pub wrong_payload_type: u64,
    pub recovered: u64,
}

pub struct RtpPipeline {
    reorder: ReorderBuffer<RtpPacket>,
    fec: Option<FecDecoder>,
    payload_type: Option<u8>,
    stats: PipelineStats,
}

impl RtpPipeline {
    pub fn new(reorder: &ReorderConfig, fec: Option<&FecConfig>, payload_type: Option<u8>) -> Self {
        Self {
            reorder: ReorderBuffer::new(reorder.window, reorder.hold()),
            fec: fec.map(|cfg| FecDecoder::new(cfg.max_blocks, cfg.max_block_age())),
            payload_type,
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Parse one received datagram (and whatever FEC recovery it unlocks)
    /// into `parsed` without reordering yet; the caller decides delivery
    /// per packet (the FCC splice filter sits exactly there).
    pub fn parse(&mut self, buffer: BufferRef, now: Instant, parsed: &mut Vec<RtpPacket>) {
        let header = match self.parse_header(buffer.bytes()) {
            Some(header) => header,
            None => return,
        };

        let recovered = match &mut self.fec {
            Some(fec) => fec.push_media(buffer.bytes(), &header, now),
            None => Vec::new(),
        };
        // Recovery can only hand back packets we never saw; run them through
        // the same checks.
        for packet in recovered {
            if let Some(rheader) = self.parse_header(&packet.datagram) {
                self.stats.recovered += 1;
                parsed.push(RtpPacket {
                    bytes: PacketBytes::Recovered(Bytes::from(packet.datagram)),
                    payload_offset: rheader.payload_offset as u32,
                    payload_len: rheader.payload_len as u32,
                    sequence: rheader.sequence,
                });
            }
        }

        self.stats.packets += 1;
        parsed.push(RtpPacket {
            bytes: PacketBytes::Pooled(buffer),
            payload_offset: header.payload_offset as u32,
            payload_len: header.payload_len as u32,
            sequence: header.sequence,
        });
    }

    fn parse_header(&mut self, datagram: &[u8]) -> Option<RtpHeader> {
        match self.payload_type {
            Some(expected) => match RtpHeader::parse_expecting(datagram, expected) {
                Ok(header) => Some(header),
                Err(RtpError::PayloadType { got, .. }) => {
                    self.stats.wrong_payload_type += 1;
                    trace!(got, "dropping RTP packet with unexpected payload type");
                    None
                }
                Err(err) => {
                    self.stats.malformed += 1;
                    debug!(%err, "dropping invalid RTP packet");
                    None
                }
            },
            None => match RtpHeader::parse(datagram) {
                Ok(header) => Some(header),
                Err(err) => {
                    self.stats.malformed += 1;
                    debug!(%err, "dropping invalid RTP packet");
                    None
                }
            },
        }
    }

    /// Feed a datagram from the companion FEC port.
    pub fn parse_parity(&mut self, datagram: &[u8], now: Instant, parsed: &mut Vec<RtpPacket>) {
        let recovered = match &mut self.fec {
            Some(fec) => fec.push_parity(datagram, now),
            None => return,
        };
        for packet in recovered {
            if let Some(header) = self.parse_header(&packet.datagram) {
                self.stats.recovered += 1;
                parsed.push(RtpPacket {
                    bytes: PacketBytes::Recovered(Bytes::from(packet.datagram)),
                    payload_offset: header.payload_offset as u32,
                    payload_len: header.payload_len as u32,
                    sequence: header.sequence,
                });
            }
        }
    }

    /// Insert a packet into the reorder window; in-order emissions land in
    /// `out`.
    pub fn push(&mut self, packet: RtpPacket, now: Instant, out: &mut Vec<RtpPacket>) {
        self.reorder.push(packet, now, out);
    }

    pub fn poll_deadline(&self) -> Option<Instant> {
        self.reorder.poll_deadline()
    }

    pub fn on_deadline(&mut self, now: Instant, out: &mut Vec<RtpPacket>) {
        self.reorder.on_deadline(now, out);
    }

    pub fn flush(&mut self, out: &mut Vec<RtpPacket>) {
        self.reorder.drain_all(out);
    }
}

/// Receive one datagram into a pooled buffer. Pool exhaustion sheds the
/// datagram instead of blocking: it is read into a scratch buffer and
/// dropped so the socket does not stay read-ready forever.
pub async fn recv_pooled(
    socket: &tokio::net::UdpSocket,
    pool: &BufferPool,
) -> std::io::Result<Option<(BufferRef, std::net::SocketAddr)>> {
    match pool.acquire() {
        Some(mut buffer) => {
            let (len, from) = socket.recv_from(buffer.space()).await?;
            buffer.set_len(len);
            Ok(Some((buffer.freeze(), from)))
        }
        None => {
            let mut scratch = [0u8; crate::buffer::BUFFER_SIZE];
            let _ = socket.recv_from(&mut scratch).await?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtp_types::RtpPacketBuilder;

    fn pool() -> BufferPool {
        BufferPool::new(64, 64)
    }

    fn datagram(seq: u16, pt: u8) -> Vec<u8> {
        let payload = [0x47u8; 188];
        let packet = RtpPacketBuilder::new()
            .payload_type(pt)
            .sequence_number(seq)
            .ssrc(7)
            .payload(&payload[..])
            .write_vec()
            .unwrap();
        packet
    }

    fn pooled(pool: &BufferPool, bytes: &[u8]) -> BufferRef {
        BufferRef::from_slice(pool, bytes).unwrap()
    }

    #[test]
    fn parse_push_emits_payload_in_order() {
        let pool = pool();
        let mut pipeline = RtpPipeline::new(&ReorderConfig::default(), None, Some(33));
        let now = Instant::now();

        let mut emitted = Vec::new();
        for seq in [0u16, 1, 3, 2, 4] {
            let mut parsed = Vec::new();
            pipeline.parse(pooled(&pool, &datagram(seq, 33)), now, &mut parsed);
            assert_eq!(parsed.len(), 1);
            for pkt in parsed {
                pipeline.push(pkt, now, &mut emitted);
            }
        }
        let seqs: Vec<u16> = emitted.iter().map(|p| p.sequence()).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        for pkt in &emitted {
            assert_eq!(pkt.payload_len(), 188);
            let (data, offset, len) = pkt.chunk();
            let slice = match &data {
                ChunkData::Pooled(b) => &b.bytes()[offset..offset + len],
                ChunkData::Shared(b) => &b[offset..offset + len],
            };
            assert!(slice.iter().all(|&b| b == 0x47));
        }
    }

    #[test]
    fn wrong_payload_type_counted_and_dropped() {
        let pool = pool();
        let mut pipeline = RtpPipeline::new(&ReorderConfig::default(), None, Some(33));
        let mut parsed = Vec::new();
        pipeline.parse(pooled(&pool, &datagram(0, 96)), Instant::now(), &mut parsed);
        assert!(parsed.is_empty());
        assert_eq!(pipeline.stats().wrong_payload_type, 1);
    }

    #[test]
    fn malformed_dropped() {
        let pool = pool();
        let mut pipeline = RtpPipeline::new(&ReorderConfig::default(), None, None);
        let mut parsed = Vec::new();
        pipeline.parse(pooled(&pool, &[0x80, 33, 0]), Instant::now(), &mut parsed);
        assert!(parsed.is_empty());
        assert_eq!(pipeline.stats().malformed, 1);
    }

    #[test]
    fn pooled_buffer_returns_after_emission_consumed() {
        let pool = pool();
        let mut pipeline = RtpPipeline::new(&ReorderConfig::default(), None, None);
        let now = Instant::now();
        let mut emitted = Vec::new();
        let mut parsed = Vec::new();
        pipeline.parse(pooled(&pool, &datagram(9, 33)), now, &mut parsed);
        for pkt in parsed {
            pipeline.push(pkt, now, &mut emitted);
        }
        assert_eq!(pool.stats().used, 1);
        emitted.clear();
        assert_eq!(pool.stats().used, 0, "last reference released");
    }
}
