//! Per-client send queue and socket sink.
//!
//! Upstream tasks enqueue `(buffer, offset, len)` chunks; the sink drains
//! them with bounded vectored writes whenever the client socket is
//! writable. A client that cannot keep up is first capped, then flagged
//! slow and capped harder, so one stalled set-top box cannot pin the whole
//! worker's buffer pool. Nothing here ever blocks the event loop: every
//! syscall is a readiness-guarded `try_*`.
//!
//! With `MSG_ZEROCOPY` enabled the kernel transmits straight from the
//! pooled slots; chunk references are parked in an in-flight table until
//! the completion notification surfaces on the socket error queue.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::time::Instant;

use bytes::Bytes;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::buffer::BufferRef;
use crate::config::{DropPolicy, QueueConfig};
use crate::error::RelayError;

/// Bytes a chunk can reference: a pooled slot or an ordinary shared blob
/// (HTTP response heads, proxied bodies).
#[derive(Debug, Clone)]
pub enum ChunkData {
    Pooled(BufferRef),
    Shared(Bytes),
}

impl ChunkData {
    fn as_slice(&self) -> &[u8] {
        match self {
            ChunkData::Pooled(buffer) => buffer.bytes(),
            ChunkData::Shared(bytes) => bytes.as_ref(),
        }
    }
}

#[derive(Debug)]
struct Chunk {
    data: ChunkData,
    offset: u32,
    len: u32,
}

impl Chunk {
    fn pending(&self) -> &[u8] {
        let offset = self.offset as usize;
        &self.data.as_slice()[offset..offset + self.len as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// The packet (or older queue content) was discarded; `bytes` counts
    /// what this call added to the drop counter.
    Dropped { bytes: usize },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SendCounters {
    pub sends: u64,
    pub batches: u64,
    pub bytes_sent: u64,
    pub completions: u64,
    pub copied: u64,
    pub eagain: u64,
    pub enobufs: u64,
}

/// Ordered outbound chunks for one client.
#[derive(Debug)]
pub struct SendQueue {
    chunks: VecDeque<Chunk>,
    queued_bytes: usize,
    config: QueueConfig,
    highwater: usize,
    dropped_bytes: u64,
    slow: bool,
    slow_since: Option<Instant>,
}

impl SendQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            chunks: VecDeque::new(),
            queued_bytes: 0,
            config,
            highwater: 0,
            dropped_bytes: 0,
            slow: false,
            slow_since: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn highwater(&self) -> usize {
        self.highwater
    }

    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    pub fn is_slow(&self) -> bool {
        self.slow
    }

    fn limit(&self) -> usize {
        if self.slow {
            self.config.slow_limit_bytes
        } else {
            self.config.limit_bytes
        }
    }

    pub fn enqueue(
        &mut self,
        data: ChunkData,
        offset: usize,
        len: usize,
        now: Instant,
    ) -> Enqueue {
        debug_assert!(offset + len <= data.as_slice().len());
        if len == 0 {
            return Enqueue::Queued;
        }

        let limit = self.limit();
        let mut dropped = 0usize;
        if self.queued_bytes + len > limit {
            match self.config.drop_policy {
                DropPolicy::Newest => {
                    self.dropped_bytes += len as u64;
                    self.tick(now);
                    return Enqueue::Dropped { bytes: len };
                }
                DropPolicy::Oldest => {
                    while self.queued_bytes + len > limit {
                        let Some(oldest) = self.chunks.pop_front() else {
                            break;
                        };
                        self.queued_bytes -= oldest.len as usize;
                        dropped += oldest.len as usize;
                    }
                    self.dropped_bytes += dropped as u64;
                    if self.queued_bytes + len > limit {
                        // One packet bigger than the whole cap.
                        self.dropped_bytes += len as u64;
                        return Enqueue::Dropped { bytes: dropped + len };
                    }
                }
            }
        }

        self.chunks.push_back(Chunk {
            data,
            offset: offset as u32,
            len: len as u32,
        });
        self.queued_bytes += len;
        self.highwater = self.highwater.max(self.queued_bytes);
        self.tick(now);
        if dropped > 0 {
            Enqueue::Dropped { bytes: dropped }
        } else {
            Enqueue::Queued
        }
    }

    /// Update the slow-client clock. The flag is sticky: a box that fell
    /// behind once keeps its reduced cap for the connection's lifetime.
    pub fn tick(&mut self, now: Instant) {
        if self.slow {
            return;
        }
        if self.queued_bytes >= self.config.slow_threshold_bytes {
            match self.slow_since {
                None => self.slow_since = Some(now),
                Some(since) if now.duration_since(since) >= self.config.slow_duration() => {
                    self.slow = true;
                    debug!(queued = self.queued_bytes, "client flagged slow");
                }
                Some(_) => {}
            }
        } else {
            self.slow_since = None;
        }
    }

    /// Gather up to `max_batch` chunks for one vectored write.
    fn iovecs(&self) -> (Vec<IoSlice<'_>>, usize) {
        let max = self.config.max_batch.max(1);
        let mut slices = Vec::with_capacity(max.min(self.chunks.len()));
        let mut total = 0usize;
        for chunk in self.chunks.iter().take(max) {
            let pending = chunk.pending();
            total += pending.len();
            slices.push(IoSlice::new(pending));
        }
        (slices, total)
    }

    /// Drop `written` bytes off the queue front. With `retain` the data
    /// handles of every touched chunk are returned so the zero-copy path
    /// can park them until the kernel confirms transmission.
    fn consume(&mut self, mut written: usize, retain: bool) -> Vec<ChunkData> {
        let mut retained = Vec::new();
        self.queued_bytes -= written.min(self.queued_bytes);
        while written > 0 {
            let front = self.chunks.front_mut().expect("consumed more than queued");
            let pending = front.len as usize;
            if written >= pending {
                written -= pending;
                let chunk = self.chunks.pop_front().expect("front exists");
                if retain {
                    retained.push(chunk.data);
                }
            } else {
                front.offset += written as u32;
                front.len -= written as u32;
                if retain {
                    retained.push(front.data.clone());
                }
                written = 0;
            }
        }
        retained
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    Progress,
    Disconnected,
}

/// The client socket plus its queue: the egress half of a connection.
pub struct ClientSink {
    stream: TcpStream,
    queue: SendQueue,
    zerocopy: Option<zc::ZeroCopy>,
    counters: SendCounters,
}

impl ClientSink {
    pub fn new(stream: TcpStream, config: QueueConfig, want_zerocopy: bool) -> Self {
        let zerocopy = if want_zerocopy {
            match zc::ZeroCopy::enable(&stream) {
                Ok(state) => Some(state),
                Err(err) => {
                    warn!(%err, "zero-copy unavailable, using copied sends");
                    None
                }
            }
        } else {
            None
        };
        Self {
            stream,
            queue: SendQueue::new(config),
            zerocopy,
            counters: SendCounters::default(),
        }
    }

    pub fn queue(&self) -> &SendQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut SendQueue {
        &mut self.queue
    }

    pub fn counters(&self) -> SendCounters {
        self.counters
    }

    pub fn enqueue(&mut self, data: ChunkData, offset: usize, len: usize, now: Instant) -> Enqueue {
        self.queue.enqueue(data, offset, len, now)
    }

    /// One readiness round: watches the client for disconnect, harvests
    /// zero-copy completions, and flushes whatever fits. Pends forever when
    /// there is nothing to do, which is exactly what a `select!` wants.
    pub async fn pump(&mut self) -> Result<Pump, RelayError> {
        let mut interest = Interest::READABLE;
        if !self.queue.is_empty() {
            interest = interest.add(Interest::WRITABLE);
        }
        if self.zerocopy.as_ref().is_some_and(|z| z.in_flight() > 0) {
            interest = interest.add(Interest::ERROR);
        }

        let ready = self.stream.ready(interest).await?;

        if ready.is_error() || ready.is_read_closed() || ready.is_write_closed() {
            if let Some(zerocopy) = &mut self.zerocopy {
                zerocopy.harvest(&self.stream, &mut self.counters)?;
            }
            if ready.is_read_closed() || ready.is_write_closed() {
                return Ok(Pump::Disconnected);
            }
        }

        // Error readiness without a pending completion means a real socket
        // error; the read probe below surfaces it instead of spinning.
        if ready.is_readable() || ready.is_error() {
            let mut scratch = [0u8; 1024];
            loop {
                match self.stream.try_read(&mut scratch) {
                    Ok(0) => return Ok(Pump::Disconnected),
                    // Streaming clients have nothing useful to say; drain
                    // and ignore so the socket does not stay read-ready.
                    Ok(_) => continue,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => return Err(classify(err)),
                }
            }
        }

        if ready.is_writable() && !self.queue.is_empty() {
            self.try_flush().map_err(classify)?;
        }

        Ok(Pump::Progress)
    }

    /// Write as much as the socket accepts right now.
    pub fn try_flush(&mut self) -> io::Result<()> {
        loop {
            if self.queue.is_empty() {
                return Ok(());
            }

            let use_zerocopy = self.zerocopy.as_ref().is_some_and(|z| z.active());
            let written = {
                let (slices, _total) = self.queue.iovecs();
                if slices.is_empty() {
                    return Ok(());
                }
                if use_zerocopy {
                    let zerocopy = self.zerocopy.as_ref().expect("checked");
                    zerocopy.send(&self.stream, &slices)
                } else {
                    self.stream.try_write_vectored(&slices)
                }
            };

            match written {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.counters.sends += 1;
                    self.counters.batches += 1;
                    self.counters.bytes_sent += n as u64;
                    let retained = self.queue.consume(n, use_zerocopy);
                    if use_zerocopy {
                        self.zerocopy
                            .as_mut()
                            .expect("checked")
                            .sent(retained);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.counters.eagain += 1;
                    return Ok(());
                }
                Err(err) if err.raw_os_error() == Some(libc::ENOBUFS) => {
                    // Kernel is out of locked pages for this send. Revert to
                    // copied sends; buffers already in flight stay parked
                    // until their completions drain off the error queue.
                    self.counters.enobufs += 1;
                    if let Some(zerocopy) = self.zerocopy.as_mut() {
                        if zerocopy.active() {
                            warn!("ENOBUFS from zero-copy send, reverting to copied sends");
                            zerocopy.deactivate();
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Graceful-shutdown drain: flush until empty, disconnect or deadline.
    pub async fn drain(&mut self, deadline: Instant) -> Result<(), RelayError> {
        while !self.queue.is_empty() {
            let timeout = tokio::time::sleep_until(deadline.into());
            tokio::select! {
                pump = self.pump() => match pump? {
                    Pump::Disconnected => return Err(RelayError::ClientGone),
                    Pump::Progress => {}
                },
                _ = timeout => return Ok(()),
            }
        }
        Ok(())
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

fn classify(err: io::Error) -> RelayError {
    let relay = RelayError::Io(err);
    if relay.is_client_gone() {
        RelayError::ClientGone
    } else {
        relay
    }
}

/// Linux `MSG_ZEROCOPY` plumbing: raw sendmsg and error-queue harvesting.
/// Kept behind readiness guards (`try_io`) so tokio's view of the socket
/// stays coherent.
mod zc {
    use super::*;
    use std::os::fd::{AsRawFd, RawFd};

    const SO_EE_CODE_ZEROCOPY_COPIED: u8 = 1;
    const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;

    pub(super) struct ZeroCopy {
        /// Kernel numbers MSG_ZEROCOPY sends per socket, starting at 0.
        next_seq: u32,
        inflight: VecDeque<(u32, Vec<ChunkData>)>,
        active: bool,
    }

    impl ZeroCopy {
        #[cfg(test)]
        pub fn new_for_tests() -> ZeroCopy {
            ZeroCopy {
                next_seq: 0,
                inflight: VecDeque::new(),
                active: true,
            }
        }

        pub fn active(&self) -> bool {
            self.active
        }

        pub fn deactivate(&mut self) {
            self.active = false;
        }

        pub fn enable(stream: &TcpStream) -> io::Result<ZeroCopy> {
            let fd = stream.as_raw_fd();
            let one: libc::c_int = 1;
            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_ZEROCOPY,
                    (&one as *const libc::c_int).cast(),
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(ZeroCopy {
                next_seq: 0,
                inflight: VecDeque::new(),
                active: true,
            })
        }

        pub fn in_flight(&self) -> usize {
            self.inflight.len()
        }

        pub fn send(&self, stream: &TcpStream, slices: &[IoSlice<'_>]) -> io::Result<usize> {
            let fd = stream.as_raw_fd();
            stream.try_io(Interest::WRITABLE, || {
                let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
                // IoSlice is guaranteed ABI-compatible with iovec.
                msg.msg_iov = slices.as_ptr() as *mut libc::iovec;
                msg.msg_iovlen = slices.len() as _;
                let n = unsafe {
                    libc::sendmsg(fd, &msg, libc::MSG_ZEROCOPY | libc::MSG_DONTWAIT)
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            })
        }

        /// Record one completed sendmsg call's retained buffers.
        pub fn sent(&mut self, retained: Vec<ChunkData>) {
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            self.inflight.push_back((seq, retained));
        }

        /// Read completion ranges off the error queue and release buffers.
        pub fn harvest(
            &mut self,
            stream: &TcpStream,
            counters: &mut SendCounters,
        ) -> io::Result<()> {
            let fd = stream.as_raw_fd();
            loop {
                match read_completion(fd) {
                    Ok(Some((lo, hi, was_copied))) => {
                        let released = self.complete(lo, hi);
                        counters.completions += released;
                        if was_copied {
                            counters.copied += released;
                        }
                    }
                    Ok(None) => continue,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(err) => return Err(err),
                }
            }
        }

        /// Release every in-flight entry with a sequence in `lo..=hi`
        /// (wrapping). Returns how many sendmsg calls completed.
        pub fn complete(&mut self, lo: u32, hi: u32) -> u64 {
            let span = hi.wrapping_sub(lo);
            let mut released = 0u64;
            self.inflight.retain(|(seq, _)| {
                let inside = seq.wrapping_sub(lo) <= span;
                if inside {
                    released += 1;
                }
                !inside
            });
            released
        }

    }

    fn read_completion(fd: RawFd) -> io::Result<Option<(u32, u32, bool)>> {
        let mut control = [0u8; 256];
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = control.len() as _;

        let rc = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        while !cmsg.is_null() {
            let header = unsafe { &*cmsg };
            let is_recverr = (header.cmsg_level == libc::SOL_IP
                && header.cmsg_type == libc::IP_RECVERR)
                || (header.cmsg_level == libc::SOL_IPV6
                    && header.cmsg_type == libc::IPV6_RECVERR);
            if is_recverr {
                let err = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::sock_extended_err) };
                if err.ee_errno == 0 && err.ee_origin == SO_EE_ORIGIN_ZEROCOPY {
                    let copied = err.ee_code & SO_EE_CODE_ZEROCOPY_COPIED != 0;
                    return Ok(Some((err.ee_info, err.ee_data, copied)));
                }
            }
            cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> QueueConfig {
        QueueConfig {
            limit_bytes: 1000,
            slow_limit_bytes: 300,
            slow_threshold_bytes: 600,
            slow_duration_ms: 100,
            drop_policy: DropPolicy::Newest,
            max_batch: 4,
        }
    }

    fn blob(n: usize, byte: u8) -> ChunkData {
        ChunkData::Shared(Bytes::from(vec![byte; n]))
    }

    #[test]
    fn fifo_order_and_partial_consume() {
        let mut q = SendQueue::new(config());
        let now = Instant::now();
        q.enqueue(blob(4, b'a'), 0, 4, now);
        q.enqueue(blob(4, b'b'), 0, 4, now);
        assert_eq!(q.queued_bytes(), 8);

        let (slices, total) = q.iovecs();
        assert_eq!(total, 8);
        assert_eq!(&*slices[0], b"aaaa");
        assert_eq!(&*slices[1], b"bbbb");

        // Partial write through the first chunk into the second.
        q.consume(6, false);
        assert_eq!(q.queued_bytes(), 2);
        let (slices, total) = q.iovecs();
        assert_eq!(total, 2);
        assert_eq!(&*slices[0], b"bb");
    }

    #[test]
    fn hard_cap_drop_newest() {
        let mut q = SendQueue::new(config());
        let now = Instant::now();
        q.enqueue(blob(900, 1), 0, 900, now);
        assert_eq!(
            q.enqueue(blob(200, 2), 0, 200, now),
            Enqueue::Dropped { bytes: 200 }
        );
        assert_eq!(q.queued_bytes(), 900);
        assert_eq!(q.dropped_bytes(), 200);
        assert_eq!(q.highwater(), 900);
    }

    #[test]
    fn hard_cap_drop_oldest_makes_room() {
        let mut cfg = config();
        cfg.drop_policy = DropPolicy::Oldest;
        let mut q = SendQueue::new(cfg);
        let now = Instant::now();
        for i in 0..5 {
            q.enqueue(blob(200, i), 0, 200, now);
        }
        assert_eq!(q.queued_bytes(), 1000);
        assert_eq!(
            q.enqueue(blob(200, 9), 0, 200, now),
            Enqueue::Dropped { bytes: 200 }
        );
        assert_eq!(q.queued_bytes(), 1000);
        // Oldest went away, newest is queued at the back.
        let (slices, _) = q.iovecs();
        assert_eq!(slices[0][0], 1);
    }

    #[test]
    fn dropped_bytes_is_monotonic_sum() {
        let mut q = SendQueue::new(config());
        let now = Instant::now();
        q.enqueue(blob(900, 1), 0, 900, now);
        q.enqueue(blob(200, 2), 0, 200, now);
        q.enqueue(blob(300, 3), 0, 300, now);
        assert_eq!(q.dropped_bytes(), 500);
    }

    #[test]
    fn slow_flag_needs_sustained_depth() {
        let mut q = SendQueue::new(config());
        let t0 = Instant::now();
        q.enqueue(blob(700, 1), 0, 700, t0);
        assert!(!q.is_slow());

        // Depth persisted past the duration: flagged on the next tick.
        q.tick(t0 + Duration::from_millis(150));
        assert!(q.is_slow());

        // Reduced cap now applies.
        assert_eq!(
            q.enqueue(blob(100, 2), 0, 100, t0 + Duration::from_millis(151)),
            Enqueue::Dropped { bytes: 100 }
        );
    }

    #[test]
    fn dip_below_threshold_resets_the_clock() {
        let mut q = SendQueue::new(config());
        let t0 = Instant::now();
        q.enqueue(blob(700, 1), 0, 700, t0);
        q.consume(700, false);
        q.tick(t0 + Duration::from_millis(50));
        q.enqueue(blob(700, 1), 0, 700, t0 + Duration::from_millis(60));
        q.tick(t0 + Duration::from_millis(120));
        assert!(!q.is_slow(), "clock restarted after the dip");
    }

    #[test]
    fn consume_retains_touched_chunks() {
        let mut q = SendQueue::new(config());
        let now = Instant::now();
        q.enqueue(blob(4, 1), 0, 4, now);
        q.enqueue(blob(4, 2), 0, 4, now);
        let retained = q.consume(6, true);
        assert_eq!(retained.len(), 2, "full first chunk + partial second");
        assert_eq!(q.queued_bytes(), 2);
    }

    #[test]
    fn zerocopy_completion_ranges_release_in_flight() {
        let mut z = zc::ZeroCopy::new_for_tests();
        z.sent(vec![blob(1, 0)]);
        z.sent(vec![blob(1, 1)]);
        z.sent(vec![blob(1, 2)]);
        assert_eq!(z.in_flight(), 3);

        assert_eq!(z.complete(0, 1), 2);
        assert_eq!(z.in_flight(), 1);
        assert_eq!(z.complete(2, 2), 1);
        assert_eq!(z.in_flight(), 0);

        // Deactivation stops new zero-copy sends but keeps bookkeeping.
        z.sent(vec![blob(1, 3)]);
        z.deactivate();
        assert!(!z.active());
        assert_eq!(z.in_flight(), 1);
        assert_eq!(z.complete(3, 3), 1);
    }
}
