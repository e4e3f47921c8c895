//! Worker status ring.
//!
//! Each worker owns a small file-backed shared-memory ring (one file per
//! worker under the status directory) and is its only writer; the
//! supervisor maps the file read-only and samples it. Records are
//! fixed-size and the head counter is published with release ordering, so
//! a torn read can at worst show a stale record, never a torn header.

use std::fs::OpenOptions;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::buffer::PoolStats;
use crate::error::RelayError;
use crate::sendq::SendCounters;

const STATUS_MAGIC: u32 = 0x5253_5430; // "RST0"
const STATUS_VERSION: u32 = 1;

/// Connection lifecycle as reported over the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Accepting = 0,
    ParsingRequest = 1,
    Dispatching = 2,
    LiveMulticast = 3,
    FccBurst = 4,
    FccSynchronizing = 5,
    Rtsp = 6,
    HttpProxy = 7,
    Draining = 8,
    Closed = 9,
}

impl ClientState {
    fn from_u8(value: u8) -> ClientState {
        match value {
            0 => ClientState::Accepting,
            1 => ClientState::ParsingRequest,
            2 => ClientState::Dispatching,
            3 => ClientState::LiveMulticast,
            4 => ClientState::FccBurst,
            5 => ClientState::FccSynchronizing,
            6 => ClientState::Rtsp,
            7 => ClientState::HttpProxy,
            8 => ClientState::Draining,
            _ => ClientState::Closed,
        }
    }
}

/// One per-client snapshot, the reader-friendly form.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSnapshot {
    pub client_id: u64,
    pub worker_pid: u32,
    pub remote_addr: String,
    pub service_url: String,
    pub state: ClientState,
    pub bytes_sent: u64,
    pub bandwidth_bps: u64,
    pub queue_bytes: u64,
    pub queue_highwater: u64,
    pub dropped_bytes: u64,
    pub slow: bool,
    pub duration_ms: u64,
}

/// Aggregate worker counters, updated in place.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct WorkerCounters {
    pub pool: PoolStats,
    pub send: SendCounters,
    pub clients_total: u64,
    pub clients_active: u64,
}

const REMOTE_CAP: usize = 48;
const SERVICE_CAP: usize = 72;

#[repr(C)]
struct RingHeader {
    magic: u32,
    version: u32,
    capacity: u32,
    worker_pid: u32,
    head: AtomicU64,
    counters: [u64; 16],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawRecord {
    client_id: u64,
    bytes_sent: u64,
    bandwidth_bps: u64,
    queue_bytes: u64,
    queue_highwater: u64,
    dropped_bytes: u64,
    duration_ms: u64,
    state: u8,
    slow: u8,
    remote_len: u8,
    service_len: u8,
    _pad: u32,
    remote: [u8; REMOTE_CAP],
    service: [u8; SERVICE_CAP],
}

fn ring_len(capacity: usize) -> usize {
    std::mem::size_of::<RingHeader>() + capacity * std::mem::size_of::<RawRecord>()
}

struct Mapping {
    ptr: NonNull<libc::c_void>,
    len: usize,
}

impl Mapping {
    fn header(&self) -> &RingHeader {
        unsafe { &*(self.ptr.as_ptr() as *const RingHeader) }
    }

    fn record_ptr(&self, index: usize) -> *mut RawRecord {
        unsafe {
            (self.ptr.as_ptr() as *mut u8)
                .add(std::mem::size_of::<RingHeader>())
                .cast::<RawRecord>()
                .add(index)
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        let _ = unsafe { munmap(self.ptr, self.len) };
    }
}

pub fn ring_path(dir: &Path, worker_id: usize) -> PathBuf {
    dir.join(format!("streamrelay-worker-{worker_id}.status"))
}

/// The worker-side, single-writer end.
pub struct StatusWriter {
    map: Mapping,
    capacity: usize,
}

impl StatusWriter {
    pub fn create(dir: &Path, worker_id: usize, capacity: usize) -> Result<StatusWriter, RelayError> {
        let capacity = capacity.max(8);
        let path = ring_path(dir, worker_id);
        let len = ring_len(capacity);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|err| {
                RelayError::Config(format!("cannot create status ring {}: {err}", path.display()))
            })?;
        file.set_len(len as u64)
            .map_err(|err| RelayError::Config(format!("cannot size status ring: {err}")))?;

        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(len).expect("non-zero ring"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file.as_fd(),
                0,
            )
        }
        .map_err(|err| RelayError::Config(format!("cannot map status ring: {err}")))?;

        let map = Mapping { ptr, len };
        let header = map.ptr.as_ptr() as *mut RingHeader;
        unsafe {
            (*header).magic = STATUS_MAGIC;
            (*header).version = STATUS_VERSION;
            (*header).capacity = capacity as u32;
            (*header).worker_pid = std::process::id();
            (*header).head = AtomicU64::new(0);
            (*header).counters = [0; 16];
        }
        Ok(StatusWriter { map, capacity })
    }

    /// Append one client snapshot.
    pub fn push(&self, snapshot: &ClientSnapshot) {
        let header = self.map.header();
        let head = header.head.load(Ordering::Relaxed);
        let slot = (head % self.capacity as u64) as usize;

        let mut raw = RawRecord {
            client_id: snapshot.client_id,
            bytes_sent: snapshot.bytes_sent,
            bandwidth_bps: snapshot.bandwidth_bps,
            queue_bytes: snapshot.queue_bytes,
            queue_highwater: snapshot.queue_highwater,
            dropped_bytes: snapshot.dropped_bytes,
            duration_ms: snapshot.duration_ms,
            state: snapshot.state as u8,
            slow: u8::from(snapshot.slow),
            remote_len: 0,
            service_len: 0,
            _pad: 0,
            remote: [0; REMOTE_CAP],
            service: [0; SERVICE_CAP],
        };
        raw.remote_len = copy_str(&mut raw.remote, &snapshot.remote_addr);
        raw.service_len = copy_str(&mut raw.service, &snapshot.service_url);

        unsafe { self.map.record_ptr(slot).write(raw) };
        header.head.store(head + 1, Ordering::Release);
    }

    /// Overwrite the aggregate counters block.
    pub fn set_counters(&self, counters: &WorkerCounters) {
        let header = self.map.ptr.as_ptr() as *mut RingHeader;
        let packed = pack_counters(counters);
        unsafe { (*header).counters = packed };
    }
}

/// Supervisor-side read-only view.
pub struct StatusReader {
    map: Mapping,
    capacity: usize,
    pub worker_pid: u32,
}

impl StatusReader {
    pub fn open(path: &Path) -> Result<StatusReader, RelayError> {
        let file = OpenOptions::new().read(true).open(path).map_err(|err| {
            RelayError::Config(format!("cannot open status ring {}: {err}", path.display()))
        })?;
        let len = file
            .metadata()
            .map_err(|err| RelayError::Config(format!("cannot stat status ring: {err}")))?
            .len() as usize;
        if len < std::mem::size_of::<RingHeader>() {
            return Err(RelayError::Config("status ring truncated".into()));
        }

        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(len).expect("checked above"),
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                file.as_fd(),
                0,
            )
        }
        .map_err(|err| RelayError::Config(format!("cannot map status ring: {err}")))?;
        let map = Mapping { ptr, len };

        let header = map.header();
        if header.magic != STATUS_MAGIC || header.version != STATUS_VERSION {
            return Err(RelayError::Config("status ring has unknown layout".into()));
        }
        let capacity = header.capacity as usize;
        if ring_len(capacity) > len {
            return Err(RelayError::Config("status ring shorter than header claims".into()));
        }
        let worker_pid = header.worker_pid;
        Ok(StatusReader {
            map,
            capacity,
            worker_pid,
        })
    }

    pub fn counters(&self) -> WorkerCounters {
        unpack_counters(&self.map.header().counters)
    }

    /// The most recent `limit` snapshots, newest first.
    pub fn recent(&self, limit: usize) -> Vec<ClientSnapshot> {
        let header = self.map.header();
        let head = header.head.load(Ordering::Acquire);
        let available = head.min(self.capacity as u64);
        let take = available.min(limit as u64);

        let mut out = Vec::with_capacity(take as usize);
        for back in 1..=take {
            let index = ((head - back) % self.capacity as u64) as usize;
            let raw = unsafe { self.map.record_ptr(index).read() };
            out.push(ClientSnapshot {
                client_id: raw.client_id,
                worker_pid: header.worker_pid,
                remote_addr: read_str(&raw.remote, raw.remote_len),
                service_url: read_str(&raw.service, raw.service_len),
                state: ClientState::from_u8(raw.state),
                bytes_sent: raw.bytes_sent,
                bandwidth_bps: raw.bandwidth_bps,
                queue_bytes: raw.queue_bytes,
                queue_highwater: raw.queue_highwater,
                dropped_bytes: raw.dropped_bytes,
                slow: raw.slow != 0,
                duration_ms: raw.duration_ms,
            });
        }
        out
    }
}

fn copy_str(dst: &mut [u8], src: &str) -> u8 {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
    n as u8
}

fn read_str(src: &[u8], len: u8) -> String {
    String::from_utf8_lossy(&src[..(len as usize).min(src.len())]).into_owned()
}

fn pack_counters(c: &WorkerCounters) -> [u64; 16] {
    [
        c.pool.total as u64,
        c.pool.free as u64,
        c.pool.used as u64,
        c.pool.max as u64,
        c.pool.expansions,
        c.pool.exhaustions,
        c.send.sends,
        c.send.batches,
        c.send.bytes_sent,
        c.send.completions,
        c.send.copied,
        c.send.eagain,
        c.send.enobufs,
        c.clients_total,
        c.clients_active,
        0,
    ]
}

fn unpack_counters(packed: &[u64; 16]) -> WorkerCounters {
    WorkerCounters {
        pool: PoolStats {
            total: packed[0] as usize,
            free: packed[1] as usize,
            used: packed[2] as usize,
            max: packed[3] as usize,
            expansions: packed[4],
            exhaustions: packed[5],
        },
        send: SendCounters {
            sends: packed[6],
            batches: packed[7],
            bytes_sent: packed[8],
            completions: packed[9],
            copied: packed[10],
            eagain: packed[11],
            enobufs: packed[12],
        },
        clients_total: packed[13],
        clients_active: packed[14],
    }
}
