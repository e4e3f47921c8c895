//! Relay configuration.
//!
//! Everything is optional with serviceable defaults so a bare
//! `streamrelay` serves udpxy-style URLs out of the box. The streaming core
//! never touches the file itself; workers receive the parsed tree.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::RelayError;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub buffers: BufferConfig,
    pub queue: QueueConfig,
    pub reorder: ReorderConfig,
    pub fec: FecConfig,
    pub fcc: FccConfig,
    pub rtsp: RtspConfig,
    pub multicast: MulticastConfig,
    pub status: StatusConfig,
    pub services: Vec<ServiceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Worker process count; 0 = one per CPU.
    pub workers: usize,
    /// Maximum concurrent clients per worker; beyond it new requests get 503.
    pub max_clients: usize,
    /// Expected Host header; mismatches get 400. Unset = accept anything.
    pub hostname: Option<String>,
    /// Access token looked for in query/cookie/User-Agent. Unset = open.
    pub token: Option<String>,
    /// Translate `/rtp/…`, `/udp/…`, `/rtsp/…`, `/http/…` URLs.
    pub udpxy: bool,
    /// Name of the device upstream sockets bind to.
    pub upstream_interface: Option<String>,
    /// Use MSG_ZEROCOPY on client sockets where the kernel allows it.
    pub zerocopy: bool,
    /// Seconds granted to drain send queues on shutdown.
    pub drain_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5140".parse().unwrap(),
            workers: 0,
            max_clients: 64,
            hostname: None,
            token: None,
            udpxy: true,
            upstream_interface: None,
            zerocopy: false,
            drain_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Data pool: buffers preallocated per worker.
    pub pool_size: usize,
    /// Data pool growth ceiling.
    pub pool_max: usize,
    /// Control pool for protocol messages.
    pub control_pool_size: usize,
    /// Kernel receive buffer requested for upstream UDP sockets.
    pub udp_recv_buffer: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            pool_size: 16 * 1024,
            pool_max: 48 * 1024,
            control_pool_size: 1024,
            udp_recv_buffer: 512 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DropPolicy {
    /// Refuse the incoming packet when the cap is hit.
    Newest,
    /// Evict from the queue front until the incoming packet fits.
    Oldest,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Hard cap of bytes queued per client.
    pub limit_bytes: usize,
    /// Reduced cap once a client is flagged slow.
    pub slow_limit_bytes: usize,
    /// Queue depth that starts the slow-client clock.
    pub slow_threshold_bytes: usize,
    /// How long the depth must persist before flagging.
    pub slow_duration_ms: u64,
    pub drop_policy: DropPolicy,
    /// Chunks coalesced into one vectored write.
    pub max_batch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            limit_bytes: 4 * 1024 * 1024,
            slow_limit_bytes: 1024 * 1024,
            slow_threshold_bytes: 2 * 1024 * 1024,
            slow_duration_ms: 2_000,
            drop_policy: DropPolicy::Newest,
            max_batch: 64,
        }
    }
}

impl QueueConfig {
    pub fn slow_duration(&self) -> Duration {
        Duration::from_millis(self.slow_duration_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ReorderConfig {
    /// Time budget for an out-of-order packet.
    pub hold_ms: u64,
    /// Sequence positions the window may span.
    pub window: usize,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            hold_ms: 150,
            window: 512,
        }
    }
}

impl ReorderConfig {
    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FecConfig {
    pub max_blocks: usize,
    pub max_block_age_ms: u64,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            max_blocks: 64,
            max_block_age_ms: 2_000,
        }
    }
}

impl FecConfig {
    pub fn max_block_age(&self) -> Duration {
        Duration::from_millis(self.max_block_age_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FccConfig {
    pub response_timeout_ms: u64,
    pub handover_timeout_ms: u64,
    pub nat_keepalive_ms: u64,
    /// Bind FCC sockets from this range so operator port-forwards apply.
    /// 0-0 = ephemeral.
    pub port_range_start: u16,
    pub port_range_end: u16,
}

impl Default for FccConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 80,
            handover_timeout_ms: 3_000,
            nat_keepalive_ms: 500,
            port_range_start: 0,
            port_range_end: 0,
        }
    }
}

impl FccConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn handover_timeout(&self) -> Duration {
        Duration::from_millis(self.handover_timeout_ms)
    }

    pub fn nat_keepalive(&self) -> Duration {
        Duration::from_millis(self.nat_keepalive_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RtspConfig {
    pub request_timeout_ms: u64,
    /// STUN server consulted before UDP SETUP, if any.
    pub stun_server: Option<SocketAddr>,
    /// Additional seek parameter name besides playseek/tvdr.
    pub seek_name: Option<String>,
    /// Default seek offset in seconds (overridable per request).
    pub seek_offset_secs: i64,
    /// First local port for RTP/RTCP pairs; 0 = ephemeral.
    pub port_start: u16,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            stun_server: None,
            seek_name: None,
            seek_offset_secs: 0,
            port_start: 0,
        }
    }
}

impl RtspConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MulticastConfig {
    /// Re-issue IGMP joins at this interval; 0 disables. Masking faulty
    /// switches is the operator's call.
    pub rejoin_interval_secs: u64,
    /// Log when a joined group stays silent this long.
    pub idle_log_secs: u64,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            rejoin_interval_secs: 0,
            idle_log_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Directory holding the per-worker status rings.
    pub dir: PathBuf,
    /// Snapshot records per ring.
    pub capacity: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/dev/shm"),
            capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    Rtp,
    Udp,
    Rtsp,
    Http,
}

/// One configured service, exposed under `/{path}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    pub path: String,
    pub kind: ServiceKind,
    /// `group:port` for multicast kinds, full URL for rtsp/http.
    pub address: String,
    pub fcc: Option<String>,
    #[serde(default)]
    pub fcc_type: Option<String>,
    pub fec_port: Option<u16>,
    /// Restrict accepted RTP payload type, if set.
    pub payload_type: Option<u8>,
    /// Accept packets only from this source address.
    pub source: Option<std::net::IpAddr>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, RelayError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| RelayError::Config(format!("cannot read {}: {err}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|err| RelayError::Config(format!("cannot parse {}: {err}", path.display())))
    }

    pub fn worker_count(&self) -> usize {
        if self.server.workers > 0 {
            return self.server.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}
