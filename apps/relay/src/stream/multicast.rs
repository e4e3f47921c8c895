//! Multicast ingress: socket construction, IGMP membership bookkeeping and
//! the live-stream driver.
//!
//! Joins are refcounted per (group, port, interface): the registry only
//! exists so the optional periodic rejoin can walk every live membership
//! (IGMP-snooping switches with no querier silently expire them) and so the
//! last leaver is observable. The kernel handles the actual membership per
//! socket.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::buffer::BufferPool;
use crate::config::Config;
use crate::error::RelayError;
use crate::sendq::{ClientSink, Enqueue, Pump};
use crate::stream::pipeline::{recv_pooled, RtpPipeline};

/// Build a multicast receive socket: reuse-address so several clients can
/// watch the same channel, a large receive buffer against bursts, group
/// membership on the configured interface.
pub fn open_multicast_socket(
    group: Ipv4Addr,
    port: u16,
    iface: Option<&str>,
    recv_buffer: usize,
) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&bind_addr.into())?;

    if recv_buffer > 0 {
        set_recv_buffer(&socket, recv_buffer);
    }

    let iface_addr = iface.map(interface_ipv4).unwrap_or(Ipv4Addr::UNSPECIFIED);
    socket.join_multicast_v4(&group, &iface_addr)?;

    UdpSocket::from_std(socket.into())
}

/// Ask for a large receive buffer, preferring the privileged variant that
/// ignores rmem_max (available with CAP_NET_ADMIN), falling back to the
/// ordinary one.
fn set_recv_buffer(socket: &Socket, bytes: usize) {
    let fd = socket.as_raw_fd();
    let value = bytes as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUFFORCE,
            (&value as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        if let Err(err) = socket.set_recv_buffer_size(bytes) {
            debug!(%err, bytes, "could not size receive buffer");
        }
    }
}

/// First IPv4 address of the named interface, or UNSPECIFIED (routing table
/// decides) when the interface has none or does not exist.
fn interface_ipv4(name: &str) -> Ipv4Addr {
    match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => {
            for ifaddr in addrs {
                if ifaddr.interface_name != name {
                    continue;
                }
                if let Some(addr) = ifaddr.address.and_then(|a| a.as_sockaddr_in().cloned()) {
                    return Ipv4Addr::from(addr.ip());
                }
            }
            warn!(name, "interface has no IPv4 address, using routing table");
            Ipv4Addr::UNSPECIFIED
        }
        Err(err) => {
            warn!(%err, "cannot enumerate interfaces, using routing table");
            Ipv4Addr::UNSPECIFIED
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MembershipKey {
    group: Ipv4Addr,
    port: u16,
    iface: Option<String>,
}

struct Membership {
    refs: usize,
    iface_addr: Ipv4Addr,
    sockets: Vec<Weak<UdpSocket>>,
}

/// Per-worker membership registry.
#[derive(Clone, Default)]
pub struct MulticastRegistry {
    inner: Rc<RefCell<HashMap<MembershipKey, Membership>>>,
}

impl MulticastRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a joined socket and register the membership. The guard leaves
    /// on drop.
    pub fn join(
        &self,
        group: Ipv4Addr,
        port: u16,
        iface: Option<&str>,
        recv_buffer: usize,
    ) -> io::Result<(Rc<UdpSocket>, JoinGuard)> {
        let socket = Rc::new(open_multicast_socket(group, port, iface, recv_buffer)?);
        let iface_addr = iface.map(interface_ipv4).unwrap_or(Ipv4Addr::UNSPECIFIED);
        let key = MembershipKey {
            group,
            port,
            iface: iface.map(str::to_string),
        };

        let mut memberships = self.inner.borrow_mut();
        let entry = memberships.entry(key.clone()).or_insert_with(|| {
            debug!(%group, port, "first member joined");
            Membership {
                refs: 0,
                iface_addr,
                sockets: Vec::new(),
            }
        });
        entry.refs += 1;
        entry.sockets.push(Rc::downgrade(&socket));

        Ok((
            socket,
            JoinGuard {
                registry: self.clone(),
                key,
            },
        ))
    }

    /// Number of live memberships (distinct group/port/interface tuples).
    pub fn active(&self) -> usize {
        self.inner.borrow().len()
    }

    /// Re-issue every membership's join. Some switches drop forwarding
    /// state when no IGMP querier answers; operators can opt into this.
    pub fn rejoin_all(&self) {
        let memberships = self.inner.borrow();
        for (key, membership) in memberships.iter() {
            for socket in membership.sockets.iter().filter_map(Weak::upgrade) {
                let _ = socket.leave_multicast_v4(key.group, membership.iface_addr);
                match socket.join_multicast_v4(key.group, membership.iface_addr) {
                    Ok(()) => trace!(group = %key.group, "rejoined"),
                    Err(err) => debug!(group = %key.group, %err, "rejoin failed"),
                }
            }
        }
    }

    fn leave(&self, key: &MembershipKey) {
        let mut memberships = self.inner.borrow_mut();
        if let Some(membership) = memberships.get_mut(key) {
            membership.refs -= 1;
            membership.sockets.retain(|s| s.strong_count() > 0);
            if membership.refs == 0 {
                // Last leaver: sockets are gone (or going), the kernel sends
                // the IGMP leave when the final one closes.
                debug!(group = %key.group, port = key.port, "last member left");
                memberships.remove(key);
            }
        }
    }
}

/// Keeps a membership accounted for; dropping it is the leave.
pub struct JoinGuard {
    registry: MulticastRegistry,
    key: MembershipKey,
}

impl Drop for JoinGuard {
    fn drop(&mut self) {
        self.registry.leave(&self.key);
    }
}

/// Live multicast relay: the steady-state driver for both RTP and raw UDP
/// services.
pub struct MulticastDriver {
    socket: Rc<UdpSocket>,
    _guard: JoinGuard,
    fec_socket: Option<UdpSocket>,
    pipeline: Option<RtpPipeline>,
    source_filter: Option<IpAddr>,
    idle_log: Duration,
    last_packet: Instant,
    pool: BufferPool,
}

impl MulticastDriver {
    /// Join and set up for an RTP service. `pipeline: None` means raw UDP
    /// passthrough.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        config: &Config,
        registry: &MulticastRegistry,
        pool: BufferPool,
        group: Ipv4Addr,
        port: u16,
        fec_port: Option<u16>,
        source_filter: Option<IpAddr>,
        pipeline: Option<RtpPipeline>,
    ) -> Result<MulticastDriver, RelayError> {
        let iface = config.server.upstream_interface.as_deref();
        let (socket, guard) = registry.join(group, port, iface, config.buffers.udp_recv_buffer)?;

        let fec_socket = match fec_port {
            Some(fec_port) if pipeline.is_some() => Some(open_multicast_socket(
                group,
                fec_port,
                iface,
                config.buffers.udp_recv_buffer,
            )?),
            _ => None,
        };

        Ok(MulticastDriver {
            socket,
            _guard: guard,
            fec_socket,
            pipeline,
            source_filter,
            idle_log: Duration::from_secs(config.multicast.idle_log_secs.max(1)),
            last_packet: Instant::now(),
            pool,
        })
    }

    fn accepts_sender(&self, from: &SocketAddr) -> bool {
        match self.source_filter {
            Some(expected) => from.ip() == expected,
            None => true,
        }
    }

    /// Relay until the client goes away or the upstream fails.
    pub async fn run(&mut self, sink: &mut ClientSink) -> Result<(), RelayError> {
        enum Event {
            Pump(Pump),
            Datagram(Option<(crate::buffer::BufferRef, SocketAddr)>),
            Parity(Vec<u8>),
            Tick,
        }

        let mut parsed = Vec::new();
        let mut emitted = Vec::new();

        loop {
            let deadline = self.next_deadline();
            // Branch futures borrow disjoint pieces; the shared state below
            // is only touched after the select resolves into an event.
            let event = tokio::select! {
                pump = sink.pump() => Event::Pump(pump?),
                received = recv_pooled(&self.socket, &self.pool) => Event::Datagram(received?),
                parity = recv_parity(self.fec_socket.as_ref()) => Event::Parity(parity?),
                _ = tokio::time::sleep_until(deadline.into()) => Event::Tick,
            };

            let now = Instant::now();
            match event {
                Event::Pump(Pump::Disconnected) => return Err(RelayError::ClientGone),
                Event::Pump(Pump::Progress) => {}
                // Pool exhausted: the datagram was shed upstream.
                Event::Datagram(None) => {}
                Event::Datagram(Some((buffer, from))) => {
                    if !self.accepts_sender(&from) {
                        trace!(%from, "dropping datagram from filtered sender");
                        continue;
                    }
                    self.last_packet = now;
                    match &mut self.pipeline {
                        Some(pipeline) => {
                            parsed.clear();
                            emitted.clear();
                            pipeline.parse(buffer, now, &mut parsed);
                            for packet in parsed.drain(..) {
                                pipeline.push(packet, now, &mut emitted);
                            }
                            deliver(sink, &mut emitted, now)?;
                        }
                        None => {
                            let len = buffer.len();
                            enqueue_counted(
                                sink,
                                crate::sendq::ChunkData::Pooled(buffer),
                                0,
                                len,
                                now,
                            )?;
                            sink.try_flush().map_err(RelayError::Io)?;
                        }
                    }
                }
                Event::Parity(datagram) => {
                    if let Some(pipeline) = &mut self.pipeline {
                        parsed.clear();
                        emitted.clear();
                        pipeline.parse_parity(&datagram, now, &mut parsed);
                        for packet in parsed.drain(..) {
                            pipeline.push(packet, now, &mut emitted);
                        }
                        deliver(sink, &mut emitted, now)?;
                    }
                }
                Event::Tick => {
                    if let Some(pipeline) = &mut self.pipeline {
                        emitted.clear();
                        pipeline.on_deadline(now, &mut emitted);
                        deliver(sink, &mut emitted, now)?;
                    }
                    if now.duration_since(self.last_packet) >= self.idle_log {
                        // IPTV streams pause; keep the membership and wait.
                        warn!("no multicast packets for {:?}, still serving", self.idle_log);
                        self.last_packet = now;
                    }
                }
            }
        }
    }

    fn next_deadline(&self) -> Instant {
        let idle_at = self.last_packet + self.idle_log;
        match self.pipeline.as_ref().and_then(RtpPipeline::poll_deadline) {
            Some(reorder_at) => reorder_at.min(idle_at),
            None => idle_at,
        }
    }
}

/// Enqueue emitted packets and kick the socket once.
pub(super) fn deliver(
    sink: &mut ClientSink,
    emitted: &mut Vec<crate::stream::pipeline::RtpPacket>,
    now: Instant,
) -> Result<(), RelayError> {
    if emitted.is_empty() {
        return Ok(());
    }
    for packet in emitted.drain(..) {
        let (data, offset, len) = packet.chunk();
        enqueue_counted(sink, data, offset, len, now)?;
    }
    sink.try_flush().map_err(RelayError::Io)
}

pub(super) fn enqueue_counted(
    sink: &mut ClientSink,
    data: crate::sendq::ChunkData,
    offset: usize,
    len: usize,
    now: Instant,
) -> Result<(), RelayError> {
    match sink.enqueue(data, offset, len, now) {
        Enqueue::Queued => Ok(()),
        Enqueue::Dropped { bytes } => {
            trace!(bytes, "send queue dropped bytes");
            Ok(())
        }
    }
}

async fn recv_parity(socket: Option<&UdpSocket>) -> io::Result<Vec<u8>> {
    match socket {
        Some(socket) => {
            let mut buf = vec![0u8; crate::buffer::BUFFER_SIZE];
            let (len, _) = socket.recv_from(&mut buf).await?;
            buf.truncate(len);
            Ok(buf)
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_refcounts_memberships() {
        let registry = MulticastRegistry::new();
        let group: Ipv4Addr = "239.255.42.42".parse().unwrap();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .unwrap();
        let _enter = rt.enter();

        let Ok((_s1, g1)) = registry.join(group, 15000, None, 0) else {
            eprintln!("multicast unavailable in this environment, skipping");
            return;
        };
        let (_s2, g2) = registry.join(group, 15000, None, 0).unwrap();
        let (_s3, g3) = registry.join(group, 15002, None, 0).unwrap();
        assert_eq!(registry.active(), 2);

        drop(g1);
        assert_eq!(registry.active(), 2, "one member remains on 15000");
        drop(g2);
        assert_eq!(registry.active(), 1, "last leaver removed 15000");
        drop(g3);
        assert_eq!(registry.active(), 0);
    }

    #[test]
    fn rejoin_walks_live_sockets() {
        let registry = MulticastRegistry::new();
        let group: Ipv4Addr = "239.255.43.43".parse().unwrap();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .unwrap();
        let _enter = rt.enter();

        let Ok((_socket, _guard)) = registry.join(group, 15004, None, 0) else {
            eprintln!("multicast unavailable in this environment, skipping");
            return;
        };
        // Nothing to assert beyond "does not panic / does not error out";
        // kernel-level effects need a switch to observe.
        registry.rejoin_all();
        assert_eq!(registry.active(), 1);
    }
}
