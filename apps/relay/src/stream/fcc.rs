//! Fast-channel-change driver.
//!
//! Owns the unicast FCC socket (signalling and burst share it; RTCP is told
//! apart from RTP by the payload-type octet) and joins the multicast group
//! when the session machine says so. All protocol decisions live in
//! `streamrelay_fcc`; this file only moves datagrams and timers.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::rc::Rc;
use std::time::Instant;

use rand::RngCore;
use socket2::{Domain, Protocol, Socket, Type};
use streamrelay_fcc::session::{Action, FccConfig as SessionConfig, SessionParams};
use streamrelay_fcc::{wire, FccSession, FccState};
use streamrelay_rtp::Sequenced;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

use crate::buffer::{BufferPool, BufferRef};
use crate::config::Config;
use crate::error::RelayError;
use crate::sendq::{ClientSink, Pump};
use crate::service::FccSpec;
use crate::stream::multicast::{deliver, open_multicast_socket, JoinGuard, MulticastRegistry};
use crate::stream::pipeline::{recv_pooled, RtpPipeline};

pub struct FccDriver {
    session: FccSession,
    /// Unicast socket; dropped once the burst is over.
    signal: Option<Rc<UdpSocket>>,
    mcast: Option<(Rc<UdpSocket>, JoinGuard)>,
    fec_socket: Option<UdpSocket>,
    pipeline: RtpPipeline,
    pool: BufferPool,
    registry: MulticastRegistry,
    group: Ipv4Addr,
    port: u16,
    fec_port: Option<u16>,
    iface: Option<String>,
    recv_buffer: usize,
}

impl FccDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        config: &Config,
        registry: &MulticastRegistry,
        pool: BufferPool,
        group: Ipv4Addr,
        port: u16,
        fec_port: Option<u16>,
        payload_type: Option<u8>,
        spec: FccSpec,
    ) -> Result<FccDriver, RelayError> {
        let signal = bind_from_range(
            config.fcc.port_range_start,
            config.fcc.port_range_end,
        )?;
        let client_port = signal.local_addr()?.port();
        let local_ip = local_ipv4_towards(spec.server);

        let mut rng = rand::rng();
        let mut stb_id = [0u8; 16];
        rng.fill_bytes(&mut stb_id);

        let mut session_config = SessionConfig::new(spec.variant, spec.server);
        session_config.response_timeout = config.fcc.response_timeout();
        session_config.handover_timeout = config.fcc.handover_timeout();
        session_config.nat_keepalive_interval = config.fcc.nat_keepalive();

        let session = FccSession::new(
            session_config,
            SessionParams {
                ssrc: rng.next_u32(),
                stb_id,
                local_ip,
                client_port,
                mcast_ip: group,
                mcast_port: port,
            },
        );

        let fec = fec_port.map(|_| config.fec);
        Ok(FccDriver {
            session,
            signal: Some(Rc::new(signal)),
            mcast: None,
            fec_socket: None,
            pipeline: RtpPipeline::new(&config.reorder, fec.as_ref(), payload_type),
            pool,
            registry: registry.clone(),
            group,
            port,
            fec_port,
            iface: config.server.upstream_interface.clone(),
            recv_buffer: config.buffers.udp_recv_buffer,
        })
    }

    pub fn state(&self) -> FccState {
        self.session.state()
    }

    pub async fn run(&mut self, sink: &mut ClientSink) -> Result<(), RelayError> {
        enum Event {
            Pump(Pump),
            Unicast(Option<(BufferRef, SocketAddr)>),
            Multicast(Option<(BufferRef, SocketAddr)>),
            Parity(Vec<u8>),
            Tick,
        }

        let actions = self.session.start(Instant::now());
        self.apply(actions)?;

        let mut parsed = Vec::new();
        let mut emitted = Vec::new();

        loop {
            let deadline = self.next_deadline();
            let event = tokio::select! {
                pump = sink.pump() => Event::Pump(pump?),
                r = recv_opt(self.signal.as_deref(), &self.pool) => Event::Unicast(r?),
                r = recv_opt(self.mcast.as_ref().map(|(s, _)| s.as_ref()), &self.pool) => {
                    Event::Multicast(r?)
                }
                p = recv_parity_opt(self.fec_socket.as_ref()) => Event::Parity(p?),
                _ = sleep_opt(deadline) => Event::Tick,
            };

            let now = Instant::now();
            match event {
                Event::Pump(Pump::Disconnected) => return Err(RelayError::ClientGone),
                Event::Pump(Pump::Progress) => {}
                Event::Unicast(None) | Event::Multicast(None) => {}
                Event::Unicast(Some((buffer, _from))) => {
                    if wire::is_feedback(buffer.bytes()) {
                        let actions = self.session.handle_signal(buffer.bytes(), now);
                        self.apply(actions)?;
                    } else {
                        parsed.clear();
                        emitted.clear();
                        self.pipeline.parse(buffer, now, &mut parsed);
                        for packet in parsed.drain(..) {
                            if self.session.accept_burst(packet.sequence()) {
                                self.pipeline.push(packet, now, &mut emitted);
                            }
                        }
                        deliver(sink, &mut emitted, now)?;
                    }
                }
                Event::Multicast(Some((buffer, _from))) => {
                    parsed.clear();
                    emitted.clear();
                    self.pipeline.parse(buffer, now, &mut parsed);
                    for packet in parsed.drain(..) {
                        let (accepted, actions) =
                            self.session.accept_multicast(packet.sequence());
                        self.apply(actions)?;
                        if accepted {
                            self.pipeline.push(packet, now, &mut emitted);
                        }
                    }
                    deliver(sink, &mut emitted, now)?;
                }
                Event::Parity(datagram) => {
                    parsed.clear();
                    emitted.clear();
                    self.pipeline.parse_parity(&datagram, now, &mut parsed);
                    for packet in parsed.drain(..) {
                        let (accepted, actions) =
                            self.session.accept_multicast(packet.sequence());
                        self.apply(actions)?;
                        if accepted {
                            self.pipeline.push(packet, now, &mut emitted);
                        }
                    }
                    deliver(sink, &mut emitted, now)?;
                }
                Event::Tick => {
                    let actions = self.session.on_deadline(now);
                    self.apply(actions)?;
                    emitted.clear();
                    self.pipeline.on_deadline(now, &mut emitted);
                    deliver(sink, &mut emitted, now)?;
                }
            }
        }
    }

    /// Cleanup on any exit path: one termination datagram at most.
    pub fn teardown(&mut self) {
        let actions = self.session.teardown();
        let _ = self.apply(actions);
        self.signal = None;
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.session.poll_deadline(), self.pipeline.poll_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn apply(&mut self, actions: Vec<Action>) -> Result<(), RelayError> {
        for action in actions {
            match action {
                Action::Send { datagram, to } => {
                    if let Some(signal) = &self.signal {
                        // Best effort: UDP signalling is repeatable and a
                        // full socket buffer must not stall the stream.
                        if let Err(err) = signal.try_send_to(&datagram, SocketAddr::V4(to)) {
                            trace!(%err, "dropping outbound FCC datagram");
                        }
                    }
                }
                Action::JoinMulticast => self.join_multicast()?,
                Action::Handover => {
                    info!(group = %self.group, "burst complete, multicast is primary");
                    self.signal = None;
                }
                Action::Fallback(reason) => {
                    info!(?reason, group = %self.group, "streaming live multicast without burst");
                }
            }
        }
        Ok(())
    }

    fn join_multicast(&mut self) -> Result<(), RelayError> {
        if self.mcast.is_some() {
            return Ok(());
        }
        debug!(group = %self.group, port = self.port, "joining multicast group");
        let joined = self.registry.join(
            self.group,
            self.port,
            self.iface.as_deref(),
            self.recv_buffer,
        )?;
        self.mcast = Some(joined);
        if let Some(fec_port) = self.fec_port {
            self.fec_socket = Some(open_multicast_socket(
                self.group,
                fec_port,
                self.iface.as_deref(),
                self.recv_buffer,
            )?);
        }
        Ok(())
    }
}

async fn recv_opt(
    socket: Option<&UdpSocket>,
    pool: &BufferPool,
) -> io::Result<Option<(BufferRef, SocketAddr)>> {
    match socket {
        Some(socket) => recv_pooled(socket, pool).await,
        None => std::future::pending().await,
    }
}

async fn recv_parity_opt(socket: Option<&UdpSocket>) -> io::Result<Vec<u8>> {
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

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

/// Bind the FCC unicast socket, optionally from an operator port range so
/// static NAT port-forwards can point at it.
fn bind_from_range(start: u16, end: u16) -> io::Result<UdpSocket> {
    if start == 0 {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        socket.bind(&addr.into())?;
        return UdpSocket::from_std(socket.into());
    }
    let end = end.max(start);
    let mut last_err = None;
    for port in start..=end {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        match socket.bind(&addr.into()) {
            Ok(()) => return UdpSocket::from_std(socket.into()),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::other("empty FCC port range")))
}

/// Which local IPv4 the kernel would route towards the FCC server; used in
/// Huawei requests.
fn local_ipv4_towards(server: SocketAddrV4) -> Ipv4Addr {
    let probe = match std::net::UdpSocket::bind(("0.0.0.0", 0)) {
        Ok(probe) => probe,
        Err(_) => return Ipv4Addr::UNSPECIFIED,
    };
    if probe.connect(server).is_err() {
        return Ipv4Addr::UNSPECIFIED;
    }
    match probe.local_addr() {
        Ok(SocketAddr::V4(addr)) => *addr.ip(),
        _ => Ipv4Addr::UNSPECIFIED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_inside_configured_range() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .unwrap();
        let _enter = rt.enter();

        let socket = bind_from_range(42100, 42110).unwrap();
        let port = socket.local_addr().unwrap().port();
        assert!((42100..=42110).contains(&port));

        // The taken port is skipped, not fatal.
        let second = bind_from_range(port, port + 1).unwrap();
        assert_ne!(second.local_addr().unwrap().port(), port);
    }

    #[test]
    fn ephemeral_bind_when_range_unset() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .unwrap();
        let _enter = rt.enter();
        let socket = bind_from_range(0, 0).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }
}
