// Copyright (C) 2025 streamrelay developers
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Sans-I/O FCC session state machine.
//!
//! The relay owns the unicast socket and the timers; the session consumes
//! parsed wall-clock instants and datagrams and emits [`Action`]s. Nothing
//! here blocks or sleeps, which is also what makes channel-change behavior
//! testable without a carrier network.
//!
//! ```text
//! Init -start-> RequestSent -ok-> UnicastStreaming -sync-> AwaitingMulticast
//!                  |  |                  |                       |
//!                  |  +-redirect(<=3)----+ (re-request)          v
//!                  +-timeout/error/declined/limit-----> Fallback | HandedOver
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::splice::{MulticastVerdict, SpliceFilter};
use crate::wire::{self, FccMessage, FccVariant, HuaweiMode, TelecomAction};

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(80);
pub const DEFAULT_HANDOVER_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_NAT_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_REDIRECTS: u8 = 3;

#[derive(Debug, Clone)]
pub struct FccConfig {
    pub variant: FccVariant,
    pub server: SocketAddrV4,
    pub response_timeout: Duration,
    pub handover_timeout: Duration,
    pub nat_keepalive_interval: Duration,
    pub max_redirects: u8,
}

impl FccConfig {
    pub fn new(variant: FccVariant, server: SocketAddrV4) -> Self {
        Self {
            variant,
            server,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            handover_timeout: DEFAULT_HANDOVER_TIMEOUT,
            nat_keepalive_interval: DEFAULT_NAT_KEEPALIVE_INTERVAL,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }
}

/// Client-side identifiers baked into requests.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub ssrc: u32,
    pub stb_id: [u8; 16],
    pub local_ip: Ipv4Addr,
    /// Local UDP port the burst should be directed at.
    pub client_port: u16,
    pub mcast_ip: Ipv4Addr,
    pub mcast_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FccState {
    Init,
    RequestSent,
    UnicastStreaming,
    AwaitingMulticast,
    HandedOver,
    /// Burst abandoned; the client streams live multicast.
    Fallback,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    ResponseTimeout,
    ServerError(u8),
    ServerDeclinedBurst,
    RedirectLimit,
    HandoverTimeout,
    UpstreamClosed,
}

/// What the socket driver must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send { datagram: Vec<u8>, to: SocketAddrV4 },
    /// Join the multicast group now (idempotent for the driver).
    JoinMulticast,
    /// Burst finished cleanly at the splice point.
    Handover,
    /// Burst abandoned; stream live multicast from here on.
    Fallback(FallbackReason),
}

pub struct FccSession {
    config: FccConfig,
    params: SessionParams,
    state: FccState,
    splice: SpliceFilter,
    expected_first_seq: Option<u16>,
    server: SocketAddrV4,
    redirects: u8,
    deadline: Option<Instant>,
    keepalive_at: Option<Instant>,
    huawei_session: u16,
    termination_sent: bool,
    burst_packets: u64,
}

impl FccSession {
    pub fn new(config: FccConfig, params: SessionParams) -> Self {
        let server = config.server;
        Self {
            config,
            params,
            state: FccState::Init,
            splice: SpliceFilter::new(),
            expected_first_seq: None,
            server,
            redirects: 0,
            deadline: None,
            keepalive_at: None,
            huawei_session: 0,
            termination_sent: false,
            burst_packets: 0,
        }
    }

    pub fn state(&self) -> FccState {
        self.state
    }

    pub fn burst_packets(&self) -> u64 {
        self.burst_packets
    }

    /// Kick off the exchange: emits the dialect's request datagram.
    pub fn start(&mut self, now: Instant) -> Vec<Action> {
        debug_assert_eq!(self.state, FccState::Init);
        self.state = FccState::RequestSent;
        self.deadline = Some(now + self.config.response_timeout);
        vec![self.request()]
    }

    fn request(&self) -> Action {
        let datagram = match self.config.variant {
            FccVariant::Telecom => wire::telecom_request(
                self.params.ssrc,
                self.params.mcast_ip,
                self.params.mcast_port,
                self.params.client_port,
                &self.params.stb_id,
            ),
            FccVariant::Huawei => wire::huawei_request(
                self.params.ssrc,
                self.params.mcast_ip,
                self.params.local_ip,
                self.params.client_port,
                true,
            ),
        };
        Action::Send {
            datagram,
            to: self.server,
        }
    }

    fn termination(&self) -> Action {
        let datagram = match self.config.variant {
            FccVariant::Telecom => wire::telecom_termination(
                self.params.ssrc,
                self.params.mcast_ip,
                true,
                self.splice_point().unwrap_or(0),
            ),
            FccVariant::Huawei => wire::huawei_termination(
                self.params.ssrc,
                self.params.mcast_ip,
                self.splice_point().unwrap_or(0),
            ),
        };
        Action::Send {
            datagram,
            to: self.server,
        }
    }

    fn splice_point(&self) -> Option<u16> {
        // The filter owns the authoritative value; it is recorded on sync.
        self.expected_first_seq
    }

    fn fall_back(&mut self, reason: FallbackReason) -> Vec<Action> {
        debug!(?reason, "abandoning fast channel change");
        let mut actions = Vec::new();
        if matches!(
            self.state,
            FccState::UnicastStreaming | FccState::AwaitingMulticast
        ) && !self.termination_sent
        {
            self.termination_sent = true;
            actions.push(self.termination());
        }
        self.state = FccState::Fallback;
        self.splice.open();
        self.deadline = None;
        self.keepalive_at = None;
        actions.push(Action::JoinMulticast);
        actions.push(Action::Fallback(reason));
        actions
    }

    /// Feed a signalling datagram received on the unicast socket (the caller
    /// has already separated RTCP from RTP media with [`wire::is_feedback`]).
    pub fn handle_signal(&mut self, datagram: &[u8], now: Instant) -> Vec<Action> {
        let msg = match wire::parse(datagram) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(%err, "dropping undecodable FCC datagram");
                return Vec::new();
            }
        };

        match (self.state, msg) {
            (FccState::RequestSent, FccMessage::TelecomResponse(r)) => {
                if r.result != 0 {
                    return self.fall_back(FallbackReason::ServerError(r.result));
                }
                match r.action {
                    TelecomAction::JoinImmediately => {
                        self.fall_back(FallbackReason::ServerDeclinedBurst)
                    }
                    TelecomAction::Redirect => {
                        self.redirect(SocketAddrV4::new(r.server_ip, r.signal_port), now)
                    }
                    TelecomAction::StartUnicast => {
                        self.state = FccState::UnicastStreaming;
                        self.deadline = None;
                        vec![Action::JoinMulticast]
                    }
                }
            }
            (FccState::RequestSent, FccMessage::HuaweiResponse(r)) => {
                if r.result != 0 {
                    return self.fall_back(FallbackReason::ServerError(r.result));
                }
                match r.mode {
                    HuaweiMode::NoUnicast => self.fall_back(FallbackReason::ServerDeclinedBurst),
                    HuaweiMode::Redirect => {
                        self.redirect(SocketAddrV4::new(r.server_ip, r.server_port), now)
                    }
                    HuaweiMode::Unicast => {
                        self.state = FccState::UnicastStreaming;
                        self.deadline = None;
                        self.huawei_session = r.session_id;
                        let mut actions = vec![Action::JoinMulticast];
                        if r.nat {
                            self.keepalive_at = Some(now + self.config.nat_keepalive_interval);
                            actions.push(Action::Send {
                                datagram: wire::nat_keepalive(r.session_id).to_vec(),
                                to: self.server,
                            });
                        }
                        actions
                    }
                }
            }
            (
                FccState::UnicastStreaming,
                FccMessage::TelecomSync { first_mcast_seq }
                | FccMessage::HuaweiSync { first_mcast_seq },
            ) => {
                self.expected_first_seq = Some(first_mcast_seq);
                self.splice.set_splice_point(first_mcast_seq);
                self.state = FccState::AwaitingMulticast;
                self.deadline = Some(now + self.config.handover_timeout);
                Vec::new()
            }
            (
                FccState::UnicastStreaming | FccState::AwaitingMulticast,
                FccMessage::TelecomTermination { first_mcast_seq, .. }
                | FccMessage::HuaweiTermination { first_mcast_seq },
            ) => {
                // The server ended the burst on its own. Treat its sequence
                // hint as the splice point and wait for multicast.
                if self.expected_first_seq.is_none() {
                    self.expected_first_seq = Some(first_mcast_seq);
                    self.splice.set_splice_point(first_mcast_seq);
                }
                self.state = FccState::AwaitingMulticast;
                self.deadline = Some(now + self.config.handover_timeout);
                Vec::new()
            }
            (state, msg) => {
                debug!(?state, ?msg, "ignoring FCC message in this state");
                Vec::new()
            }
        }
    }

    fn redirect(&mut self, target: SocketAddrV4, now: Instant) -> Vec<Action> {
        self.redirects += 1;
        if self.redirects > self.config.max_redirects {
            return self.fall_back(FallbackReason::RedirectLimit);
        }
        debug!(%target, hop = self.redirects, "FCC redirect");
        self.server = target;
        self.deadline = Some(now + self.config.response_timeout);
        vec![self.request()]
    }

    /// The unicast socket failed or closed under us.
    pub fn on_upstream_error(&mut self) -> Vec<Action> {
        match self.state {
            FccState::RequestSent | FccState::UnicastStreaming | FccState::AwaitingMulticast => {
                self.fall_back(FallbackReason::UpstreamClosed)
            }
            _ => Vec::new(),
        }
    }

    /// Should this burst RTP packet reach the client?
    pub fn accept_burst(&mut self, seq: u16) -> bool {
        let deliver = matches!(
            self.state,
            FccState::UnicastStreaming | FccState::AwaitingMulticast
        ) && self.splice.accept_burst(seq);
        if deliver {
            self.burst_packets += 1;
        }
        deliver
    }

    /// Should this multicast RTP packet reach the client? May complete the
    /// handover, in which case the returned actions include the termination
    /// message for the server.
    pub fn accept_multicast(&mut self, seq: u16) -> (bool, Vec<Action>) {
        match self.splice.accept_multicast(seq) {
            MulticastVerdict::Deliver => (true, Vec::new()),
            MulticastVerdict::Drop => (false, Vec::new()),
            MulticastVerdict::Handover => {
                self.state = FccState::HandedOver;
                self.deadline = None;
                self.keepalive_at = None;
                let mut actions = Vec::new();
                if !self.termination_sent {
                    self.termination_sent = true;
                    actions.push(self.termination());
                }
                actions.push(Action::Handover);
                (true, actions)
            }
        }
    }

    /// Earliest instant at which [`FccSession::on_deadline`] must run.
    pub fn poll_deadline(&self) -> Option<Instant> {
        match (self.deadline, self.keepalive_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn on_deadline(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();

        if self.keepalive_at.is_some_and(|at| at <= now)
            && matches!(
                self.state,
                FccState::UnicastStreaming | FccState::AwaitingMulticast
            )
        {
            self.keepalive_at = Some(now + self.config.nat_keepalive_interval);
            actions.push(Action::Send {
                datagram: wire::nat_keepalive(self.huawei_session).to_vec(),
                to: self.server,
            });
        }

        if self.deadline.is_some_and(|at| at <= now) {
            match self.state {
                FccState::RequestSent => {
                    actions.extend(self.fall_back(FallbackReason::ResponseTimeout))
                }
                FccState::AwaitingMulticast => {
                    actions.extend(self.fall_back(FallbackReason::HandoverTimeout))
                }
                _ => self.deadline = None,
            }
        }

        actions
    }

    /// Idempotent cleanup: at most one termination message ever leaves the
    /// socket, and only from states where the server holds session state.
    pub fn teardown(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if matches!(
            self.state,
            FccState::RequestSent | FccState::UnicastStreaming | FccState::AwaitingMulticast
        ) && !self.termination_sent
        {
            self.termination_sent = true;
            actions.push(self.termination());
        }
        self.state = FccState::Terminated;
        self.deadline = None;
        self.keepalive_at = None;
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 15970);
    const MCAST: Ipv4Addr = Ipv4Addr::new(239, 1, 1, 1);

    fn params() -> SessionParams {
        SessionParams {
            ssrc: 0x5eed,
            stb_id: [7; 16],
            local_ip: Ipv4Addr::new(192, 168, 1, 50),
            client_port: 40000,
            mcast_ip: MCAST,
            mcast_port: 5000,
        }
    }

    fn telecom_session() -> FccSession {
        FccSession::new(FccConfig::new(FccVariant::Telecom, SERVER), params())
    }

    fn response(action: u8, ip: Ipv4Addr, signal_port: u16) -> Vec<u8> {
        let mut buf = vec![0x80 | 3, wire::RTCP_PT_FB, 0, 6];
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&MCAST.octets());
        buf.push(0); // result ok
        buf.push(action);
        buf.extend_from_slice(&signal_port.to_be_bytes());
        buf.extend_from_slice(&15971u16.to_be_bytes());
        buf.extend_from_slice(&30u16.to_be_bytes());
        buf.extend_from_slice(&ip.octets());
        buf.extend_from_slice(&[0u8; 4]);
        buf
    }

    fn sync(first: u16) -> Vec<u8> {
        let mut buf = vec![0x80 | 4, wire::RTCP_PT_FB, 0, 3];
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&MCAST.octets());
        buf.extend_from_slice(&first.to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf
    }

    fn sent_terminations(actions: &[Action]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, Action::Send { datagram, .. } if datagram[0] & 0x1f == 5))
            .count()
    }

    #[test]
    fn happy_path_splices_at_announced_sequence() {
        let mut s = telecom_session();
        let t0 = Instant::now();

        let actions = s.start(t0);
        assert!(matches!(&actions[..], [Action::Send { to, .. }] if *to == SERVER));

        let actions = s.handle_signal(&response(1, Ipv4Addr::UNSPECIFIED, 0), t0);
        assert_eq!(actions, vec![Action::JoinMulticast]);
        assert_eq!(s.state(), FccState::UnicastStreaming);

        // burst 95..=120, sync at 100
        for seq in 95..100u16 {
            assert!(s.accept_burst(seq));
        }
        let _ = s.handle_signal(&sync(100), t0);
        assert_eq!(s.state(), FccState::AwaitingMulticast);
        for seq in 100..121u16 {
            assert!(!s.accept_burst(seq), "burst must stop at splice point");
        }

        let (deliver, actions) = s.accept_multicast(100);
        assert!(deliver);
        assert_eq!(sent_terminations(&actions), 1);
        assert!(actions.contains(&Action::Handover));
        assert_eq!(s.state(), FccState::HandedOver);

        for seq in 101..200u16 {
            let (deliver, actions) = s.accept_multicast(seq);
            assert!(deliver);
            assert!(actions.is_empty());
        }
    }

    #[test]
    fn silent_server_falls_back() {
        let mut s = telecom_session();
        let t0 = Instant::now();
        s.start(t0);
        assert_eq!(s.poll_deadline(), Some(t0 + DEFAULT_RESPONSE_TIMEOUT));

        let actions = s.on_deadline(t0 + Duration::from_millis(100));
        assert!(actions.contains(&Action::JoinMulticast));
        assert!(actions.contains(&Action::Fallback(FallbackReason::ResponseTimeout)));
        assert_eq!(s.state(), FccState::Fallback);

        // live multicast flows regardless of sequence
        let (deliver, _) = s.accept_multicast(31000);
        assert!(deliver);
    }

    #[test]
    fn redirect_depth_three_accepted_four_falls_back() {
        let mut s = telecom_session();
        let t0 = Instant::now();
        s.start(t0);

        for hop in 1..=3u8 {
            let ip = Ipv4Addr::new(10, 0, 0, hop);
            let actions = s.handle_signal(&response(2, ip, 16000), t0);
            assert!(
                matches!(&actions[..], [Action::Send { to, .. }]
                    if *to == SocketAddrV4::new(ip, 16000)),
                "hop {hop} should re-request"
            );
            assert_eq!(s.state(), FccState::RequestSent);
        }

        let actions = s.handle_signal(&response(2, Ipv4Addr::new(10, 0, 0, 4), 16000), t0);
        assert!(actions.contains(&Action::Fallback(FallbackReason::RedirectLimit)));
        assert_eq!(s.state(), FccState::Fallback);
    }

    #[test]
    fn huawei_nat_keepalive_cadence() {
        let mut s = FccSession::new(FccConfig::new(FccVariant::Huawei, SERVER), params());
        let t0 = Instant::now();
        s.start(t0);

        let mut resp = vec![0x80 | 6, wire::RTCP_PT_FB, 0, 5];
        resp.extend_from_slice(&0u32.to_be_bytes());
        resp.extend_from_slice(&MCAST.octets());
        resp.extend_from_slice(&[0, 1, 1, 0]); // ok, unicast, nat
        resp.extend_from_slice(&SERVER.port().to_be_bytes());
        resp.extend_from_slice(&0xbeefu16.to_be_bytes());
        resp.extend_from_slice(&SERVER.ip().octets());

        let actions = s.handle_signal(&resp, t0);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Send { datagram, .. } if datagram[..2] == [0x00, 0x03]
        )));

        let next = s.poll_deadline().unwrap();
        assert_eq!(next, t0 + DEFAULT_NAT_KEEPALIVE_INTERVAL);
        let actions = s.on_deadline(next);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Send { datagram, .. } if datagram[..2] == [0x00, 0x03] && datagram[2..4] == [0xbe, 0xef]
        )));
        assert_eq!(
            s.poll_deadline().unwrap(),
            next + DEFAULT_NAT_KEEPALIVE_INTERVAL
        );
    }

    #[test]
    fn teardown_is_idempotent() {
        let mut s = telecom_session();
        let t0 = Instant::now();
        s.start(t0);
        s.handle_signal(&response(1, Ipv4Addr::UNSPECIFIED, 0), t0);

        let mut wire_terminations = sent_terminations(&s.teardown());
        for _ in 0..3 {
            wire_terminations += sent_terminations(&s.teardown());
        }
        assert_eq!(wire_terminations, 1);
        assert_eq!(s.state(), FccState::Terminated);
    }

    #[test]
    fn teardown_after_handover_sends_nothing() {
        let mut s = telecom_session();
        let t0 = Instant::now();
        s.start(t0);
        s.handle_signal(&response(1, Ipv4Addr::UNSPECIFIED, 0), t0);
        s.handle_signal(&sync(10), t0);
        let (_, actions) = s.accept_multicast(10);
        assert_eq!(sent_terminations(&actions), 1);

        assert_eq!(sent_terminations(&s.teardown()), 0);
    }

    #[test]
    fn server_termination_sets_splice_point() {
        let mut s = telecom_session();
        let t0 = Instant::now();
        s.start(t0);
        s.handle_signal(&response(1, Ipv4Addr::UNSPECIFIED, 0), t0);

        let term = wire::telecom_termination(1, MCAST, true, 500);
        s.handle_signal(&term, t0);
        assert_eq!(s.state(), FccState::AwaitingMulticast);
        assert!(!s.accept_burst(500));
        assert!(s.accept_burst(499));
        let (deliver, actions) = s.accept_multicast(500);
        assert!(deliver);
        assert!(actions.contains(&Action::Handover));
    }
}
