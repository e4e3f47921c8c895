// Copyright (C) 2025 streamrelay developers
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! RTSP request driver: DESCRIBE -> SETUP -> PLAY and idempotent TEARDOWN.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use rtsp_types::headers::{
    CSeq, RtpLowerTransport, RtpProfile, RtpTransport, RtpTransportParameters, Session, Transport,
    Transports, ACCEPT, CONTENT_BASE, CONTENT_LOCATION, RANGE, USER_AGENT,
};
use rtsp_types::{Message, Method, Request, Response, StatusCode, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

use crate::framing::{Frame, MessageDecoder};
use crate::{stun, RtspError};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RTSP_PORT: u16 = 554;
const MAX_BIND_PORT_RETRY: u16 = 100;
const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct RtspConfig {
    pub url: Url,
    pub user_agent: String,
    pub request_timeout: Duration,
    /// First local port to try for the RTP/RTCP pair; 0 = ephemeral.
    pub port_start: u16,
    /// Optional STUN server consulted before a UDP SETUP.
    pub stun_server: Option<SocketAddr>,
}

impl RtspConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            user_agent: concat!("streamrelay/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            port_start: 0,
            stun_server: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspSessionState {
    Init,
    Connected,
    Described,
    Setup,
    Playing,
    TornDown,
}

/// The transport negotiated by SETUP. For UDP the client owns the bound
/// socket pair and hands it to the ingest pipeline; for TCP the media
/// arrives as interleaved frames on the control connection.
#[derive(Debug)]
pub enum RtspTransport {
    Udp {
        rtp_socket: UdpSocket,
        rtcp_socket: Option<UdpSocket>,
    },
    TcpInterleaved {
        rtp_channel: u8,
        rtcp_channel: Option<u8>,
    },
}

pub struct RtspClient {
    stream: TcpStream,
    decoder: MessageDecoder,
    pending_data: VecDeque<(u8, Bytes)>,
    config: RtspConfig,
    cseq: u32,
    session: Option<Session>,
    state: RtspSessionState,
    content_base: Option<Url>,
    control_url: Url,
    teardown_sent: bool,
}

impl RtspClient {
    /// Open the control connection.
    pub async fn connect(config: RtspConfig) -> Result<Self, RtspError> {
        let host = config
            .url
            .host_str()
            .ok_or_else(|| RtspError::Protocol("URL has no host".into()))?
            .to_string();
        let port = config.url.port().unwrap_or(DEFAULT_RTSP_PORT);

        let stream = timeout(config.request_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| RtspError::Timeout(config.request_timeout))??;
        stream.set_nodelay(true)?;

        let control_url = config.url.clone();
        Ok(Self {
            stream,
            decoder: MessageDecoder::new(),
            pending_data: VecDeque::new(),
            config,
            cseq: 0,
            session: None,
            state: RtspSessionState::Connected,
            content_base: None,
            control_url,
            teardown_sent: false,
        })
    }

    pub fn state(&self) -> RtspSessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.0.as_str())
    }

    fn builder(&mut self, method: Method, uri: Url) -> rtsp_types::RequestBuilder {
        self.cseq += 1;
        let mut builder = Request::builder(method, Version::V1_0)
            .typed_header::<CSeq>(&self.cseq.into())
            .request_uri(uri)
            .header(USER_AGENT, self.config.user_agent.clone());
        if let Some(session) = &self.session {
            builder = builder.typed_header::<Session>(session);
        }
        builder
    }

    async fn send_request(
        &mut self,
        req: Request<Vec<u8>>,
    ) -> Result<Response<Vec<u8>>, RtspError> {
        let mut wire = Vec::new();
        Message::Request(req)
            .write(&mut wire)
            .map_err(|err| RtspError::Protocol(format!("failed to serialize request: {err}")))?;
        self.stream.write_all(&wire).await?;

        let deadline = self.config.request_timeout;
        timeout(deadline, self.read_response())
            .await
            .map_err(|_| RtspError::Timeout(deadline))?
    }

    async fn read_response(&mut self) -> Result<Response<Vec<u8>>, RtspError> {
        loop {
            while let Some(frame) = self.decoder.next()? {
                match frame {
                    Frame::Message(Message::Response(rsp)) => return Ok(rsp),
                    Frame::Message(Message::Request(req)) => {
                        debug!(method = ?req.method(), "ignoring server-initiated request");
                    }
                    Frame::Message(Message::Data(_)) => unreachable!("decoder yields Frame::Data"),
                    Frame::Data { channel, payload } => {
                        self.pending_data.push_back((channel, payload));
                    }
                }
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<(), RtspError> {
        let mut buf = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            return Err(RtspError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "RTSP connection closed",
            )));
        }
        self.decoder.extend(&buf[..n]);
        Ok(())
    }

    /// Next interleaved frame or control message after PLAY. This is the
    /// receive path in TCP-interleaved mode.
    pub async fn read_frame(&mut self) -> Result<Frame, RtspError> {
        if let Some((channel, payload)) = self.pending_data.pop_front() {
            return Ok(Frame::Data { channel, payload });
        }
        loop {
            if let Some(frame) = self.decoder.next()? {
                return Ok(frame);
            }
            self.fill().await?;
        }
    }

    fn check(rsp: &Response<Vec<u8>>, cseq: u32) -> Result<(), RtspError> {
        if rsp.status() != StatusCode::Ok {
            return Err(RtspError::Status {
                status: rsp.status().into(),
                reason: rsp.reason_phrase().to_string(),
            });
        }
        match rsp.typed_header::<CSeq>() {
            Ok(Some(v)) if *v != cseq => {
                return Err(RtspError::Protocol("CSeq does not match request".into()))
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => warn!("response without a valid CSeq, continuing"),
        }
        Ok(())
    }

    pub async fn options(&mut self) -> Result<(), RtspError> {
        let req = self
            .builder(Method::Options, self.config.url.clone())
            .build(Vec::new());
        let cseq = self.cseq;
        let rsp = self.send_request(req).await?;
        Self::check(&rsp, cseq)
    }

    /// DESCRIBE and derive the control URL from the SDP.
    pub async fn describe(&mut self) -> Result<sdp_types::Session, RtspError> {
        let req = self
            .builder(Method::Describe, self.config.url.clone())
            .header(ACCEPT, "application/sdp")
            .build(Vec::new());
        let cseq = self.cseq;
        let rsp = self.send_request(req).await?;
        Self::check(&rsp, cseq)?;

        self.content_base = rsp
            .header(&CONTENT_BASE)
            .or_else(|| rsp.header(&CONTENT_LOCATION))
            .and_then(|value| Url::parse(value.as_str()).ok());

        let sdp = sdp_types::Session::parse(rsp.body())?;
        self.control_url = self.resolve_control(&sdp);
        self.state = RtspSessionState::Described;
        Ok(sdp)
    }

    fn resolve_control(&self, sdp: &sdp_types::Session) -> Url {
        let base = self.content_base.as_ref().unwrap_or(&self.config.url);

        let control = sdp
            .medias
            .first()
            .and_then(|media| attr_value(&media.attributes, "control"))
            .or_else(|| attr_value(&sdp.attributes, "control"));

        match control {
            None | Some("*") => base.clone(),
            Some(control) => Url::parse(control)
                .or_else(|_| base.join(control))
                .unwrap_or_else(|_| base.clone()),
        }
    }

    /// SETUP with UDP preferred; accepts a TCP-interleaved counter-offer.
    pub async fn setup(&mut self) -> Result<RtspTransport, RtspError> {
        debug_assert_eq!(self.state, RtspSessionState::Described);

        let (rtp_socket, rtcp_socket) = bind_udp_pair(self.config.port_start).await?;
        let mut client_rtp_port = rtp_socket.local_addr()?.port();

        if let Some(stun_server) = self.config.stun_server {
            if let Some(mapped) = stun::discover_mapped_address(&rtp_socket, stun_server).await {
                client_rtp_port = mapped.port();
            }
        }

        let offer: Transports = [Transport::Rtp(RtpTransport {
            profile: RtpProfile::Avp,
            lower_transport: Some(RtpLowerTransport::Udp),
            params: RtpTransportParameters {
                unicast: true,
                client_port: Some((client_rtp_port, Some(client_rtp_port.wrapping_add(1)))),
                ..Default::default()
            },
        })]
        .as_slice()
        .into();

        let req = self
            .builder(Method::Setup, self.control_url.clone())
            .typed_header::<Transports>(&offer)
            .build(Vec::new());
        let cseq = self.cseq;
        let rsp = self.send_request(req).await?;

        if rsp.status() == StatusCode::UnsupportedTransport {
            debug!("server refused UDP transport, retrying interleaved");
            return self.setup_interleaved().await;
        }
        Self::check(&rsp, cseq)?;
        self.take_session(&rsp)?;

        match self.response_transport(&rsp)? {
            ResponseTransport::Interleaved { rtp, rtcp } => {
                // Server switched to TCP on its own; honor it.
                self.state = RtspSessionState::Setup;
                Ok(RtspTransport::TcpInterleaved {
                    rtp_channel: rtp,
                    rtcp_channel: rtcp,
                })
            }
            ResponseTransport::Udp => {
                self.state = RtspSessionState::Setup;
                Ok(RtspTransport::Udp {
                    rtp_socket,
                    rtcp_socket: Some(rtcp_socket),
                })
            }
        }
    }

    async fn setup_interleaved(&mut self) -> Result<RtspTransport, RtspError> {
        let offer: Transports = [Transport::Rtp(RtpTransport {
            profile: RtpProfile::Avp,
            lower_transport: Some(RtpLowerTransport::Tcp),
            params: RtpTransportParameters {
                unicast: true,
                interleaved: Some((0, Some(1))),
                ..Default::default()
            },
        })]
        .as_slice()
        .into();

        let req = self
            .builder(Method::Setup, self.control_url.clone())
            .typed_header::<Transports>(&offer)
            .build(Vec::new());
        let cseq = self.cseq;
        let rsp = self.send_request(req).await?;
        Self::check(&rsp, cseq)?;
        self.take_session(&rsp)?;

        match self.response_transport(&rsp)? {
            ResponseTransport::Interleaved { rtp, rtcp } => {
                self.state = RtspSessionState::Setup;
                Ok(RtspTransport::TcpInterleaved {
                    rtp_channel: rtp,
                    rtcp_channel: rtcp,
                })
            }
            ResponseTransport::Udp => Err(RtspError::TransportNegotiation),
        }
    }

    fn take_session(&mut self, rsp: &Response<Vec<u8>>) -> Result<(), RtspError> {
        if self.session.is_none() {
            match rsp.typed_header::<Session>() {
                Ok(Some(session)) => {
                    // Echo only the id; the timeout parameter stays server-side.
                    self.session = Some(Session(session.0.clone(), None));
                }
                Ok(None) => {
                    return Err(RtspError::Protocol("SETUP response without Session".into()))
                }
                Err(err) => {
                    return Err(RtspError::Protocol(format!("invalid Session header: {err}")))
                }
            }
        }
        Ok(())
    }

    fn response_transport(
        &self,
        rsp: &Response<Vec<u8>>,
    ) -> Result<ResponseTransport, RtspError> {
        let transports = match rsp.typed_header::<Transports>() {
            Ok(Some(t)) => t,
            // Some servers omit the Transport echo; assume our offer stood.
            Ok(None) => return Ok(ResponseTransport::Udp),
            Err(err) => {
                return Err(RtspError::Protocol(format!("invalid Transport header: {err}")))
            }
        };
        for transport in transports.iter() {
            let Transport::Rtp(t) = transport else {
                continue;
            };
            if let Some((rtp, rtcp)) = t.params.interleaved {
                return Ok(ResponseTransport::Interleaved { rtp, rtcp });
            }
            return Ok(ResponseTransport::Udp);
        }
        Err(RtspError::TransportNegotiation)
    }

    /// PLAY, optionally positioned with `Range: npt=<start>-`.
    pub async fn play(&mut self, npt_start: Option<f64>) -> Result<(), RtspError> {
        debug_assert_eq!(self.state, RtspSessionState::Setup);

        let mut builder = self.builder(Method::Play, self.control_url.clone());
        if let Some(start) = npt_start {
            builder = builder.header(RANGE, format!("npt={start}-"));
        }
        let req = builder.build(Vec::new());
        let cseq = self.cseq;
        let rsp = self.send_request(req).await?;
        Self::check(&rsp, cseq)?;
        self.state = RtspSessionState::Playing;
        Ok(())
    }

    /// Idempotent teardown. At most one TEARDOWN is put on the wire, and
    /// only once SETUP has succeeded; errors are swallowed since the
    /// connection is going away regardless.
    pub async fn teardown(&mut self) {
        let had_session = matches!(
            self.state,
            RtspSessionState::Setup | RtspSessionState::Playing
        );
        if had_session && !self.teardown_sent {
            self.teardown_sent = true;
            let req = self
                .builder(Method::Teardown, self.control_url.clone())
                .build(Vec::new());
            if let Err(err) = self.send_request(req).await {
                debug!(%err, "TEARDOWN failed, closing anyway");
            }
        }
        self.state = RtspSessionState::TornDown;
    }
}

enum ResponseTransport {
    Udp,
    Interleaved { rtp: u8, rtcp: Option<u8> },
}

fn attr_value<'a>(attributes: &'a [sdp_types::Attribute], name: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|a| a.attribute.eq_ignore_ascii_case(name))
        .and_then(|a| a.value.as_deref())
}

/// Bind an adjacent RTP/RTCP port pair, RTP on the even port.
async fn bind_udp_pair(port_start: u16) -> Result<(UdpSocket, UdpSocket), RtspError> {
    let mut attempt: u16 = 0;
    loop {
        let candidate = if port_start == 0 {
            0
        } else {
            port_start.saturating_add(attempt * 2) & !1
        };
        let rtp = match UdpSocket::bind(("0.0.0.0", candidate)).await {
            Ok(socket) => socket,
            Err(err) if attempt < MAX_BIND_PORT_RETRY => {
                debug!(candidate, %err, "RTP port busy");
                attempt += 1;
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        let rtp_port = rtp.local_addr()?.port();
        match UdpSocket::bind(("0.0.0.0", rtp_port.wrapping_add(1))).await {
            Ok(rtcp) => return Ok((rtp, rtcp)),
            Err(err) if attempt < MAX_BIND_PORT_RETRY => {
                debug!(rtp_port, %err, "adjacent RTCP port busy");
                attempt += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    async fn serve_one(
        listener: TcpListener,
        responses: Vec<String>,
    ) -> tokio::task::JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            let mut buf = vec![0u8; 65536];
            for response in responses {
                // Read until a blank line terminates the request head.
                let mut head = Vec::new();
                loop {
                    let n = sock.read(&mut buf).await.unwrap();
                    assert!(n > 0, "client hung up mid-request");
                    head.extend_from_slice(&buf[..n]);
                    if head.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                seen.push(String::from_utf8_lossy(&head).into_owned());
                sock.write_all(response.as_bytes()).await.unwrap();
            }
            seen
        })
    }

    fn rsp(cseq: u32, extra: &str, body: &str) -> String {
        format!(
            "RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\n{extra}Content-Length: {}\r\n\r\n{body}",
            body.len()
        )
    }

    #[tokio::test]
    async fn describe_setup_play_against_mock_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=ch\r\nt=0 0\r\nm=video 0 RTP/AVP 33\r\na=control:streamid=0\r\n";
        let server = serve_one(
            listener,
            vec![
                rsp(1, "Content-Type: application/sdp\r\n", sdp),
                rsp(
                    2,
                    "Session: 12345678\r\nTransport: RTP/AVP;unicast;client_port=40000-40001;server_port=6970-6971\r\n",
                    "",
                ),
                rsp(3, "Session: 12345678\r\nRange: npt=0.000-\r\n", ""),
                rsp(4, "Session: 12345678\r\n", ""),
            ],
        )
        .await;

        let url = Url::parse(&format!("rtsp://{addr}/live/ch1")).unwrap();
        let mut client = RtspClient::connect(RtspConfig::new(url)).await.unwrap();

        let sdp = client.describe().await.unwrap();
        assert_eq!(sdp.medias.len(), 1);
        assert!(client.control_url.as_str().ends_with("streamid=0"));

        let transport = client.setup().await.unwrap();
        assert!(matches!(transport, RtspTransport::Udp { .. }));
        assert_eq!(client.session_id(), Some("12345678"));

        client.play(None).await.unwrap();
        assert_eq!(client.state(), RtspSessionState::Playing);

        client.teardown().await;
        client.teardown().await; // idempotent
        assert_eq!(client.state(), RtspSessionState::TornDown);

        let seen = server.await.unwrap();
        assert_eq!(seen.len(), 4, "exactly one TEARDOWN on the wire");
        assert!(seen[0].starts_with("DESCRIBE"));
        assert!(seen[1].starts_with("SETUP"));
        assert!(seen[2].starts_with("PLAY"));
        assert!(seen[2].contains("Session: 12345678"));
        assert!(seen[3].starts_with("TEARDOWN"));
    }

    #[tokio::test]
    async fn play_with_npt_range() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=ch\r\nt=0 0\r\nm=video 0 RTP/AVP 33\r\n";
        let server = serve_one(
            listener,
            vec![
                rsp(1, "Content-Type: application/sdp\r\n", sdp),
                rsp(
                    2,
                    "Session: 99\r\nTransport: RTP/AVP;unicast;client_port=40000-40001\r\n",
                    "",
                ),
                rsp(3, "Session: 99\r\n", ""),
            ],
        )
        .await;

        let url = Url::parse(&format!("rtsp://{addr}/vod/movie")).unwrap();
        let mut client = RtspClient::connect(RtspConfig::new(url)).await.unwrap();
        client.describe().await.unwrap();
        client.setup().await.unwrap();
        client.play(Some(42.5)).await.unwrap();

        let seen = server.await.unwrap();
        assert!(seen[2].contains("Range: npt=42.5-"), "{}", seen[2]);
    }

    #[tokio::test]
    async fn teardown_before_setup_sends_nothing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = serve_one(listener, vec![]).await;

        let url = Url::parse(&format!("rtsp://{addr}/live/ch1")).unwrap();
        let mut client = RtspClient::connect(RtspConfig::new(url)).await.unwrap();
        client.teardown().await;
        assert_eq!(client.state(), RtspSessionState::TornDown);

        let seen = server.await.unwrap();
        assert!(seen.is_empty());
    }
}
