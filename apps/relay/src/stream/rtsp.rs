//! RTSP upstream driver: timeshift URL rewriting, session setup, and the
//! two receive paths (UDP pair with reordering, TCP interleaved).

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use streamrelay_rtp::RtpHeader;
use streamrelay_rtsp::client::{RtspClient, RtspConfig as ClientConfig, RtspTransport};
use streamrelay_rtsp::framing::Frame;
use streamrelay_rtsp::timeshift::{self, TimeshiftContext};
use tokio::net::UdpSocket;
use tracing::{debug, trace};
use url::Url;

use crate::buffer::{BufferPool, BufferRef};
use crate::config::Config;
use crate::error::RelayError;
use crate::http::HttpRequest;
use crate::sendq::{ChunkData, ClientSink, Pump};
use crate::stream::multicast::{deliver, enqueue_counted};
use crate::stream::pipeline::{recv_pooled, RtpPipeline};
use crate::worker::Shutdown;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run(
    service_url: &Url,
    request: &HttpRequest,
    config: &Config,
    pool: BufferPool,
    sink: &mut ClientSink,
    shutdown: &Shutdown,
) -> Result<(), RelayError> {
    let url = describe_url(service_url, request, config);
    let npt_start = request
        .query_param("r2h-start")
        .and_then(|v| v.parse::<f64>().ok());

    let mut client_config = ClientConfig::new(url);
    client_config.request_timeout = config.rtsp.request_timeout();
    client_config.port_start = config.rtsp.port_start;
    client_config.stun_server = config.rtsp.stun_server;

    let mut client = RtspClient::connect(client_config).await?;
    let result = drive(&mut client, config, pool, sink, npt_start, shutdown).await;
    client.teardown().await;
    result
}

async fn drive(
    client: &mut RtspClient,
    config: &Config,
    pool: BufferPool,
    sink: &mut ClientSink,
    npt_start: Option<f64>,
    shutdown: &Shutdown,
) -> Result<(), RelayError> {
    client.describe().await?;
    let transport = client.setup().await?;
    client.play(npt_start).await?;

    match transport {
        RtspTransport::Udp {
            rtp_socket,
            rtcp_socket: _rtcp_socket,
        } => stream_udp(client, config, pool, sink, rtp_socket, shutdown).await,
        RtspTransport::TcpInterleaved {
            rtp_channel,
            rtcp_channel: _,
        } => stream_interleaved(client, sink, rtp_channel, shutdown).await,
    }
}

/// UDP transport: datagrams may reorder, so they go through the window.
async fn stream_udp(
    client: &mut RtspClient,
    config: &Config,
    pool: BufferPool,
    sink: &mut ClientSink,
    rtp_socket: UdpSocket,
    shutdown: &Shutdown,
) -> Result<(), RelayError> {
    enum Event {
        Pump(Pump),
        Datagram(Option<(BufferRef, SocketAddr)>),
        Control(Frame),
        Tick,
        Shutdown,
    }

    let mut pipeline = RtpPipeline::new(&config.reorder, None, None);
    let mut parsed = Vec::new();
    let mut emitted = Vec::new();
    let mut keepalive_at = Instant::now() + KEEPALIVE_INTERVAL;

    loop {
        let deadline = pipeline
            .poll_deadline()
            .map_or(keepalive_at, |d| d.min(keepalive_at));

        let event = tokio::select! {
            pump = sink.pump() => Event::Pump(pump?),
            received = recv_pooled(&rtp_socket, &pool) => Event::Datagram(received?),
            frame = client.read_frame() => Event::Control(frame?),
            _ = tokio::time::sleep_until(deadline.into()) => Event::Tick,
            _ = shutdown.wait() => Event::Shutdown,
        };

        let now = Instant::now();
        match event {
            Event::Pump(Pump::Disconnected) => return Err(RelayError::ClientGone),
            Event::Pump(Pump::Progress) => {}
            Event::Datagram(None) => {}
            Event::Datagram(Some((buffer, _from))) => {
                parsed.clear();
                emitted.clear();
                pipeline.parse(buffer, now, &mut parsed);
                for packet in parsed.drain(..) {
                    pipeline.push(packet, now, &mut emitted);
                }
                deliver(sink, &mut emitted, now)?;
            }
            Event::Control(frame) => {
                // Interleaved data is unexpected on a UDP session; control
                // messages are keepalive responses or server chatter.
                trace!(?frame, "control-connection frame during UDP streaming");
            }
            Event::Tick => {
                emitted.clear();
                pipeline.on_deadline(now, &mut emitted);
                deliver(sink, &mut emitted, now)?;
                if now >= keepalive_at {
                    keepalive_at = now + KEEPALIVE_INTERVAL;
                    client.options().await?;
                }
            }
            Event::Shutdown => return Ok(()),
        }
    }
}

/// TCP interleaved transport: frames arrive in order on the control
/// connection, so the payload goes straight through.
async fn stream_interleaved(
    client: &mut RtspClient,
    sink: &mut ClientSink,
    rtp_channel: u8,
    shutdown: &Shutdown,
) -> Result<(), RelayError> {
    enum Event {
        Pump(Pump),
        Control(Frame),
        Shutdown,
    }

    loop {
        let event = tokio::select! {
            pump = sink.pump() => Event::Pump(pump?),
            frame = client.read_frame() => Event::Control(frame?),
            _ = shutdown.wait() => Event::Shutdown,
        };

        let now = Instant::now();
        match event {
            Event::Pump(Pump::Disconnected) => return Err(RelayError::ClientGone),
            Event::Pump(Pump::Progress) => {}
            Event::Control(Frame::Data { channel, payload }) if channel == rtp_channel => {
                relay_interleaved_payload(sink, payload, now)?;
            }
            Event::Control(Frame::Data { channel, .. }) => {
                trace!(channel, "ignoring non-media interleaved frame");
            }
            Event::Control(Frame::Message(message)) => {
                debug!(?message, "control message during interleaved streaming");
            }
            Event::Shutdown => return Ok(()),
        }
    }
}

fn relay_interleaved_payload(
    sink: &mut ClientSink,
    frame: Bytes,
    now: Instant,
) -> Result<(), RelayError> {
    match RtpHeader::parse(&frame) {
        Ok(header) => {
            enqueue_counted(
                sink,
                ChunkData::Shared(frame),
                header.payload_offset,
                header.payload_len,
                now,
            )?;
            sink.try_flush().map_err(RelayError::Io)
        }
        Err(err) => {
            debug!(%err, "dropping invalid interleaved RTP frame");
            Ok(())
        }
    }
}

/// Apply timeshift translation to the upstream DESCRIBE URL: the seek
/// parameter from the client request is translated into the client's
/// timezone-corrected form and re-attached under the same name.
fn describe_url(service_url: &Url, request: &HttpRequest, config: &Config) -> Url {
    let mut url = service_url.clone();
    let request_seek_name = request.query_param("r2h-seek-name");
    let seek_name = request_seek_name
        .as_deref()
        .or(config.rtsp.seek_name.as_deref());
    let seek_names = timeshift::seek_param_names(seek_name);

    let seek = seek_names.iter().find_map(|name| {
        request
            .query_param(name)
            .map(|value| (name.to_string(), value))
    });
    let Some((name, raw)) = seek else {
        return url;
    };

    let offset = request
        .query_param("r2h-seek-offset")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(config.rtsp.seek_offset_secs);
    let tz = request
        .user_agent
        .as_deref()
        .and_then(timeshift::tz_offset_from_user_agent)
        .unwrap_or(0);
    let ctx = TimeshiftContext {
        tz_offset_hours: tz,
        seek_offset_secs: offset,
    };
    let translated = timeshift::translate_range(&raw, &ctx);
    debug!(%raw, %translated, "timeshift range translated");

    // Drop any stale copy of the seek parameters, keep everything else.
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !seek_names.contains(&key.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.set_query(None);
    if !kept.is_empty() {
        url.query_pairs_mut().extend_pairs(kept);
    }
    url.query_pairs_mut().append_pair(&name, &translated);
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    fn request(query: &str, user_agent: &str) -> HttpRequest {
        HttpRequest {
            method: Method::Get,
            path: "/rtsp/vod.example.com:554/ch1".into(),
            query: query.into(),
            host: None,
            user_agent: Some(user_agent.into()),
            cookie: None,
            accept: None,
            snapshot_header: false,
        }
    }

    #[test]
    fn playseek_translated_into_describe_url() {
        let config = Config::default();
        let service_url = Url::parse("rtsp://vod.example.com:554/ch1").unwrap();
        let req = request(
            "playseek=20240101120000-20240101130000",
            "Player/1.0 TZ/UTC+8",
        );
        let url = describe_url(&service_url, &req, &config);
        assert_eq!(
            url.query(),
            Some("playseek=20240101040000-20240101050000")
        );
    }

    #[test]
    fn seek_offset_param_applies() {
        let config = Config::default();
        let service_url = Url::parse("rtsp://vod.example.com/ch1?auth=tok").unwrap();
        let req = request("tvdr=1704110400-&r2h-seek-offset=-60", "Player/1.0");
        let url = describe_url(&service_url, &req, &config);
        let query = url.query().unwrap();
        assert!(query.contains("auth=tok"));
        assert!(query.contains("tvdr=1704110340-"));
    }

    #[test]
    fn request_level_seek_name_override() {
        let config = Config::default();
        let service_url = Url::parse("rtsp://vod.example.com/ch1").unwrap();
        let req = request(
            "r2h-seek-name=starttime&starttime=1704110400&r2h-seek-offset=60",
            "Player/1.0",
        );
        let url = describe_url(&service_url, &req, &config);
        assert!(
            url.query().unwrap().contains("starttime=1704110460-"),
            "{:?}",
            url.query()
        );
    }

    #[test]
    fn no_seek_param_leaves_url_alone() {
        let config = Config::default();
        let service_url = Url::parse("rtsp://vod.example.com/ch1?auth=tok").unwrap();
        let req = request("", "Player/1.0");
        let url = describe_url(&service_url, &req, &config);
        assert_eq!(url.query(), Some("auth=tok"));
    }
}
