//! Request -> service resolution.
//!
//! Order: exact match in the configured table first, then udpxy-compatible
//! URL templates when enabled, otherwise 404. Query parameters can attach
//! FCC and FEC descriptors to multicast services; the access token (when
//! configured) is accepted from a query parameter, a cookie or a User-Agent
//! marker.

use std::collections::HashMap;

use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::error::RelayError;
use crate::http::HttpRequest;
use crate::service::{parse_fcc_variant, parse_group_port, FccSpec, Service, Upstream};

pub const TOKEN_PARAM: &str = "r2h-token";

/// Query parameters the relay consumes; everything else is forwarded to
/// RTSP/HTTP upstreams untouched.
const CONSUMED_PARAMS: &[&str] = &[
    "fcc",
    "fcc-type",
    "fec",
    "snapshot",
    TOKEN_PARAM,
    "r2h-seek-name",
    "r2h-seek-offset",
    "r2h-start",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Stream(Service),
    Snapshot(Service),
    NotFound,
    Unauthorized,
    BadHost,
}

pub struct Dispatcher {
    table: HashMap<String, Service>,
    udpxy: bool,
    token: Option<String>,
    hostname: Option<String>,
}

impl Dispatcher {
    pub fn new(config: &Config) -> Result<Dispatcher, RelayError> {
        let mut table = HashMap::new();
        for entry in &config.services {
            let service = Service::from_entry(entry)?;
            if table.insert(service.path.clone(), service).is_some() {
                return Err(RelayError::Config(format!(
                    "duplicate service path '{}'",
                    entry.path
                )));
            }
        }
        Ok(Dispatcher {
            table,
            udpxy: config.server.udpxy,
            token: config.server.token.clone(),
            hostname: config.server.hostname.clone(),
        })
    }

    pub fn dispatch(&self, request: &HttpRequest) -> Dispatch {
        if let (Some(expected), Some(got)) = (self.hostname.as_deref(), request.hostname()) {
            if !expected.eq_ignore_ascii_case(got) {
                return Dispatch::BadHost;
            }
        }
        if !self.authorized(request) {
            return Dispatch::Unauthorized;
        }

        let Some(mut service) = self.resolve(request) else {
            return Dispatch::NotFound;
        };
        self.apply_query_descriptors(&mut service, request);

        if request.wants_snapshot() {
            Dispatch::Snapshot(service)
        } else {
            Dispatch::Stream(service)
        }
    }

    fn authorized(&self, request: &HttpRequest) -> bool {
        let Some(token) = self.token.as_deref() else {
            return true;
        };
        if request.query_param(TOKEN_PARAM).as_deref() == Some(token) {
            return true;
        }
        if let Some(cookie) = request.cookie.as_deref() {
            let found = cookie.split(';').any(|pair| {
                pair.trim()
                    .strip_prefix(TOKEN_PARAM)
                    .and_then(|rest| rest.strip_prefix('='))
                    == Some(token)
            });
            if found {
                return true;
            }
        }
        request
            .user_agent
            .as_deref()
            .is_some_and(|ua| ua.contains(token))
    }

    fn resolve(&self, request: &HttpRequest) -> Option<Service> {
        if let Some(service) = self.table.get(&request.path) {
            return Some(service.clone());
        }
        if self.udpxy {
            return self.resolve_udpxy(request);
        }
        None
    }

    fn resolve_udpxy(&self, request: &HttpRequest) -> Option<Service> {
        let path = request.path.as_str();

        if let Some(rest) = path.strip_prefix("/rtp/") {
            let (group, port) = parse_group_port(rest)?;
            return Some(Service {
                path: path.to_string(),
                upstream: Upstream::MulticastRtp {
                    group,
                    port,
                    fec_port: None,
                    source: None,
                    payload_type: None,
                },
                fcc: None,
            });
        }
        if let Some(rest) = path.strip_prefix("/udp/") {
            let (group, port) = parse_group_port(rest)?;
            return Some(Service {
                path: path.to_string(),
                upstream: Upstream::MulticastUdp { group, port },
                fcc: None,
            });
        }
        if let Some(rest) = path.strip_prefix("/rtsp/") {
            let url = self.upstream_url("rtsp", rest, request)?;
            return Some(Service {
                path: path.to_string(),
                upstream: Upstream::Rtsp { url },
                fcc: None,
            });
        }
        if let Some(rest) = path.strip_prefix("/http/") {
            let url = self.upstream_url("http", rest, request)?;
            return Some(Service {
                path: path.to_string(),
                upstream: Upstream::HttpProxy { url },
                fcc: None,
            });
        }
        None
    }

    /// `<host>[:<port>]/<path>` plus every query parameter the relay does
    /// not consume itself (auth tokens for the upstream survive the trip).
    fn upstream_url(&self, scheme: &str, rest: &str, request: &HttpRequest) -> Option<Url> {
        if rest.is_empty() {
            return None;
        }
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        let mut url = Url::parse(&format!("{scheme}://{authority}{path}")).ok()?;
        url.host_str()?;

        let passthrough: Vec<(String, String)> = request
            .query_pairs()
            .into_iter()
            .filter(|(name, _)| {
                !CONSUMED_PARAMS.contains(&name.as_str())
                    && !streamrelay_rtsp::timeshift::seek_param_names(None)
                        .contains(&name.as_str())
            })
            .collect();
        if !passthrough.is_empty() {
            url.query_pairs_mut().extend_pairs(passthrough);
        }
        Some(url)
    }

    /// `fcc=`, `fcc-type=`, `fec=` attach descriptors to multicast services.
    fn apply_query_descriptors(&self, service: &mut Service, request: &HttpRequest) {
        if let Upstream::MulticastRtp { fec_port, .. } = &mut service.upstream {
            if let Some(port) = request.query_param("fec").and_then(|v| v.parse().ok()) {
                *fec_port = Some(port);
            }
            if let Some(addr) = request.query_param("fcc") {
                match (
                    addr.parse(),
                    parse_fcc_variant(request.query_param("fcc-type").as_deref()),
                ) {
                    (Ok(server), Some(variant)) => {
                        service.fcc = Some(FccSpec { server, variant });
                    }
                    _ => debug!(%addr, "ignoring unparsable fcc descriptor"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use streamrelay_fcc::FccVariant;

    fn request(path_query: &str) -> HttpRequest {
        let (path, query) = match path_query.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (path_query.to_string(), String::new()),
        };
        HttpRequest {
            method: Method::Get,
            path,
            query,
            host: Some("gw.lan:5140".into()),
            user_agent: Some("Player/1.0".into()),
            cookie: None,
            accept: None,
            snapshot_header: false,
        }
    }

    fn dispatcher(config: &str) -> Dispatcher {
        let config: Config = toml::from_str(config).unwrap();
        Dispatcher::new(&config).unwrap()
    }

    #[test]
    fn configured_service_wins_over_templates() {
        let d = dispatcher(
            r#"
            [[services]]
            path = "rtp/239.1.1.1:5000"
            kind = "udp"
            address = "239.9.9.9:1234"
            "#,
        );
        match d.dispatch(&request("/rtp/239.1.1.1:5000")) {
            Dispatch::Stream(service) => {
                assert!(matches!(service.upstream, Upstream::MulticastUdp { .. }))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn udpxy_rtp_template() {
        let d = dispatcher("");
        match d.dispatch(&request("/rtp/239.1.1.1:5000")) {
            Dispatch::Stream(service) => {
                assert_eq!(
                    service.upstream,
                    Upstream::MulticastRtp {
                        group: "239.1.1.1".parse().unwrap(),
                        port: 5000,
                        fec_port: None,
                        source: None,
                        payload_type: None,
                    }
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dispatch_roundtrip_on_canonical_path() {
        let d = dispatcher("");
        let Dispatch::Stream(service) = d.dispatch(&request("/rtp/239.1.1.1:5000")) else {
            panic!()
        };
        let Dispatch::Stream(again) = d.dispatch(&request(&service.canonical_path())) else {
            panic!()
        };
        assert_eq!(service.upstream, again.upstream);
    }

    #[test]
    fn query_descriptors_attach() {
        let d = dispatcher("");
        let Dispatch::Stream(service) =
            d.dispatch(&request("/rtp/239.1.1.1:5000?fcc=10.0.0.1:15970&fcc-type=huawei&fec=5002"))
        else {
            panic!()
        };
        let fcc = service.fcc.unwrap();
        assert_eq!(fcc.variant, FccVariant::Huawei);
        assert_eq!(fcc.server.port(), 15970);
        assert!(matches!(
            service.upstream,
            Upstream::MulticastRtp {
                fec_port: Some(5002),
                ..
            }
        ));
    }

    #[test]
    fn unknown_path_is_not_found() {
        let d = dispatcher("");
        assert_eq!(d.dispatch(&request("/nope")), Dispatch::NotFound);
        assert_eq!(d.dispatch(&request("/rtp/10.0.0.1:5000")), Dispatch::NotFound);
    }

    #[test]
    fn udpxy_can_be_disabled() {
        let d = dispatcher("[server]\nudpxy = false\n");
        assert_eq!(
            d.dispatch(&request("/rtp/239.1.1.1:5000")),
            Dispatch::NotFound
        );
    }

    #[test]
    fn token_accepted_from_any_source() {
        let d = dispatcher("[server]\ntoken = \"sesame\"\n");

        assert_eq!(
            d.dispatch(&request("/rtp/239.1.1.1:5000")),
            Dispatch::Unauthorized
        );

        let ok = request("/rtp/239.1.1.1:5000?r2h-token=sesame");
        assert!(matches!(d.dispatch(&ok), Dispatch::Stream(_)));

        let mut with_cookie = request("/rtp/239.1.1.1:5000");
        with_cookie.cookie = Some("lang=en; r2h-token=sesame".into());
        assert!(matches!(d.dispatch(&with_cookie), Dispatch::Stream(_)));

        let mut with_ua = request("/rtp/239.1.1.1:5000");
        with_ua.user_agent = Some("Player/1.0 sesame".into());
        assert!(matches!(d.dispatch(&with_ua), Dispatch::Stream(_)));
    }

    #[test]
    fn hostname_mismatch_is_bad_request() {
        let d = dispatcher("[server]\nhostname = \"gw.lan\"\n");
        assert!(matches!(
            d.dispatch(&request("/rtp/239.1.1.1:5000")),
            Dispatch::Stream(_)
        ));

        let mut wrong = request("/rtp/239.1.1.1:5000");
        wrong.host = Some("other.lan".into());
        assert_eq!(d.dispatch(&wrong), Dispatch::BadHost);
    }

    #[test]
    fn rtsp_template_preserves_foreign_query() {
        let d = dispatcher("");
        let Dispatch::Stream(service) = d.dispatch(&request(
            "/rtsp/vod.example.com:554/ch1?auth=tok123&playseek=20240101120000&r2h-token=x",
        )) else {
            panic!()
        };
        let Upstream::Rtsp { url } = service.upstream else {
            panic!()
        };
        assert_eq!(url.host_str(), Some("vod.example.com"));
        assert_eq!(url.path(), "/ch1");
        let q = url.query().unwrap();
        assert!(q.contains("auth=tok123"));
        assert!(!q.contains("playseek"), "seek params are re-added translated");
        assert!(!q.contains("r2h-token"));
    }

    #[test]
    fn snapshot_request_routes_to_snapshot() {
        let d = dispatcher("");
        let req = request("/rtp/239.1.1.1:5000?snapshot=1");
        assert!(matches!(d.dispatch(&req), Dispatch::Snapshot(_)));
    }
}
