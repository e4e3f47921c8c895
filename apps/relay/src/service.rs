//! Service model: what one client streams and where it comes from.

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};

use streamrelay_fcc::FccVariant;
use url::Url;

use crate::config::{ServiceEntry, ServiceKind};
use crate::error::RelayError;

/// Upstream plan for one service.
#[derive(Debug, Clone, PartialEq)]
pub enum Upstream {
    MulticastRtp {
        group: Ipv4Addr,
        port: u16,
        fec_port: Option<u16>,
        source: Option<IpAddr>,
        payload_type: Option<u8>,
    },
    MulticastUdp {
        group: Ipv4Addr,
        port: u16,
    },
    Rtsp {
        url: Url,
    },
    HttpProxy {
        url: Url,
    },
}

/// Fast-channel-change descriptor attached to a multicast service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FccSpec {
    pub server: SocketAddrV4,
    pub variant: FccVariant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    /// Canonical URL path this service answers under.
    pub path: String,
    pub upstream: Upstream,
    pub fcc: Option<FccSpec>,
}

impl Service {
    /// Build a service from a configured table entry. Fails loudly at
    /// startup; a table that cannot be served must not reach the workers.
    pub fn from_entry(entry: &ServiceEntry) -> Result<Service, RelayError> {
        let bad = |what: &str| {
            RelayError::Config(format!("service '{}': {what}", entry.path))
        };

        let upstream = match entry.kind {
            ServiceKind::Rtp => {
                let (group, port) = parse_group_port(&entry.address)
                    .ok_or_else(|| bad("address must be <multicast-ip>:<port>"))?;
                Upstream::MulticastRtp {
                    group,
                    port,
                    fec_port: entry.fec_port,
                    source: entry.source,
                    payload_type: entry.payload_type,
                }
            }
            ServiceKind::Udp => {
                let (group, port) = parse_group_port(&entry.address)
                    .ok_or_else(|| bad("address must be <multicast-ip>:<port>"))?;
                Upstream::MulticastUdp { group, port }
            }
            ServiceKind::Rtsp => {
                let url = Url::parse(&entry.address).map_err(|_| bad("bad RTSP URL"))?;
                if url.scheme() != "rtsp" {
                    return Err(bad("URL scheme must be rtsp"));
                }
                Upstream::Rtsp { url }
            }
            ServiceKind::Http => {
                let url = Url::parse(&entry.address).map_err(|_| bad("bad HTTP URL"))?;
                if url.scheme() != "http" {
                    return Err(bad("URL scheme must be http (no TLS)"));
                }
                Upstream::HttpProxy { url }
            }
        };

        let fcc = match &entry.fcc {
            Some(addr) => Some(FccSpec {
                server: addr
                    .parse()
                    .map_err(|_| bad("fcc must be <ip>:<port>"))?,
                variant: parse_fcc_variant(entry.fcc_type.as_deref())
                    .ok_or_else(|| bad("fcc_type must be telecom or huawei"))?,
            }),
            None => None,
        };
        if fcc.is_some() && !matches!(upstream, Upstream::MulticastRtp { .. }) {
            return Err(bad("fcc only applies to rtp services"));
        }

        Ok(Service {
            path: format!("/{}", entry.path.trim_start_matches('/')),
            upstream,
            fcc,
        })
    }

    /// The canonical request path for this service. Paths produced here
    /// resolve back to an equivalent service when requested.
    pub fn canonical_path(&self) -> String {
        match &self.upstream {
            Upstream::MulticastRtp { group, port, .. } => format!("/rtp/{group}:{port}"),
            Upstream::MulticastUdp { group, port } => format!("/udp/{group}:{port}"),
            Upstream::Rtsp { url } => {
                let host = url.host_str().unwrap_or_default();
                let port = url.port().unwrap_or(554);
                format!("/rtsp/{host}:{port}{}", url.path())
            }
            Upstream::HttpProxy { url } => {
                let host = url.host_str().unwrap_or_default();
                match url.port() {
                    Some(port) => format!("/http/{host}:{port}{}", url.path()),
                    None => format!("/http/{host}{}", url.path()),
                }
            }
        }
    }
}

pub fn parse_fcc_variant(name: Option<&str>) -> Option<FccVariant> {
    match name {
        None => Some(FccVariant::Telecom),
        Some(s) if s.eq_ignore_ascii_case("telecom") => Some(FccVariant::Telecom),
        Some(s) if s.eq_ignore_ascii_case("huawei") => Some(FccVariant::Huawei),
        _ => None,
    }
}

pub fn parse_group_port(s: &str) -> Option<(Ipv4Addr, u16)> {
    let (ip, port) = s.rsplit_once(':')?;
    let group: Ipv4Addr = ip.parse().ok()?;
    if !group.is_multicast() {
        return None;
    }
    Some((group, port.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: ServiceKind, address: &str) -> ServiceEntry {
        ServiceEntry {
            path: "ch".into(),
            kind,
            address: address.into(),
            fcc: None,
            fcc_type: None,
            fec_port: None,
            payload_type: None,
            source: None,
        }
    }

    #[test]
    fn builds_multicast_service() {
        let service = Service::from_entry(&entry(ServiceKind::Rtp, "239.1.1.1:5000")).unwrap();
        assert_eq!(service.path, "/ch");
        assert!(matches!(
            service.upstream,
            Upstream::MulticastRtp { port: 5000, .. }
        ));
        assert_eq!(service.canonical_path(), "/rtp/239.1.1.1:5000");
    }

    #[test]
    fn rejects_unicast_group() {
        assert!(Service::from_entry(&entry(ServiceKind::Rtp, "10.0.0.1:5000")).is_err());
    }

    #[test]
    fn fcc_requires_rtp() {
        let mut e = entry(ServiceKind::Udp, "239.1.1.1:5000");
        e.fcc = Some("10.0.0.1:15970".into());
        assert!(Service::from_entry(&e).is_err());

        let mut e = entry(ServiceKind::Rtp, "239.1.1.1:5000");
        e.fcc = Some("10.0.0.1:15970".into());
        e.fcc_type = Some("huawei".into());
        let service = Service::from_entry(&e).unwrap();
        assert_eq!(service.fcc.unwrap().variant, FccVariant::Huawei);
    }

    #[test]
    fn rtsp_url_scheme_enforced() {
        assert!(Service::from_entry(&entry(ServiceKind::Rtsp, "http://x/y")).is_err());
        let service =
            Service::from_entry(&entry(ServiceKind::Rtsp, "rtsp://vod.example.com:554/ch1"))
                .unwrap();
        assert_eq!(service.canonical_path(), "/rtsp/vod.example.com:554/ch1");
    }
}
