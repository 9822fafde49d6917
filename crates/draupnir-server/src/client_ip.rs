//! Working out which address a request really came from

use axum::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use std::convert::Infallible;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use tracing::warn;

use crate::AppState;

/// An address block such as `10.0.0.0/8`. A bare address is a single host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpCidr {
    network: IpAddr,
    prefix: u8,
}

impl IpCidr {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                prefix_matches(u32::from(net).into(), u32::from(ip).into(), self.prefix, 32)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                prefix_matches(u128::from(net), u128::from(ip), self.prefix, 128)
            }
            _ => false,
        }
    }
}

fn prefix_matches(network: u128, ip: u128, prefix: u8, width: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let shift = u32::from(width - prefix);
    (network >> shift) == (ip >> shift)
}

impl FromStr for IpCidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let network: IpAddr = addr.parse().map_err(|_| format!("invalid address in {s:?}"))?;
        let width = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= width)
                .ok_or_else(|| format!("invalid prefix length in {s:?}"))?,
            None => width,
        };
        Ok(Self { network, prefix })
    }
}

impl fmt::Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// How to pick the client address out of a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIpConfig {
    pub use_x_forwarded_for: bool,
    pub trusted_proxies: Vec<IpCidr>,
}

/// Resolve the client address.
///
/// With forwarding enabled the right-most `X-Forwarded-For` entry that is a
/// valid address outside every trusted proxy range wins. Otherwise, or when no
/// such entry exists, the peer address of the connection is used.
pub fn resolve(headers: &HeaderMap, peer: Option<IpAddr>, config: &ClientIpConfig) -> Option<IpAddr> {
    if config.use_x_forwarded_for {
        let forwarded = headers
            .get_all("x-forwarded-for")
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| match entry.parse::<IpAddr>() {
                Ok(ip) => Some(ip.to_canonical()),
                Err(_) => {
                    warn!(entry, "ignoring invalid address in X-Forwarded-For");
                    None
                }
            })
            .filter(|ip| !config.trusted_proxies.iter().any(|cidr| cidr.contains(ip)))
            .last();
        if forwarded.is_some() {
            return forwarded;
        }
    }
    peer.map(|ip| ip.to_canonical())
}

/// Extractor yielding the resolved client address, if one could be found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub Option<IpAddr>);

#[async_trait]
impl FromRequestParts<AppState> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        Ok(ClientIp(resolve(&parts.headers, peer, &state.client_ip)))
    }
}

/// Parse a comma-separated list of CIDRs
pub fn parse_cidrs(list: &str) -> Result<Vec<IpCidr>, String> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(IpCidr::from_str)
        .collect()
}
