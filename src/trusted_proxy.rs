//! Trusted-proxy parsing and client-IP extraction (part of C8).
//! Grounded on `sem_os_server::middleware::jwt::jwt_auth`'s pattern
//! of inspecting headers only after establishing trust in the caller.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use axum::http::HeaderMap;

use crate::config::IpStrategy;

#[derive(Debug, Clone, Copy)]
struct CidrPrefix {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrPrefix {
    fn contains(&self, addr: &IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(a)) => {
                let mask = v4_mask(self.prefix_len);
                u32::from(net) & mask == u32::from(*a) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(a)) => {
                let mask = v6_mask(self.prefix_len);
                u128::from(net) & mask == u128::from(*a) & mask
            }
            _ => false,
        }
    }
}

fn v4_mask(len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        u32::MAX << (32 - len as u32)
    }
}

fn v6_mask(len: u8) -> u128 {
    if len == 0 {
        0
    } else {
        u128::MAX << (128 - len as u32)
    }
}

/// Parsed set of trusted-proxy prefixes.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxySet {
    prefixes: Vec<CidrPrefix>,
}

impl TrustedProxySet {
    pub fn parse(entries: &[String]) -> Self {
        let mut prefixes = Vec::new();
        for entry in entries {
            match entry.as_str() {
                "loopback" => {
                    prefixes.push(cidr(Ipv4Addr::new(127, 0, 0, 0).into(), 8));
                    prefixes.push(cidr(Ipv6Addr::LOCALHOST.into(), 128));
                }
                "private" => {
                    prefixes.push(cidr(Ipv4Addr::new(10, 0, 0, 0).into(), 8));
                    prefixes.push(cidr(Ipv4Addr::new(172, 16, 0, 0).into(), 12));
                    prefixes.push(cidr(Ipv4Addr::new(192, 168, 0, 0).into(), 16));
                    prefixes.push(cidr(
                        "fc00::".parse::<Ipv6Addr>().unwrap().into(),
                        7,
                    ));
                    prefixes.push(cidr(
                        "fe80::".parse::<Ipv6Addr>().unwrap().into(),
                        10,
                    ));
                }
                other => match parse_literal_or_cidr(other) {
                    Some(p) => prefixes.push(p),
                    None => tracing::warn!(entry = other, "unparseable trusted-proxy entry, skipping"),
                },
            }
        }
        Self { prefixes }
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    fn contains(&self, addr: &IpAddr) -> bool {
        self.prefixes.iter().any(|p| p.contains(addr))
    }
}

fn cidr(network: IpAddr, prefix_len: u8) -> CidrPrefix {
    CidrPrefix { network, prefix_len }
}

fn parse_literal_or_cidr(s: &str) -> Option<CidrPrefix> {
    if let Some((addr, len)) = s.split_once('/') {
        let network: IpAddr = addr.parse().ok()?;
        let len: u8 = len.parse().ok()?;
        Some(cidr(network, len))
    } else {
        let network: IpAddr = s.parse().ok()?;
        let len = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Some(cidr(network, len))
    }
}

fn first_forwarded_token(value: &str) -> &str {
    value.split(',').next().unwrap_or(value).trim()
}

/// Client-IP extraction honoring the configured trust policy.
pub fn extract_client_ip(
    direct: SocketAddr,
    headers: &HeaderMap,
    strategy: IpStrategy,
    trusted: &TrustedProxySet,
    trusted_header: &str,
) -> IpAddr {
    let direct_ip = direct.ip();

    if strategy == IpStrategy::Direct || trusted.is_empty() {
        return direct_ip;
    }
    if !trusted.contains(&direct_ip) {
        return direct_ip;
    }

    let header_name = match strategy {
        IpStrategy::XForwardedFor => "x-forwarded-for",
        IpStrategy::RealIp => "x-real-ip",
        IpStrategy::Custom => trusted_header,
        IpStrategy::Direct => unreachable!(),
    };
    if header_name.is_empty() {
        return direct_ip;
    }

    match headers.get(header_name).and_then(|v| v.to_str().ok()) {
        Some(value) => {
            let token = first_forwarded_token(value);
            token.parse().unwrap_or(direct_ip)
        }
        None => direct_ip,
    }
}
