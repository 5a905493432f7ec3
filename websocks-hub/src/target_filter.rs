//! Private/reserved IP range checks, ported from the client gateway's
//! module of the same name. The hub is not meant to be an open relay
//! into its own local network, so every OPEN request's destination is
//! checked here before dialing.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// True if `ip` falls in a private, loopback, link-local, CGNAT, or
/// otherwise non-globally-routable range.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}

fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    if octets[0] == 10 {
        return true;
    }
    if octets[0] == 172 && (16..=31).contains(&octets[1]) {
        return true;
    }
    if octets[0] == 192 && octets[1] == 168 {
        return true;
    }
    if octets[0] == 127 {
        return true;
    }
    if octets[0] == 169 && octets[1] == 254 {
        return true;
    }
    if octets[0] == 0 {
        return true;
    }
    if octets[0] == 100 && (64..=127).contains(&octets[1]) {
        return true;
    }
    if octets[0] == 192 && octets[1] == 0 && octets[2] == 0 {
        return true;
    }
    if octets[0] == 198 && (18..=19).contains(&octets[1]) {
        return true;
    }
    if octets[0] >= 240 {
        return true;
    }
    false
}

fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() {
        return true;
    }
    if ip.is_unspecified() {
        return true;
    }
    let segments = ip.segments();
    if segments[0] & 0xfe00 == 0xfc00 {
        return true;
    }
    if segments[0] & 0xffc0 == 0xfe80 {
        return true;
    }
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_ipv4(&v4);
    }
    false
}

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("target IP {0} is in a private/reserved range")]
    PrivateIp(IpAddr),
    #[error("DNS resolution failed for {0}")]
    DnsResolutionFailed(String),
    #[error("all resolved addresses for {0} are private/reserved")]
    NoPublicAddrs(String),
}

/// Resolve and reject private/reserved destinations. The hub has no
/// custom-nameserver config key (that's a client-gateway-only concern
/// per spec.md §6), so this always asks the system resolver.
pub async fn validate_target(host: &str, port: u16) -> Result<Vec<SocketAddr>, FilterError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(&ip) {
            return Err(FilterError::PrivateIp(ip));
        }
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| FilterError::DnsResolutionFailed(host.to_string()))?
        .collect();
    if resolved.is_empty() {
        return Err(FilterError::DnsResolutionFailed(host.to_string()));
    }

    let public: Vec<SocketAddr> = resolved
        .into_iter()
        .filter(|addr| !is_private_ip(&addr.ip()))
        .collect();
    if public.is_empty() {
        return Err(FilterError::NoPublicAddrs(host.to_string()));
    }
    Ok(public)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ipv4_ranges() {
        assert!(is_private_ip(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(is_private_ip(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
        assert!(is_private_ip(&IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
        assert!(!is_private_ip(&IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
    }

    #[tokio::test]
    async fn literal_private_ip_rejected_without_dns() {
        let result = validate_target("10.0.0.5", 80).await;
        assert!(matches!(result, Err(FilterError::PrivateIp(_))));
    }

    #[tokio::test]
    async fn literal_public_ip_allowed_without_dns() {
        let result = validate_target("1.1.1.1", 443).await.unwrap();
        assert_eq!(result[0].ip(), IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)));
    }
}
