//! Private/reserved IP range checks shared by the client gateway and the
//! hub, plus a small TTL-bounded DNS cache.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::dns::Resolver;

/// True if `ip` falls in a private, loopback, link-local, CGNAT, or
/// otherwise non-globally-routable range. Auto-mode and the hub both
/// treat such destinations as "always direct" / "never relay".
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

struct DnsCacheEntry {
    addrs: Arc<Vec<SocketAddr>>,
    expires_at: Instant,
    inserted_at: Instant,
}

/// TTL + capacity bounded cache of validated, public resolved addresses.
pub struct DnsCache {
    ttl: Duration,
    capacity: usize,
    entries: RwLock<HashMap<String, DnsCacheEntry>>,
}

impl DnsCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, host: &str, port: u16) -> Option<Arc<Vec<SocketAddr>>> {
        if self.capacity == 0 || self.ttl.is_zero() {
            return None;
        }
        let key = Self::key(host, port);
        let now = Instant::now();
        let entries = self.entries.read().await;
        match entries.get(&key) {
            Some(entry) if entry.expires_at > now => Some(Arc::clone(&entry.addrs)),
            _ => None,
        }
    }

    pub async fn insert(&self, host: &str, port: u16, addrs: Arc<Vec<SocketAddr>>) {
        if self.capacity == 0 || self.ttl.is_zero() || addrs.is_empty() {
            return;
        }
        let key = Self::key(host, port);
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.expires_at > now);
        while entries.len() >= self.capacity {
            let oldest_key = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone());
            match oldest_key {
                Some(key) => entries.remove(&key),
                None => break,
            };
        }
        entries.insert(
            key,
            DnsCacheEntry {
                addrs,
                expires_at: now + self.ttl,
                inserted_at: now,
            },
        );
    }

    fn key(host: &str, port: u16) -> String {
        format!("{}:{}", host.to_ascii_lowercase(), port)
    }
}

/// Resolve a hostname to its public (non-private) socket addresses,
/// consulting and populating `dns_cache`.
pub async fn resolve_public_addrs(
    host: &str,
    port: u16,
    resolver: &Resolver,
    dns_cache: &DnsCache,
) -> Result<Vec<SocketAddr>, FilterError> {
    if let Some(addrs) = dns_cache.get(host, port).await {
        return Ok((*addrs).clone());
    }

    let resolved = resolver
        .lookup(host, port)
        .await
        .map_err(|_| FilterError::DnsResolutionFailed(host.to_string()))?;

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

    let arc_addrs = Arc::new(public);
    dns_cache.insert(host, port, Arc::clone(&arc_addrs)).await;
    Ok((*arc_addrs).clone())
}

/// Resolve and reject private/reserved destinations. Used by both the
/// gateway (before a direct dial) and the hub (before honoring OPEN).
pub async fn validate_target(
    host: &str,
    port: u16,
    resolver: &Resolver,
    dns_cache: &DnsCache,
) -> Result<Vec<SocketAddr>, FilterError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(&ip) {
            return Err(FilterError::PrivateIp(ip));
        }
        return Ok(vec![SocketAddr::new(ip, port)]);
    }
    resolve_public_addrs(host, port, resolver, dns_cache).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> DnsCache {
        DnsCache::new(Duration::from_secs(60), 128)
    }

    #[test]
    fn private_ipv4_ranges() {
        assert!(is_private_ip(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(is_private_ip(&IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1))));
        assert!(is_private_ip(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
        assert!(is_private_ip(&IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
        assert!(is_private_ip(&IpAddr::V4(Ipv4Addr::new(169, 254, 1, 1))));
        assert!(is_private_ip(&IpAddr::V4(Ipv4Addr::new(100, 64, 0, 1))));
        assert!(!is_private_ip(&IpAddr::V4(Ipv4Addr::new(
            100, 63, 255, 254
        ))));
        assert!(is_private_ip(&IpAddr::V4(Ipv4Addr::new(198, 18, 0, 1))));
        assert!(is_private_ip(&IpAddr::V4(Ipv4Addr::new(240, 0, 0, 1))));
        assert!(!is_private_ip(&IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
        assert!(!is_private_ip(&IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1))));
    }

    #[test]
    fn private_ipv6_ranges() {
        assert!(is_private_ip(&IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(is_private_ip(&IpAddr::V6(Ipv6Addr::UNSPECIFIED)));
        assert!(is_private_ip(&IpAddr::V6(Ipv6Addr::new(
            0xfc00, 0, 0, 0, 0, 0, 0, 1
        ))));
        assert!(is_private_ip(&IpAddr::V6(Ipv6Addr::new(
            0xfe80, 0, 0, 0, 0, 0, 0, 1
        ))));
    }

    #[tokio::test]
    async fn direct_literal_private_ip_rejected() {
        let cache = cache();
        let result =
            validate_target("127.0.0.1", 80, &Resolver::system(), &cache).await;
        assert!(matches!(result, Err(FilterError::PrivateIp(_))));
    }

    #[tokio::test]
    async fn direct_literal_public_ip_allowed() {
        let cache = cache();
        let result =
            validate_target("8.8.8.8", 443, &Resolver::system(), &cache).await;
        let addrs = result.unwrap();
        assert_eq!(addrs[0].ip(), IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[tokio::test]
    async fn cache_roundtrip_is_case_insensitive() {
        let cache = cache();
        let addrs = vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 443)];
        cache
            .insert("Example.COM", 443, Arc::new(addrs.clone()))
            .await;
        let cached = cache.get("example.com", 443).await.unwrap();
        assert_eq!(*cached, addrs);
    }
}
