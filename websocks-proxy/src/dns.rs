//! Hostname resolution, optionally pinned to operator-supplied nameservers.
//!
//! Plain `tokio::net::lookup_host` always asks the system resolver. When
//! the `nameservers` config key (spec §6) is set we want every lookup —
//! rule-engine short-circuits excepted — to go through those servers
//! instead, which `hickory-resolver` supports directly.

use std::net::{IpAddr, SocketAddr};

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;

/// Resolves hostnames to IP addresses, using a custom nameserver list when
/// one was configured and the system resolver otherwise.
pub enum Resolver {
    System,
    Custom(TokioAsyncResolver),
}

impl Resolver {
    pub fn system() -> Self {
        Self::System
    }

    /// Build a resolver that queries only the given nameserver IPs over
    /// both UDP and TCP on port 53.
    pub fn with_nameservers(servers: &[IpAddr]) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(servers, 53, true);
        let config = ResolverConfig::from_parts(None, vec![], group);
        let resolver = TokioAsyncResolver::tokio(config, ResolverOpts::default());
        Self::Custom(resolver)
    }

    pub async fn lookup(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        match self {
            Resolver::System => Ok(tokio::net::lookup_host((host, port)).await?.collect()),
            Resolver::Custom(resolver) => {
                let response = resolver.lookup_ip(host).await.map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
                })?;
                Ok(response
                    .iter()
                    .map(|ip| SocketAddr::new(ip, port))
                    .collect())
            }
        }
    }
}
