//! The proxy/direct decision described in spec §4.3: policy override,
//! private-address short-circuit, then rule-engine verdict, with `Auto`
//! falling through to a direct-dial race the caller drives.

use std::net::IpAddr;

use crate::config::ProxyPolicy;
use crate::rule::RuleSet;
use crate::target_filter::is_private_ip;

/// What the caller should do next for a given destination host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Dial the destination directly, no tunnel involved.
    Direct,
    /// Acquire a tunnel and relay through it.
    Tunnel,
    /// Policy is `Auto` and no rule/learned-set entry was conclusive:
    /// race a direct dial against the configured timeout, falling back
    /// to `Tunnel` (and learning the host) on failure.
    AutoRace,
}

pub fn classify(host: &str, policy: ProxyPolicy, rules: &RuleSet) -> Route {
    match policy {
        ProxyPolicy::Proxy => return Route::Tunnel,
        ProxyPolicy::Direct => return Route::Direct,
        _ => {}
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(&ip) {
            return Route::Direct;
        }
    }

    if rules.has_learned(host) {
        return Route::Tunnel;
    }

    match rules.judge(host) {
        Some(true) => Route::Tunnel,
        Some(false) => Route::Direct,
        None => match policy {
            ProxyPolicy::Black => Route::Direct,
            ProxyPolicy::White => Route::Tunnel,
            ProxyPolicy::Auto => Route::AutoRace,
            ProxyPolicy::Proxy | ProxyPolicy::Direct => unreachable!("handled above"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_rules() -> RuleSet {
        RuleSet::empty()
    }

    #[test]
    fn proxy_policy_always_tunnels() {
        let rules = empty_rules();
        assert_eq!(classify("example.com", ProxyPolicy::Proxy, &rules), Route::Tunnel);
    }

    #[test]
    fn direct_policy_always_direct() {
        let rules = empty_rules();
        assert_eq!(classify("example.com", ProxyPolicy::Direct, &rules), Route::Direct);
    }

    #[test]
    fn private_literal_is_always_direct_even_under_auto() {
        let rules = empty_rules();
        assert_eq!(classify("10.0.0.5", ProxyPolicy::Auto, &rules), Route::Direct);
    }

    #[test]
    fn learned_host_short_circuits_to_tunnel() {
        let rules = empty_rules();
        rules.learn("learned.example.com");
        assert_eq!(
            classify("learned.example.com", ProxyPolicy::Auto, &rules),
            Route::Tunnel
        );
    }

    #[test]
    fn unknown_host_under_auto_races() {
        let rules = empty_rules();
        assert_eq!(classify("unknown.example.com", ProxyPolicy::Auto, &rules), Route::AutoRace);
    }

    #[test]
    fn unknown_host_under_black_is_direct() {
        let rules = empty_rules();
        assert_eq!(classify("unknown.example.com", ProxyPolicy::Black, &rules), Route::Direct);
    }

    #[test]
    fn unknown_host_under_white_is_tunnel() {
        let rules = empty_rules();
        assert_eq!(classify("unknown.example.com", ProxyPolicy::White, &rules), Route::Tunnel);
    }
}
