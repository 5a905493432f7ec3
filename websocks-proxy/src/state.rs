//! Shared application state passed to the listener and every connection
//! task it spawns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::dns::Resolver;
use crate::pool::Pool;
use crate::rule::RuleSet;
use crate::target_filter::DnsCache;

/// Everything a connection-handling task needs, cloned once per accept
/// via `Arc`.
pub struct AppState {
    pub config: Arc<Config>,
    pub rules: Arc<RuleSet>,
    pub resolver: Arc<Resolver>,
    pub dns_cache: Arc<DnsCache>,
    pools: Vec<Arc<Pool>>,
    next_pool: AtomicUsize,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        rules: Arc<RuleSet>,
        resolver: Arc<Resolver>,
        pools: Vec<Arc<Pool>>,
    ) -> Self {
        Self {
            config,
            rules,
            resolver,
            dns_cache: Arc::new(DnsCache::new(Duration::from_secs(60), 4096)),
            pools,
            next_pool: AtomicUsize::new(0),
        }
    }

    pub fn direct_race_timeout(&self) -> Duration {
        Duration::from_millis(self.config.direct_race_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.config.connect_timeout_secs)
    }

    /// Round-robin across configured hub targets. Every tunnel-mode
    /// config has at least one pool; callers may assume this is `Some`.
    pub fn pick_pool(&self) -> Option<&Arc<Pool>> {
        if self.pools.is_empty() {
            return None;
        }
        let idx = self.next_pool.fetch_add(1, Ordering::Relaxed) % self.pools.len();
        self.pools.get(idx)
    }

    pub fn pools(&self) -> &[Arc<Pool>] {
        &self.pools
    }
}
