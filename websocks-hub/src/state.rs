//! Shared hub state handed to every request handler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::auth::Credential;
use crate::config::Config;

pub struct HubState {
    pub config: Arc<Config>,
    pub users: Vec<Credential>,
    active_sessions: AtomicU64,
}

impl HubState {
    pub fn new(config: Arc<Config>, users: Vec<Credential>) -> Self {
        Self { config, users, active_sessions: AtomicU64::new(0) }
    }

    pub fn session_started(&self) -> u64 {
        self.active_sessions.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn session_ended(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }
}
