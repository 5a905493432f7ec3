//! Connection pool of established (but tunnel-idle) WebSocket sessions
//! to the hub. Target size N, idle set bounded at 2N, refilled and
//! trimmed on a periodic maintenance tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::config::HubTarget;
use crate::tunnel::client;

pub type TunnelSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const DEFAULT_TARGET_SIZE: usize = 7;
const MAINTENANCE_TICK: Duration = Duration::from_secs(7);
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Default)]
pub struct PoolMetrics {
    pub created_total: AtomicU64,
    pub dead_evicted_total: AtomicU64,
}

struct Inner {
    idle: Vec<TunnelSocket>,
    consecutive_failures: u32,
}

/// Pool of reusable tunnel connections to a single hub target.
pub struct Pool {
    target: HubTarget,
    target_size: usize,
    connector: Option<Arc<rustls::ClientConfig>>,
    inner: Mutex<Inner>,
    pub metrics: Arc<PoolMetrics>,
}

impl Pool {
    pub fn new(target: HubTarget, target_size: usize, connector: Option<Arc<rustls::ClientConfig>>) -> Arc<Self> {
        Arc::new(Self {
            target,
            target_size: target_size.max(1),
            connector,
            inner: Mutex::new(Inner {
                idle: Vec::new(),
                consecutive_failures: 0,
            }),
            metrics: Arc::new(PoolMetrics::default()),
        })
    }

    pub fn with_default_size(target: HubTarget, connector: Option<Arc<rustls::ClientConfig>>) -> Arc<Self> {
        Self::new(target, DEFAULT_TARGET_SIZE, connector)
    }

    /// Take an idle connection if one exists, probing it alive before
    /// handing it back so a caller never receives a connection that went
    /// dead between maintenance ticks. Dead entries are dropped and the
    /// next idle candidate is tried instead; callers that get `None`
    /// (idle set genuinely empty) should dial a fresh connection
    /// themselves rather than block — the background refill loop will
    /// restock.
    pub async fn try_acquire(&self) -> Option<TunnelSocket> {
        loop {
            let mut candidate = self.inner.lock().await.idle.pop()?;
            if probe_alive(&mut candidate).await {
                return Some(candidate);
            }
            self.metrics.dead_evicted_total.fetch_add(1, Ordering::Relaxed);
            debug!(target = %self.target.url, "dropped dead idle connection on acquire");
        }
    }

    /// Dial a brand new connection, independent of the idle set. Used
    /// both by the refill loop and by callers on a pool miss.
    pub async fn dial(&self) -> anyhow::Result<TunnelSocket> {
        let result = client::dial(&self.target, self.connector.clone()).await;
        let mut inner = self.inner.lock().await;
        match &result {
            Ok(_) => {
                inner.consecutive_failures = 0;
                self.metrics.created_total.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            }
        }
        result
    }

    /// Return a connection to the idle set after a tunnel session
    /// completes its CLOSE handshake, unless the idle set is already at
    /// the 2N cap.
    pub async fn release(&self, socket: TunnelSocket) {
        let mut inner = self.inner.lock().await;
        if inner.idle.len() < 2 * self.target_size {
            inner.idle.push(socket);
        }
        // else: drop it, it's surplus.
    }

    fn backoff_delay(consecutive_failures: u32) -> Duration {
        let mut delay = BACKOFF_INITIAL;
        for _ in 0..consecutive_failures.min(8) {
            delay = (delay * 2).min(BACKOFF_MAX);
        }
        delay
    }

    /// Background task: every tick, drop idle connections that have gone
    /// dead, trim surplus above 2N, and refill up to N.
    pub async fn run_maintenance(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(MAINTENANCE_TICK);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => return,
            }
            self.tick().await;
            if *shutdown.borrow() {
                return;
            }
        }
    }

    async fn tick(self: &Arc<Self>) {
        let mut idle = {
            let mut inner = self.inner.lock().await;
            std::mem::take(&mut inner.idle)
        };

        let mut alive = Vec::with_capacity(idle.len());
        let before = idle.len();
        for mut socket in idle.drain(..) {
            if probe_alive(&mut socket).await {
                alive.push(socket);
            }
        }
        let dead = before - alive.len();
        if dead > 0 {
            self.metrics
                .dead_evicted_total
                .fetch_add(dead as u64, Ordering::Relaxed);
            debug!(target = %self.target.url, dead, "evicted dead idle connections");
        }

        alive.truncate(2 * self.target_size);

        let (deficit, failures) = {
            let mut inner = self.inner.lock().await;
            inner.idle = alive;
            let deficit = self.target_size.saturating_sub(inner.idle.len());
            (deficit, inner.consecutive_failures)
        };

        if deficit == 0 {
            return;
        }
        if failures > 0 {
            tokio::time::sleep(Self::backoff_delay(failures)).await;
        }

        for _ in 0..deficit {
            match self.dial().await {
                Ok(socket) => {
                    self.inner.lock().await.idle.push(socket);
                    debug!(target = %self.target.url, "pool refilled one connection");
                }
                Err(e) => {
                    warn!(target = %self.target.url, error = %e, "pool refill dial failed");
                    break;
                }
            }
        }
    }

    pub async fn idle_len(&self) -> usize {
        self.inner.lock().await.idle.len()
    }
}

/// Send a WebSocket ping and wait briefly for any response frame. An idle
/// tunnel connection should answer with a Pong (tokio-tungstenite answers
/// pings automatically on the peer side); no answer within the timeout,
/// or a send error, means the socket is dead.
async fn probe_alive(socket: &mut TunnelSocket) -> bool {
    if socket.send(Message::Ping(Vec::new())).await.is_err() {
        return false;
    }
    matches!(
        tokio::time::timeout(PING_TIMEOUT, socket.next()).await,
        Ok(Some(Ok(_)))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// A bare-bones hub stand-in: accepts WebSocket upgrades and keeps
    /// reading from each one (so pings get auto-answered) until the
    /// client side goes away. Good enough to exercise warm-up/trim
    /// without a real tunnel server.
    async fn spawn_live_hub() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                        while ws.next().await.is_some() {}
                    }
                });
            }
        });
        addr
    }

    /// A hub stand-in that completes the WebSocket handshake and then
    /// immediately drops the connection without a close handshake,
    /// simulating a crashed/partitioned peer.
    async fn spawn_dying_hub() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                        drop(ws);
                    }
                });
            }
        });
        addr
    }

    fn target_for(addr: std::net::SocketAddr) -> HubTarget {
        HubTarget {
            url: format!("ws://{addr}"),
            username: None,
            password: None,
        }
    }

    #[tokio::test]
    async fn maintenance_tick_warms_up_to_target_size() {
        let addr = spawn_live_hub().await;
        let pool = Pool::new(target_for(addr), 3, None);
        pool.tick().await;
        assert_eq!(pool.idle_len().await, 3);
    }

    #[tokio::test]
    async fn maintenance_tick_trims_surplus_to_2n() {
        let addr = spawn_live_hub().await;
        let pool = Pool::new(target_for(addr), 3, None);
        // Seed past the 2N cap that `release()` would normally enforce, to
        // exercise the trim path in isolation.
        for _ in 0..10 {
            let ws = pool.dial().await.expect("dial succeeds against local test hub");
            pool.inner.lock().await.idle.push(ws);
        }
        assert_eq!(pool.idle_len().await, 10);
        pool.tick().await;
        assert_eq!(pool.idle_len().await, 6); // 2N with N=3
    }

    #[tokio::test]
    async fn try_acquire_never_returns_a_dead_connection() {
        let addr = spawn_dying_hub().await;
        let pool = Pool::new(target_for(addr), 1, None);
        let ws = pool.dial().await.expect("dial succeeds before the hub drops it");
        // Give the hub's side time to tear the connection down after the
        // handshake completes.
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.inner.lock().await.idle.push(ws);

        assert!(pool.try_acquire().await.is_none());
        assert_eq!(pool.idle_len().await, 0);
    }

    #[tokio::test]
    async fn try_acquire_returns_a_live_connection() {
        let addr = spawn_live_hub().await;
        let pool = Pool::new(target_for(addr), 1, None);
        let ws = pool.dial().await.expect("dial succeeds against local test hub");
        pool.inner.lock().await.idle.push(ws);

        assert!(pool.try_acquire().await.is_some());
        assert_eq!(pool.idle_len().await, 0);
    }
}

pub fn target_size_default() -> usize {
    DEFAULT_TARGET_SIZE
}
