//! The single shared listener: accept loop, first-byte protocol sniff,
//! per-protocol greeter, policy decision, and dispatch to a direct dial
//! or a pooled tunnel.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bridge::bridge_direct;
use crate::http_greeter::{self, HttpError, ParsedRequest};
use crate::policy::{self, Route};
use crate::sniffer::{self, ProtocolKind};
use crate::socks::{self, SocksError};
use crate::state::AppState;
use crate::target_filter::{self, FilterError};
use crate::tunnel::{self, OpenOutcome};

pub async fn run(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "proxy listener started");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(state, stream).await {
                        debug!(peer = %peer, error = %e, "connection ended with error");
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("proxy listener shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(state: Arc<AppState>, mut stream: TcpStream) -> anyhow::Result<()> {
    match sniffer::sniff(&stream).await? {
        ProtocolKind::Socks5 => {
            let target = match socks::negotiate_socks5(&mut stream).await {
                Ok(t) => t,
                Err(SocksError::Io(e)) => return Err(e.into()),
                Err(_) => return Ok(()), // greeter already replied with an error code
            };
            route_and_serve(state, stream, target.host, target.port, Greeted::Socks5).await
        }
        ProtocolKind::Socks4 => {
            let target = match socks::negotiate_socks4(&mut stream).await {
                Ok(t) => t,
                Err(SocksError::Io(e)) => return Err(e.into()),
                Err(_) => return Ok(()),
            };
            route_and_serve(state, stream, target.host, target.port, Greeted::Socks4).await
        }
        ProtocolKind::Http => {
            let parsed = match http_greeter::parse_request(&mut stream).await {
                Ok(p) => p,
                Err(HttpError::UnsupportedCommand) => {
                    http_greeter::reply_status(&mut stream, 400, "Bad Request").await?;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            match parsed {
                ParsedRequest::Connect { host, port } => {
                    route_and_serve(state, stream, host, port, Greeted::HttpConnect).await
                }
                ParsedRequest::Forward { host, port, head } => {
                    route_and_serve(state, stream, host, port, Greeted::HttpForward(head)).await
                }
            }
        }
    }
}

/// Which greeter accepted the connection, kept around to format the
/// success/failure reply in its own wire format and, for HTTP absolute-URI
/// requests, to re-send the rewritten request head to the upstream.
enum Greeted {
    Socks5,
    Socks4,
    HttpConnect,
    HttpForward(Vec<u8>),
}

impl Greeted {
    async fn reply_success(&self, client: &mut TcpStream, host: &str, port: u16) -> std::io::Result<()> {
        match self {
            Greeted::Socks5 => socks::reply_socks5_success(client, host, port).await,
            Greeted::Socks4 => {
                socks::reply_socks4(client, true, port, socks::socks4_reply_octets(host)).await
            }
            Greeted::HttpConnect => http_greeter::reply_connect_success(client).await,
            Greeted::HttpForward(_) => Ok(()), // nothing to send on the client leg
        }
    }

    async fn reply_failure(&self, client: &mut TcpStream, host: &str, port: u16, timed_out: bool) -> std::io::Result<()> {
        match self {
            Greeted::Socks5 => socks::reply_socks5_failure(client, socks::SOCKS5_GENERAL_FAILURE).await,
            Greeted::Socks4 => {
                socks::reply_socks4(client, false, port, socks::socks4_reply_octets(host)).await
            }
            Greeted::HttpConnect | Greeted::HttpForward(_) => {
                let (status, reason) = if timed_out { (504, "Gateway Timeout") } else { (502, "Bad Gateway") };
                http_greeter::reply_status(client, status, reason).await
            }
        }
    }
}

async fn route_and_serve(
    state: Arc<AppState>,
    mut client: TcpStream,
    host: String,
    port: u16,
    greeted: Greeted,
) -> anyhow::Result<()> {
    let route = policy::classify(&host, state.config.proxy_policy, &state.rules);

    match route {
        Route::Direct => serve_direct(&state, client, host, port, greeted).await,
        Route::Tunnel => serve_tunnel(&state, client, host, port, greeted).await,
        Route::AutoRace => {
            let race = tokio::time::timeout(
                state.direct_race_timeout(),
                dial_direct(&state, &host, port),
            )
            .await;
            match race {
                Ok(Ok(mut upstream)) => {
                    if let Err(e) = write_forward_prefix(&greeted, &mut upstream).await {
                        warn!(%host, port, error = %e, "failed writing rewritten request head to direct upstream");
                        greeted.reply_failure(&mut client, &host, port, false).await?;
                        return Ok(());
                    }
                    greeted.reply_success(&mut client, &host, port).await?;
                    bridge_direct(client, upstream).await
                }
                Ok(Err(_)) | Err(_) => {
                    // Direct dial failed or timed out: fall back to the
                    // tunnel and remember the host so future requests skip
                    // the direct-dial race entirely.
                    state.rules.learn(&host);
                    serve_tunnel(&state, client, host, port, greeted).await
                }
            }
        }
    }
}

async fn serve_direct(
    state: &Arc<AppState>,
    mut client: TcpStream,
    host: String,
    port: u16,
    greeted: Greeted,
) -> anyhow::Result<()> {
    match tokio::time::timeout(state.connect_timeout(), dial_direct(state, &host, port)).await {
        Ok(Ok(mut upstream)) => {
            if let Err(e) = write_forward_prefix(&greeted, &mut upstream).await {
                warn!(%host, port, error = %e, "failed writing rewritten request head to direct upstream");
                greeted.reply_failure(&mut client, &host, port, false).await?;
                return Ok(());
            }
            greeted.reply_success(&mut client, &host, port).await?;
            bridge_direct(client, upstream).await
        }
        Ok(Err(e)) => {
            debug!(%host, port, error = %e, "direct dial failed");
            greeted.reply_failure(&mut client, &host, port, false).await?;
            Ok(())
        }
        Err(_) => {
            debug!(%host, port, "direct dial timed out");
            greeted.reply_failure(&mut client, &host, port, true).await?;
            Ok(())
        }
    }
}

async fn serve_tunnel(
    state: &Arc<AppState>,
    mut client: TcpStream,
    host: String,
    port: u16,
    greeted: Greeted,
) -> anyhow::Result<()> {
    let Some(pool) = state.pick_pool() else {
        greeted.reply_failure(&mut client, &host, port, false).await?;
        anyhow::bail!("no hub configured, cannot tunnel {host}:{port}");
    };

    match tunnel::open_tunnel(pool, &host, port).await {
        Ok(OpenOutcome::Allowed(mut handle)) => {
            if let Greeted::HttpForward(head) = &greeted {
                if let Err(e) = handle.send_prefix(head).await {
                    warn!(%host, port, error = %e, "failed writing rewritten request head into tunnel");
                    greeted.reply_failure(&mut client, &host, port, false).await?;
                    return Ok(());
                }
            }
            greeted.reply_success(&mut client, &host, port).await?;
            handle.bridge_and_close(client).await?;
            Ok(())
        }
        Ok(OpenOutcome::Denied) => {
            greeted.reply_failure(&mut client, &host, port, false).await?;
            Ok(())
        }
        Err(e) => {
            warn!(%host, port, error = %e, "tunnel open failed");
            greeted.reply_failure(&mut client, &host, port, false).await?;
            Ok(())
        }
    }
}

/// For an HTTP absolute-URI forward dialed directly (not through the
/// tunnel), the rewritten request head still has to reach the upstream
/// socket before the generic byte bridge takes over — `bridge_direct`
/// only relays whatever arrives on the sockets from here on, it never
/// saw the original request line the sniffer already consumed.
async fn write_forward_prefix(greeted: &Greeted, upstream: &mut TcpStream) -> std::io::Result<()> {
    if let Greeted::HttpForward(head) = greeted {
        use tokio::io::AsyncWriteExt;
        upstream.write_all(head).await?;
    }
    Ok(())
}

async fn dial_direct(state: &Arc<AppState>, host: &str, port: u16) -> Result<TcpStream, FilterError> {
    let addrs = target_filter::validate_target(host, port, &state.resolver, &state.dns_cache).await?;
    for addr in addrs {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return Ok(stream);
        }
    }
    Err(FilterError::NoPublicAddrs(host.to_string()))
}
