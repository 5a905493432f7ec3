//! Per-connection tunnel session: read an OPEN frame, dial the target,
//! answer ALLOW/DENY, bridge bytes, then run the CLOSE handshake.
//!
//! Grounded on `original_source/websocks/server.py`'s `_link()`: one
//! logical tunnel per WebSocket, reused after a CLOSE/CLOSE round trip
//! so the client can open a new target over the same socket.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::protocol::{CloseNotice, ControlFrame, OpenAck};
use crate::target_filter::{self, FilterError};

const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(mut ws: WebSocket, peer: std::net::SocketAddr, connect_timeout: Duration) {
    loop {
        let open = match next_open(&mut ws).await {
            Ok(Some(open)) => open,
            Ok(None) => {
                debug!(%peer, "tunnel socket closed");
                return;
            }
            Err(e) => {
                debug!(%peer, error = %e, "tunnel socket errored waiting for OPEN");
                return;
            }
        };

        info!(%peer, host = %open.host, port = open.port, "tunnel OPEN");

        let outcome = dial(&open.host, open.port, connect_timeout).await;
        let upstream = match outcome {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%peer, host = %open.host, port = open.port, error = %e, "tunnel target rejected");
                if send_control(&mut ws, OpenAck::deny().into_message()).await.is_err() {
                    return;
                }
                continue;
            }
        };

        if send_control(&mut ws, OpenAck::allow().into_message()).await.is_err() {
            return;
        }

        match bridge(&mut ws, upstream).await {
            Ok(()) => {}
            Err(e) => {
                debug!(%peer, error = %e, "tunnel bridge ended with error");
                return;
            }
        }

        if !finish_close_handshake(&mut ws).await {
            return;
        }
    }
}

async fn next_open(ws: &mut WebSocket) -> anyhow::Result<Option<crate::protocol::OpenRequest>> {
    loop {
        let Some(msg) = ws.next().await else { return Ok(None) };
        match msg? {
            Message::Text(text) => match ControlFrame::decode(&text)? {
                ControlFrame::Open(req) => return Ok(Some(req)),
                ControlFrame::Close(_) => continue,
            },
            Message::Close(_) => return Ok(None),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Binary(_) => anyhow::bail!("unexpected binary frame before OPEN"),
        }
    }
}

async fn dial(host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream, FilterError> {
    let addrs = target_filter::validate_target(host, port).await?;
    for addr in addrs {
        let dial = tokio::time::timeout(connect_timeout, TcpStream::connect(addr));
        if let Ok(Ok(stream)) = dial.await {
            let _ = stream.set_nodelay(true);
            return Ok(stream);
        }
    }
    Err(FilterError::NoPublicAddrs(host.to_string()))
}

async fn send_control(
    ws: &mut WebSocket,
    msg: Result<Message, crate::protocol::ProtocolError>,
) -> Result<(), axum::Error> {
    ws.send(msg.expect("control frame serialization cannot fail")).await
}

/// Bridge bytes both ways until either side is done, then send our own
/// CLOSE notice. The peer's CLOSE reply (if any) is drained separately
/// by `finish_close_handshake` so a pipelined OPEN for the next tunnel
/// isn't swallowed here.
async fn bridge(ws: &mut WebSocket, upstream: TcpStream) -> anyhow::Result<()> {
    let (mut read_half, mut write_half) = upstream.into_split();
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            read = read_half.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                ws.send(crate::protocol::data_message(&buf[..n])).await?;
            }
            frame = ws.next() => {
                match frame {
                    Some(Ok(Message::Binary(data))) => {
                        write_half.write_all(&data).await?;
                    }
                    Some(Ok(Message::Text(text))) => match ControlFrame::decode(&text) {
                        Ok(ControlFrame::Close(_)) => break,
                        Ok(other) => {
                            anyhow::bail!("protocol violation: unexpected control frame during DATA phase: {other:?}")
                        }
                        Err(e) => return Err(e.into()),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    }

    let _ = write_half.shutdown().await;
    send_control(ws, CloseNotice::default().into_message()).await?;
    Ok(())
}

/// After sending our CLOSE, drain frames until the client's matching
/// CLOSE arrives (or the socket closes outright). Returns `false` if
/// the session should end rather than loop for another OPEN.
async fn finish_close_handshake(ws: &mut WebSocket) -> bool {
    let wait = tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(ControlFrame::Close(_)) = ControlFrame::decode(&text) {
                        return true;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return false,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return false,
            }
        }
    })
    .await;

    matches!(wait, Ok(true))
}
