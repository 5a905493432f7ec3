//! Bidirectional byte copying.
//!
//! Two shapes are needed: a plain TCP<->TCP bridge for direct dials, and
//! a TCP<->tunnel bridge where the far side is a binary WebSocket data
//! stream multiplexed with JSON control frames. Both follow the same
//! "only first to finish" discipline: two concurrent copy loops race,
//! whichever observes EOF/error first ends the bridge, and the other
//! side's write half is shut down rather than left to block forever on
//! a peer that will never read again.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::pool::TunnelSocket;
use crate::tunnel::protocol::{data_message, ControlFrame};

const BUF_SIZE: usize = 8 * 1024;

/// Copy bytes between two TCP connections until either side reaches EOF
/// or errors. Shuts down the write half of each peer before returning so
/// a caller observing the other direction still draining can do so
/// without a stuck write.
pub async fn bridge_direct(a: TcpStream, b: TcpStream) -> anyhow::Result<()> {
    let (mut a_read, mut a_write) = a.into_split();
    let (mut b_read, mut b_write) = b.into_split();

    let a_to_b = async {
        let mut buf = vec![0u8; BUF_SIZE];
        loop {
            let n = a_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            b_write.write_all(&buf[..n]).await?;
        }
        let _ = b_write.shutdown().await;
        Ok::<(), anyhow::Error>(())
    };

    let b_to_a = async {
        let mut buf = vec![0u8; BUF_SIZE];
        loop {
            let n = b_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            a_write.write_all(&buf[..n]).await?;
        }
        let _ = a_write.shutdown().await;
        Ok::<(), anyhow::Error>(())
    };

    tokio::select! {
        r = a_to_b => { debug!("client->upstream direction finished first"); r }
        r = b_to_a => { debug!("upstream->client direction finished first"); r }
    }
}

/// Whether the peer had already sent its CLOSE control frame by the time
/// the bridge tore down, so the caller knows whether a CLOSE drain is
/// still required before the tunnel's half of the handshake is sent.
pub struct BridgeOutcome {
    pub ws: TunnelSocket,
    pub peer_sent_close: bool,
    pub result: anyhow::Result<()>,
}

/// Runs an open tunnel's DATA phase until either the TCP side hits EOF,
/// the tunnel errors, or the peer sends a CLOSE control frame. Returns
/// the WebSocket reunited (not split) so the caller can continue the
/// CLOSE handshake described in the tunnel protocol.
pub async fn bridge_tunnel(tcp: TcpStream, ws: TunnelSocket) -> BridgeOutcome {
    let (mut tcp_read, mut tcp_write) = tcp.into_split();
    let (ws_sink, ws_stream) = ws.split();
    let mut ws_sink = ws_sink;
    let mut ws_stream = ws_stream;
    let mut peer_sent_close = false;

    let to_ws = async {
        let mut buf = vec![0u8; BUF_SIZE];
        loop {
            let n = tcp_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            ws_sink.send(data_message(&buf[..n])).await?;
        }
        Ok::<(), anyhow::Error>(())
    };

    let to_tcp = async {
        while let Some(msg) = ws_stream.next().await {
            match msg? {
                Message::Binary(data) => {
                    tcp_write.write_all(&data).await?;
                }
                Message::Text(text) => match ControlFrame::decode(&text) {
                    Ok(ControlFrame::Close(_)) => return Ok(true),
                    Ok(other) => {
                        anyhow::bail!("protocol violation: unexpected control frame during DATA phase: {other:?}")
                    }
                    Err(e) => return Err(e.into()),
                },
                Message::Close(_) => return Ok(true),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
        Ok::<bool, anyhow::Error>(false)
    };

    let result = tokio::select! {
        r = to_ws => {
            debug!("tcp->tunnel direction finished first");
            r
        }
        r = to_tcp => {
            debug!("tunnel->tcp direction finished first");
            match r {
                Ok(seen_close) => { peer_sent_close = seen_close; Ok(()) }
                Err(e) => Err(e),
            }
        }
    };

    let ws = match ws_sink.reunite(ws_stream) {
        Ok(ws) => ws,
        Err(_) => unreachable!("split halves always come from the same stream"),
    };

    BridgeOutcome { ws, peer_sent_close, result }
}
