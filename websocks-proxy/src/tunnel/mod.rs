pub mod client;
pub mod protocol;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::bridge::bridge_tunnel;
use crate::pool::{Pool, TunnelSocket};
use protocol::{ControlFrame, OpenRequest, ProtocolError};

const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Pool(#[from] anyhow::Error),
}

/// A tunnel the hub has agreed to open. Holds the bound WebSocket; the
/// caller must follow up with [`TunnelHandle::bridge_and_close`] once it
/// has told its own client the connection succeeded.
pub struct TunnelHandle<'a> {
    pool: &'a Pool,
    ws: TunnelSocket,
}

impl<'a> TunnelHandle<'a> {
    /// Send bytes as a DATA frame ahead of the bridge proper. Used by the
    /// HTTP absolute-URI greeter to forward its rewritten request head,
    /// which was already drained off the client socket during parsing
    /// and so can't ride the generic byte-for-byte bridge.
    pub async fn send_prefix(&mut self, bytes: &[u8]) -> Result<(), TunnelError> {
        self.ws
            .send(protocol::data_message(bytes))
            .await
            .map_err(ProtocolError::from)?;
        Ok(())
    }

    /// Bridge `tcp` with the tunnel's DATA stream until either side
    /// closes, then run the CLOSE handshake and return the WebSocket to
    /// the pool if it's still usable.
    pub async fn bridge_and_close(self, tcp: TcpStream) -> Result<(), TunnelError> {
        let outcome = bridge_tunnel(tcp, self.ws).await;
        if let Err(e) = outcome.result {
            debug!(error = %e, "tunnel bridge ended with error, discarding socket");
            return Err(ProtocolError::UnknownFrame(e.to_string()).into());
        }
        let mut ws = outcome.ws;
        match finish_close_handshake(&mut ws, outcome.peer_sent_close).await {
            Ok(()) => {
                self.pool.release(ws).await;
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "close handshake failed, discarding socket");
                Err(e.into())
            }
        }
    }
}

pub enum OpenOutcome<'a> {
    Allowed(TunnelHandle<'a>),
    Denied,
}

/// Acquire a WebSocket (pooled or freshly dialed), send OPEN, and read
/// the hub's ALLOW/DENY. On denial, runs the CLOSE handshake and
/// returns the WebSocket to the pool itself since there is nothing left
/// for the caller to do with it.
pub async fn open_tunnel<'a>(pool: &'a Pool, host: &str, port: u16) -> Result<OpenOutcome<'a>, TunnelError> {
    let mut ws = match pool.try_acquire().await {
        Some(ws) => ws,
        None => pool.dial().await?,
    };

    ws.send(OpenRequest::new(host, port).into_message()?)
        .await
        .map_err(ProtocolError::from)?;

    let ack = match read_control(&mut ws).await {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "tunnel open failed reading ack, discarding socket");
            return Err(e.into());
        }
    };

    match ack {
        ControlFrame::Ack(ack) if ack.allow => Ok(OpenOutcome::Allowed(TunnelHandle { pool, ws })),
        ControlFrame::Ack(_) => {
            match finish_close_handshake(&mut ws, false).await {
                Ok(()) => pool.release(ws).await,
                Err(e) => debug!(error = %e, "close handshake after denial failed, discarding socket"),
            }
            Ok(OpenOutcome::Denied)
        }
        other => {
            warn!(?other, "unexpected control frame in place of OPEN-ACK, discarding socket");
            Err(ProtocolError::UnknownFrame("expected ack".to_string()).into())
        }
    }
}

async fn read_control(ws: &mut TunnelSocket) -> Result<ControlFrame, ProtocolError> {
    match ws.next().await {
        Some(Ok(Message::Text(text))) => ControlFrame::decode(&text),
        Some(Ok(Message::Close(_))) | None => {
            Err(ProtocolError::UnknownFrame("websocket closed".to_string()))
        }
        Some(Ok(_)) => Err(ProtocolError::UnknownFrame("expected a text control frame".to_string())),
        Some(Err(e)) => Err(ProtocolError::WebSocket(e)),
    }
}

/// Send our CLOSE, and if the peer hasn't already sent theirs, wait
/// (bounded) until it does. Both sides must exchange CLOSE before the
/// WebSocket is returnable to the pool.
async fn finish_close_handshake(ws: &mut TunnelSocket, peer_already_closed: bool) -> Result<(), ProtocolError> {
    ws.send(protocol::CloseNotice::default().into_message()?).await?;

    if peer_already_closed {
        return Ok(());
    }

    let wait = async {
        loop {
            match read_control(ws).await? {
                ControlFrame::Close(_) => return Ok(()),
                _ => continue,
            }
        }
    };

    match tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, wait).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::UnknownFrame("timed out waiting for peer CLOSE".to_string())),
    }
}
