//! Dialing a fresh WebSocket connection to a hub target: TCP connect,
//! TLS handshake when `wss://`, WebSocket upgrade carrying a
//! Proxy-Authorization header, and socket tuning.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{info, warn};

use crate::config::HubTarget;
use crate::pool::TunnelSocket;

const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

pub async fn dial(
    target: &HubTarget,
    tls_config: Option<Arc<rustls::ClientConfig>>,
) -> anyhow::Result<TunnelSocket> {
    info!(url = %target.url, "dialing hub");

    let mut request = target.url.clone().into_client_request()?;
    if let (Some(user), pass) = (&target.username, &target.password) {
        let creds = format!("{}:{}", user, pass.clone().unwrap_or_default());
        let encoded = base64::engine::general_purpose::STANDARD.encode(creds);
        request.headers_mut().insert(
            http::header::AUTHORIZATION,
            http::HeaderValue::from_str(&format!("Basic {encoded}"))?,
        );
    }

    let uri: http::Uri = target.url.parse()?;
    let host = uri
        .host()
        .ok_or_else(|| anyhow::anyhow!("missing host in hub URL"))?
        .to_string();
    let is_tls = uri.scheme_str() == Some("wss");
    let port = uri.port_u16().unwrap_or(if is_tls { 443 } else { 80 });

    let tcp_stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| anyhow::anyhow!("hub TCP connect timeout"))??;

    configure_tcp_socket(&tcp_stream);

    let connector = if is_tls {
        let config = tls_config.unwrap_or_else(|| Arc::new(build_tls_config()));
        Some(tokio_tungstenite::Connector::Rustls(config))
    } else {
        None
    };

    let ws_config = WebSocketConfig {
        max_frame_size: Some(16 << 20),
        max_message_size: Some(16 << 20),
        ..Default::default()
    };

    let (ws_stream, _response) = tokio::time::timeout(
        DIAL_TIMEOUT,
        tokio_tungstenite::client_async_tls_with_config(
            request,
            tcp_stream,
            Some(ws_config),
            connector,
        ),
    )
    .await
    .map_err(|_| anyhow::anyhow!("hub WebSocket handshake timeout"))??;

    info!(url = %target.url, "hub connection established");
    Ok(ws_stream)
}

fn configure_tcp_socket(stream: &TcpStream) {
    let sock_ref = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(5));
    #[cfg(not(target_os = "windows"))]
    let keepalive = keepalive.with_retries(3);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "failed to set TCP keepalive on hub socket");
    }
    if let Err(e) = sock_ref.set_nodelay(true) {
        warn!(error = %e, "failed to set TCP_NODELAY on hub socket");
    }
}

/// Build a rustls `ClientConfig` trusting the system's webpki roots.
pub fn build_tls_config() -> rustls::ClientConfig {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}
