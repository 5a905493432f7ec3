//! The hub's axum router: a single WebSocket upgrade endpoint accepted
//! on any path (spec.md §6: "No path routing; any path accepted"),
//! gated by HTTP Basic auth checked before the upgrade completes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tracing::{info, warn};

use crate::auth;
use crate::session;
use crate::state::HubState;

pub fn router(state: Arc<HubState>) -> Router {
    Router::new().fallback(any(upgrade)).with_state(state)
}

async fn upgrade(
    State(state): State<Arc<HubState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let auth_header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if let Err(e) = auth::check(auth_header, &state.users) {
        warn!(%peer, error = %e, "tunnel upgrade rejected");
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    let connect_timeout = Duration::from_secs(state.config.connect_timeout_secs);

    ws.on_upgrade(move |socket| async move {
        let active = state.session_started();
        info!(%peer, active_sessions = active, "tunnel session started");
        session::run(socket, peer, connect_timeout).await;
        state.session_ended();
        info!(%peer, "tunnel session ended");
    })
}
