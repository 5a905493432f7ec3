//! Application lifecycle: tracing init, router construction, and
//! serving plain `ws://` or, when a cert/key pair is configured,
//! `wss://` directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use tracing::info;

use crate::config::Config;
use crate::state::HubState;
use crate::ws_server;

const GRACEFUL_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub async fn run(config: Config) -> anyhow::Result<()> {
    init_tracing(&config);
    let credentials = config.credentials()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.host,
        port = config.port,
        users = credentials.len(),
        "websocks-hub starting"
    );

    let tls_paths = config
        .tls_paths()
        .map(|(cert, key)| (cert.to_string(), key.to_string()));
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let state = Arc::new(HubState::new(Arc::new(config), credentials));
    let app = ws_server::router(Arc::clone(&state))
        .into_make_service_with_connect_info::<SocketAddr>();

    let handle = Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("shutdown signal received, draining tunnel sessions...");
        shutdown_handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN_GRACE));
    });

    match tls_paths {
        Some((cert, key)) => {
            info!(%addr, "tunnel listener bound (wss://)");
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key).await?;
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(app)
                .await?;
        }
        None => {
            info!(%addr, "tunnel listener bound (ws://)");
            axum_server::bind(addr).handle(handle).serve(app).await?;
        }
    }

    info!("websocks-hub stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
