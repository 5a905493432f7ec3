//! Application lifecycle: initialization, task orchestration, and shutdown.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{Config, ConfigFile, HubTarget};
use crate::dns::Resolver;
use crate::listener;
use crate::pool::Pool;
use crate::rule::RuleSet;
use crate::state::AppState;
use crate::tunnel::client::build_tls_config;

/// Run the full application lifecycle after config has been parsed.
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.host,
        port = config.port,
        policy = ?config.proxy_policy,
        "websocks-proxy starting"
    );

    let rules = Arc::new(load_rules(&config)?);
    let resolver = Arc::new(if config.nameservers.is_empty() {
        Resolver::system()
    } else {
        Resolver::with_nameservers(&config.nameservers)
    });

    let server_urls = effective_server_urls(&config)?;
    let tls_connector = Arc::new(build_tls_config());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut pools = Vec::with_capacity(server_urls.len());
    let mut maintenance_handles = Vec::with_capacity(server_urls.len());
    for url in &server_urls {
        let target = HubTarget::parse(url)?;
        let pool = Pool::new(target, config.pool_size, Some(Arc::clone(&tls_connector)));
        let maintenance_pool = Arc::clone(&pool);
        let maintenance_shutdown = shutdown_rx.clone();
        maintenance_handles.push(tokio::spawn(async move {
            maintenance_pool.run_maintenance(maintenance_shutdown).await;
        }));
        pools.push(pool);
    }

    if pools.is_empty() {
        warn!("no hub servers configured; only Direct and Black-listed destinations can be served");
    }

    let state = Arc::new(AppState::new(Arc::new(config), rules, resolver, pools));

    let listener_shutdown = shutdown_rx.clone();
    let listener_state = Arc::clone(&state);
    let listener_handle = tokio::spawn(async move {
        if let Err(e) = listener::run(listener_state, listener_shutdown).await {
            warn!(error = %e, "listener exited with error");
        }
    });

    wait_for_shutdown().await;
    info!("shutdown signal received, cleaning up...");
    let _ = shutdown_tx.send(true);

    let _ = listener_handle.await;
    for h in maintenance_handles {
        let _ = h.await;
    }

    info!("websocks-proxy stopped");
    Ok(())
}

fn load_rules(config: &Config) -> anyhow::Result<RuleSet> {
    if config.rulefiles.is_empty() {
        return Ok(RuleSet::empty());
    }
    RuleSet::load(&config.rulefiles)
}

/// Hub URLs to dial: the config file's `servers`/`tcp_server` if one was
/// loaded, otherwise the CLI/env `--tcp-server` alone.
fn effective_server_urls(config: &Config) -> anyhow::Result<Vec<String>> {
    match &config.config_file {
        Some(path) => {
            let file = ConfigFile::load(path)?;
            Ok(file.effective_servers(&config.tcp_server))
        }
        None => Ok(config.tcp_server.clone().into_iter().collect()),
    }
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
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
