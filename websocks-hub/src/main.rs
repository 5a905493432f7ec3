mod app;
mod auth;
mod config;
mod protocol;
mod session;
mod state;
mod target_filter;
mod ws_server;

use clap::Parser;

use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Only exercised when --tls-cert/--tls-key are set, but installed
    // unconditionally since axum-server's rustls backend needs a process-wide
    // default provider before the first `wss://` bind, mirroring the proxy's
    // own startup sequence.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls CryptoProvider"))?;

    let config = Config::parse();
    app::run(config).await
}
