mod app;
mod bridge;
mod config;
mod dns;
mod http_greeter;
mod listener;
mod policy;
mod pool;
mod rule;
mod sniffer;
mod socks;
mod state;
mod target_filter;
mod tunnel;

use clap::Parser;

use config::{Config, ConfigFile};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls CryptoProvider"))?;

    // First pass just to learn whether a config file was named (by flag
    // or env). Its settings are then injected as env vars and argv is
    // re-parsed, so an explicit CLI flag still wins over the file and the
    // file still wins over clap's hardcoded defaults either way.
    let first_pass = Config::parse();
    if let Some(path) = &first_pass.config_file {
        ConfigFile::load(path)?.inject_env();
    }

    let config = Config::parse();
    app::run(config).await
}
