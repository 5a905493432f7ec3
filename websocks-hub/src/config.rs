//! Hub configuration: CLI flags and environment variables via `clap`,
//! mirroring the client gateway's `Config` idiom.

use clap::Parser;

use crate::auth::Credential;

#[derive(Debug, Parser)]
#[command(name = "websocks-hub", version, about = "WebSocket tunnel hub")]
pub struct Config {
    /// Address to bind the WebSocket upgrade listener on.
    #[arg(long, env = "WEBSOCKS_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the WebSocket upgrade listener on.
    #[arg(long, env = "WEBSOCKS_PORT", default_value_t = 8765)]
    pub port: u16,

    /// Accepted `user:pass` credentials, repeatable or comma-separated.
    /// Required: an upgrade with no matching credential is refused.
    #[arg(long = "user", env = "WEBSOCKS_USERS", value_delimiter = ',', required = true)]
    pub users: Vec<String>,

    /// Bounded timeout for dialing a tunnel's outbound target.
    #[arg(long, env = "WEBSOCKS_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// PEM certificate chain for terminating `wss://` directly. When
    /// unset, the hub speaks plain `ws://` and TLS termination is left
    /// to an external reverse proxy (the documented default).
    #[arg(long, env = "WEBSOCKS_TLS_CERT")]
    pub tls_cert: Option<String>,

    /// PEM private key paired with `tls_cert`.
    #[arg(long, env = "WEBSOCKS_TLS_KEY")]
    pub tls_key: Option<String>,

    #[arg(long, env = "WEBSOCKS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "WEBSOCKS_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    pub fn credentials(&self) -> anyhow::Result<Vec<Credential>> {
        self.users
            .iter()
            .map(|entry| {
                let (user, pass) = entry
                    .split_once(':')
                    .ok_or_else(|| anyhow::anyhow!("malformed --user entry {entry:?}, expected user:pass"))?;
                Ok(Credential { username: user.to_string(), password: pass.to_string() })
            })
            .collect()
    }

    pub fn tls_paths(&self) -> Option<(&str, &str)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some((cert.as_str(), key.as_str())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_pass_pairs() {
        let config = Config {
            host: "0.0.0.0".into(),
            port: 8765,
            users: vec!["alice:hunter2".into(), "bob:swordfish".into()],
            connect_timeout_secs: 10,
            tls_cert: None,
            tls_key: None,
            log_level: "info".into(),
            log_json: false,
        };
        let creds = config.credentials().unwrap();
        assert_eq!(creds.len(), 2);
        assert_eq!(creds[0].username, "alice");
        assert_eq!(creds[1].password, "swordfish");
    }

    #[test]
    fn rejects_entry_without_colon() {
        let config = Config {
            host: "0.0.0.0".into(),
            port: 8765,
            users: vec!["nopass".into()],
            connect_timeout_secs: 10,
            tls_cert: None,
            tls_key: None,
            log_level: "info".into(),
            log_json: false,
        };
        assert!(config.credentials().is_err());
    }
}
