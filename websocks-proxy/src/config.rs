use std::net::IpAddr;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

/// Local HTTP/SOCKS proxying gateway with WebSocket tunnel fallback.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Address to listen on for local HTTP/SOCKS connections.
    #[arg(long, env = "WEBSOCKS_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on for local HTTP/SOCKS connections.
    #[arg(long, env = "WEBSOCKS_PORT", default_value_t = 3128)]
    pub port: u16,

    /// Single hub server URL, `ws(s)://user:pass@host:port`. Ignored if
    /// a config file supplies a `servers` list.
    #[arg(long, env = "WEBSOCKS_TCP_SERVER")]
    pub tcp_server: Option<String>,

    /// Routing policy: auto, proxy, direct, black, or white.
    #[arg(long, env = "WEBSOCKS_PROXY_POLICY", default_value = "auto")]
    pub proxy_policy: ProxyPolicy,

    /// Rule list files, in priority order (first entry treated as the
    /// user-override list unless its name contains "whitelist"/"gfwlist").
    #[arg(long, env = "WEBSOCKS_RULEFILES", value_delimiter = ',')]
    pub rulefiles: Vec<PathBuf>,

    /// Custom DNS nameservers to use instead of the system resolver.
    #[arg(long, env = "WEBSOCKS_NAMESERVERS", value_delimiter = ',')]
    pub nameservers: Vec<IpAddr>,

    /// Path to a JSON or YAML config file (auto-detected by extension).
    #[arg(long, env = "WEBSOCKS_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Per-tunnel TCP connect timeout, in seconds, for upstream dials.
    #[arg(long, env = "WEBSOCKS_CONNECT_TIMEOUT", default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Auto-mode direct-dial race timeout, in milliseconds.
    #[arg(long, env = "WEBSOCKS_DIRECT_RACE_MS", default_value_t = 2300)]
    pub direct_race_ms: u64,

    /// Target pool size per hub connection (N). Idle set is capped at 2N.
    #[arg(long, env = "WEBSOCKS_POOL_SIZE", default_value_t = 7)]
    pub pool_size: usize,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "WEBSOCKS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON.
    #[arg(long, env = "WEBSOCKS_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyPolicy {
    /// Race a direct dial against the tunnel; learn hosts that need it.
    Auto,
    /// Always use the tunnel.
    Proxy,
    /// Always dial directly, ignoring rule lists.
    Direct,
    /// Proxy everything except what the rule lists exempt.
    Black,
    /// Direct-dial everything except what the rule lists select.
    White,
}

/// One configured hub endpoint, with credentials split out of the URL.
#[derive(Debug, Clone)]
pub struct HubTarget {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl HubTarget {
    /// Parse `ws(s)://user:pass@host:port` into a bare `ws(s)://host:port`
    /// URL plus extracted Basic-auth credentials, mirroring the original
    /// `convert_tcp_url` config shape.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let parsed = url::Url::parse(raw)?;
        let username = if parsed.username().is_empty() {
            None
        } else {
            Some(parsed.username().to_string())
        };
        let password = parsed.password().map(|p| p.to_string());

        let mut bare = parsed.clone();
        let _ = bare.set_username("");
        let _ = bare.set_password(None);

        Ok(Self {
            url: bare.to_string(),
            username,
            password,
        })
    }
}

/// JSON/YAML config file mirroring the CLI flags, with the addition of
/// a `servers` list for multi-hub deployments (spec §6).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub servers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_policy: Option<ProxyPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rulefiles: Option<Vec<PathBuf>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nameservers: Option<Vec<IpAddr>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_json: Option<bool>,
}

impl ConfigFile {
    /// Load a config file, dispatching to JSON or YAML by extension.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&content)?),
            _ => Ok(serde_json::from_str(&content)?),
        }
    }

    /// The effective list of hub server URLs: `servers` if present and
    /// non-empty, else the single `tcp_server`.
    pub fn effective_servers(&self, cli_tcp_server: &Option<String>) -> Vec<String> {
        if let Some(list) = &self.servers {
            if !list.is_empty() {
                return list.clone();
            }
        }
        if let Some(single) = &self.tcp_server {
            return vec![single.clone()];
        }
        cli_tcp_server.clone().into_iter().collect()
    }

    /// Inject values as environment variables so clap picks them up.
    /// Only sets variables not already present, preserving CLI > env >
    /// file precedence.
    pub fn inject_env(&self) {
        macro_rules! set {
            ($env:expr, $val:expr) => {
                if let Some(ref v) = $val {
                    if std::env::var($env).is_err() {
                        std::env::set_var($env, v.to_string());
                    }
                }
            };
        }
        set!("WEBSOCKS_HOST", self.host);
        set!("WEBSOCKS_PORT", self.port);
        set!("WEBSOCKS_TCP_SERVER", self.tcp_server);
        set!("WEBSOCKS_CONNECT_TIMEOUT", self.connect_timeout_secs);
        set!("WEBSOCKS_POOL_SIZE", self.pool_size);
        set!("WEBSOCKS_LOG_LEVEL", self.log_level);
        set!("WEBSOCKS_LOG_JSON", self.log_json);

        if let Some(policy) = self.proxy_policy {
            if std::env::var("WEBSOCKS_PROXY_POLICY").is_err() {
                let s = match policy {
                    ProxyPolicy::Auto => "auto",
                    ProxyPolicy::Proxy => "proxy",
                    ProxyPolicy::Direct => "direct",
                    ProxyPolicy::Black => "black",
                    ProxyPolicy::White => "white",
                };
                std::env::set_var("WEBSOCKS_PROXY_POLICY", s);
            }
        }
        if let Some(files) = &self.rulefiles {
            if std::env::var("WEBSOCKS_RULEFILES").is_err() {
                let s = files
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                std::env::set_var("WEBSOCKS_RULEFILES", s);
            }
        }
        if let Some(servers) = &self.nameservers {
            if std::env::var("WEBSOCKS_NAMESERVERS").is_err() {
                let s = servers
                    .iter()
                    .map(|ip| ip.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                std::env::set_var("WEBSOCKS_NAMESERVERS", s);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_target_splits_credentials_out_of_url() {
        let t = HubTarget::parse("ws://alice:s3cr3t@hub.example.com:8765").unwrap();
        assert_eq!(t.username.as_deref(), Some("alice"));
        assert_eq!(t.password.as_deref(), Some("s3cr3t"));
        assert_eq!(t.url, "ws://hub.example.com:8765/");
    }

    #[test]
    fn effective_servers_prefers_list_over_single() {
        let file = ConfigFile {
            tcp_server: Some("ws://a".into()),
            servers: Some(vec!["ws://b".into(), "ws://c".into()]),
            ..Default::default()
        };
        assert_eq!(file.effective_servers(&None), vec!["ws://b", "ws://c"]);
    }
}
