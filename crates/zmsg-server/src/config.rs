//! Server configuration: TOML file + CLI overrides.

use crate::connection::Liveness;
use crate::hub::HubConfig;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use zmsg_core::{ZmsgError, ZmsgResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_sync_page_size")]
    pub sync_page_size: usize,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_connections_per_user: default_max_connections_per_user(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
            write_timeout_secs: default_write_timeout(),
            sync_page_size: default_sync_page_size(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded HMAC key for bearer tokens.
    #[serde(default)]
    pub token_secret: Option<String>,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            token_secret: None,
            token_ttl_secs: default_token_ttl(),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_port() -> u16 {
    9405
}
fn default_max_connections_per_user() -> usize {
    crate::registry::DEFAULT_MAX_CONNECTIONS_PER_USER
}
fn default_outbound_queue_capacity() -> usize {
    crate::hub::DEFAULT_OUTBOUND_QUEUE_CAPACITY
}
fn default_ping_interval() -> u64 {
    30
}
fn default_pong_timeout() -> u64 {
    300
}
fn default_write_timeout() -> u64 {
    30
}
fn default_sync_page_size() -> usize {
    crate::router::DEFAULT_SYNC_PAGE_SIZE
}
fn default_max_frame_size() -> usize {
    crate::transport::websocket::DEFAULT_MAX_FRAME_SIZE
}
fn default_token_ttl() -> u64 {
    7 * 24 * 3600
}

/// Values given on the command line. `None` keeps the file's value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub max_connections_per_user: Option<usize>,
    pub ping_interval_secs: Option<u64>,
    pub pong_timeout_secs: Option<u64>,
}

/// Resolved server configuration (CLI overrides applied, secret decoded).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub hub: HubConfig,
    pub token_secret: Option<Vec<u8>>,
    pub token_ttl: u64,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> ZmsgResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, cli)
    }

    /// Merge CLI overrides into a parsed file.
    pub fn resolve(file: ConfigFile, cli: &CliOverrides) -> ZmsgResult<Self> {
        let server = file.server;
        let ping_interval = cli.ping_interval_secs.unwrap_or(server.ping_interval_secs);
        let pong_timeout = cli.pong_timeout_secs.unwrap_or(server.pong_timeout_secs);
        if ping_interval == 0 {
            return Err(ZmsgError::Config("ping_interval_secs must be positive".into()));
        }
        if pong_timeout < ping_interval {
            return Err(ZmsgError::Config(format!(
                "pong_timeout_secs ({pong_timeout}) must not be shorter than ping_interval_secs ({ping_interval})"
            )));
        }
        if server.write_timeout_secs == 0 {
            return Err(ZmsgError::Config("write_timeout_secs must be positive".into()));
        }

        let token_secret = match file.auth.token_secret.as_deref() {
            Some(s) => {
                let secret = hex::decode(s.trim())
                    .map_err(|e| ZmsgError::Config(format!("token_secret is not hex: {e}")))?;
                if secret.is_empty() {
                    return Err(ZmsgError::Config("token_secret is empty".into()));
                }
                Some(secret)
            }
            None => None,
        };

        Ok(Self {
            listen_addr: SocketAddr::new(
                cli.bind.unwrap_or(server.bind),
                cli.port.unwrap_or(server.port),
            ),
            hub: HubConfig {
                max_connections_per_user: cli
                    .max_connections_per_user
                    .unwrap_or(server.max_connections_per_user),
                outbound_queue_capacity: server.outbound_queue_capacity,
                liveness: Liveness {
                    ping_interval: Duration::from_secs(ping_interval),
                    pong_timeout: Duration::from_secs(pong_timeout),
                    write_timeout: Duration::from_secs(server.write_timeout_secs),
                },
                sync_page_size: server.sync_page_size,
                max_frame_size: server.max_frame_size,
            },
            token_secret,
            token_ttl: file.auth.token_ttl_secs,
        })
    }
}

fn parse(content: &str) -> ZmsgResult<ConfigFile> {
    toml::from_str(content).map_err(|e| ZmsgError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = ServerConfig::resolve(parse("").unwrap(), &CliOverrides::default()).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9405".parse::<SocketAddr>().unwrap());
        assert_eq!(config.hub, HubConfig::default());
        assert_eq!(config.token_secret, None);
        assert_eq!(config.token_ttl, 604_800);
    }

    #[test]
    fn file_values_and_cli_overrides() {
        let file = parse(
            r#"
            [server]
            bind = "127.0.0.1"
            port = 9000
            max_connections_per_user = 5
            ping_interval_secs = 10
            pong_timeout_secs = 60
            write_timeout_secs = 5
            sync_page_size = 50

            [auth]
            token_secret = "00ff10"
            token_ttl_secs = 3600
            "#,
        )
        .unwrap();
        let cli = CliOverrides {
            port: Some(9100),
            pong_timeout_secs: Some(120),
            ..Default::default()
        };
        let config = ServerConfig::resolve(file, &cli).unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:9100".parse::<SocketAddr>().unwrap());
        assert_eq!(config.hub.max_connections_per_user, 5);
        assert_eq!(config.hub.liveness.ping_interval, Duration::from_secs(10));
        assert_eq!(config.hub.liveness.pong_timeout, Duration::from_secs(120));
        assert_eq!(config.hub.liveness.write_timeout, Duration::from_secs(5));
        assert_eq!(config.hub.sync_page_size, 50);
        assert_eq!(config.token_secret, Some(vec![0x00, 0xff, 0x10]));
        assert_eq!(config.token_ttl, 3600);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(parse("[server]\nport = \"x\""), Err(ZmsgError::Config(_))));

        let bad_secret = parse("[auth]\ntoken_secret = \"zz\"").unwrap();
        assert!(ServerConfig::resolve(bad_secret, &CliOverrides::default()).is_err());

        let inverted = CliOverrides {
            ping_interval_secs: Some(60),
            pong_timeout_secs: Some(30),
            ..Default::default()
        };
        assert!(ServerConfig::resolve(ConfigFile::default(), &inverted).is_err());

        let no_write_timeout = parse("[server]\nwrite_timeout_secs = 0").unwrap();
        assert!(ServerConfig::resolve(no_write_timeout, &CliOverrides::default()).is_err());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = ServerConfig::load(
            Some(Path::new("/nonexistent/zmsg/config.toml")),
            &CliOverrides::default(),
        )
        .unwrap();
        assert_eq!(config.listen_addr.port(), 9405);
    }
}
