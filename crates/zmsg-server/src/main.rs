//! zmsg-server: chat transport server.
//!
//! Listens for WebSocket connections, authenticates clients with HMAC bearer
//! tokens and relays chat, sync and presence traffic between them.

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use zmsg_server::config::{CliOverrides, ServerConfig};
use zmsg_server::services::{InMemoryMessageStore, TokenUserService};
use zmsg_server::ChatHub;

/// zmsg-server: chat transport server
#[derive(Parser, Debug)]
#[command(name = "zmsg-server", version, about = "zmsg chat transport server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Config file path
    #[arg(long, default_value = "~/.zmsg/config.toml")]
    config: String,

    /// Maximum simultaneous connections per user
    #[arg(long)]
    max_connections_per_user: Option<usize>,

    /// Ping interval in seconds
    #[arg(long)]
    ping_interval: Option<u64>,

    /// Close connections silent for this many seconds
    #[arg(long)]
    pong_timeout: Option<u64>,

    /// Print a bearer token for this user id and exit
    #[arg(long, value_name = "USER_ID")]
    issue_token: Option<i64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let overrides = CliOverrides {
        bind: cli.bind,
        port: cli.port,
        max_connections_per_user: cli.max_connections_per_user,
        ping_interval_secs: cli.ping_interval,
        pong_timeout_secs: cli.pong_timeout,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let secret = match server_config.token_secret.clone() {
        Some(secret) => secret,
        None => match zmsg_core::generate_secret() {
            Ok(secret) => {
                warn!("no auth.token_secret configured, tokens are only valid for this process");
                secret
            }
            Err(e) => {
                error!(error = %e, "failed to generate token secret");
                std::process::exit(1);
            }
        },
    };
    let users = Arc::new(TokenUserService::new(secret, server_config.token_ttl));

    if let Some(user_id) = cli.issue_token {
        match users.issue_token(user_id) {
            Ok(token) => {
                println!("{token}");
                return;
            }
            Err(e) => {
                error!(error = %e, user_id, "failed to issue token");
                std::process::exit(1);
            }
        }
    }

    let hub = ChatHub::new(
        server_config.hub.clone(),
        users,
        Arc::new(InMemoryMessageStore::new()),
    );
    let liveness = hub.config().liveness;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %server_config.listen_addr,
        ping_interval_secs = liveness.ping_interval.as_secs(),
        pong_timeout_secs = liveness.pong_timeout.as_secs(),
        write_timeout_secs = liveness.write_timeout.as_secs(),
        "starting zmsg-server"
    );

    tokio::select! {
        result = hub.serve_websocket(server_config.listen_addr) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    hub.shutdown().await;
    info!("zmsg-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
