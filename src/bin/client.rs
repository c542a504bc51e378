//! Drill Client
//!
//! Runs a local HTTP CONNECT proxy and carries every accepted connection
//! over one tunnel session. Lost sessions are re-established with back-off.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use clap::Parser;
use drill::{
    config::{generate_example_config, Config},
    crypto::random_key,
    proxy::HttpProxyServer,
    Client,
};
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Drill Client - local HTTP CONNECT proxy over the tunnel
#[derive(Parser, Debug)]
#[command(name = "drill-client")]
#[command(about = "Drill Client - HTTP CONNECT proxy over an obfuscated UDP tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(required_unless_present_any = ["generate_secret", "generate_config"])]
    config: Option<PathBuf>,

    /// Print a fresh base64 shared secret and exit
    #[arg(long)]
    generate_secret: bool,

    /// Write an example configuration with a fresh secret to PATH and exit
    #[arg(long, value_name = "PATH")]
    generate_config: Option<PathBuf>,

    /// Log level (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_secret {
        let secret = random_key().context("Failed to generate secret")?;
        println!("{}", BASE64.encode(secret));
        return Ok(());
    }

    if let Some(path) = &args.generate_config {
        generate_example_config()
            .and_then(|config| config.save(path))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote example configuration to {}", path.display());
        return Ok(());
    }

    let path = args.config.context("Missing configuration path")?;
    let config = Config::load(&path).context("Failed to load configuration")?;
    config
        .logging
        .init(args.log_level.as_deref())
        .context("Failed to initialize logging")?;

    let client_config = config.client()?;
    let listen = client_config.listen_addr()?;
    let server = client_config.server_addr()?;
    let transport = config
        .tunnel
        .transport_config()
        .context("Invalid [tunnel] section")?;

    info!("Drill Client v{}", drill::VERSION);
    info!("Server: {}", server);

    let proxy = HttpProxyServer::bind(listen)
        .await
        .with_context(|| format!("Failed to bind HTTP proxy on {}", listen))?;

    let mut attempt = 0u32;
    loop {
        let connected = tokio::select! {
            result = Client::connect(server, transport.clone()) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                return Ok(());
            }
        };

        let client = match connected {
            Ok(client) => {
                attempt = 0;
                client
            }
            Err(e) => {
                let delay = backoff(attempt);
                attempt = attempt.saturating_add(1);
                warn!("Handshake with {} failed: {}, retrying in {:?}", server, e, delay);
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        tokio::select! {
            result = client.run() => match result {
                Ok(()) => return Ok(()),
                Err(e) => warn!("Session {} ended: {}", client.conn_id(), e),
            },
            result = proxy.run(&client) => {
                error!("HTTP proxy stopped");
                return result.context("HTTP proxy failed");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                client.shutdown().await;
                return Ok(());
            }
        }

        let delay = backoff(0);
        info!("Reconnecting in {:?}...", delay);
        tokio::time::sleep(delay).await;
    }
}

/// Exponential back-off with up to half a second of jitter
fn backoff(attempt: u32) -> Duration {
    let base = RECONNECT_BASE
        .saturating_mul(1u32 << attempt.min(5))
        .min(RECONNECT_MAX);
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=500))
}
