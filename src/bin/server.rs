//! Drill Server
//!
//! Listens on UDP, handshakes with clients holding the shared secret, and
//! connects the streams they open to their targets.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use clap::Parser;
use drill::{
    config::{generate_example_config, Config},
    crypto::random_key,
    Server,
};
use std::path::PathBuf;
use tracing::info;

/// Drill Server - obfuscated UDP tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "drill-server")]
#[command(about = "Drill Server - obfuscated, encrypted UDP tunnel endpoint")]
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

    let listen = config.server()?.listen_addr()?;
    let transport = config
        .tunnel
        .transport_config()
        .context("Invalid [tunnel] section")?;

    info!("Drill Server v{}", drill::VERSION);
    info!("Obfuscation: {}", transport.protocol);

    let server = Server::bind(listen, transport)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;

    tokio::select! {
        result = server.run() => result.context("Server stopped")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
