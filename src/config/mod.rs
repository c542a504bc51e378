//! Configuration management

use crate::crypto::KEY_LEN;
use crate::obfuscation::ObfuscatorKind;
use crate::protocol::{MAX_WINDOW, MIN_WINDOW};
use crate::transport::TransportConfig;
use crate::tunnel::StreamConfig;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Tunnel parameters shared by both ends
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// The `[client]` section, required by the client binary
    pub fn client(&self) -> Result<&ClientConfig, crate::Error> {
        self.client
            .as_ref()
            .ok_or_else(|| crate::Error::Config("Missing [client] section".into()))
    }

    /// The `[server]` section, required by the server binary
    pub fn server(&self) -> Result<&ServerConfig, crate::Error> {
        self.server
            .as_ref()
            .ok_or_else(|| crate::Error::Config("Missing [server] section".into()))
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local HTTP CONNECT listen address
    pub listen: String,
    /// Remote UDP server address
    pub server: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            server: "127.0.0.1:7000".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, crate::Error> {
        parse_addr("client.listen", &self.listen)
    }

    pub fn server_addr(&self) -> Result<SocketAddr, crate::Error> {
        parse_addr("client.server", &self.server)
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// UDP listen address
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7000".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, crate::Error> {
        parse_addr("server.listen", &self.listen)
    }
}

/// Tunnel parameters. Both ends must agree on `secret` and `protocol`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Pre-shared secret (base64, 32 bytes)
    pub secret: String,
    /// Obfuscation algorithm name
    pub protocol: String,
    /// Initial send window in frames
    pub window: u64,
    pub retransmit_interval_ms: u64,
    /// Retransmit rounds without progress before a stream is dropped
    pub max_retransmits: u32,
    pub handshake_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub idle_timeout_ms: u64,
    /// Capacity of session and stream queues
    pub queue_capacity: usize,
    pub dispatch_timeout_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            protocol: "basic".to_string(),
            window: 32,
            retransmit_interval_ms: 300,
            max_retransmits: 20,
            handshake_timeout_ms: 2000,
            connect_timeout_ms: 10_000,
            keepalive_interval_ms: 15_000,
            idle_timeout_ms: 60_000,
            queue_capacity: 65535,
            dispatch_timeout_ms: 200,
        }
    }
}

impl TunnelConfig {
    /// Decode the shared secret
    pub fn secret_bytes(&self) -> Result<[u8; KEY_LEN], crate::Error> {
        let decoded = BASE64
            .decode(self.secret.trim())
            .map_err(|e| crate::Error::Config(format!("Invalid tunnel.secret: {}", e)))?;

        decoded.try_into().map_err(|bytes: Vec<u8>| {
            crate::Error::Config(format!(
                "tunnel.secret must decode to {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })
    }

    /// Build the runtime transport settings
    pub fn transport_config(&self) -> Result<TransportConfig, crate::Error> {
        let protocol: ObfuscatorKind = self.protocol.parse()?;

        if !(MIN_WINDOW..=MAX_WINDOW).contains(&self.window) {
            return Err(crate::Error::Config(format!(
                "tunnel.window must be within {}..={}",
                MIN_WINDOW, MAX_WINDOW
            )));
        }
        if self.queue_capacity == 0 {
            return Err(crate::Error::Config(
                "tunnel.queue_capacity must be positive".into(),
            ));
        }
        for (name, value) in [
            ("retransmit_interval_ms", self.retransmit_interval_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("keepalive_interval_ms", self.keepalive_interval_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("dispatch_timeout_ms", self.dispatch_timeout_ms),
        ] {
            if value == 0 {
                return Err(crate::Error::Config(format!(
                    "tunnel.{} must be positive",
                    name
                )));
            }
        }

        let mut config = TransportConfig::new(self.secret_bytes()?);
        config.protocol = protocol;
        config.handshake_timeout = Duration::from_millis(self.handshake_timeout_ms);
        config.connect_timeout = Duration::from_millis(self.connect_timeout_ms);
        config.keepalive_interval = Duration::from_millis(self.keepalive_interval_ms);
        config.idle_timeout = Duration::from_millis(self.idle_timeout_ms);
        config.dispatch_timeout = Duration::from_millis(self.dispatch_timeout_ms);
        config.queue_capacity = self.queue_capacity;
        config.stream = StreamConfig {
            window: self.window,
            retransmit_interval: Duration::from_millis(self.retransmit_interval_ms),
            max_retransmits: self.max_retransmits,
            queue_capacity: self.queue_capacity,
        };

        Ok(config)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Install the global `tracing` subscriber. `level` overrides the configured level.
    pub fn init(&self, level: Option<&str>) -> Result<(), crate::Error> {
        let filter = EnvFilter::try_new(level.unwrap_or(&self.level))
            .map_err(|e| crate::Error::Config(format!("Invalid log level: {}", e)))?;
        let builder = tracing_subscriber::fmt().with_env_filter(filter);

        let installed = match self.format.to_lowercase().as_str() {
            "json" => builder.json().try_init(),
            "compact" => builder.compact().try_init(),
            "pretty" => builder.pretty().try_init(),
            other => {
                return Err(crate::Error::Config(format!("Unknown log format: {}", other)));
            }
        };

        installed.map_err(|e| crate::Error::Config(format!("Failed to install logger: {}", e)))
    }
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr, crate::Error> {
    value
        .parse()
        .map_err(|e| crate::Error::Config(format!("Invalid {} {:?}: {}", field, value, e)))
}

/// Generate example configuration with a fresh secret
pub fn generate_example_config() -> Result<Config, crate::Error> {
    let secret = crate::crypto::random_key()?;

    Ok(Config {
        client: Some(ClientConfig::default()),
        server: Some(ServerConfig::default()),
        tunnel: TunnelConfig {
            secret: BASE64.encode(secret),
            ..TunnelConfig::default()
        },
        logging: LoggingConfig::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=";

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(&format!(
            r#"
            [client]
            listen = "127.0.0.1:8080"
            server = "203.0.113.1:7000"

            [server]
            listen = "0.0.0.0:7000"

            [tunnel]
            secret = "{SECRET}"
            window = 64
            max_retransmits = 5

            [logging]
            level = "debug"
            format = "json"
            "#
        ))
        .unwrap();

        let client = config.client().unwrap();
        assert_eq!(client.listen_addr().unwrap(), "127.0.0.1:8080".parse().unwrap());
        assert_eq!(client.server_addr().unwrap(), "203.0.113.1:7000".parse().unwrap());
        assert_eq!(config.server().unwrap().listen, "0.0.0.0:7000");
        assert_eq!(config.logging.format, "json");

        let transport = config.tunnel.transport_config().unwrap();
        let expected: Vec<u8> = (0u8..32).collect();
        assert_eq!(transport.secret.to_vec(), expected);
        assert_eq!(transport.protocol, ObfuscatorKind::Basic);
        assert_eq!(transport.stream.window, 64);
        assert_eq!(transport.stream.max_retransmits, 5);
        assert_eq!(transport.stream.retransmit_interval, Duration::from_millis(300));
        assert_eq!(transport.handshake_timeout, Duration::from_secs(2));
        assert_eq!(transport.idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_missing_sections() {
        let config = Config::parse(&format!("[tunnel]\nsecret = \"{SECRET}\"\n")).unwrap();
        assert!(config.client().is_err());
        assert!(config.server().is_err());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_secret_length() {
        let tunnel = TunnelConfig {
            secret: BASE64.encode([7u8; 16]),
            ..TunnelConfig::default()
        };
        assert!(matches!(tunnel.secret_bytes(), Err(crate::Error::Config(_))));

        let tunnel = TunnelConfig {
            secret: "not base64!".into(),
            ..TunnelConfig::default()
        };
        assert!(tunnel.secret_bytes().is_err());
    }

    #[test]
    fn test_rejects_bad_tunnel_settings() {
        let base = TunnelConfig {
            secret: SECRET.into(),
            ..TunnelConfig::default()
        };

        let unknown = TunnelConfig {
            protocol: "rot13".into(),
            ..base.clone()
        };
        assert!(unknown.transport_config().is_err());

        let tiny_window = TunnelConfig {
            window: 4,
            ..base.clone()
        };
        assert!(tiny_window.transport_config().is_err());

        let no_keepalive = TunnelConfig {
            keepalive_interval_ms: 0,
            ..base.clone()
        };
        assert!(matches!(
            no_keepalive.transport_config(),
            Err(crate::Error::Config(msg)) if msg.contains("keepalive_interval_ms")
        ));

        let busy_retransmit = TunnelConfig {
            retransmit_interval_ms: 0,
            ..base.clone()
        };
        assert!(busy_retransmit.transport_config().is_err());

        let no_idle = TunnelConfig {
            idle_timeout_ms: 0,
            ..base.clone()
        };
        assert!(no_idle.transport_config().is_err());

        assert!(base.transport_config().is_ok());
    }

    #[test]
    fn test_example_config_round_trip() {
        let config = generate_example_config().unwrap();
        let path = std::env::temp_dir().join(format!("drill-example-{}.toml", std::process::id()));
        config.save(&path).unwrap();
        let parsed = Config::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(
            parsed.tunnel.secret_bytes().unwrap(),
            config.tunnel.secret_bytes().unwrap()
        );
        assert!(parsed.client().unwrap().listen_addr().is_ok());
    }
}
