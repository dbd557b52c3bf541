use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

/// Command line options for the chat server.
#[derive(Parser, Debug, Default)]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Directory holding the database and signing key.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

/// Runtime configuration for the server resolved from file, env and CLI.
#[derive(Clone)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Base directory for the database and persisted secret.
    pub data_dir: PathBuf,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
    /// Deadline for a single database call.
    pub store_timeout: Duration,
    /// Lifetime of issued access tokens.
    pub token_ttl: time::Duration,
    /// Signing secret supplied through the environment, base64 encoded.
    pub jwt_secret: Option<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind", &self.bind)
            .field("data_dir", &self.data_dir)
            .field("logging_enabled", &self.logging_enabled)
            .field("store_timeout", &self.store_timeout)
            .field("token_ttl", &self.token_ttl)
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: format!("127.0.0.1:{}", default_port()),
            data_dir: default_data_dir(),
            logging_enabled: default_logging(),
            store_timeout: Duration::from_millis(default_store_timeout_ms()),
            token_ttl: time::Duration::hours(default_token_ttl_hours()),
            jwt_secret: None,
        }
    }
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    chat: FileChat,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize)]
struct FileChat {
    #[serde(default = "default_store_timeout_ms")]
    store_timeout_ms: u64,
    #[serde(default = "default_token_ttl_hours")]
    token_ttl_hours: i64,
}

fn default_port() -> u16 {
    3000
}

fn default_logging() -> bool {
    true
}

fn default_store_timeout_ms() -> u64 {
    5000
}

fn default_token_ttl_hours() -> i64 {
    24 * 7
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Default for FileChat {
    fn default() -> Self {
        Self {
            store_timeout_ms: default_store_timeout_ms(),
            token_ttl_hours: default_token_ttl_hours(),
        }
    }
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        // built-in defaults
        let mut port = default_port();
        let mut logging = default_logging();
        let mut chat = FileChat::default();

        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("CHAT_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/chat.toml"));

        if let Ok(bytes) = fs::read(&config_path) {
            let contents = String::from_utf8_lossy(&bytes);
            let file_cfg: FileConfig = toml::from_str(&contents).context("invalid config file")?;
            port = file_cfg.server.port;
            logging = file_cfg.logging.enabled;
            chat = file_cfg.chat;
        }

        // environment overrides
        if let Ok(p) = std::env::var("CHAT_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(l) = std::env::var("CHAT_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }

        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }
        if chat.store_timeout_ms == 0 {
            anyhow::bail!("invalid_store_timeout");
        }
        if chat.token_ttl_hours <= 0 {
            anyhow::bail!("invalid_token_ttl");
        }

        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let data_dir = cli
            .data_dir
            .clone()
            .or_else(|| std::env::var("DATA_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(default_data_dir);

        Ok(Self {
            bind,
            data_dir,
            logging_enabled: logging,
            store_timeout: Duration::from_millis(chat.store_timeout_ms),
            token_ttl: time::Duration::hours(chat.token_ttl_hours),
            jwt_secret: std::env::var("CHAT_JWT_SECRET").ok(),
        })
    }
}

/// Determine the default data directory.
pub fn default_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".local/share/chat_server");
        p
    } else {
        PathBuf::from("./chat_data")
    }
}
