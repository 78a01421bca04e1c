//! Configuration Module
//!
//! TOML configuration for mqttgate:
//! - `[log]` level and optional filter directives
//! - `[server]` bind address, accept and I/O threads, optional TLS
//! - `[limits]` packet size, queue capacity, idle timeout
//! - `[codec]` payload charset
//! - `[auth]` static users for the credential verifier
//!
//! `${VAR}` / `${VAR:-default}` is substituted in the file before parsing and
//! `MQTTGATE__SECTION__KEY` environment variables override file values.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::charset::Charset;
use crate::codec::{DEFAULT_MAX_PACKET_SIZE, MAX_REMAINING_LENGTH};
use crate::gateway::{GatewayConfig, TlsConfig, DEFAULT_IDLE_TIMEOUT};
use crate::queue::DEFAULT_CAPACITY;

#[cfg(test)]
mod tests;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    static ENV_VAR: OnceLock<Regex> = OnceLock::new();
    let re = ENV_VAR.get_or_init(|| {
        Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("env var pattern is valid")
    });
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub codec: CodecConfig,
    pub auth: AuthConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
    /// `EnvFilter` directives (e.g. `mqttgate::gateway=debug`); overrides `level`
    pub filter: Option<String>,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: None,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind: SocketAddr,
    /// Concurrent accept tasks (clamped to 1-5)
    pub accept_threads: usize,
    /// I/O worker threads (0 = available parallelism, at most 100)
    pub io_threads: usize,
    /// Serve MQTT over TLS on `bind`
    pub tls: Option<ServerTlsConfig>,
}

/// TLS configuration for the server
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerTlsConfig {
    /// Path to certificate file (PEM format)
    pub cert: String,
    /// Path to private key file (PEM format)
    pub key: String,
    /// Path to CA certificate file for client authentication (PEM format, optional)
    pub ca_cert: Option<String>,
    /// Require client certificate authentication
    #[serde(default)]
    pub require_client_cert: bool,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 1883))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            accept_threads: 1,
            io_threads: 0,
            tls: None,
        }
    }
}

/// Resource limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum remaining length of an inbound packet
    pub max_packet_size: usize,
    /// Capacity of the inbound message queue
    pub max_queued_messages: usize,
    /// Close connections that send nothing for this long (e.g. "90s", "2m")
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_queued_messages: DEFAULT_CAPACITY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Payload encoding
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// utf-8, iso-8859-1 or us-ascii
    pub charset: Charset,
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether authentication is enabled
    pub enabled: bool,
    /// Allow connections without a username when auth is enabled
    pub allow_anonymous: bool,
    /// Static user list
    pub users: Vec<UserConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_anonymous: true,
            users: Vec::new(),
        }
    }
}

/// User configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    /// Username
    pub username: String,
    /// Password (plaintext) - use password_hash for production
    #[serde(default)]
    pub password: Option<String>,
    /// Password hash (argon2 PHC format: $argon2id$v=19$...)
    #[serde(default)]
    pub password_hash: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MQTTGATE__` prefix with double underscores for nesting:
    ///    - `MQTTGATE__SERVER__BIND=0.0.0.0:1884` overrides `server.bind`
    ///    - `MQTTGATE__LIMITS__IDLE_TIMEOUT=2m` overrides `limits.idle_timeout`
    ///    - `MQTTGATE__CODEC__CHARSET=iso-8859-1` overrides `codec.charset`
    ///
    /// A missing file is not an error; defaults and the environment apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", default_log_level())?
            .set_default("server.bind", default_bind().to_string())?
            .set_default("server.accept_threads", 1)?
            .set_default("server.io_threads", 0)?
            .set_default("limits.max_packet_size", DEFAULT_MAX_PACKET_SIZE as i64)?
            .set_default("limits.max_queued_messages", DEFAULT_CAPACITY as i64)?
            .set_default("limits.idle_timeout", "90s")?
            .set_default("codec.charset", Charset::Utf8.name())?
            .set_default("auth.enabled", false)?
            .set_default("auth.allow_anonymous", true)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("MQTTGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, no file
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_packet_size > MAX_REMAINING_LENGTH {
            return Err(ConfigError::Validation(format!(
                "max_packet_size must not exceed {} bytes",
                MAX_REMAINING_LENGTH
            )));
        }

        for user in &self.auth.users {
            match (&user.password, &user.password_hash) {
                (None, None) => {
                    return Err(ConfigError::Validation(format!(
                        "User '{}' must have either 'password' or 'password_hash'",
                        user.username
                    )));
                }
                (Some(_), Some(_)) => {
                    return Err(ConfigError::Validation(format!(
                        "User '{}' cannot have both 'password' and 'password_hash'",
                        user.username
                    )));
                }
                (Some(pwd), None) if pwd.is_empty() => {
                    return Err(ConfigError::Validation(format!(
                        "User '{}' has empty password",
                        user.username
                    )));
                }
                (None, Some(hash)) if !hash.starts_with("$argon2") => {
                    return Err(ConfigError::Validation(format!(
                        "User '{}' has invalid password_hash format (must be argon2 PHC format)",
                        user.username
                    )));
                }
                _ => {}
            }
        }

        if let Some(tls) = &self.server.tls {
            if tls.cert.is_empty() {
                return Err(ConfigError::Validation(
                    "server.tls.cert is required when TLS is configured".to_string(),
                ));
            }
            if tls.key.is_empty() {
                return Err(ConfigError::Validation(
                    "server.tls.key is required when TLS is configured".to_string(),
                ));
            }
            if tls.require_client_cert && tls.ca_cert.is_none() {
                return Err(ConfigError::Validation(
                    "server.tls.ca_cert is required when require_client_cert is set".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Runtime settings for [`crate::gateway::Gateway::bind`], normalized
    pub fn to_gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            bind_addr: self.server.bind,
            accept_threads: self.server.accept_threads,
            io_threads: self.server.io_threads,
            idle_timeout: self.limits.idle_timeout,
            max_packet_size: self.limits.max_packet_size,
            max_queued_messages: self.limits.max_queued_messages,
            charset: self.codec.charset,
            tls: self.server.tls.as_ref().map(|tls| TlsConfig {
                cert_path: PathBuf::from(&tls.cert),
                key_path: PathBuf::from(&tls.key),
                ca_cert_path: tls.ca_cert.as_ref().map(PathBuf::from),
                require_client_cert: tls.require_client_cert,
            }),
        }
        .normalized()
    }
}
