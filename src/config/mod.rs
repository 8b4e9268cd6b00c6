//! Configuration Module
//!
//! TOML-based settings with support for:
//! - Worker thread count
//! - Session expiry and queue limits
//! - Authentication (password file, external plugin)
//! - Persistence file locations
//! - Environment variable overrides (EMBERMQ__ prefix)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
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

/// Root settings structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    /// Server configuration
    pub server: ServerSettings,
    /// Session configuration
    pub session: SessionSettings,
    /// Authentication configuration
    pub auth: AuthSettings,
    /// Persistence configuration
    pub persistence: PersistenceSettings,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Number of worker threads (0 = one per CPU)
    #[serde(default)]
    pub workers: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { workers: 0 }
    }
}

impl ServerSettings {
    /// Worker count with 0 resolved to the CPU count.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Seconds of idle time before a disconnected session is swept
    #[serde(default = "default_expire_after")]
    pub expire_after_seconds: u64,
    /// How often the expiry sweep runs, in seconds
    #[serde(default = "default_expiry_check_interval")]
    pub expiry_check_interval: u64,
    /// Maximum queued messages per disconnected session
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,
}

fn default_expire_after() -> u64 {
    86400
}
fn default_expiry_check_interval() -> u64 {
    60
}
fn default_max_queued_messages() -> usize {
    1000
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            expire_after_seconds: default_expire_after(),
            expiry_check_interval: default_expiry_check_interval(),
            max_queued_messages: default_max_queued_messages(),
        }
    }
}

impl SessionSettings {
    pub fn expire_after(&self) -> Duration {
        Duration::from_secs(self.expire_after_seconds)
    }

    pub fn expiry_check_interval_duration(&self) -> Duration {
        Duration::from_secs(self.expiry_check_interval)
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Mosquitto-style password file; absent disables file authentication
    pub password_file: Option<PathBuf>,
    /// Allow users not present in the password file
    #[serde(default)]
    pub allow_anonymous: bool,
    /// Seconds between password file change checks
    #[serde(default = "default_password_file_check_interval")]
    pub password_file_check_interval: u64,
    /// External auth plugin (mosquitto auth plugin version 2 ABI)
    pub plugin_path: Option<PathBuf>,
    /// Serialize plugin init calls across workers
    #[serde(default)]
    pub plugin_serialize_init: bool,
    /// Serialize per-request plugin checks
    #[serde(default)]
    pub plugin_serialize_checks: bool,
    /// Options handed to the plugin as a {key, value} vector
    #[serde(default)]
    pub plugin_opts: HashMap<String, String>,
}

fn default_password_file_check_interval() -> u64 {
    2
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            password_file: None,
            allow_anonymous: false,
            password_file_check_interval: default_password_file_check_interval(),
            plugin_path: None,
            plugin_serialize_init: false,
            plugin_serialize_checks: false,
            plugin_opts: HashMap::new(),
        }
    }
}

impl AuthSettings {
    pub fn password_file_check_interval_duration(&self) -> Duration {
        Duration::from_secs(self.password_file_check_interval)
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    /// Retained-messages file; absent disables retained persistence
    pub retained_path: Option<PathBuf>,
    /// Sessions+subscriptions file; absent disables session persistence
    pub sessions_path: Option<PathBuf>,
    /// Seconds between periodic saves
    #[serde(default = "default_save_interval")]
    pub save_interval: u64,
}

fn default_save_interval() -> u64 {
    900
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            retained_path: None,
            sessions_path: None,
            save_interval: default_save_interval(),
        }
    }
}

impl PersistenceSettings {
    pub fn save_interval_duration(&self) -> Duration {
        Duration::from_secs(self.save_interval)
    }
}

impl Settings {
    /// Load settings from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax
    /// 2. Override via env vars: `EMBERMQ__` prefix with double underscores
    ///    for nesting, e.g. `EMBERMQ__SERVER__WORKERS=4` overrides
    ///    `server.workers`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("server.workers", 0)?
            .set_default("session.expire_after_seconds", 86400)?
            .set_default("session.expiry_check_interval", 60)?
            .set_default("session.max_queued_messages", 1000)?
            .set_default("auth.allow_anonymous", false)?
            .set_default("auth.password_file_check_interval", 2)?
            .set_default("auth.plugin_serialize_init", false)?
            .set_default("auth.plugin_serialize_checks", false)?
            .set_default("persistence.save_interval", 900)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore is
        // preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("EMBERMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = cfg.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse settings from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_queued_messages == 0 {
            return Err(ConfigError::Validation(
                "session.max_queued_messages must be at least 1".to_string(),
            ));
        }
        if self.session.expire_after_seconds == 0 {
            return Err(ConfigError::Validation(
                "session.expire_after_seconds must be at least 1".to_string(),
            ));
        }
        if self.auth.password_file_check_interval == 0 {
            return Err(ConfigError::Validation(
                "auth.password_file_check_interval must be at least 1".to_string(),
            ));
        }
        if self.persistence.save_interval == 0 {
            return Err(ConfigError::Validation(
                "persistence.save_interval must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
