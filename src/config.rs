//! Broker configuration.
//!
//! Loaded from a TOML file with environment variable overrides using the
//! `MQHIVE__` prefix (double underscore for nesting), e.g.
//! `MQHIVE__ALLOW_ANONYMOUS=false` or `MQHIVE__SESSION_EXPIRY_DEFAULT=60`.

use std::path::{Path, PathBuf};

use config::{Environment, File};
use serde::Deserialize;

pub const DEFAULT_SESSION_EXPIRY: u64 = 300;
pub const DEFAULT_QUEUE_BOUND: usize = 1000;
pub const DEFAULT_SYS_INTERVAL: u64 = 15;

/// A configured user with credentials and an ordered ACL.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub name: String,
    /// Plaintext password. Use only for development.
    pub password: Option<String>,
    /// Argon2 hash in PHC string format; takes priority over `password`.
    pub password_hash: Option<String>,
    /// Rules of the form `allow <filter>` / `deny <filter>`, first match wins.
    pub acls: Vec<String>,
}

/// Persistence settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("mqhive-data"),
        }
    }
}

/// Root configuration consumed by the broker core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Admit clients that present no credentials.
    pub allow_anonymous: bool,
    /// Static user list.
    pub users: Vec<UserConfig>,
    /// Grace window in seconds for sessions whose CONNECT carried no
    /// Session-Expiry-Interval.
    pub session_expiry_default: u64,
    /// Bound of each session's outbound packet queue.
    pub outbound_queue_bound: usize,
    /// Bound of each session's delivery backlog.
    pub backlog_bound: usize,
    /// Seconds between $SYS stat publishes.
    pub sys_interval: u64,
    pub persistence: PersistenceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allow_anonymous: true,
            users: Vec::new(),
            session_expiry_default: DEFAULT_SESSION_EXPIRY,
            outbound_queue_bound: DEFAULT_QUEUE_BOUND,
            backlog_bound: DEFAULT_QUEUE_BOUND,
            sys_interval: DEFAULT_SYS_INTERVAL,
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply `MQHIVE__` env
    /// overrides. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix("MQHIVE").separator("__"))
            .build()?
            .try_deserialize()
    }
}
