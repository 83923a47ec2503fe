//! Server configuration

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration loading and validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Reading the file failed
    #[error("cannot read {path}: {source}")]
    Read {
        /// File that was being read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema
    #[error("cannot parse {path}: {source}")]
    Parse {
        /// File that was being parsed
        path: PathBuf,
        /// Underlying error
        source: toml::de::Error,
    },
    /// A value is out of range or inconsistent
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// What is wrong
        reason: String,
    },
}

/// A named account served by the built-in credential table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserEntry {
    /// Login name
    pub name: String,
    /// Hex encoded SHA-256 digest of the password
    pub password_sha256: String,
    /// Jail root for this user's sessions
    pub root: PathBuf,
}

/// Immutable server configuration, built once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FtpConfig {
    /// Control connection listen address
    pub bind: SocketAddr,
    /// Name announced in the greeting
    pub server_name: String,
    /// First port of the passive range (inclusive)
    pub pasv_port_start: u16,
    /// Last port of the passive range (inclusive)
    pub pasv_port_end: u16,
    /// Address advertised in PASV replies; the control socket address when unset
    pub pasv_address: Option<Ipv4Addr>,
    /// Maximum number of concurrent workers
    pub max_clients: Option<usize>,
    /// Maximum number of concurrent workers per peer address
    pub max_clients_per_addr: Option<usize>,
    /// Per-transfer rate limit in bytes per second (0 = unlimited)
    pub max_bytes_per_sec: u64,
    /// Idle time after which a control connection is closed
    pub idle_timeout_ms: u64,
    /// Whether USER anonymous is accepted
    pub allow_anonymous: bool,
    /// Jail root for anonymous sessions
    pub anon_root: PathBuf,
    /// Whether the jail follows symbolic links
    pub allow_symlinks: bool,
    /// Default tracing filter
    pub log_level: String,
    /// Named accounts
    pub users: Vec<UserEntry>,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8008)),
            server_name: "jailftpd".to_string(),
            pasv_port_start: 1025,
            pasv_port_end: 65535,
            pasv_address: None,
            max_clients: None,
            max_clients_per_addr: None,
            max_bytes_per_sec: 0,
            idle_timeout_ms: 300_000,
            allow_anonymous: true,
            anon_root: PathBuf::from("/srv/ftp"),
            allow_symlinks: false,
            log_level: "info".to_string(),
            users: Vec::new(),
        }
    }
}

impl FtpConfig {
    /// Reads and validates a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: FtpConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if it exists, otherwise falls back to the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Idle timeout of a control connection.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Rate limit, or `None` when transfers are unthrottled.
    pub fn rate_limit(&self) -> Option<u64> {
        (self.max_bytes_per_sec > 0).then_some(self.max_bytes_per_sec)
    }

    /// Checks value ranges and cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pasv_port_start > self.pasv_port_end {
            return Err(invalid(format!(
                "passive port range {}-{} is empty",
                self.pasv_port_start, self.pasv_port_end
            )));
        }

        if self.pasv_port_start == 0 {
            return Err(invalid("passive port range cannot start at 0"));
        }

        if self.max_clients == Some(0) {
            return Err(invalid("max_clients must be at least 1"));
        }

        if self.max_clients_per_addr == Some(0) {
            return Err(invalid("max_clients_per_addr must be at least 1"));
        }

        if self.idle_timeout_ms == 0 {
            return Err(invalid("idle_timeout_ms must be at least 1"));
        }

        if !self.anon_root.is_absolute() {
            return Err(invalid(format!(
                "anon_root must be absolute: {}",
                self.anon_root.display()
            )));
        }

        let mut seen = HashSet::new();
        for user in &self.users {
            if user.name.is_empty() {
                return Err(invalid("user name cannot be empty"));
            }
            if user.name.eq_ignore_ascii_case("anonymous") {
                return Err(invalid("'anonymous' is reserved"));
            }
            if !seen.insert(user.name.as_str()) {
                return Err(invalid(format!("duplicate user: {}", user.name)));
            }
            if user.password_sha256.len() != 64
                || !user.password_sha256.bytes().all(|b| b.is_ascii_hexdigit())
            {
                return Err(invalid(format!(
                    "password_sha256 for {} must be 64 hex characters",
                    user.name
                )));
            }
            if !user.root.is_absolute() {
                return Err(invalid(format!(
                    "root for {} must be absolute: {}",
                    user.name,
                    user.root.display()
                )));
            }
        }

        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
}
