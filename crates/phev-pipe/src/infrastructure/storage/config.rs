//! TOML-based configuration persistence.
//!
//! The default location is platform dependent:
//! - Windows:  `%APPDATA%\PhevPipe\config.toml`
//! - Linux:    `~/.config/phev-pipe/config.toml`
//! - macOS:    `~/Library/Application Support/PhevPipe/config.toml`
//!
//! ```toml
//! [client]
//! mac = "24:0a:c4:11:22:33"
//! log_level = "debug"
//!
//! [vehicle]
//! host = "192.168.8.46"
//! port = 8080
//!
//! [session]
//! register_device = true
//! filtered_registers = [30]
//! ```
//!
//! Every field has a `#[serde(default = ...)]`, so a missing file, a missing
//! table or a missing key all fall back to working values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use phev_core::protocol::messages::MAC_LEN;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::settings::SessionConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The configured MAC address is not six colon-separated hex bytes.
    #[error("invalid MAC address {0:?}")]
    InvalidMac(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub vehicle: VehicleConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Identity of this device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    /// MAC address announced to the head unit, `aa:bb:cc:dd:ee:ff`.
    #[serde(default = "default_mac")]
    pub mac: String,
    /// `tracing` level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Where the head unit listens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VehicleConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Socket read timeout; bounds one loop iteration.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl VehicleConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_mac() -> String {
    "00:00:00:00:00:00".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_host() -> String {
    "192.168.8.46".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_read_timeout_ms() -> u64 {
    50
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mac: default_mac(),
            log_level: default_log_level(),
        }
    }
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

/// Parses `aa:bb:cc:dd:ee:ff` (also accepts `-` separators).
///
/// # Errors
///
/// [`ConfigError::InvalidMac`] unless the string is exactly six hex bytes.
pub fn parse_mac(text: &str) -> Result<[u8; MAC_LEN], ConfigError> {
    let invalid = || ConfigError::InvalidMac(text.to_string());
    let mut mac = [0u8; MAC_LEN];
    let mut parts = text.trim().split([':', '-']);

    for byte in mac.iter_mut() {
        let part = parts.next().ok_or_else(invalid)?;
        if part.len() != 2 {
            return Err(invalid());
        }
        *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok(mac)
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(platform_config_dir()
        .ok_or(ConfigError::NoPlatformConfigDir)?
        .join("config.toml"))
}

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the
/// file does not exist yet.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("PhevPipe"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("phev-pipe"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("PhevPipe")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
