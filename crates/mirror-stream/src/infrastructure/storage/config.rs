//! TOML-based configuration persistence.
//!
//! Reads and writes [`MirrorConfig`] to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\DeviceMirror\mirror.toml`
//! - Linux:    `~/.config/devicemirror/mirror.toml`
//! - macOS:    `~/Library/Application Support/DeviceMirror/mirror.toml`
//!
//! Example file:
//!
//! ```toml
//! [agent]
//! codec = "synthetic"
//! bit_rate = 8000000
//!
//! [viewer]
//! bind_address = "127.0.0.1"
//! port = 27183
//!
//! [logging]
//! level = "debug"
//! ```
//!
//! Every field has a `#[serde(default = "...")]`, so a missing file, a
//! missing section or a missing key all fall back to the defaults below.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the configuration file inside [`config_dir`].
pub const CONFIG_FILE_NAME: &str = "mirror.toml";

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The value could not be serialized to TOML.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MirrorConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub viewer: ViewerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Settings for the device-side agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// Identity used to key persisted bit-rate state.
    #[serde(default = "default_device_id")]
    pub device_id: String,
    /// Codec name announced on the video channel (at most 20 ASCII bytes).
    #[serde(default = "default_codec")]
    pub codec: String,
    /// Encoder bit rate in bits per second when no cap has been learned.
    #[serde(default = "default_bit_rate")]
    pub bit_rate: u32,
    /// Largest encoded width and height; 0 means the encoder limit.
    #[serde(default)]
    pub max_width: u32,
    #[serde(default)]
    pub max_height: u32,
    /// Width and height of the simulated display.
    #[serde(default = "default_display_width")]
    pub display_width: u32,
    #[serde(default = "default_display_height")]
    pub display_height: u32,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
}

/// Settings for the viewer endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewerConfig {
    /// IP address the viewer listens on; agents connect to it.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Resolution cap the viewer requests once a session starts.
    #[serde(default)]
    pub max_width: u32,
    #[serde(default)]
    pub max_height: u32,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_device_id() -> String {
    "local-device".to_string()
}
fn default_codec() -> String {
    "synthetic".to_string()
}
fn default_bit_rate() -> u32 {
    8_000_000
}
fn default_display_width() -> u32 {
    1080
}
fn default_display_height() -> u32 {
    2400
}
fn default_handshake_timeout_ms() -> u64 {
    5_000
}
fn default_io_timeout_ms() -> u64 {
    1_000
}
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    27183
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            codec: default_codec(),
            bit_rate: default_bit_rate(),
            max_width: 0,
            max_height: 0,
            display_width: default_display_width(),
            display_height: default_display_height(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
        }
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            max_width: 0,
            max_height: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config files.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to `mirror.toml`.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Loads the config from the platform path.
///
/// # Errors
///
/// As for [`load_config_from`].
pub fn load_config() -> Result<MirrorConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Persists `config` to the platform path.
///
/// # Errors
///
/// As for [`save_config_to`].
pub fn save_config(config: &MirrorConfig) -> Result<(), ConfigError> {
    save_config_to(&config_file_path()?, config)
}

/// Loads a config from `path`, returning the defaults if the file does not
/// exist yet.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<MirrorConfig, ConfigError> {
    load_toml_or_default(path)
}

/// Writes `config` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(path: &Path, config: &MirrorConfig) -> Result<(), ConfigError> {
    save_toml(path, config)
}

pub(crate) fn load_toml_or_default<T>(path: &Path) -> Result<T, ConfigError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub(crate) fn save_toml<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(value)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the platform config directory including the application folder.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("DeviceMirror"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("devicemirror"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("DeviceMirror")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
