use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CimageError, Result};

/// Environment variable overriding the data root.
pub const DATA_ROOT_ENV: &str = "CIMAGE_DATA_ROOT";

/// Environment variable forcing `insecure` registry access.
pub const INSECURE_REGISTRY_ENV: &str = "CIMAGE_INSECURE_REGISTRY";

/// cimage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CimageConfig {
    /// Local store layout
    pub store: StoreConfig,

    /// Registry connection settings
    pub registry: RegistryConfig,

    /// Log level
    pub log_level: LogLevel,
}

impl CimageConfig {
    /// Load configuration from a YAML file, applying environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            CimageError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config: CimageConfig = serde_yaml::from_str(&data)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, defaults (plus environment) otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let mut config = Self::default();
                config.apply_env();
                config.validate()?;
                Ok(config)
            }
        }
    }

    fn apply_env(&mut self) {
        if let Ok(root) = std::env::var(DATA_ROOT_ENV) {
            if !root.is_empty() {
                self.store.data_root = PathBuf::from(root);
            }
        }
        if let Ok(v) = std::env::var(INSECURE_REGISTRY_ENV) {
            if v == "1" || v.eq_ignore_ascii_case("true") {
                self.registry.insecure = true;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.data_root.as_os_str().is_empty() {
            return Err(CimageError::ConfigError(
                "store.data_root must not be empty".to_string(),
            ));
        }
        self.registry.validate()
    }
}

/// Local store layout, all rooted under `data_root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
        }
    }
}

impl StoreConfig {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    /// Raw layer file trees: `layers/<hex>`.
    pub fn layer_data_root(&self) -> PathBuf {
        self.data_root.join("layers")
    }

    /// Per-layer sidecars: `layerdb/sha256/<hex>`.
    pub fn layer_db_root(&self) -> PathBuf {
        self.data_root.join("layerdb").join(crate::digest::SHA256)
    }

    /// Serialized image specs: `images/<id>.yaml`.
    pub fn image_db_root(&self) -> PathBuf {
        self.data_root.join("images")
    }

    /// The name → manifest list index.
    pub fn image_metadata_file(&self) -> PathBuf {
        self.data_root.join("image_metadata.json")
    }

    /// Scratch space for in-flight downloads and builds.
    pub fn tmp_root(&self) -> PathBuf {
        self.data_root.join("tmp")
    }

    /// Registry credentials file.
    pub fn auth_file(&self) -> PathBuf {
        self.data_root.join("auth.json")
    }
}

fn default_data_root() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".cimage"))
        .unwrap_or_else(|| PathBuf::from(".cimage"))
}

/// Registry connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// TCP connect timeout in seconds
    pub dial_timeout_secs: u64,

    /// TLS handshake timeout in seconds
    pub tls_handshake_timeout_secs: u64,

    /// Request timeout of the login client in seconds
    pub login_timeout_secs: u64,

    /// Accept invalid TLS certificates
    pub insecure: bool,

    /// Talk plain HTTP instead of HTTPS
    pub plain_http: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: 30,
            tls_handshake_timeout_secs: 10,
            login_timeout_secs: 15,
            insecure: false,
            plain_http: false,
        }
    }
}

impl RegistryConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.tls_handshake_timeout_secs)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("dial_timeout_secs", self.dial_timeout_secs),
            ("tls_handshake_timeout_secs", self.tls_handshake_timeout_secs),
            ("login_timeout_secs", self.login_timeout_secs),
        ] {
            if value == 0 {
                return Err(CimageError::ConfigError(format!(
                    "registry.{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[default]
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = CimageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(CimageError::ConfigError(format!(
                "unknown log level '{}' (supported: debug, info, warn, error)",
                s
            ))),
        }
    }
}
