//! Registry credentials.
//!
//! Credentials live in `<data_root>/auth.json` as base64 `user:password`
//! per registry, the same shape docker uses:
//!
//! ```json
//! {"auths": {"localhost:5000": {"auth": "dXNlcjpwYXNz"}}}
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::prelude::*;
use serde::{Deserialize, Serialize};

use cimage_core::error::{CimageError, Result};

use crate::fsutil::atomic_write;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuthEntry {
    auth: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AuthFile {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,
}

/// Persistent per-registry credential store.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store credentials for a registry, replacing any existing entry.
    pub fn store(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        let mut file = self.load()?;
        file.auths.insert(
            normalize_registry(registry),
            AuthEntry {
                auth: BASE64_STANDARD.encode(format!("{}:{}", username, password)),
            },
        );
        self.save(&file)
    }

    /// Credentials for a registry as `(username, password)`.
    pub fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        let file = self.load()?;
        let Some(entry) = file.auths.get(&normalize_registry(registry)) else {
            return Ok(None);
        };

        let decoded = BASE64_STANDARD
            .decode(entry.auth.as_bytes())
            .map_err(|e| self.corrupt(format!("invalid base64 for {}: {}", registry, e)))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|e| self.corrupt(format!("invalid UTF-8 for {}: {}", registry, e)))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| self.corrupt(format!("missing ':' in entry for {}", registry)))?;
        Ok(Some((username.to_string(), password.to_string())))
    }

    /// Remove credentials for a registry. Returns whether an entry existed.
    pub fn remove(&self, registry: &str) -> Result<bool> {
        let mut file = self.load()?;
        let removed = file.auths.remove(&normalize_registry(registry)).is_some();
        if removed {
            self.save(&file)?;
        }
        Ok(removed)
    }

    /// Registries with stored credentials, sorted.
    pub fn list_registries(&self) -> Result<Vec<String>> {
        Ok(self.load()?.auths.into_keys().collect())
    }

    fn load(&self) -> Result<AuthFile> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(AuthFile::default()),
            Err(e) => return Err(CimageError::io(&self.path, e)),
        };
        serde_json::from_slice(&data).map_err(|e| self.corrupt(e.to_string()))
    }

    fn save(&self, file: &AuthFile) -> Result<()> {
        let data = serde_json::to_vec_pretty(file)?;
        atomic_write(&self.path, &data)
    }

    fn corrupt(&self, message: String) -> CimageError {
        CimageError::ConfigError(format!(
            "credential store {}: {}",
            self.path.display(),
            message
        ))
    }
}

/// `docker.io` and its API host share one entry.
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().trim_end_matches('/').to_lowercase();
    let r = r
        .strip_prefix("https://")
        .or_else(|| r.strip_prefix("http://"))
        .unwrap_or(&r)
        .to_string();
    if r == "docker.io" || r == "registry-1.docker.io" {
        "index.docker.io".to_string()
    } else {
        r
    }
}

/// Credentials presented to a registry.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Read `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`, falling back to anonymous.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(username), Some(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    /// Stored credentials for `registry`, then the environment, then anonymous.
    pub fn from_credential_store(store: &CredentialStore, registry: &str) -> Self {
        match store.get(registry) {
            Ok(Some((username, password))) => return Self::basic(username, password),
            Ok(None) => {}
            Err(e) => tracing::warn!(registry, error = %e, "Ignoring unreadable credential store"),
        }
        Self::from_env()
    }

    /// `(username, password)` when credentials are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.credentials().is_none()
    }
}
