use std::path::PathBuf;

use thiserror::Error;

/// cimage error types
#[derive(Error, Debug)]
pub enum CimageError {
    /// Image, manifest descriptor, platform, layer or blob has no matching entry
    #[error("Not found: {0}")]
    NotFound(String),

    /// Content does not hash to its declared digest
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Two sources of truth disagree on the number of layers
    #[error("Cardinality mismatch ({context}): expected {expected}, got {actual}")]
    CardinalityMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// Registry login or challenge failure
    #[error("Authentication failed for {registry}: {message}")]
    AuthError { registry: String, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// I/O error on a known path
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Malformed image reference
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// Malformed digest string
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    /// Malformed platform string
    #[error("Invalid platform: {0}")]
    InvalidPlatform(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// A single layer transfer failed during push or pull
    #[error("Layer {layer} failed: {source}")]
    LayerTransfer {
        layer: String,
        #[source]
        source: Box<CimageError>,
    },

    /// Layer tar stream could not be split or reassembled
    #[error("Tar-split error: {0}")]
    TarSplitError(String),

    /// Build step execution error
    #[error("Build error: {0}")]
    BuildError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CimageError {
    /// Attach a path to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CimageError::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap an error as the failure of one layer transfer.
    pub fn layer_transfer(layer: impl Into<String>, source: CimageError) -> Self {
        CimageError::LayerTransfer {
            layer: layer.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error (or the layer failure it wraps) is a `NotFound`.
    pub fn is_not_found(&self) -> bool {
        match self {
            CimageError::NotFound(_) => true,
            CimageError::Io { source, .. } | CimageError::IoError(source) => {
                source.kind() == std::io::ErrorKind::NotFound
            }
            CimageError::LayerTransfer { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Whether this error (or the layer failure it wraps) is a `DigestMismatch`.
    pub fn is_digest_mismatch(&self) -> bool {
        match self {
            CimageError::DigestMismatch { .. } => true,
            CimageError::LayerTransfer { source, .. } => source.is_digest_mismatch(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for CimageError {
    fn from(err: serde_json::Error) -> Self {
        CimageError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CimageError {
    fn from(err: serde_yaml::Error) -> Self {
        CimageError::SerializationError(err.to_string())
    }
}

/// Result type alias for cimage operations
pub type Result<T> = std::result::Result<T, CimageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let error = CimageError::NotFound("image demo:v1".to_string());
        assert_eq!(error.to_string(), "Not found: image demo:v1");
    }

    #[test]
    fn test_digest_mismatch_display() {
        let error = CimageError::DigestMismatch {
            expected: "sha256:aaa".to_string(),
            actual: "sha256:bbb".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Digest mismatch: expected sha256:aaa, got sha256:bbb"
        );
    }

    #[test]
    fn test_cardinality_mismatch_display() {
        let error = CimageError::CardinalityMismatch {
            context: "pull demo:v1".to_string(),
            expected: 3,
            actual: 2,
        };
        assert_eq!(
            error.to_string(),
            "Cardinality mismatch (pull demo:v1): expected 3, got 2"
        );
    }

    #[test]
    fn test_auth_error_display() {
        let error = CimageError::AuthError {
            registry: "registry.local".to_string(),
            message: "401 Unauthorized".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Authentication failed for registry.local: 401 Unauthorized"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: CimageError = io_error.into();
        assert!(matches!(error, CimageError::IoError(_)));
        assert!(error.to_string().contains("file not found"));
        assert!(error.is_not_found());
    }

    #[test]
    fn test_io_with_path_display() {
        let error = CimageError::io(
            "/data/layers/abc",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(error.to_string(), "I/O error at /data/layers/abc: denied");
        assert!(!error.is_not_found());
    }

    #[test]
    fn test_layer_transfer_wraps_source() {
        let error = CimageError::layer_transfer(
            "sha256:abc",
            CimageError::DigestMismatch {
                expected: "sha256:aaa".to_string(),
                actual: "sha256:bbb".to_string(),
            },
        );
        assert!(error.to_string().starts_with("Layer sha256:abc failed:"));
        assert!(error.is_digest_mismatch());
        assert!(!error.is_not_found());
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error: CimageError = err.into();
        assert!(matches!(error, CimageError::SerializationError(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let err = serde_yaml::from_str::<Vec<String>>("a: [").unwrap_err();
        let error: CimageError = err.into();
        assert!(matches!(error, CimageError::SerializationError(_)));
    }

    #[test]
    fn test_registry_error_display() {
        let error = CimageError::RegistryError {
            registry: "ghcr.io".to_string(),
            message: "500 Internal Server Error".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Registry error: ghcr.io - 500 Internal Server Error"
        );
    }

    #[test]
    fn test_other_error_display() {
        let error = CimageError::Other("something happened".to_string());
        assert_eq!(error.to_string(), "something happened");
    }
}
