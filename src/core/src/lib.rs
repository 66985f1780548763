//! cimage core - foundational types shared by the store, cache and
//! distribution crates.

pub mod config;
pub mod digest;
pub mod error;
pub mod platform;

// Re-export commonly used types
pub use config::{CimageConfig, LogLevel, RegistryConfig, StoreConfig};
pub use digest::{Digest, HashingReader, HashingWriter};
pub use error::{CimageError, Result};
pub use platform::Platform;

/// cimage version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
