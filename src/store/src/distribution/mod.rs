//! Distribution client: moves layers and manifests between the local
//! stores and a registry speaking the standard manifest/blob protocol.

mod auth;
mod http;
mod login;
mod pull;
mod push;
mod reference;
mod registry;
#[cfg(test)]
mod testing;
pub mod types;

pub use auth::{CredentialStore, RegistryAuth};
pub use http::HttpRegistry;
pub use login::{login, logout};
pub use pull::Puller;
pub use push::{PushResult, Pusher};
pub use reference::ImageReference;
pub use registry::{BlobBody, Registry};

use std::sync::Arc;

use cimage_core::config::RegistryConfig;
use cimage_core::error::Result;

/// Open an HTTP registry client for `reference`, authenticating with the
/// stored credentials for its registry.
pub fn connect(
    reference: &ImageReference,
    config: &RegistryConfig,
    credentials: &CredentialStore,
) -> Result<Arc<dyn Registry>> {
    let auth = RegistryAuth::from_credential_store(credentials, &reference.registry);
    Ok(Arc::new(HttpRegistry::new(reference.api_host(), auth, config)?))
}
