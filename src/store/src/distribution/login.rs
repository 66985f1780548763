//! Registry login and logout.

use cimage_core::config::RegistryConfig;
use cimage_core::error::Result;

use super::auth::{CredentialStore, RegistryAuth};
use super::http::HttpRegistry;
use super::registry::Registry;

/// Verify `username`/`password` against `server` and store them on success.
pub async fn login(
    server: &str,
    username: &str,
    password: &str,
    config: &RegistryConfig,
    store: &CredentialStore,
) -> Result<()> {
    let registry = HttpRegistry::for_login(server, RegistryAuth::basic(username, password), config)?;
    registry.ping().await?;
    store.store(server, username, password)?;
    tracing::info!(registry = server, username, "Login succeeded");
    Ok(())
}

/// Forget the credentials stored for `server`. Returns whether any existed.
pub fn logout(server: &str, store: &CredentialStore) -> Result<bool> {
    let removed = store.remove(server)?;
    if removed {
        tracing::info!(registry = server, "Removed credentials");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cimage_core::error::CimageError;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn basic_registry() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .and(header("Authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", r#"Basic realm="test""#))
            .with_priority(10)
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_login_stores_credentials() {
        let server = basic_registry().await;
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("auth.json"));

        login(&server.uri(), "user", "pass", &RegistryConfig::default(), &store)
            .await
            .unwrap();
        assert_eq!(
            store.get(&server.uri()).unwrap(),
            Some(("user".to_string(), "pass".to_string()))
        );

        assert!(logout(&server.uri(), &store).unwrap());
        assert!(!logout(&server.uri(), &store).unwrap());
    }

    #[tokio::test]
    async fn test_rejected_login_stores_nothing() {
        let server = basic_registry().await;
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("auth.json"));

        let err = login(&server.uri(), "user", "wrong", &RegistryConfig::default(), &store)
            .await
            .unwrap_err();
        assert!(matches!(err, CimageError::AuthError { .. }));
        assert!(store.list_registries().unwrap().is_empty());
    }
}
