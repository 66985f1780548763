//! Registry v2 HTTP client over `reqwest`.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use cimage_core::config::RegistryConfig;
use cimage_core::digest::Digest;
use cimage_core::error::{CimageError, Result};

use super::auth::RegistryAuth;
use super::registry::{BlobBody, Registry};
use super::types::{Descriptor, RawManifest, MEDIA_TYPE_MANIFEST};

const ACCEPT_MANIFESTS: &str = "application/vnd.docker.distribution.manifest.v2+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.oci.image.index.v1+json";

/// Authentication scheme announced by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Challenge {
    Basic,
    Bearer { realm: String, service: Option<String> },
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// [`Registry`] implementation speaking the distribution HTTP API.
///
/// The first 401 is answered by parsing `WWW-Authenticate`; bearer tokens
/// are cached per scope for the lifetime of the client.
pub struct HttpRegistry {
    client: Client,
    base_url: Url,
    registry: String,
    auth: RegistryAuth,
    challenge: Mutex<Option<Challenge>>,
    tokens: Mutex<HashMap<String, String>>,
}

impl HttpRegistry {
    /// Connect to `registry` (a host, or a full `http(s)://` URL).
    pub fn new(registry: &str, auth: RegistryAuth, config: &RegistryConfig) -> Result<Self> {
        Self::build(registry, auth, config, None)
    }

    /// Client with the short whole-request timeout used by `login`.
    pub fn for_login(registry: &str, auth: RegistryAuth, config: &RegistryConfig) -> Result<Self> {
        Self::build(registry, auth, config, Some(config.login_timeout()))
    }

    fn build(
        registry: &str,
        auth: RegistryAuth,
        config: &RegistryConfig,
        timeout: Option<std::time::Duration>,
    ) -> Result<Self> {
        let registry = registry.trim().trim_end_matches('/');
        let base = if registry.starts_with("http://") || registry.starts_with("https://") {
            registry.to_string()
        } else if config.plain_http {
            format!("http://{}", registry)
        } else {
            format!("https://{}", registry)
        };
        let base_url = Url::parse(&format!("{}/", base))
            .map_err(|e| CimageError::InvalidReference(format!("registry '{}': {}", registry, e)))?;

        // reqwest's connect timeout spans both the TCP dial and the TLS handshake.
        let mut builder = Client::builder()
            .connect_timeout(config.dial_timeout() + config.tls_handshake_timeout())
            .pool_max_idle_per_host(0)
            .danger_accept_invalid_certs(config.insecure)
            .user_agent(format!("cimage/{}", cimage_core::VERSION));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| CimageError::RegistryError {
            registry: registry.to_string(),
            message: format!("Failed to build HTTP client: {}", e),
        })?;

        Ok(Self {
            client,
            base_url,
            registry: registry.to_string(),
            auth,
            challenge: Mutex::new(None),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(|e| self.registry_error(format!("bad URL {}: {}", path, e)))
    }

    fn registry_error(&self, message: impl Into<String>) -> CimageError {
        CimageError::RegistryError {
            registry: self.registry.clone(),
            message: message.into(),
        }
    }

    fn auth_error(&self, message: impl Into<String>) -> CimageError {
        CimageError::AuthError {
            registry: self.registry.clone(),
            message: message.into(),
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> CimageError {
        self.registry_error(e.to_string())
    }

    fn authorize(&self, req: RequestBuilder, scope: &str) -> RequestBuilder {
        let challenge = self.challenge.lock().clone();
        match challenge {
            Some(Challenge::Basic) => match self.auth.credentials() {
                Some((username, password)) => req.basic_auth(username, Some(password)),
                None => req,
            },
            Some(Challenge::Bearer { .. }) => match self.tokens.lock().get(scope) {
                Some(token) => req.bearer_auth(token),
                None => req,
            },
            None => req,
        }
    }

    /// Send a request, answering one authentication challenge if needed.
    ///
    /// `build` is called again for the retry, so it must not carry a
    /// one-shot body.
    async fn send<F>(&self, scope: &str, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let resp = self
            .authorize(build(&self.client), scope)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let header = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| self.auth_error("401 without an authentication challenge"))?;
        let challenge = parse_challenge(&header)
            .ok_or_else(|| self.auth_error(format!("unsupported challenge '{}'", header)))?;

        match &challenge {
            Challenge::Bearer { realm, service } => {
                let token = self.fetch_token(realm, service.as_deref(), scope).await?;
                self.tokens.lock().insert(scope.to_string(), token);
            }
            Challenge::Basic if self.auth.is_anonymous() => {
                return Err(self.auth_error("registry requires credentials"));
            }
            Challenge::Basic => {}
        }
        *self.challenge.lock() = Some(challenge);

        let resp = self
            .authorize(build(&self.client), scope)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(self.auth_error(format!(
                "{} after authenticating",
                resp.status()
            ))),
            _ => Ok(resp),
        }
    }

    async fn fetch_token(&self, realm: &str, service: Option<&str>, scope: &str) -> Result<String> {
        let mut url = Url::parse(realm).map_err(|e| self.auth_error(format!("bad realm '{}': {}", realm, e)))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = service {
                query.append_pair("service", service);
            }
            if !scope.is_empty() {
                query.append_pair("scope", scope);
            }
        }

        tracing::debug!(registry = %self.registry, scope, "Fetching registry token");
        let mut req = self.client.get(url);
        if let Some((username, password)) = self.auth.credentials() {
            req = req.basic_auth(username, Some(password));
        }
        let resp = req.send().await.map_err(|e| self.transport_error(e))?;
        if !resp.status().is_success() {
            return Err(self.auth_error(format!("token endpoint returned {}", resp.status())));
        }

        let body: TokenResponse = resp.json().await.map_err(|e| self.transport_error(e))?;
        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| self.auth_error("token endpoint returned no token"))
    }

    /// Map a non-success response to an error.
    async fn check(&self, resp: Response, what: &str) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        match status {
            StatusCode::NOT_FOUND => Err(CimageError::NotFound(format!("{} in {}", what, self.registry))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(self.auth_error(format!("{} for {}", status, what)))
            }
            _ => {
                let body = resp.text().await.unwrap_or_default();
                Err(self.registry_error(format!("{} returned {}: {}", what, status, body.trim())))
            }
        }
    }
}

fn scope(repo: &str, push: bool) -> String {
    format!("repository:{}:{}", repo, if push { "pull,push" } else { "pull" })
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn ping(&self) -> Result<()> {
        let url = self.url("v2/")?;
        let resp = self.send("", |c| c.get(url.clone())).await?;
        self.check(resp, "ping").await?;
        Ok(())
    }

    async fn stat_blob(&self, repo: &str, digest: &Digest) -> Result<Option<Descriptor>> {
        let url = self.url(&format!("v2/{}/blobs/{}", repo, digest))?;
        let resp = self.send(&scope(repo, false), |c| c.head(url.clone())).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = self.check(resp, "blob stat").await?;

        let size = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let media_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        Ok(Some(Descriptor::new(media_type, size, digest.clone())))
    }

    async fn put_blob(&self, repo: &str, digest: &Digest, body: BlobBody) -> Result<()> {
        let push_scope = scope(repo, true);
        let start = self.url(&format!("v2/{}/blobs/uploads/", repo))?;
        let resp = self.send(&push_scope, |c| c.post(start.clone())).await?;
        let resp = self.check(resp, "blob upload start").await?;

        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| self.registry_error("blob upload response has no Location"))?;
        let mut upload = self
            .base_url
            .join(location)
            .map_err(|e| self.registry_error(format!("bad upload location '{}': {}", location, e)))?;
        upload.query_pairs_mut().append_pair("digest", digest.as_str());

        // The upload session is already authorized; the body can't be replayed.
        let size = body.size();
        let req = self
            .client
            .put(upload)
            .header(CONTENT_TYPE, "application/octet-stream");
        let req = match body {
            BlobBody::Bytes(data) => req.body(data),
            BlobBody::File { path, .. } => {
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| CimageError::io(&path, e))?;
                req.header(CONTENT_LENGTH, size).body(reqwest::Body::from(file))
            }
        };
        let resp = self
            .authorize(req, &push_scope)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.check(resp, "blob upload").await?;

        tracing::debug!(registry = %self.registry, repo, digest = %digest, size, "Uploaded blob");
        Ok(())
    }

    async fn fetch_blob(&self, repo: &str, digest: &Digest, dest: &Path) -> Result<u64> {
        let url = self.url(&format!("v2/{}/blobs/{}", repo, digest))?;
        let resp = self.send(&scope(repo, false), |c| c.get(url.clone())).await?;
        let resp = self.check(resp, &format!("blob {}", digest)).await?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| CimageError::io(dest, e))?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.transport_error(e))?;
            file.write_all(&chunk).await.map_err(|e| CimageError::io(dest, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| CimageError::io(dest, e))?;
        Ok(written)
    }

    async fn get_blob(&self, repo: &str, digest: &Digest) -> Result<Vec<u8>> {
        let url = self.url(&format!("v2/{}/blobs/{}", repo, digest))?;
        let resp = self.send(&scope(repo, false), |c| c.get(url.clone())).await?;
        let resp = self.check(resp, &format!("blob {}", digest)).await?;
        let bytes = resp.bytes().await.map_err(|e| self.transport_error(e))?;
        Ok(bytes.to_vec())
    }

    async fn get_manifest(&self, repo: &str, reference: &str) -> Result<RawManifest> {
        let url = self.url(&format!("v2/{}/manifests/{}", repo, reference))?;
        let resp = self
            .send(&scope(repo, false), |c| c.get(url.clone()).header(ACCEPT, ACCEPT_MANIFESTS))
            .await?;
        let resp = self.check(resp, &format!("manifest {}:{}", repo, reference)).await?;

        let media_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = resp.bytes().await.map_err(|e| self.transport_error(e))?;
        Ok(RawManifest {
            media_type,
            body: body.to_vec(),
        })
    }

    async fn put_manifest(&self, repo: &str, reference: &str, manifest: RawManifest) -> Result<Digest> {
        let url = self.url(&format!("v2/{}/manifests/{}", repo, reference))?;
        let media_type = if manifest.media_type.is_empty() {
            MEDIA_TYPE_MANIFEST
        } else {
            manifest.media_type.as_str()
        };
        let resp = self
            .send(&scope(repo, true), |c| {
                c.put(url.clone())
                    .header(CONTENT_TYPE, media_type)
                    .body(manifest.body.clone())
            })
            .await?;
        self.check(resp, &format!("manifest put {}:{}", repo, reference)).await?;

        let digest = manifest.digest();
        tracing::debug!(registry = %self.registry, repo, reference, digest = %digest, "Put manifest");
        Ok(digest)
    }
}

/// Parse a `WWW-Authenticate` header value.
fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
    match scheme.to_ascii_lowercase().as_str() {
        "basic" => Some(Challenge::Basic),
        "bearer" => {
            let mut params = parse_params(params);
            Some(Challenge::Bearer {
                realm: params.remove("realm")?,
                service: params.remove("service"),
            })
        }
        _ => None,
    }
}

/// `key="value", key=value` pairs; quoted values may contain commas.
fn parse_params(s: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = s.trim();
    while let Some((key, after)) = rest.split_once('=') {
        let key = key.trim().to_ascii_lowercase();
        let after = after.trim_start();
        let (value, remaining) = match after.strip_prefix('"') {
            Some(quoted) => match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            },
            None => match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            },
        };
        params.insert(key, value.trim().to_string());
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn registry(server: &MockServer, auth: RegistryAuth) -> HttpRegistry {
        HttpRegistry::new(&server.uri(), auth, &RegistryConfig::default()).unwrap()
    }

    async fn mount_bearer(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(header("Authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "abc"})))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(401))
            .with_priority(10)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .and(header("Authorization", "Bearer abc"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "WWW-Authenticate",
                format!(r#"Bearer realm="{}/token",service="test-registry""#, server.uri()).as_str(),
            ))
            .with_priority(10)
            .mount(server)
            .await;
    }

    #[test]
    fn test_parse_challenge() {
        assert_eq!(parse_challenge(r#"Basic realm="registry""#), Some(Challenge::Basic));
        assert_eq!(
            parse_challenge(
                r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:team/app:pull,push""#
            ),
            Some(Challenge::Bearer {
                realm: "https://auth.example.com/token".to_string(),
                service: Some("registry.example.com".to_string()),
            })
        );
        assert_eq!(parse_challenge("Bearer service=x"), None);
        assert_eq!(parse_challenge("Negotiate"), None);

        let params = parse_params(r#"realm="r", scope="a:b:pull,push",error=insufficient_scope"#);
        assert_eq!(params["scope"], "a:b:pull,push");
        assert_eq!(params["error"], "insufficient_scope");
    }

    #[test]
    fn test_base_url_scheme() {
        let mut config = RegistryConfig::default();
        let r = HttpRegistry::new("localhost:5000", RegistryAuth::anonymous(), &config).unwrap();
        assert_eq!(r.base_url.as_str(), "https://localhost:5000/");

        config.plain_http = true;
        let r = HttpRegistry::new("localhost:5000", RegistryAuth::anonymous(), &config).unwrap();
        assert_eq!(r.url("v2/").unwrap().as_str(), "http://localhost:5000/v2/");
    }

    #[tokio::test]
    async fn test_ping_with_bearer_challenge() {
        let server = MockServer::start().await;
        mount_bearer(&server).await;

        let r = registry(&server, RegistryAuth::basic("user", "pass"));
        r.ping().await.unwrap();
        assert_eq!(r.tokens.lock().get("").map(String::as_str), Some("abc"));
    }

    #[tokio::test]
    async fn test_ping_with_bad_credentials() {
        let server = MockServer::start().await;
        mount_bearer(&server).await;

        let err = registry(&server, RegistryAuth::basic("user", "wrong")).ping().await.unwrap_err();
        assert!(matches!(err, CimageError::AuthError { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_basic_challenge_requires_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .and(header("Authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", r#"Basic realm="r""#))
            .with_priority(10)
            .mount(&server)
            .await;

        registry(&server, RegistryAuth::basic("user", "pass")).ping().await.unwrap();
        let err = registry(&server, RegistryAuth::anonymous()).ping().await.unwrap_err();
        assert!(matches!(err, CimageError::AuthError { .. }));
    }

    #[tokio::test]
    async fn test_blob_upload_and_stat() {
        let server = MockServer::start().await;
        let data = b"layer bytes".to_vec();
        let digest = Digest::from_bytes(&data);

        Mock::given(method("POST"))
            .and(path("/v2/team/app/blobs/uploads/"))
            .respond_with(ResponseTemplate::new(202).insert_header("Location", "/v2/team/app/blobs/uploads/u1?state=x"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v2/team/app/blobs/uploads/u1"))
            .and(query_param("digest", digest.as_str()))
            .and(query_param("state", "x"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path(format!("/v2/team/app/blobs/{}", digest)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 11]))
            .mount(&server)
            .await;

        let r = registry(&server, RegistryAuth::anonymous());
        r.put_blob("team/app", &digest, BlobBody::Bytes(data)).await.unwrap();

        let stat = r.stat_blob("team/app", &digest).await.unwrap().unwrap();
        assert_eq!(stat.digest, digest);
        assert_eq!(stat.size, 11);
        let missing = Digest::from_bytes(b"missing");
        assert!(r.stat_blob("team/app", &missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_blob_streams_to_file() {
        let server = MockServer::start().await;
        let data = vec![7u8; 64 * 1024];
        let digest = Digest::from_bytes(&data);
        Mock::given(method("GET"))
            .and(path(format!("/v2/team/app/blobs/{}", digest)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
            .mount(&server)
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("blob");
        let r = registry(&server, RegistryAuth::anonymous());
        assert_eq!(r.fetch_blob("team/app", &digest, &dest).await.unwrap(), data.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), data);

        let err = r.get_blob("team/app", &Digest::from_bytes(b"x")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_manifest_round_trip() {
        let server = MockServer::start().await;
        let body = br#"{"schemaVersion":2}"#.to_vec();
        Mock::given(method("PUT"))
            .and(path("/v2/team/app/manifests/v1"))
            .and(header("Content-Type", MEDIA_TYPE_MANIFEST))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/team/app/manifests/v1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", MEDIA_TYPE_MANIFEST)
                    .set_body_bytes(body.clone()),
            )
            .mount(&server)
            .await;

        let r = registry(&server, RegistryAuth::anonymous());
        let raw = RawManifest {
            media_type: MEDIA_TYPE_MANIFEST.to_string(),
            body: body.clone(),
        };
        let digest = r.put_manifest("team/app", "v1", raw).await.unwrap();
        assert_eq!(digest, Digest::from_bytes(&body));

        let fetched = r.get_manifest("team/app", "v1").await.unwrap();
        assert_eq!(fetched.media_type, MEDIA_TYPE_MANIFEST);
        assert_eq!(fetched.body, body);
    }

    #[tokio::test]
    async fn test_server_error_is_registry_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = registry(&server, RegistryAuth::anonymous()).ping().await.unwrap_err();
        assert!(matches!(err, CimageError::RegistryError { ref message, .. } if message.contains("boom")));
    }
}
