//! Image reference parsing.
//!
//! Parses references like `registry.local:5000/team/app:v1` into the registry
//! host, repository path, tag and digest used by the distribution client.

use cimage_core::digest::Digest;
use cimage_core::error::{CimageError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Host actually serving the API for the default registry.
const DEFAULT_REGISTRY_HOST: &str = "registry-1.docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, optionally with a port (e.g. "docker.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g. "library/nginx", "team/app")
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// - `app` → docker.io/library/app:latest
    /// - `team/app:v1` → docker.io/team/app:v1
    /// - `localhost:5000/app` → localhost:5000/app:latest
    /// - `ghcr.io/org/app@sha256:...` → digest only, no tag
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(CimageError::InvalidReference("empty image reference".to_string()));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                let digest = digest.parse::<Digest>().map_err(|e| {
                    CimageError::InvalidReference(format!("'{}': {}", reference, e))
                })?;
                (name, Some(digest))
            }
            None => (reference, None),
        };

        // A colon only starts a tag after the last slash; `host:5000` alone
        // is a name with a port.
        let slash = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[slash..].rfind(':') {
            Some(colon) => {
                let tag = &name_tag[slash + colon + 1..];
                if slash == 0 && tag.chars().all(|c| c.is_ascii_digit()) {
                    (name_tag, None)
                } else {
                    (&name_tag[..slash + colon], Some(tag.to_string()))
                }
            }
            None => (name_tag, None),
        };

        if let Some(tag) = &tag {
            if !valid_tag(tag) {
                return Err(CimageError::InvalidReference(format!(
                    "invalid tag '{}' in '{}'",
                    tag, reference
                )));
            }
        }

        let (registry, repository) = split_registry_repository(name)?;
        if !valid_repository(&repository) {
            return Err(CimageError::InvalidReference(format!(
                "invalid repository '{}' in '{}'",
                repository, reference
            )));
        }

        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Key under which distribution metadata is recorded: `registry/repository`.
    pub fn repository_key(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Host serving the registry API.
    pub fn api_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            DEFAULT_REGISTRY_HOST
        } else {
            &self.registry
        }
    }

    /// Tag or digest to address the manifest with; the digest wins.
    pub fn manifest_reference(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    pub fn full_reference(&self) -> String {
        let mut s = self.repository_key();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest.as_str());
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = CimageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// The first path component is a registry if it looks like a host.
fn split_registry_repository(name: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(CimageError::InvalidReference(format!(
                    "empty repository in '{}'",
                    name
                )));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Ok((DEFAULT_REGISTRY.to_string(), repository))
}

fn valid_repository(repository: &str) -> bool {
    !repository.is_empty()
        && repository.split('/').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        })
}

fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}
