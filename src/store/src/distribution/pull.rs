//! Pulling images from a registry into the local stores.

use std::collections::HashSet;
use std::io::BufReader;
use std::sync::Arc;

use flate2::read::GzDecoder;
use tempfile::NamedTempFile;
use tokio::task::JoinSet;

use cimage_core::digest::{Digest, HashingReader};
use cimage_core::error::{CimageError, Result};
use cimage_core::platform::Platform;

use super::reference::ImageReference;
use super::registry::Registry;
use super::types::{ConfigBlob, Descriptor, ImageManifest, ManifestDocument, RawManifest};
use crate::backend::StagedTar;
use crate::layer::{LayerStore, ROLayer};
use crate::model::{Image, LayerId};

pub struct Puller {
    registry: Arc<dyn Registry>,
    layers: Arc<LayerStore>,
}

impl Puller {
    pub fn new(registry: Arc<dyn Registry>, layers: Arc<LayerStore>) -> Self {
        Self { registry, layers }
    }

    /// Download the `platform` variant of `name` and register its layers.
    ///
    /// Returns the image spec named `name`; saving it is up to the caller.
    /// Any layer failure aborts the pull and no image is returned.
    pub async fn pull(&self, name: &str, platform: &Platform) -> Result<Image> {
        let reference = ImageReference::parse(name)?;
        let repo = reference.repository.clone();
        tracing::info!(reference = %reference, platform = %platform, "Pulling image");

        let manifest = self.resolve_manifest(&reference, platform).await?;

        let config = self.registry.get_blob(&repo, &manifest.config.digest).await?;
        verify(&manifest.config.digest, &Digest::from_bytes(&config))?;
        let mut image = ConfigBlob::decode(&config)?.image;
        image.name = name.to_string();
        if !image.spec.platform.matches(platform) {
            tracing::warn!(
                reference = %reference,
                requested = %platform,
                actual = %image.spec.platform,
                "Pulled image is for a different platform"
            );
        }

        let ids: Vec<LayerId> = image.layer_ids().cloned().collect();
        if ids.len() != manifest.layers.len() {
            return Err(CimageError::CardinalityMismatch {
                context: format!("layers of {}", reference),
                expected: ids.len(),
                actual: manifest.layers.len(),
            });
        }

        let mut tasks = JoinSet::new();
        let mut scheduled = HashSet::new();
        for (id, descriptor) in ids.into_iter().zip(manifest.layers) {
            if self.layers.contains(&id) {
                tracing::info!(layer = %id.short(), "Layer already exists");
                continue;
            }
            if !scheduled.insert(id.clone()) {
                continue;
            }

            let registry = self.registry.clone();
            let layers = self.layers.clone();
            let repo = repo.clone();
            let repo_key = reference.repository_key();
            tasks.spawn(async move {
                download_layer(registry, layers, &repo, repo_key, &id, descriptor)
                    .await
                    .map_err(|e| CimageError::layer_transfer(id.to_string(), e))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| CimageError::Other(format!("layer download task failed: {}", e)))
                .and_then(|result| result);
            if let Err(e) = outcome {
                tasks.abort_all();
                tracing::warn!(reference = %reference, error = %e, "Pull aborted");
                return Err(e);
            }
        }

        tracing::info!(reference = %reference, id = %image.spec.id, "Image pulled");
        Ok(image)
    }

    /// Fetch the manifest, resolving a manifest list to the entry for `platform`.
    async fn resolve_manifest(&self, reference: &ImageReference, platform: &Platform) -> Result<ImageManifest> {
        let repo = reference.repository.as_str();
        let raw = self
            .registry
            .get_manifest(repo, &reference.manifest_reference())
            .await?;
        if let Some(expected) = &reference.digest {
            verify(expected, &raw.digest())?;
        }

        let list = match ManifestDocument::parse(&raw)? {
            ManifestDocument::Manifest(manifest) => return Ok(manifest),
            ManifestDocument::List(list) => list,
        };

        let mut matching = list.matching(platform);
        let chosen = matching
            .next()
            .cloned()
            .ok_or_else(|| CimageError::NotFound(format!("platform {} in {}", platform, reference)))?;
        let duplicates = matching.count();
        if duplicates > 0 {
            tracing::warn!(
                reference = %reference,
                platform = %platform,
                duplicates,
                "Several manifests match the platform, using the first"
            );
        }

        let raw: RawManifest = self.registry.get_manifest(repo, chosen.digest.as_str()).await?;
        verify(&chosen.digest, &raw.digest())?;
        match ManifestDocument::parse(&raw)? {
            ManifestDocument::Manifest(manifest) => Ok(manifest),
            ManifestDocument::List(_) => Err(CimageError::RegistryError {
                registry: reference.registry.clone(),
                message: format!("manifest list {} points at another list", chosen.digest),
            }),
        }
    }
}

fn verify(expected: &Digest, actual: &Digest) -> Result<()> {
    if expected != actual {
        return Err(CimageError::DigestMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Download one blob, check both digests and register it under `id`.
async fn download_layer(
    registry: Arc<dyn Registry>,
    layers: Arc<LayerStore>,
    repo: &str,
    repo_key: String,
    id: &LayerId,
    descriptor: Descriptor,
) -> Result<()> {
    let tmp_root = layers.backend().tmp_dir();
    tokio::fs::create_dir_all(&tmp_root)
        .await
        .map_err(|e| CimageError::io(&tmp_root, e))?;
    let blob = tempfile::Builder::new()
        .prefix("pull-")
        .tempfile_in(&tmp_root)
        .map_err(|e| CimageError::io(&tmp_root, e))?;

    tracing::info!(layer = %id.short(), digest = %descriptor.digest, size = descriptor.size, "Pulling layer");
    registry.fetch_blob(repo, &descriptor.digest, blob.path()).await?;

    let unpack_into = layers.clone();
    let expected = descriptor.digest.clone();
    let staged = tokio::task::spawn_blocking(move || unpack_layer(&unpack_into, blob, &expected))
        .await
        .map_err(|e| CimageError::Other(format!("layer unpack task failed: {}", e)))??;

    let size = staged.summary().size;
    layers.commit_tar(id, staged)?;

    // The compressed size stands in until the uncompressed size is recorded.
    let mut layer = ROLayer::new(id.clone(), descriptor.size);
    layer.distribution_metadata.insert(repo_key, descriptor.digest);
    layers.register_if_not_present(&layer)?;
    layers.update_size(id, size)?;

    tracing::info!(layer = %id.short(), size, "Pull completed");
    Ok(())
}

/// Gunzip and disassemble a downloaded blob while hashing its compressed bytes.
///
/// A compressed digest mismatch wins over any decode error it caused.
fn unpack_layer(layers: &LayerStore, blob: NamedTempFile, expected: &Digest) -> Result<StagedTar> {
    let file = blob.reopen().map_err(|e| CimageError::io(blob.path(), e))?;
    let mut reader = GzDecoder::new(HashingReader::new(BufReader::new(file)));
    let staged = layers.stage_tar(&mut reader, true);
    let (actual, _) = reader.into_inner().finish()?;
    verify(expected, &actual)?;
    staged
}
