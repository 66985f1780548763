//! Pushing local images to a registry.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;
use tokio::task::JoinSet;

use cimage_core::digest::{Digest, HashingWriter};
use cimage_core::error::{CimageError, Result};
use cimage_core::platform::Platform;

use super::reference::ImageReference;
use super::registry::{BlobBody, Registry};
use super::types::{
    ConfigBlob, Descriptor, ImageManifest, ManifestList, RawManifest, MEDIA_TYPE_IMAGE_CONFIG,
    MEDIA_TYPE_MANIFEST, MEDIA_TYPE_MANIFEST_LIST,
};
use crate::image::ImageStore;
use crate::layer::LayerStore;
use crate::model::{Image, LayerId};

/// What a push did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushResult {
    pub reference: String,
    /// Digest of the manifest (or manifest list) now behind the tag.
    pub digest: Digest,
    pub platforms: usize,
    pub uploaded: usize,
    /// Layers skipped because the registry already had them.
    pub reused: usize,
}

/// A platform manifest whose blobs are all in the registry but which is not
/// yet tagged.
struct PreparedManifest {
    platform: Platform,
    manifest: RawManifest,
    uploaded: usize,
    reused: usize,
}

pub struct Pusher {
    registry: Arc<dyn Registry>,
    images: ImageStore,
    layers: Arc<LayerStore>,
}

impl Pusher {
    pub fn new(registry: Arc<dyn Registry>, images: ImageStore, layers: Arc<LayerStore>) -> Self {
        Self {
            registry,
            images,
            layers,
        }
    }

    /// Push every platform stored under `name`.
    ///
    /// Layers go up concurrently; the first failure aborts the push before
    /// any manifest is written, so the tag never points at a partial image.
    pub async fn push(&self, name: &str) -> Result<PushResult> {
        let reference = ImageReference::parse(name)?;
        let tag = reference.tag.clone().ok_or_else(|| {
            CimageError::InvalidReference(format!("push needs a tag, got '{}'", name))
        })?;

        let map = self.images.get_image_metadata_map()?;
        let list = map
            .get(name)
            .filter(|list| !list.manifests.is_empty())
            .ok_or_else(|| CimageError::NotFound(format!("image {}", name)))?;

        tracing::info!(reference = %reference, platforms = list.manifests.len(), "Pushing image");

        let mut prepared = Vec::with_capacity(list.manifests.len());
        for descriptor in &list.manifests {
            let image = self.images.get_by_id(&descriptor.id)?;
            prepared.push(self.push_platform(&reference, &image).await?);
        }

        let uploaded = prepared.iter().map(|p| p.uploaded).sum();
        let reused = prepared.iter().map(|p| p.reused).sum();
        let platforms = prepared.len();
        let repo = reference.repository.as_str();

        let digest = if platforms == 1 {
            let only = prepared.remove(0);
            self.registry.put_manifest(repo, &tag, only.manifest).await?
        } else {
            let mut entries = Vec::with_capacity(platforms);
            for p in prepared {
                let size = p.manifest.body.len() as u64;
                let digest = p.manifest.digest();
                self.registry.put_manifest(repo, digest.as_str(), p.manifest).await?;
                let mut entry = Descriptor::new(MEDIA_TYPE_MANIFEST, size, digest);
                entry.platform = Some(p.platform);
                entries.push(entry);
            }
            let list = RawManifest {
                media_type: MEDIA_TYPE_MANIFEST_LIST.to_string(),
                body: serde_json::to_vec(&ManifestList::new(entries))?,
            };
            self.registry.put_manifest(repo, &tag, list).await?
        };

        tracing::info!(reference = %reference, digest = %digest, uploaded, reused, "Image pushed");
        Ok(PushResult {
            reference: reference.to_string(),
            digest,
            platforms,
            uploaded,
            reused,
        })
    }

    /// Upload the layers and config of one platform and build its manifest.
    async fn push_platform(&self, reference: &ImageReference, image: &Image) -> Result<PreparedManifest> {
        let repo = reference.repository.clone();
        let repo_key = reference.repository_key();

        let mut tasks = JoinSet::new();
        let mut scheduled = HashSet::new();
        for id in image.layer_ids() {
            if !self.layers.contains(id) {
                return Err(CimageError::NotFound(format!(
                    "layer {} of image {} is not stored locally",
                    id, image.name
                )));
            }
            if !scheduled.insert(id.clone()) {
                continue;
            }

            let registry = self.registry.clone();
            let layers = self.layers.clone();
            let repo = repo.clone();
            let repo_key = repo_key.clone();
            let id = id.clone();
            tasks.spawn(async move {
                match upload_layer(registry, layers, &repo, repo_key, &id).await {
                    Ok((descriptor, reused)) => Ok((id, descriptor, reused)),
                    Err(e) => Err(CimageError::layer_transfer(id.to_string(), e)),
                }
            });
        }

        let mut pushed: HashMap<LayerId, Descriptor> = HashMap::new();
        let mut reused = 0;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| CimageError::Other(format!("layer upload task failed: {}", e)))
                .and_then(|result| result);
            match outcome {
                Ok((id, descriptor, was_reused)) => {
                    reused += usize::from(was_reused);
                    pushed.insert(id, descriptor);
                }
                Err(e) => {
                    tasks.abort_all();
                    tracing::warn!(reference = %reference, error = %e, "Push aborted");
                    return Err(e);
                }
            }
        }

        // Descriptors follow image order, one per non-empty layer.
        let expected = image.layer_ids().count();
        let descriptors: Vec<Descriptor> = image
            .layer_ids()
            .filter_map(|id| pushed.get(id).cloned())
            .collect();
        if descriptors.len() != expected {
            return Err(CimageError::CardinalityMismatch {
                context: format!("pushed layers of {}", image.name),
                expected,
                actual: descriptors.len(),
            });
        }

        let config = ConfigBlob::from_image(image).to_bytes()?;
        let config_digest = Digest::from_bytes(&config);
        let config_size = config.len() as u64;
        if self.registry.stat_blob(&repo, &config_digest).await?.is_none() {
            self.registry
                .put_blob(&repo, &config_digest, BlobBody::Bytes(config))
                .await?;
        }

        let manifest = ImageManifest::new(
            Descriptor::new(MEDIA_TYPE_IMAGE_CONFIG, config_size, config_digest),
            descriptors,
        );
        Ok(PreparedManifest {
            platform: image.spec.platform.clone(),
            manifest: RawManifest {
                media_type: MEDIA_TYPE_MANIFEST.to_string(),
                body: serde_json::to_vec(&manifest)?,
            },
            uploaded: pushed.len() - reused,
            reused,
        })
    }
}

/// Upload one layer unless the registry already holds a known digest of it.
///
/// Returns the descriptor and whether the upload was skipped.
async fn upload_layer(
    registry: Arc<dyn Registry>,
    layers: Arc<LayerStore>,
    repo: &str,
    repo_key: String,
    id: &LayerId,
) -> Result<(Descriptor, bool)> {
    let layer = layers
        .get(id)
        .ok_or_else(|| CimageError::NotFound(format!("layer {}", id)))?;

    let mut candidates: Vec<&Digest> = layer.distribution_metadata.values().collect();
    candidates.sort();
    candidates.dedup();
    for candidate in candidates {
        match registry.stat_blob(repo, candidate).await {
            Ok(Some(remote)) => {
                tracing::info!(layer = %id.short(), "Layer already exists");
                if layer.distribution_metadata.get(&repo_key) != Some(candidate) {
                    layers.add_distribution_metadata(id, &BTreeMap::from([(repo_key, candidate.clone())]))?;
                }
                return Ok((Descriptor::new(layer.media_type.clone(), remote.size, candidate.clone()), true));
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(layer = %id, digest = %candidate, error = %e, "Blob stat failed"),
        }
    }

    tracing::info!(layer = %id.short(), size = layer.size, "Preparing layer");
    let tmp_root = layers.backend().tmp_dir();
    let compress_from = layers.clone();
    let compress_id = id.clone();
    let (blob, digest, size) =
        tokio::task::spawn_blocking(move || compress_layer(&compress_from, &compress_id, &tmp_root))
            .await
            .map_err(|e| CimageError::Other(format!("layer compression task failed: {}", e)))??;

    tracing::info!(layer = %id.short(), digest = %digest, size, "Pushing layer");
    registry
        .put_blob(
            repo,
            &digest,
            BlobBody::File {
                path: blob.path().to_path_buf(),
                size,
            },
        )
        .await?;
    drop(blob);

    layers.add_distribution_metadata(id, &BTreeMap::from([(repo_key, digest.clone())]))?;
    tracing::info!(layer = %id.short(), "Push completed");
    Ok((Descriptor::new(layer.media_type, size, digest), false))
}

/// Gzip the layer's tar stream into a temp file, hashing exactly the bytes
/// that will be sent.
fn compress_layer(layers: &LayerStore, id: &LayerId, tmp_root: &Path) -> Result<(NamedTempFile, Digest, u64)> {
    std::fs::create_dir_all(tmp_root).map_err(|e| CimageError::io(tmp_root, e))?;
    let tmp = tempfile::Builder::new()
        .prefix("push-")
        .tempfile_in(tmp_root)
        .map_err(|e| CimageError::io(tmp_root, e))?;

    let mut encoder = GzEncoder::new(HashingWriter::new(tmp), Compression::default());
    layers.assemble_tar(id, &mut encoder)?;
    let (digest, size, mut tmp) = encoder.finish()?.into_parts();
    tmp.flush()?;
    Ok((tmp, digest, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::testing::{MemoryRegistry, StoreFixture};
    use crate::distribution::types::ManifestDocument;
    use crate::model::{ImageLayer, StepKind};
    use flate2::read::GzDecoder;
    use std::io::Read;

    const NAME: &str = "localhost:5000/demo:v1";

    fn gunzip(data: &[u8]) -> Vec<u8> {
        // Config blobs are plain JSON.
        let mut out = Vec::new();
        GzDecoder::new(data).read_to_end(&mut out).map(|_| out).unwrap_or_default()
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    fn three_layer_image(f: &StoreFixture) -> (Image, Vec<LayerId>) {
        let ids = vec![
            f.layer("l1", &[("one", "first layer content")]),
            f.layer("l2", &[("two", "second layer content")]),
            f.layer("l3", &[("three", "third layer content")]),
        ];
        let mut layers: Vec<ImageLayer> = ids
            .iter()
            .map(|id| ImageLayer::new(StepKind::Copy, "x y", Some(id.clone())))
            .collect();
        layers.insert(1, ImageLayer::new(StepKind::Cmd, "echo hi", None));
        let image = Image::new(NAME, Platform::new("linux", "amd64", ""), layers);
        (image, ids)
    }

    #[tokio::test]
    async fn test_push_uploads_layers_and_tags_manifest() {
        let f = StoreFixture::new();
        let (image, ids) = three_layer_image(&f);
        f.images.save(&image).unwrap();

        let registry = MemoryRegistry::new();
        let pusher = Pusher::new(registry.clone(), f.images.clone(), f.layers.clone());
        let result = pusher.push(NAME).await.unwrap();
        assert_eq!(result.uploaded, 3);
        assert_eq!(result.reused, 0);
        assert_eq!(registry.manifest_puts(), 1);

        let raw = registry.manifest("demo", "v1").unwrap();
        assert_eq!(raw.digest(), result.digest);
        let ManifestDocument::Manifest(manifest) = ManifestDocument::parse(&raw).unwrap() else {
            panic!("expected a single manifest");
        };
        assert_eq!(manifest.layers.len(), 3);

        // Descriptors keep image order and record what was actually sent.
        for (id, descriptor) in ids.iter().zip(&manifest.layers) {
            let layer = f.layers.get(id).unwrap();
            assert_eq!(layer.distribution_metadata["localhost:5000/demo"], descriptor.digest);
        }
    }

    #[tokio::test]
    async fn test_second_push_reuses_remote_layers() {
        let f = StoreFixture::new();
        let (image, _) = three_layer_image(&f);
        f.images.save(&image).unwrap();

        let registry = MemoryRegistry::new();
        let pusher = Pusher::new(registry.clone(), f.images.clone(), f.layers.clone());
        let first = pusher.push(NAME).await.unwrap();
        let blob_puts = registry.blob_puts();

        let second = pusher.push(NAME).await.unwrap();
        assert_eq!(second.uploaded, 0);
        assert_eq!(second.reused, 3);
        assert_eq!(second.digest, first.digest);
        assert_eq!(registry.blob_puts(), blob_puts);
    }

    #[tokio::test]
    async fn test_failed_layer_aborts_before_manifest() {
        let f = StoreFixture::new();
        let (image, ids) = three_layer_image(&f);
        f.images.save(&image).unwrap();

        let registry = MemoryRegistry::new();
        registry.fail_uploads_where(|blob| contains(&gunzip(blob), b"second layer content"));
        let pusher = Pusher::new(registry.clone(), f.images.clone(), f.layers.clone());

        let err = pusher.push(NAME).await.unwrap_err();
        match &err {
            CimageError::LayerTransfer { layer, .. } => assert_eq!(layer, &ids[1].to_string()),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(registry.manifest_puts(), 0);
        assert!(registry.manifest("demo", "v1").is_none());
    }

    #[tokio::test]
    async fn test_multi_platform_push_writes_manifest_list() {
        let f = StoreFixture::new();
        let amd = f.layer("amd", &[("bin", "amd64 binary")]);
        let arm = f.layer("arm", &[("bin", "arm64 binary")]);
        for (platform, id) in [(Platform::new("linux", "amd64", ""), amd), (Platform::new("linux", "arm64", ""), arm)] {
            let image = Image::new(NAME, platform, vec![ImageLayer::new(StepKind::Copy, "bin /", Some(id))]);
            f.images.save(&image).unwrap();
        }

        let registry = MemoryRegistry::new();
        let pusher = Pusher::new(registry.clone(), f.images.clone(), f.layers.clone());
        let result = pusher.push(NAME).await.unwrap();
        assert_eq!(result.platforms, 2);
        assert_eq!(registry.manifest_puts(), 3);

        let raw = registry.manifest("demo", "v1").unwrap();
        let ManifestDocument::List(list) = ManifestDocument::parse(&raw).unwrap() else {
            panic!("expected a manifest list");
        };
        let platforms: Vec<_> = list
            .manifests
            .iter()
            .map(|d| d.platform.clone().unwrap().architecture)
            .collect();
        assert_eq!(platforms, vec!["amd64", "arm64"]);
        for entry in &list.manifests {
            assert!(registry.manifest("demo", entry.digest.as_str()).is_some());
        }
    }

    #[tokio::test]
    async fn test_push_unknown_image() {
        let f = StoreFixture::new();
        let pusher = Pusher::new(MemoryRegistry::new(), f.images.clone(), f.layers.clone());
        assert!(pusher.push(NAME).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_push_missing_local_layer() {
        let f = StoreFixture::new();
        let (image, ids) = three_layer_image(&f);
        f.images.save(&image).unwrap();
        f.layers.delete(&ids[2]).unwrap();

        let registry = MemoryRegistry::new();
        let pusher = Pusher::new(registry.clone(), f.images.clone(), f.layers.clone());
        assert!(pusher.push(NAME).await.unwrap_err().is_not_found());
        assert_eq!(registry.manifest_puts(), 0);
    }
}
