use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use cimage_core::digest::Digest;
use cimage_core::error::Result;

use super::CACHE_ID_KEY;
use crate::image::ImageStore;
use crate::layer::LayerStore;
use crate::model::{ImageLayer, StepKind};

/// Fingerprint of a build step along the chain of its ancestors.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainId(Digest);

impl ChainId {
    pub fn digest(&self) -> &Digest {
        &self.0
    }
}

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Semantic identity of one build step.
///
/// `cache_id` carries the content digest of any local files the step reads
/// (COPY sources); it is empty for steps that read none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayer {
    pub cache_id: String,
    pub kind: StepKind,
    pub value: String,
}

impl CacheLayer {
    pub fn new(kind: StepKind, value: impl Into<String>, cache_id: impl Into<String>) -> Self {
        Self {
            cache_id: cache_id.into(),
            kind,
            value: value.into(),
        }
    }

    /// Canonical string form hashed into chain IDs.
    pub fn canonical(&self) -> String {
        format!(
            "{{\"cacheID\":{},\"type\":\"{}\",\"value\":{}}}",
            serde_json::Value::String(self.cache_id.clone()),
            self.kind,
            serde_json::Value::String(self.value.clone()),
        )
    }

    /// `sha256(L)` for the first step, `sha256(parent + ":" + L)` after it.
    pub fn chain_id(&self, parent: Option<&ChainId>) -> ChainId {
        let input = match parent {
            None => self.canonical(),
            Some(parent) => format!("{}:{}", parent, self.canonical()),
        };
        ChainId(Digest::from_bytes(input.as_bytes()))
    }

    /// Rebuild the fingerprint of a stored image layer.
    ///
    /// COPY layers read the recorded cache id from layer metadata. A COPY
    /// layer without one (a pulled layer, say) has no fingerprint and
    /// returns `None`.
    pub fn from_image_layer(layer: &ImageLayer, layers: &LayerStore) -> Option<Self> {
        let mut cache_id = String::new();
        if layer.kind == StepKind::Copy {
            if let Some(id) = &layer.id {
                match layers.get_metadata(id, CACHE_ID_KEY) {
                    Ok(raw) => cache_id = String::from_utf8_lossy(&raw).trim().to_string(),
                    Err(e) => {
                        tracing::warn!(layer = %id, error = %e, "No cache id recorded for COPY layer");
                        return None;
                    }
                }
                if cache_id.is_empty() {
                    tracing::warn!(layer = %id, "Empty cache id recorded for COPY layer");
                    return None;
                }
            }
        }
        Some(Self::new(layer.kind, layer.value.clone(), cache_id))
    }
}

/// Chain ID → image layer table rebuilt from every stored image.
#[derive(Debug, Default)]
pub struct ChainStore {
    chains: HashMap<ChainId, ImageLayer>,
}

impl ChainStore {
    pub fn restore(images: &ImageStore, layers: &LayerStore) -> Result<Self> {
        let mut chains = HashMap::new();
        for id in images.backend().list_image_ids()? {
            let image = match images.get_by_id(&id) {
                Ok(image) => image,
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "Skipping unreadable image while restoring cache");
                    continue;
                }
            };

            let mut parent: Option<ChainId> = None;
            for layer in &image.spec.layers {
                // Later chains hang off this one, so the rest of the image is unreachable.
                let Some(cache_layer) = CacheLayer::from_image_layer(layer, layers) else {
                    break;
                };
                let chain_id = cache_layer.chain_id(parent.as_ref());
                tracing::debug!(chain = %chain_id, kind = %layer.kind, value = %layer.value, "Restored chain");
                chains.entry(chain_id.clone()).or_insert_with(|| layer.clone());
                parent = Some(chain_id);
            }
        }
        Ok(Self { chains })
    }

    pub fn get_chain_layer(&self, id: &ChainId) -> Option<&ImageLayer> {
        self.chains.get(id)
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

/// Shared handle to the restored chain table.
///
/// Passed explicitly to each build; there is no process-wide instance.
#[derive(Clone)]
pub struct CacheService {
    images: ImageStore,
    layers: Arc<LayerStore>,
    chains: Arc<RwLock<Arc<ChainStore>>>,
}

impl CacheService {
    pub fn open(images: ImageStore, layers: Arc<LayerStore>) -> Result<Self> {
        let chains = ChainStore::restore(&images, &layers)?;
        tracing::debug!(chains = chains.len(), "Opened build cache");
        Ok(Self {
            images,
            layers,
            chains: Arc::new(RwLock::new(Arc::new(chains))),
        })
    }

    /// The layer a previous build produced for `id`, if any.
    pub fn lookup(&self, id: &ChainId) -> Option<ImageLayer> {
        self.chains.read().get_chain_layer(id).cloned()
    }

    pub fn layers(&self) -> &Arc<LayerStore> {
        &self.layers
    }

    /// Drop the current table and restore a fresh one from the stores.
    pub fn reload(&self) -> Result<()> {
        let fresh = ChainStore::restore(&self.images, &self.layers)?;
        *self.chains.write() = Arc::new(fresh);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, FsBackend};
    use crate::model::Image;
    use cimage_core::config::StoreConfig;
    use cimage_core::platform::Platform;
    use tempfile::TempDir;

    fn steps() -> Vec<CacheLayer> {
        vec![
            CacheLayer::new(StepKind::Copy, "a b", "sha256:1111"),
            CacheLayer::new(StepKind::Run, "make", ""),
            CacheLayer::new(StepKind::Cmd, "echo hi", ""),
        ]
    }

    fn fold(layers: &[CacheLayer]) -> ChainId {
        let mut parent: Option<ChainId> = None;
        for layer in layers {
            parent = Some(layer.chain_id(parent.as_ref()));
        }
        parent.unwrap()
    }

    #[test]
    fn test_chain_id_is_deterministic() {
        assert_eq!(fold(&steps()), fold(&steps()));
    }

    #[test]
    fn test_chain_id_changes_with_any_field() {
        let base = fold(&steps());

        let mut changed = steps();
        changed[0].cache_id = "sha256:2222".to_string();
        assert_ne!(fold(&changed), base);

        let mut changed = steps();
        changed[1].value = "make all".to_string();
        assert_ne!(fold(&changed), base);

        let mut changed = steps();
        changed[2].kind = StepKind::Run;
        assert_ne!(fold(&changed), base);
    }

    #[test]
    fn test_chain_id_is_order_sensitive() {
        let mut swapped = steps();
        swapped.swap(0, 1);
        assert_ne!(fold(&swapped), fold(&steps()));
    }

    #[test]
    fn test_first_link_hashes_canonical_form() {
        let layer = CacheLayer::new(StepKind::Cmd, "echo \"hi\"", "");
        assert_eq!(
            layer.canonical(),
            r#"{"cacheID":"","type":"CMD","value":"echo \"hi\""}"#
        );
        assert_eq!(
            layer.chain_id(None).digest(),
            &Digest::from_bytes(layer.canonical().as_bytes())
        );
    }

    #[test]
    fn test_restore_reads_copy_cache_ids() {
        let tmp = TempDir::new().unwrap();
        let backend: Arc<dyn Backend> =
            Arc::new(FsBackend::open(StoreConfig::new(tmp.path().join("data"))).unwrap());
        let images = ImageStore::new(backend.clone());
        let layers = Arc::new(LayerStore::new(backend).unwrap());

        let dir = tmp.path().join("src");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("f"), "content").unwrap();
        let id = layers.register_from_dir(&dir).unwrap().unwrap();
        layers.set_metadata(&id, CACHE_ID_KEY, b"sha256:1111").unwrap();

        let image = Image::new(
            "demo",
            Platform::new("linux", "amd64", ""),
            vec![
                ImageLayer::new(StepKind::Copy, "a b", Some(id.clone())),
                ImageLayer::new(StepKind::Cmd, "echo hi", None),
            ],
        );
        images.save(&image).unwrap();

        let service = CacheService::open(images, layers).unwrap();
        let first = CacheLayer::new(StepKind::Copy, "a b", "sha256:1111").chain_id(None);
        assert_eq!(service.lookup(&first).unwrap().id, Some(id));

        let second = CacheLayer::new(StepKind::Cmd, "echo hi", "").chain_id(Some(&first));
        assert_eq!(service.lookup(&second).unwrap().kind, StepKind::Cmd);

        let other = CacheLayer::new(StepKind::Copy, "a b", "sha256:9999").chain_id(None);
        assert!(service.lookup(&other).is_none());
    }

    #[test]
    fn test_restore_skips_copy_layers_without_cache_id() {
        let tmp = TempDir::new().unwrap();
        let backend: Arc<dyn Backend> =
            Arc::new(FsBackend::open(StoreConfig::new(tmp.path().join("data"))).unwrap());
        let images = ImageStore::new(backend.clone());
        let layers = Arc::new(LayerStore::new(backend).unwrap());

        let dir = tmp.path().join("src");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("f"), "pulled").unwrap();
        let id = layers.register_from_dir(&dir).unwrap().unwrap();

        let image = Image::new(
            "pulled",
            Platform::new("linux", "amd64", ""),
            vec![
                ImageLayer::new(StepKind::Copy, "app /opt", Some(id)),
                ImageLayer::new(StepKind::Cmd, "serve", None),
            ],
        );
        images.save(&image).unwrap();

        let chains = ChainStore::restore(&images, &layers).unwrap();
        assert!(chains.is_empty());

        let unfingerprinted = CacheLayer::new(StepKind::Copy, "app /opt", "").chain_id(None);
        assert!(chains.get_chain_layer(&unfingerprinted).is_none());
    }
}
