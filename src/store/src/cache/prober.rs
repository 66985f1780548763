use cimage_core::error::Result;

use super::chain::{CacheLayer, CacheService, ChainId};
use crate::model::LayerId;

/// Where a build stands with respect to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Every step so far was reused; the next one may be too.
    Enabled,
    /// An ancestor step was rebuilt, so nothing downstream can be reused.
    Busted,
    /// Caching was switched off for this build.
    Disabled,
}

impl CacheState {
    /// Whether a probe should be issued at all.
    pub fn should_probe(&self) -> bool {
        matches!(self, CacheState::Enabled)
    }
}

/// Answer of a single cache probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// A previous build produced this chain. `layer_id` is `None` for
    /// metadata-only steps.
    Hit {
        layer_id: Option<LayerId>,
        chain_id: ChainId,
    },
    /// No previous build produced this chain.
    Miss,
    /// Caching is switched off; nothing was looked up.
    Disabled,
}

/// Cache lookup used by the step executor.
pub trait Prober: Send + Sync {
    fn probe(&self, parent: Option<&ChainId>, layer: &CacheLayer) -> ProbeOutcome;

    /// Re-acquire the cache handle from the stores.
    fn reset(&self) -> Result<()>;
}

/// Prober backed by the chain table of locally stored images.
pub struct ImageProber {
    service: CacheService,
}

impl ImageProber {
    pub fn new(service: CacheService) -> Self {
        Self { service }
    }
}

impl Prober for ImageProber {
    fn probe(&self, parent: Option<&ChainId>, layer: &CacheLayer) -> ProbeOutcome {
        let chain_id = layer.chain_id(parent);
        let Some(found) = self.service.lookup(&chain_id) else {
            tracing::debug!(chain = %chain_id, kind = %layer.kind, "Cache miss");
            return ProbeOutcome::Miss;
        };

        // A pruned layer can't be reused even though its chain is known.
        if let Some(id) = &found.id {
            if !self.service.layers().contains(id) {
                tracing::debug!(chain = %chain_id, layer = %id, "Cached layer no longer stored");
                return ProbeOutcome::Miss;
            }
        }

        tracing::debug!(chain = %chain_id, kind = %layer.kind, "Cache hit");
        ProbeOutcome::Hit {
            layer_id: found.id,
            chain_id,
        }
    }

    fn reset(&self) -> Result<()> {
        self.service.reload()
    }
}

/// Prober used when caching is switched off.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProber;

impl Prober for NoopProber {
    fn probe(&self, _parent: Option<&ChainId>, _layer: &CacheLayer) -> ProbeOutcome {
        ProbeOutcome::Disabled
    }

    fn reset(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, FsBackend};
    use crate::image::ImageStore;
    use crate::layer::LayerStore;
    use crate::model::{Image, ImageLayer, StepKind};
    use cimage_core::config::StoreConfig;
    use cimage_core::platform::Platform;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(tmp: &TempDir) -> (ImageStore, Arc<LayerStore>) {
        let backend: Arc<dyn Backend> =
            Arc::new(FsBackend::open(StoreConfig::new(tmp.path().join("data"))).unwrap());
        (
            ImageStore::new(backend.clone()),
            Arc::new(LayerStore::new(backend).unwrap()),
        )
    }

    #[test]
    fn test_noop_prober_is_distinguishable_from_miss() {
        let layer = CacheLayer::new(StepKind::Run, "make", "");
        assert_eq!(NoopProber.probe(None, &layer), ProbeOutcome::Disabled);
        assert_ne!(NoopProber.probe(None, &layer), ProbeOutcome::Miss);
    }

    #[test]
    fn test_probe_hit_and_reset_sees_new_images() {
        let tmp = TempDir::new().unwrap();
        let (images, layers) = setup(&tmp);
        let service = CacheService::open(images.clone(), layers.clone()).unwrap();
        let prober = ImageProber::new(service);

        let step = CacheLayer::new(StepKind::Cmd, "echo hi", "");
        assert_eq!(prober.probe(None, &step), ProbeOutcome::Miss);

        let image = Image::new(
            "demo",
            Platform::new("linux", "amd64", ""),
            vec![ImageLayer::new(StepKind::Cmd, "echo hi", None)],
        );
        images.save(&image).unwrap();
        // Stale handle until reset.
        assert_eq!(prober.probe(None, &step), ProbeOutcome::Miss);

        prober.reset().unwrap();
        assert_eq!(
            prober.probe(None, &step),
            ProbeOutcome::Hit {
                layer_id: None,
                chain_id: step.chain_id(None),
            }
        );
    }

    #[test]
    fn test_probe_misses_pruned_layer() {
        let tmp = TempDir::new().unwrap();
        let (images, layers) = setup(&tmp);

        let dir = tmp.path().join("src");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("f"), "x").unwrap();
        let id = layers.register_from_dir(&dir).unwrap().unwrap();
        let image = Image::new(
            "demo",
            Platform::new("linux", "amd64", ""),
            vec![ImageLayer::new(StepKind::Run, "touch f", Some(id.clone()))],
        );
        images.save(&image).unwrap();

        let prober = ImageProber::new(CacheService::open(images, layers.clone()).unwrap());
        let step = CacheLayer::new(StepKind::Run, "touch f", "");
        assert!(matches!(prober.probe(None, &step), ProbeOutcome::Hit { .. }));

        layers.delete(&id).unwrap();
        assert_eq!(prober.probe(None, &step), ProbeOutcome::Miss);
    }

    #[test]
    fn test_cache_state_should_probe() {
        assert!(CacheState::Enabled.should_probe());
        assert!(!CacheState::Busted.should_probe());
        assert!(!CacheState::Disabled.should_probe());
    }
}
