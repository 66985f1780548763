//! Reachability-based garbage collection of image specs and layers.

use std::collections::HashSet;

use cimage_core::error::Result;

use crate::fsutil::dir_size;
use crate::image::ImageStore;
use crate::layer::LayerStore;
use crate::model::LayerId;

/// What a prune pass removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub removed_images: Vec<String>,
    pub removed_layers: Vec<LayerId>,
    pub reclaimed_bytes: u64,
}

/// Remove image specs and layers that no index entry reaches.
///
/// Roots are the image IDs in the manifest index; a layer survives if any
/// root image lists it.
pub fn prune(images: &ImageStore, layers: &LayerStore) -> Result<PruneReport> {
    let map = images.get_image_metadata_map()?;
    let live_images: HashSet<String> = map
        .values()
        .flat_map(|list| list.manifests.iter().map(|m| m.id.clone()))
        .collect();

    let mut live_layers: HashSet<LayerId> = HashSet::new();
    for id in &live_images {
        let image = images.get_by_id(id)?;
        live_layers.extend(image.layer_ids().cloned());
    }

    let mut report = PruneReport::default();
    let backend = images.backend();

    for id in backend.list_image_ids()? {
        if !live_images.contains(&id) {
            backend.delete_image_spec(&id)?;
            tracing::debug!(id = %id, "Pruned image spec");
            report.removed_images.push(id);
        }
    }

    for layer in layers.list() {
        if live_layers.contains(&layer.id) {
            continue;
        }
        report.reclaimed_bytes += dir_size(&layers.layer_data_dir(&layer.id)).unwrap_or(0);
        layers.delete(&layer.id)?;
        tracing::debug!(layer = %layer.id, "Pruned layer");
        report.removed_layers.push(layer.id);
    }

    tracing::info!(
        images = report.removed_images.len(),
        layers = report.removed_layers.len(),
        bytes = report.reclaimed_bytes,
        "Prune complete"
    );
    Ok(report)
}
