//! Name → manifest index and image spec persistence.

use std::sync::Arc;

use chrono::Utc;

use cimage_core::error::{CimageError, Result};
use cimage_core::platform::Platform;

use crate::backend::Backend;
use crate::fsutil::dir_size;
use crate::model::{Image, ImageMetadataMap, ManifestDescriptor};

/// One row of [`ImageStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub name: String,
    pub descriptor: ManifestDescriptor,
}

/// Image store over a [`Backend`].
#[derive(Clone)]
pub struct ImageStore {
    backend: Arc<dyn Backend>,
}

impl ImageStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Resolve `name` for `platform` and load its spec.
    pub fn get_by_name(&self, name: &str, platform: &Platform) -> Result<Image> {
        let descriptor = self.get_image_metadata_item(name, platform)?;
        self.get_by_id(&descriptor.id)
    }

    pub fn get_by_id(&self, id: &str) -> Result<Image> {
        self.backend.get_image_by_id(id)
    }

    /// Persist `image` and point `(image.name, image.spec.platform)` at it.
    ///
    /// The spec file is written before the index, so the index never
    /// advertises a spec that is missing on disk. Returns the image ID.
    pub fn save(&self, image: &Image) -> Result<String> {
        let mut image = image.clone();
        if image.spec.created_at.is_none() {
            image.spec.created_at = Some(Utc::now());
        }
        let id = image.compute_id()?;
        image.spec.id = id.clone();
        self.backend.save_image(&image)?;

        let mut size = 0;
        for layer_id in image.layer_ids() {
            let dir = self.backend.layer_data_dir(layer_id);
            size += dir_size(&dir).map_err(|e| CimageError::io(&dir, e))?;
        }

        let descriptor = ManifestDescriptor {
            id: id.clone(),
            size,
            created_at: Utc::now(),
            platform: image.spec.platform.clone(),
        };
        self.backend.put_image_metadata(&image.name, descriptor)?;
        tracing::info!(name = %image.name, id = %id, size, platform = %image.spec.platform, "Saved image");
        Ok(id)
    }

    /// Remove a name (all platforms when `platform` is `None`) from the index.
    ///
    /// The spec files stay on disk until the next prune.
    pub fn delete_by_name(&self, name: &str, platform: Option<&Platform>) -> Result<()> {
        self.backend.delete_image_metadata(name, platform)?;
        tracing::info!(name, "Deleted image");
        Ok(())
    }

    /// Remove every index entry pointing at image `id`.
    pub fn delete_by_id(&self, id: &str) -> Result<()> {
        self.backend.delete_image_metadata_by_id(id)?;
        tracing::info!(id, "Deleted image");
        Ok(())
    }

    pub fn get_image_metadata_map(&self) -> Result<ImageMetadataMap> {
        self.backend.get_image_metadata_map()
    }

    pub fn get_image_metadata_item(&self, name: &str, platform: &Platform) -> Result<ManifestDescriptor> {
        let map = self.backend.get_image_metadata_map()?;
        let list = map
            .get(name)
            .ok_or_else(|| CimageError::NotFound(format!("image {}", name)))?;
        list.find(platform).cloned().ok_or_else(|| {
            CimageError::NotFound(format!("image {} for platform {}", name, platform))
        })
    }

    /// Every (name, platform) in the index, ordered by name then platform.
    pub fn list(&self) -> Result<Vec<ImageSummary>> {
        let map = self.backend.get_image_metadata_map()?;
        let mut rows: Vec<ImageSummary> = map
            .into_iter()
            .flat_map(|(name, list)| {
                list.manifests.into_iter().map(move |descriptor| ImageSummary {
                    name: name.clone(),
                    descriptor,
                })
            })
            .collect();
        rows.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| a.descriptor.platform.cmp(&b.descriptor.platform))
        });
        Ok(rows)
    }
}
