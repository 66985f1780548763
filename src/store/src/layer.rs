//! Content-addressed layer store.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use cimage_core::digest::{Digest, HashingWriter};
use cimage_core::error::{CimageError, Result};

use crate::backend::{Backend, StagedTar};
use crate::fsutil::{copy_recursive, is_empty_dir, remove_dir_all_if_exists};
use crate::model::{LayerId, LAYER_MEDIA_TYPE};
use crate::tar_split;

/// A registered, read-only layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ROLayer {
    pub id: LayerId,
    /// Size of the uncompressed tar stream.
    pub size: u64,
    pub media_type: String,
    /// Repository (`registry/repo`) → digest of the blob uploaded there.
    pub distribution_metadata: BTreeMap<String, Digest>,
}

impl ROLayer {
    pub fn new(id: LayerId, size: u64) -> Self {
        Self {
            id,
            size,
            media_type: LAYER_MEDIA_TYPE.to_string(),
            distribution_metadata: BTreeMap::new(),
        }
    }
}

/// In-memory index of registered layers over a [`Backend`].
///
/// The index is populated from disk when the store is opened.
pub struct LayerStore {
    backend: Arc<dyn Backend>,
    layers: RwLock<HashMap<LayerId, ROLayer>>,
}

impl LayerStore {
    pub fn new(backend: Arc<dyn Backend>) -> Result<Self> {
        let layers: HashMap<_, _> = backend
            .load_all_ro_layers()?
            .into_iter()
            .map(|l| (l.id.clone(), l))
            .collect();
        tracing::debug!(count = layers.len(), "Loaded layer index");
        Ok(Self {
            backend,
            layers: RwLock::new(layers),
        })
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Look up a registered layer. Absent layers are `None`, not an error.
    pub fn get(&self, id: &LayerId) -> Option<ROLayer> {
        self.layers.read().get(id).cloned()
    }

    pub fn contains(&self, id: &LayerId) -> bool {
        self.layers.read().contains_key(id)
    }

    /// All registered layers, ordered by ID.
    pub fn list(&self) -> Vec<ROLayer> {
        let mut layers: Vec<_> = self.layers.read().values().cloned().collect();
        layers.sort_by(|a, b| a.id.cmp(&b.id));
        layers
    }

    pub fn layer_data_dir(&self, id: &LayerId) -> PathBuf {
        self.backend.layer_data_dir(id)
    }

    /// Persist the sidecars of `layer` unless a layer with that ID exists.
    pub fn register_if_not_present(&self, layer: &ROLayer) -> Result<()> {
        if self.contains(&layer.id) {
            return Ok(());
        }
        self.backend.store_ro_layer(layer)?;
        self.layers.write().insert(layer.id.clone(), layer.clone());
        tracing::debug!(layer = %layer.id, size = layer.size, "Registered layer");
        Ok(())
    }

    /// Register the file tree in `dir` as a layer, moving it into the store.
    ///
    /// Returns `None` when `dir` holds no files. Registering a tree whose
    /// content is already stored returns the existing ID and discards `dir`.
    pub fn register_from_dir(&self, dir: &Path) -> Result<Option<LayerId>> {
        if is_empty_dir(dir)? {
            return Ok(None);
        }

        let tmp_root = self.backend.tmp_dir();
        std::fs::create_dir_all(&tmp_root).map_err(|e| CimageError::io(&tmp_root, e))?;
        let file = tempfile::tempfile_in(&tmp_root).map_err(|e| CimageError::io(&tmp_root, e))?;
        let writer = tar_split::write_dir_tar(dir, HashingWriter::new(file))?;
        let (id, size, mut file) = writer.into_parts();
        file.flush()?;

        let target = self.backend.layer_data_dir(&id);
        if self.contains(&id) || target.exists() {
            remove_dir_all_if_exists(dir)?;
            if !self.contains(&id) {
                self.finish_registration(&id, size, file)?;
            }
            tracing::debug!(layer = %id, "Layer content already stored");
            return Ok(Some(id));
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CimageError::io(parent, e))?;
        }
        if std::fs::rename(dir, &target).is_err() {
            // Different filesystem: fall back to copy + remove.
            copy_recursive(dir, &target)?;
            remove_dir_all_if_exists(dir)?;
        }

        self.finish_registration(&id, size, file)?;
        tracing::info!(layer = %id, size, "Registered layer from directory");
        Ok(Some(id))
    }

    fn finish_registration(&self, id: &LayerId, size: u64, mut tar: std::fs::File) -> Result<()> {
        tar.seek(SeekFrom::Start(0))?;
        self.disassemble_tar(id, &mut tar, false)?;
        self.register_if_not_present(&ROLayer::new(id.clone(), size))
    }

    /// Record the tar framing of `reader` under `id`, extracting files into
    /// the layer's data directory when `extract` is set.
    ///
    /// Fails with `DigestMismatch` if the stream does not hash to `id`.
    pub fn disassemble_tar(&self, id: &LayerId, reader: &mut dyn Read, extract: bool) -> Result<()> {
        let staged = self.stage_tar(reader, extract)?;
        self.commit_tar(id, staged)
    }

    /// Disassemble into a staging area without touching the store.
    pub fn stage_tar(&self, reader: &mut dyn Read, extract: bool) -> Result<StagedTar> {
        self.backend.stage_tar(reader, extract)
    }

    /// Move staged content under `id` after checking its digest.
    pub fn commit_tar(&self, id: &LayerId, staged: StagedTar) -> Result<()> {
        let actual = &staged.summary().digest;
        if actual != id {
            return Err(CimageError::DigestMismatch {
                expected: id.to_string(),
                actual: actual.to_string(),
            });
        }
        self.backend.commit_tar(id, staged)
    }

    /// Stream the layer's tar representation into `writer`.
    pub fn assemble_tar(&self, id: &LayerId, writer: &mut dyn Write) -> Result<()> {
        if !self.contains(id) {
            return Err(CimageError::NotFound(format!("layer {}", id)));
        }
        self.backend.assemble_tar(id, writer)
    }

    /// Merge repository → digest entries into the layer's distribution metadata.
    pub fn add_distribution_metadata(&self, id: &LayerId, entries: &BTreeMap<String, Digest>) -> Result<()> {
        self.backend.add_distribution_metadata(id, entries)?;
        if let Some(layer) = self.layers.write().get_mut(id) {
            layer
                .distribution_metadata
                .extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(())
    }

    /// Backfill the size of a layer once it is known exactly.
    ///
    /// Only the size sidecar is rewritten, so distribution metadata added
    /// concurrently is kept.
    pub fn update_size(&self, id: &LayerId, size: u64) -> Result<()> {
        if !self.contains(id) {
            return Err(CimageError::NotFound(format!("layer {}", id)));
        }
        self.backend.store_layer_size(id, size)?;
        if let Some(layer) = self.layers.write().get_mut(id) {
            layer.size = size;
        }
        Ok(())
    }

    pub fn set_metadata(&self, id: &LayerId, key: &str, data: &[u8]) -> Result<()> {
        self.backend.set_metadata(id, key, data)
    }

    pub fn get_metadata(&self, id: &LayerId, key: &str) -> Result<Vec<u8>> {
        self.backend.get_metadata(id, key)
    }

    pub fn delete_metadata(&self, id: &LayerId, key: &str) -> Result<()> {
        self.backend.delete_metadata(id, key)
    }

    /// Remove a layer's content and sidecars.
    pub fn delete(&self, id: &LayerId) -> Result<()> {
        self.backend.remove_layer(id)?;
        self.layers.write().remove(id);
        tracing::debug!(layer = %id, "Deleted layer");
        Ok(())
    }
}
