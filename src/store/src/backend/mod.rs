//! Persistence backends for layers, image specs and the manifest index.

mod fs;

pub use fs::FsBackend;

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;

use cimage_core::digest::Digest;
use cimage_core::error::Result;
use cimage_core::platform::Platform;

use crate::layer::ROLayer;
use crate::model::{Image, ImageMetadataMap, LayerId, ManifestDescriptor};
use crate::tar_split::TarSummary;

/// A disassembled tar stream waiting to be moved under its layer ID.
///
/// Dropping it without committing discards the staged files.
pub struct StagedTar {
    pub(crate) dir: tempfile::TempDir,
    pub(crate) summary: TarSummary,
    pub(crate) extracted: bool,
}

impl StagedTar {
    /// Digest and size of the uncompressed stream that was staged.
    pub fn summary(&self) -> &TarSummary {
        &self.summary
    }
}

/// Storage capability set used by the layer store and the image store.
///
/// `FsBackend` is the production implementation.
pub trait Backend: Send + Sync {
    /// Load the image spec stored under `id`.
    fn get_image_by_id(&self, id: &str) -> Result<Image>;

    /// Write the spec of an image whose `spec.id` is already set.
    fn save_image(&self, image: &Image) -> Result<()>;

    /// Remove a stored image spec file. Missing files are not an error.
    fn delete_image_spec(&self, id: &str) -> Result<()>;

    /// IDs of all stored image spec files.
    fn list_image_ids(&self) -> Result<Vec<String>>;

    /// The full name → manifest list index, created empty if absent.
    fn get_image_metadata_map(&self) -> Result<ImageMetadataMap>;

    /// Insert or replace the descriptor for `(name, descriptor.platform)`.
    fn put_image_metadata(&self, name: &str, descriptor: ManifestDescriptor) -> Result<()>;

    /// Remove one platform of a name, or the whole name when `platform` is `None`.
    fn delete_image_metadata(&self, name: &str, platform: Option<&Platform>) -> Result<()>;

    /// Remove every descriptor pointing at image `id`.
    fn delete_image_metadata_by_id(&self, id: &str) -> Result<()>;

    /// Directory holding the file tree of a layer.
    fn layer_data_dir(&self, id: &LayerId) -> PathBuf;

    /// Directory holding the sidecar files of a layer.
    fn layer_db_dir(&self, id: &LayerId) -> PathBuf;

    /// Scratch directory on the same filesystem as the layers.
    fn tmp_dir(&self) -> PathBuf;

    /// Write the `id`, `size`, media type and distribution sidecars.
    fn store_ro_layer(&self, layer: &ROLayer) -> Result<()>;

    /// Rewrite only the `size` sidecar of a registered layer.
    fn store_layer_size(&self, id: &LayerId, size: u64) -> Result<()>;

    /// Read every registered layer from disk.
    fn load_all_ro_layers(&self) -> Result<Vec<ROLayer>>;

    /// Remove both the file tree and the sidecars of a layer.
    fn remove_layer(&self, id: &LayerId) -> Result<()>;

    fn set_metadata(&self, id: &LayerId, key: &str, data: &[u8]) -> Result<()>;
    fn get_metadata(&self, id: &LayerId, key: &str) -> Result<Vec<u8>>;
    fn delete_metadata(&self, id: &LayerId, key: &str) -> Result<()>;

    /// Merge repository → digest entries into the distribution sidecar.
    fn add_distribution_metadata(&self, id: &LayerId, entries: &BTreeMap<String, Digest>) -> Result<()>;

    /// Distribution sidecar content; absent sidecar reads as empty.
    fn load_distribution_metadata(&self, id: &LayerId) -> Result<BTreeMap<String, Digest>>;

    /// Split a tar stream into a staging area.
    fn stage_tar(&self, reader: &mut dyn Read, extract: bool) -> Result<StagedTar>;

    /// Move a staged tar under `id`. Existing content for `id` is kept.
    fn commit_tar(&self, id: &LayerId, staged: StagedTar) -> Result<()>;

    /// Re-serialize the tar stream of a layer.
    fn assemble_tar(&self, id: &LayerId, writer: &mut dyn Write) -> Result<()>;
}
