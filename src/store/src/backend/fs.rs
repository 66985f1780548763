//! Filesystem backend.
//!
//! Layout under the data root:
//!
//! ```text
//! layers/<hex>/...                          layer file trees
//! layerdb/sha256/<hex>/id                   sidecars
//! layerdb/sha256/<hex>/size
//! layerdb/sha256/<hex>/media_type
//! layerdb/sha256/<hex>/distribution_layer_digest
//! layerdb/sha256/<hex>/tar-split.json.gz
//! images/<image-id>.yaml                    image specs
//! image_metadata.json                       name -> manifest list index
//! ```

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use cimage_core::config::StoreConfig;
use cimage_core::digest::Digest;
use cimage_core::error::{CimageError, Result};
use cimage_core::platform::Platform;

use super::{Backend, StagedTar};
use crate::fsutil::{atomic_write, remove_dir_all_if_exists};
use crate::layer::ROLayer;
use crate::model::{Image, ImageMetadataMap, LayerId, ManifestDescriptor, LAYER_MEDIA_TYPE};
use crate::tar_split;

const ID_FILE: &str = "id";
const SIZE_FILE: &str = "size";
const MEDIA_TYPE_FILE: &str = "media_type";
const DISTRIBUTION_FILE: &str = "distribution_layer_digest";
const TAR_SPLIT_FILE: &str = "tar-split.json.gz";

const RESERVED_KEYS: &[&str] = &[ID_FILE, SIZE_FILE, MEDIA_TYPE_FILE, DISTRIBUTION_FILE, TAR_SPLIT_FILE];

#[derive(Debug, Serialize, Deserialize)]
struct DistributionEntry {
    source_repository: String,
    layer_content_digest: Digest,
}

/// Filesystem-backed store.
///
/// The manifest index and the layer sidecars each sit behind their own
/// reader/writer lock; layer file trees are immutable once committed and are
/// read without locking.
pub struct FsBackend {
    config: StoreConfig,
    index_lock: RwLock<()>,
    layer_lock: RwLock<()>,
}

impl FsBackend {
    /// Open (creating if needed) a backend rooted at `config.data_root`.
    pub fn open(config: StoreConfig) -> Result<Self> {
        for dir in [
            config.layer_data_root(),
            config.layer_db_root(),
            config.image_db_root(),
            config.tmp_root(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| CimageError::io(&dir, e))?;
        }
        tracing::debug!(root = %config.data_root.display(), "Opened filesystem backend");
        Ok(Self {
            config,
            index_lock: RwLock::new(()),
            layer_lock: RwLock::new(()),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn image_path(&self, id: &str) -> Result<PathBuf> {
        // Validates the id so it can't name anything outside images/.
        Digest::from_hex(id)?;
        Ok(self.config.image_db_root().join(format!("{}.yaml", id)))
    }

    fn read_index(&self) -> Result<Option<ImageMetadataMap>> {
        let path = self.config.image_metadata_file();
        match std::fs::read(&path) {
            Ok(data) => {
                let map = serde_json::from_slice(&data).map_err(|e| {
                    CimageError::SerializationError(format!(
                        "Failed to parse image index {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(Some(map))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CimageError::io(path, e)),
        }
    }

    fn write_index(&self, map: &ImageMetadataMap) -> Result<()> {
        let data = serde_json::to_vec_pretty(map)?;
        atomic_write(&self.config.image_metadata_file(), &data)
    }

    fn read_distribution(&self, id: &LayerId) -> Result<BTreeMap<String, Digest>> {
        let path = self.layer_db_dir(id).join(DISTRIBUTION_FILE);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(layer = %id, "No distribution metadata recorded yet");
                return Ok(BTreeMap::new());
            }
            Err(e) => return Err(CimageError::io(path, e)),
        };
        let entries: Vec<DistributionEntry> = serde_json::from_slice(&data)?;
        Ok(entries
            .into_iter()
            .map(|e| (e.source_repository, e.layer_content_digest))
            .collect())
    }

    fn write_distribution(&self, id: &LayerId, map: &BTreeMap<String, Digest>) -> Result<()> {
        let entries: Vec<DistributionEntry> = map
            .iter()
            .map(|(repo, digest)| DistributionEntry {
                source_repository: repo.clone(),
                layer_content_digest: digest.clone(),
            })
            .collect();
        let data = serde_json::to_vec(&entries)?;
        atomic_write(&self.layer_db_dir(id).join(DISTRIBUTION_FILE), &data)
    }

    fn read_ro_layer(&self, dir: &Path) -> Result<Option<ROLayer>> {
        let id_path = dir.join(ID_FILE);
        let raw_id = match std::fs::read_to_string(&id_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CimageError::io(id_path, e)),
        };
        let id: LayerId = raw_id.trim().parse()?;

        let size = match std::fs::read_to_string(dir.join(SIZE_FILE)) {
            Ok(raw) => raw.trim().parse::<u64>().map_err(|e| {
                CimageError::SerializationError(format!("invalid size for layer {}: {}", id, e))
            })?,
            Err(_) => 0,
        };
        let media_type = std::fs::read_to_string(dir.join(MEDIA_TYPE_FILE))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| LAYER_MEDIA_TYPE.to_string());
        let distribution_metadata = self.read_distribution(&id)?;

        Ok(Some(ROLayer {
            id,
            size,
            media_type,
            distribution_metadata,
        }))
    }

    fn metadata_path(&self, id: &LayerId, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && !key.contains('/')
            && !key.contains('\\')
            && key != "."
            && key != ".."
            && !RESERVED_KEYS.contains(&key);
        if !valid {
            return Err(CimageError::Other(format!(
                "invalid layer metadata key '{}'",
                key
            )));
        }
        Ok(self.layer_db_dir(id).join(key))
    }
}

impl Backend for FsBackend {
    fn get_image_by_id(&self, id: &str) -> Result<Image> {
        let path = self.image_path(id)?;
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CimageError::NotFound(format!("image {}", id)))
            }
            Err(e) => return Err(CimageError::io(path, e)),
        };
        Ok(serde_yaml::from_str(&data)?)
    }

    fn save_image(&self, image: &Image) -> Result<()> {
        let path = self.image_path(&image.spec.id)?;
        let data = serde_yaml::to_string(image)?;
        atomic_write(&path, data.as_bytes())
    }

    fn delete_image_spec(&self, id: &str) -> Result<()> {
        let path = self.image_path(id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CimageError::io(path, e)),
        }
    }

    fn list_image_ids(&self) -> Result<Vec<String>> {
        let root = self.config.image_db_root();
        let mut ids = Vec::new();
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(CimageError::io(root, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| CimageError::io(&root, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(".yaml") {
                if Digest::from_hex(id).is_ok() {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn get_image_metadata_map(&self) -> Result<ImageMetadataMap> {
        {
            let _guard = self.index_lock.read();
            if let Some(map) = self.read_index()? {
                return Ok(map);
            }
        }
        let _guard = self.index_lock.write();
        if let Some(map) = self.read_index()? {
            return Ok(map);
        }
        let map = ImageMetadataMap::new();
        self.write_index(&map)?;
        tracing::debug!("Created empty image index");
        Ok(map)
    }

    fn put_image_metadata(&self, name: &str, descriptor: ManifestDescriptor) -> Result<()> {
        let _guard = self.index_lock.write();
        let mut map = self.read_index()?.unwrap_or_default();
        map.entry(name.to_string()).or_default().upsert(descriptor);
        self.write_index(&map)
    }

    fn delete_image_metadata(&self, name: &str, platform: Option<&Platform>) -> Result<()> {
        let _guard = self.index_lock.write();
        let mut map = self.read_index()?.unwrap_or_default();
        match platform {
            None => {
                if map.remove(name).is_none() {
                    return Err(CimageError::NotFound(format!("image {}", name)));
                }
            }
            Some(platform) => {
                let list = map
                    .get_mut(name)
                    .ok_or_else(|| CimageError::NotFound(format!("image {}", name)))?;
                if !list.remove(platform) {
                    return Err(CimageError::NotFound(format!(
                        "image {} for platform {}",
                        name, platform
                    )));
                }
                if list.manifests.is_empty() {
                    map.remove(name);
                }
            }
        }
        self.write_index(&map)
    }

    fn delete_image_metadata_by_id(&self, id: &str) -> Result<()> {
        let _guard = self.index_lock.write();
        let mut map = self.read_index()?.unwrap_or_default();
        let mut removed = false;
        for list in map.values_mut() {
            let before = list.manifests.len();
            list.manifests.retain(|m| m.id != id);
            removed |= list.manifests.len() != before;
        }
        if !removed {
            return Err(CimageError::NotFound(format!("image {}", id)));
        }
        map.retain(|_, list| !list.manifests.is_empty());
        self.write_index(&map)
    }

    fn layer_data_dir(&self, id: &LayerId) -> PathBuf {
        self.config.layer_data_root().join(id.hex())
    }

    fn layer_db_dir(&self, id: &LayerId) -> PathBuf {
        self.config
            .data_root
            .join("layerdb")
            .join(id.algorithm())
            .join(id.hex())
    }

    fn tmp_dir(&self) -> PathBuf {
        self.config.tmp_root()
    }

    fn store_ro_layer(&self, layer: &ROLayer) -> Result<()> {
        let _guard = self.layer_lock.write();
        let dir = self.layer_db_dir(&layer.id);
        std::fs::create_dir_all(&dir).map_err(|e| CimageError::io(&dir, e))?;
        atomic_write(&dir.join(SIZE_FILE), layer.size.to_string().as_bytes())?;
        atomic_write(&dir.join(MEDIA_TYPE_FILE), layer.media_type.as_bytes())?;
        self.write_distribution(&layer.id, &layer.distribution_metadata)?;
        // The id file marks the entry complete, so it goes last.
        atomic_write(&dir.join(ID_FILE), layer.id.as_str().as_bytes())
    }

    fn store_layer_size(&self, id: &LayerId, size: u64) -> Result<()> {
        let _guard = self.layer_lock.write();
        let dir = self.layer_db_dir(id);
        if !dir.join(ID_FILE).exists() {
            return Err(CimageError::NotFound(format!("layer {}", id)));
        }
        atomic_write(&dir.join(SIZE_FILE), size.to_string().as_bytes())
    }

    fn load_all_ro_layers(&self) -> Result<Vec<ROLayer>> {
        let _guard = self.layer_lock.read();
        let root = self.config.layer_db_root();
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CimageError::io(root, e)),
        };

        let mut layers = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CimageError::io(&root, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            match self.read_ro_layer(&entry.path())? {
                Some(layer) if layer.id.hex() == entry.file_name().to_string_lossy() => {
                    layers.push(layer)
                }
                Some(layer) => {
                    tracing::warn!(
                        layer = %layer.id,
                        dir = %entry.path().display(),
                        "Layer id does not match its directory, skipping"
                    );
                }
                None => {
                    tracing::warn!(dir = %entry.path().display(), "Incomplete layer entry, skipping");
                }
            }
        }
        layers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(layers)
    }

    fn remove_layer(&self, id: &LayerId) -> Result<()> {
        let _guard = self.layer_lock.write();
        remove_dir_all_if_exists(&self.layer_db_dir(id))?;
        remove_dir_all_if_exists(&self.layer_data_dir(id))
    }

    fn set_metadata(&self, id: &LayerId, key: &str, data: &[u8]) -> Result<()> {
        let path = self.metadata_path(id, key)?;
        let _guard = self.layer_lock.write();
        atomic_write(&path, data)
    }

    fn get_metadata(&self, id: &LayerId, key: &str) -> Result<Vec<u8>> {
        let path = self.metadata_path(id, key)?;
        let _guard = self.layer_lock.read();
        match std::fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CimageError::NotFound(
                format!("metadata '{}' for layer {}", key, id),
            )),
            Err(e) => Err(CimageError::io(path, e)),
        }
    }

    fn delete_metadata(&self, id: &LayerId, key: &str) -> Result<()> {
        let path = self.metadata_path(id, key)?;
        let _guard = self.layer_lock.write();
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CimageError::io(path, e)),
        }
    }

    fn add_distribution_metadata(&self, id: &LayerId, entries: &BTreeMap<String, Digest>) -> Result<()> {
        let _guard = self.layer_lock.write();
        let mut map = self.read_distribution(id)?;
        map.extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.write_distribution(id, &map)
    }

    fn load_distribution_metadata(&self, id: &LayerId) -> Result<BTreeMap<String, Digest>> {
        let _guard = self.layer_lock.read();
        self.read_distribution(id)
    }

    fn stage_tar(&self, reader: &mut dyn Read, extract: bool) -> Result<StagedTar> {
        let tmp_root = self.tmp_dir();
        std::fs::create_dir_all(&tmp_root).map_err(|e| CimageError::io(&tmp_root, e))?;
        let dir = tempfile::Builder::new()
            .prefix("stage-")
            .tempdir_in(&tmp_root)
            .map_err(|e| CimageError::io(&tmp_root, e))?;

        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir).map_err(|e| CimageError::io(&data_dir, e))?;
        let meta_path = dir.path().join(TAR_SPLIT_FILE);
        let meta = std::fs::File::create(&meta_path).map_err(|e| CimageError::io(&meta_path, e))?;

        let summary = tar_split::disassemble(reader, &data_dir, extract, meta)?;
        Ok(StagedTar {
            dir,
            summary,
            extracted: extract,
        })
    }

    fn commit_tar(&self, id: &LayerId, staged: StagedTar) -> Result<()> {
        let _guard = self.layer_lock.write();
        if staged.extracted {
            let target = self.layer_data_dir(id);
            if target.exists() {
                tracing::debug!(layer = %id, "Layer content already present, keeping it");
            } else {
                let source = staged.dir.path().join("data");
                std::fs::rename(&source, &target).map_err(|e| CimageError::io(&target, e))?;
            }
        }

        let db_dir = self.layer_db_dir(id);
        std::fs::create_dir_all(&db_dir).map_err(|e| CimageError::io(&db_dir, e))?;
        let target = db_dir.join(TAR_SPLIT_FILE);
        std::fs::rename(staged.dir.path().join(TAR_SPLIT_FILE), &target)
            .map_err(|e| CimageError::io(&target, e))?;
        Ok(())
    }

    fn assemble_tar(&self, id: &LayerId, writer: &mut dyn Write) -> Result<()> {
        let path = self.layer_db_dir(id).join(TAR_SPLIT_FILE);
        let meta = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CimageError::NotFound(format!("tar-split metadata for layer {}", id)))
            }
            Err(e) => return Err(CimageError::io(path, e)),
        };
        tar_split::assemble(meta, &self.layer_data_dir(id), writer)
    }
}
