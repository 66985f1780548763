//! In-memory registry and store fixtures for distribution tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use cimage_core::config::StoreConfig;
use cimage_core::digest::Digest;
use cimage_core::error::{CimageError, Result};

use super::registry::{BlobBody, Registry};
use super::types::{Descriptor, RawManifest};
use crate::backend::{Backend, FsBackend};
use crate::image::ImageStore;
use crate::layer::LayerStore;
use crate::model::LayerId;

type UploadFault = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

#[derive(Default)]
pub(crate) struct MemoryRegistry {
    blobs: Mutex<HashMap<(String, Digest), Vec<u8>>>,
    manifests: Mutex<HashMap<(String, String), RawManifest>>,
    fail_upload: Mutex<Option<UploadFault>>,
    blob_puts: AtomicUsize,
    manifest_puts: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reject blob uploads whose content satisfies `fault`.
    pub fn fail_uploads_where(&self, fault: impl Fn(&[u8]) -> bool + Send + Sync + 'static) {
        *self.fail_upload.lock() = Some(Box::new(fault));
    }

    /// Flip one byte of a stored blob without updating its key.
    pub fn corrupt_blob(&self, repo: &str, digest: &Digest) {
        let mut blobs = self.blobs.lock();
        let blob = blobs
            .get_mut(&(repo.to_string(), digest.clone()))
            .expect("blob to corrupt");
        let middle = blob.len() / 2;
        blob[middle] ^= 0xff;
    }

    pub fn insert_blob(&self, repo: &str, data: Vec<u8>) -> Digest {
        let digest = Digest::from_bytes(&data);
        self.blobs.lock().insert((repo.to_string(), digest.clone()), data);
        digest
    }

    pub fn insert_manifest(&self, repo: &str, reference: &str, manifest: RawManifest) {
        self.manifests
            .lock()
            .insert((repo.to_string(), reference.to_string()), manifest);
    }

    pub fn blob_puts(&self) -> usize {
        self.blob_puts.load(Ordering::SeqCst)
    }

    pub fn manifest_puts(&self) -> usize {
        self.manifest_puts.load(Ordering::SeqCst)
    }

    pub fn manifest(&self, repo: &str, reference: &str) -> Option<RawManifest> {
        self.manifests
            .lock()
            .get(&(repo.to_string(), reference.to_string()))
            .cloned()
    }

    fn blob(&self, repo: &str, digest: &Digest) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .get(&(repo.to_string(), digest.clone()))
            .cloned()
            .ok_or_else(|| CimageError::NotFound(format!("blob {}", digest)))
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn stat_blob(&self, repo: &str, digest: &Digest) -> Result<Option<Descriptor>> {
        Ok(self
            .blobs
            .lock()
            .get(&(repo.to_string(), digest.clone()))
            .map(|data| Descriptor::new("application/octet-stream", data.len() as u64, digest.clone())))
    }

    async fn put_blob(&self, repo: &str, digest: &Digest, body: BlobBody) -> Result<()> {
        let data = match body {
            BlobBody::Bytes(data) => data,
            BlobBody::File { path, .. } => tokio::fs::read(&path)
                .await
                .map_err(|e| CimageError::io(&path, e))?,
        };
        // Let sibling uploads make progress before this one settles.
        tokio::task::yield_now().await;

        if let Some(fault) = self.fail_upload.lock().as_ref() {
            if fault(&data) {
                return Err(CimageError::RegistryError {
                    registry: "memory".to_string(),
                    message: "injected upload failure".to_string(),
                });
            }
        }
        let actual = Digest::from_bytes(&data);
        if &actual != digest {
            return Err(CimageError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }

        self.blob_puts.fetch_add(1, Ordering::SeqCst);
        self.blobs.lock().insert((repo.to_string(), actual), data);
        Ok(())
    }

    async fn fetch_blob(&self, repo: &str, digest: &Digest, dest: &Path) -> Result<u64> {
        let data = self.blob(repo, digest)?;
        tokio::fs::write(dest, &data)
            .await
            .map_err(|e| CimageError::io(dest, e))?;
        Ok(data.len() as u64)
    }

    async fn get_blob(&self, repo: &str, digest: &Digest) -> Result<Vec<u8>> {
        self.blob(repo, digest)
    }

    async fn get_manifest(&self, repo: &str, reference: &str) -> Result<RawManifest> {
        self.manifest(repo, reference)
            .ok_or_else(|| CimageError::NotFound(format!("manifest {}:{}", repo, reference)))
    }

    async fn put_manifest(&self, repo: &str, reference: &str, manifest: RawManifest) -> Result<Digest> {
        self.manifest_puts.fetch_add(1, Ordering::SeqCst);
        let digest = manifest.digest();
        let mut manifests = self.manifests.lock();
        manifests.insert((repo.to_string(), digest.to_string()), manifest.clone());
        manifests.insert((repo.to_string(), reference.to_string()), manifest);
        Ok(digest)
    }
}

/// A complete on-disk store in a temp dir.
pub(crate) struct StoreFixture {
    pub tmp: TempDir,
    pub images: ImageStore,
    pub layers: Arc<LayerStore>,
}

impl StoreFixture {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let backend: Arc<dyn Backend> =
            Arc::new(FsBackend::open(StoreConfig::new(tmp.path().join("data"))).unwrap());
        Self {
            images: ImageStore::new(backend.clone()),
            layers: Arc::new(LayerStore::new(backend).unwrap()),
            tmp,
        }
    }

    /// Register a layer holding `files`.
    pub fn layer(&self, name: &str, files: &[(&str, &str)]) -> LayerId {
        let dir = self.tmp.path().join("scratch").join(name);
        for (path, content) in files {
            let path = dir.join(path);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        self.layers.register_from_dir(&dir).unwrap().unwrap()
    }

    pub fn tar_of(&self, id: &LayerId) -> Vec<u8> {
        let mut out = Vec::new();
        self.layers.assemble_tar(id, &mut out).unwrap();
        out
    }
}
