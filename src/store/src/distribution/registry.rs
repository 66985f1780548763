//! The registry seam used by the pusher and the puller.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use cimage_core::digest::Digest;
use cimage_core::error::Result;

use super::types::{Descriptor, RawManifest};

/// Content of a blob upload.
#[derive(Debug, Clone)]
pub enum BlobBody {
    Bytes(Vec<u8>),
    /// Streamed from a file of known size.
    File { path: PathBuf, size: u64 },
}

impl BlobBody {
    pub fn size(&self) -> u64 {
        match self {
            BlobBody::Bytes(data) => data.len() as u64,
            BlobBody::File { size, .. } => *size,
        }
    }
}

/// Manifest/blob operations against one registry.
///
/// `repo` is the repository path within the registry (e.g. `team/app`).
#[async_trait]
pub trait Registry: Send + Sync {
    /// Check that the registry speaks the v2 API and accepts our credentials.
    async fn ping(&self) -> Result<()>;

    /// Size and digest of a blob, `None` when the registry doesn't have it.
    async fn stat_blob(&self, repo: &str, digest: &Digest) -> Result<Option<Descriptor>>;

    /// Upload a blob whose content hashes to `digest`.
    async fn put_blob(&self, repo: &str, digest: &Digest, body: BlobBody) -> Result<()>;

    /// Stream a blob into `dest`, returning the number of bytes written.
    ///
    /// The content is not verified; callers hash what they read back.
    async fn fetch_blob(&self, repo: &str, digest: &Digest, dest: &Path) -> Result<u64>;

    /// Read a small blob (e.g. a config) fully into memory.
    async fn get_blob(&self, repo: &str, digest: &Digest) -> Result<Vec<u8>>;

    /// Fetch a manifest or manifest list by tag or digest.
    async fn get_manifest(&self, repo: &str, reference: &str) -> Result<RawManifest>;

    /// Store a manifest under a tag or digest, returning its digest.
    async fn put_manifest(&self, repo: &str, reference: &str, manifest: RawManifest) -> Result<Digest>;
}
