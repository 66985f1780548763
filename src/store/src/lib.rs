//! cimage store - content-addressed layers and images, the build cache and
//! the registry client that moves them.
//!
//! - [`layer::LayerStore`] holds immutable layers keyed by the digest of
//!   their uncompressed tar stream.
//! - [`image::ImageStore`] maps names to per-platform image specs.
//! - [`cache`] computes chain IDs over build steps and finds reusable layers.
//! - [`build`] executes build steps against the cache and the layer store.
//! - [`distribution`] pushes and pulls images to and from a registry.

pub mod backend;
pub mod build;
pub mod cache;
pub mod distribution;
mod fsutil;
pub mod gc;
pub mod image;
pub mod layer;
pub mod model;
pub mod tar_split;

// Re-export commonly used types
pub use backend::{Backend, FsBackend};
pub use build::{execute_step, execute_steps, BuildSession, BuildStep, StepContext, StepOutput};
pub use cache::{CacheService, CacheState, ChainId, ImageProber, NoopProber, ProbeOutcome, Prober};
pub use distribution::{ImageReference, Puller, Pusher, Registry};
pub use gc::{prune, PruneReport};
pub use image::{ImageStore, ImageSummary};
pub use layer::{LayerStore, ROLayer};
pub use model::{Image, ImageLayer, LayerId, StepKind};
