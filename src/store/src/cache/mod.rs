//! Build cache: chain fingerprints over ordered build steps and the lookup
//! of layers previously produced by an identical chain.

mod chain;
mod prober;

pub use chain::{CacheLayer, CacheService, ChainId, ChainStore};
pub use prober::{CacheState, ImageProber, NoopProber, ProbeOutcome, Prober};

/// Layer metadata key holding the content digest a COPY step was keyed on.
pub const CACHE_ID_KEY: &str = "cacheID";
