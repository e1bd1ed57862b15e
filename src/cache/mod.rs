//! Bounded TTL cache with request coalescing.
//!
//! - `storage`: the size-bounded, expiring key/value store
//! - `manager`: sweeping, metrics and `get_or_set` coalescing on top of the store
//! - `key`: canonical cache keys for upstream queries
//! - `size`: byte estimates used for the store budget

pub mod key;
pub mod manager;
pub mod size;
pub mod storage;
pub mod upstream;

pub use key::generate_key;
pub use manager::{CacheConfig, CacheManager, CacheStats};
pub use size::{entry_size, EstimateSize, ENTRY_OVERHEAD_BYTES};
pub use storage::{BoundedStore, Removed, SetOutcome};
pub use upstream::Upstream;
