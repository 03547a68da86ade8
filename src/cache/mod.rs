//! Versioned response cache for offline support.
//!
//! This module provides the generation-partitioned cache the router reads and writes:
//! - Entries are keyed by request identity (normalized URL + method)
//! - Each entry belongs to one generation; a generation is dropped as a unit
//! - The static generation holds the app shell, the runtime generation mirrors API reads
//! - Snapshots keep the exact body bytes, status and headers

mod layer;
mod storage;
mod traits;

pub use layer::VersionedCache;
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{CacheGeneration, CacheResult, CacheSource, CachedResponse, Generations};
