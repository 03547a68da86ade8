//! Generation-aware facade over a cache storage backend.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::db::blocking;
use crate::error::Result;
use crate::net::{RequestIdentity, ResponseSnapshot};

use super::storage::CacheStorage;
use super::traits::{CacheGeneration, CachedResponse, Generations};

/// Versioned cache store.
///
/// Knows the current static and runtime generations and routes reads and
/// writes to them. All storage calls run on the blocking pool, so callers
/// from async code never hold a runtime thread while SQLite works.
pub struct VersionedCache<S: CacheStorage> {
  storage: Arc<S>,
  generations: Generations,
}

impl<S: CacheStorage> VersionedCache<S> {
  pub fn new(storage: S, generations: Generations) -> Self {
    Self {
      storage: Arc::new(storage),
      generations,
    }
  }

  pub fn generations(&self) -> &Generations {
    &self.generations
  }

  /// A view of the same storage scoped to other generations.
  pub fn with_generations(&self, generations: Generations) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      generations,
    }
  }

  /// Store a response in `generation`, replacing any prior entry for the identity.
  pub async fn put(
    &self,
    generation: &CacheGeneration,
    identity: &RequestIdentity,
    response: &ResponseSnapshot,
  ) -> Result<()> {
    debug!(%generation, %identity, status = response.status, "cache put");
    let generation = generation.clone();
    let identity = identity.clone();
    let response = response.clone();
    blocking(&self.storage, move |s| s.put(&generation, &identity, &response)).await
  }

  pub async fn put_static(&self, identity: &RequestIdentity, response: &ResponseSnapshot) -> Result<()> {
    self.put(&self.generations.static_gen, identity, response).await
  }

  pub async fn put_runtime(&self, identity: &RequestIdentity, response: &ResponseSnapshot) -> Result<()> {
    self.put(&self.generations.runtime_gen, identity, response).await
  }

  /// Store a batch into `generation` atomically.
  pub async fn put_all(
    &self,
    generation: &CacheGeneration,
    entries: Vec<(RequestIdentity, ResponseSnapshot)>,
  ) -> Result<()> {
    let generation = generation.clone();
    blocking(&self.storage, move |s| s.put_all(&generation, &entries)).await
  }

  /// Find the stored response for `identity`.
  ///
  /// Scoped to `generation` when given; otherwise the static generation is
  /// searched first, then the runtime generation. `None` means no entry.
  pub async fn match_entry(
    &self,
    identity: &RequestIdentity,
    generation: Option<&CacheGeneration>,
  ) -> Result<Option<CachedResponse>> {
    let search: Vec<CacheGeneration> = match generation {
      Some(g) => vec![g.clone()],
      None => self.generations.search_order().into_iter().cloned().collect(),
    };
    let identity = identity.clone();

    blocking(&self.storage, move |s| {
      for generation in &search {
        if let Some(hit) = s.get(generation, &identity)? {
          return Ok(Some(hit));
        }
      }
      Ok(None)
    })
    .await
  }

  /// Delete every stored generation not named in `keep`. Returns the removed generations.
  pub async fn delete_generations_except(&self, keep: &[CacheGeneration]) -> Result<Vec<CacheGeneration>> {
    let keep: BTreeSet<CacheGeneration> = keep.iter().cloned().collect();

    let removed = blocking(&self.storage, move |s| {
      let mut removed = Vec::new();
      for generation in s.generations()? {
        if !keep.contains(&generation) && s.delete_generation(&generation)? {
          removed.push(generation);
        }
      }
      Ok(removed)
    })
    .await?;

    for generation in &removed {
      info!(%generation, "deleted stale cache generation");
    }
    Ok(removed)
  }

  /// Create `generation` if missing so it is visible to garbage collection.
  pub async fn open_generation(&self, generation: &CacheGeneration) -> Result<()> {
    let generation = generation.clone();
    blocking(&self.storage, move |s| s.open_generation(&generation)).await
  }

  pub async fn stored_generations(&self) -> Result<Vec<CacheGeneration>> {
    blocking(&self.storage, |s| s.generations()).await
  }

  pub async fn entry_count(&self, generation: &CacheGeneration) -> Result<usize> {
    let generation = generation.clone();
    blocking(&self.storage, move |s| s.entry_count(&generation)).await
  }
}

impl<S: CacheStorage> Clone for VersionedCache<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      generations: self.generations.clone(),
    }
  }
}
