//! Core types for the versioned response cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::net::ResponseSnapshot;

/// Identifier tagging one batch of cache entries (e.g. `axis-static-v12`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheGeneration(String);

impl CacheGeneration {
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for CacheGeneration {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for CacheGeneration {
  fn from(s: &str) -> Self {
    Self::new(s)
  }
}

/// The current static and runtime generations. Every other stored generation is stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generations {
  /// App shell and assets; replaced wholesale on each deploy
  #[serde(rename = "static")]
  pub static_gen: CacheGeneration,
  /// Mirror of API read responses
  #[serde(rename = "runtime")]
  pub runtime_gen: CacheGeneration,
}

impl Generations {
  pub fn new(static_gen: impl Into<String>, runtime_gen: impl Into<String>) -> Self {
    Self {
      static_gen: CacheGeneration::new(static_gen),
      runtime_gen: CacheGeneration::new(runtime_gen),
    }
  }

  /// Search order for unscoped lookups: static first, then runtime.
  pub fn search_order(&self) -> [&CacheGeneration; 2] {
    [&self.static_gen, &self.runtime_gen]
  }

  pub fn keep_set(&self) -> Vec<CacheGeneration> {
    vec![self.static_gen.clone(), self.runtime_gen.clone()]
  }
}

/// A stored response with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub generation: CacheGeneration,
  pub response: ResponseSnapshot,
  pub cached_at: DateTime<Utc>,
}

/// Result from a routed request, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new result from live network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }
}

impl CacheResult<ResponseSnapshot> {
  pub fn from_cached(cached: CachedResponse, source: CacheSource) -> Self {
    Self {
      data: cached.response,
      source,
      cached_at: Some(cached.cached_at),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live network response
  Network,
  /// Cache hit served without a network attempt (cache-first)
  Cache,
  /// Network unavailable, serving cached data
  Offline,
}
