//! Request router: picks a strategy per request class and serves the response.

mod classify;

pub use classify::{RequestClass, RoutePolicy};

use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheResult, CacheSource, CacheStorage, Generations, VersionedCache};
use crate::error::{OfflineError, Result};
use crate::net::{Network, OutboundRequest, RequestIdentity, ResponseSnapshot};

/// What the router produced for one request.
#[derive(Debug, Clone)]
pub enum RouteOutcome {
  /// Intercepted request answered from the network or a cache
  Served {
    class: RequestClass,
    result: CacheResult<ResponseSnapshot>,
  },
  /// Not intercepted (cross-origin, API write, non-GET); live answer as-is
  Passthrough(ResponseSnapshot),
  /// API read with neither network nor a runtime-cached copy
  Unavailable,
}

impl RouteOutcome {
  pub fn response(&self) -> Option<&ResponseSnapshot> {
    match self {
      Self::Served { result, .. } => Some(&result.data),
      Self::Passthrough(response) => Some(response),
      Self::Unavailable => None,
    }
  }

  pub fn source(&self) -> Option<CacheSource> {
    match self {
      Self::Served { result, .. } => Some(result.source),
      Self::Passthrough(_) => Some(CacheSource::Network),
      Self::Unavailable => None,
    }
  }
}

/// Routes intercepted requests through the network and the versioned cache.
pub struct Router<S: CacheStorage> {
  cache: VersionedCache<S>,
  network: Arc<dyn Network>,
  policy: RoutePolicy,
}

impl<S: CacheStorage> Router<S> {
  pub fn new(cache: VersionedCache<S>, network: Arc<dyn Network>, policy: RoutePolicy) -> Self {
    Self {
      cache,
      network,
      policy,
    }
  }

  pub fn policy(&self) -> &RoutePolicy {
    &self.policy
  }

  pub fn generations(&self) -> &Generations {
    self.cache.generations()
  }

  /// The same routing over other cache generations.
  pub fn with_generations(&self, generations: Generations) -> Self {
    Self {
      cache: self.cache.with_generations(generations),
      network: Arc::clone(&self.network),
      policy: self.policy.clone(),
    }
  }

  /// Produce a response for `request` using the strategy for its class.
  pub async fn handle(&self, request: &OutboundRequest) -> Result<RouteOutcome> {
    let class = match self.policy.classify(request) {
      Some(class) => class,
      None => {
        debug!(method = %request.method, url = %request.url, "passthrough");
        return self.passthrough(request).await;
      }
    };
    debug!(%class, method = %request.method, url = %request.url, "routing");

    match class {
      RequestClass::Navigation => self.navigation(request).await,
      RequestClass::HotAsset => self.network_first(request).await,
      RequestClass::StaticAsset => self.cache_first(request).await,
      RequestClass::ApiRead => self.api_read(request).await,
      RequestClass::ApiWrite => self.passthrough(request).await,
    }
  }

  async fn passthrough(&self, request: &OutboundRequest) -> Result<RouteOutcome> {
    Ok(RouteOutcome::Passthrough(self.network.fetch(request).await?))
  }

  /// Network, keep a copy in the static generation; offline falls back to the
  /// exact cached page, then to the root document.
  async fn navigation(&self, request: &OutboundRequest) -> Result<RouteOutcome> {
    let identity = request.identity();
    let class = RequestClass::Navigation;

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store_static(&identity, &response).await;
        }
        Ok(served(class, CacheResult::from_network(response)))
      }
      Err(e) if e.is_network() => {
        if let Some(hit) = self.cache.match_entry(&identity, None).await? {
          return Ok(served(class, CacheResult::from_cached(hit, CacheSource::Offline)));
        }
        if let Some(fallback) = self.policy.fallback_url() {
          let fallback = RequestIdentity::get(&fallback);
          if let Some(hit) = self.cache.match_entry(&fallback, None).await? {
            debug!(url = %request.url, fallback = %fallback, "serving navigation fallback");
            return Ok(served(class, CacheResult::from_cached(hit, CacheSource::Offline)));
          }
        }
        Err(e)
      }
      Err(e) => Err(e),
    }
  }

  /// Network-first for hot assets. A non-2xx answer is treated like a failed
  /// fetch: the cached copy wins, and with no copy the request fails.
  async fn network_first(&self, request: &OutboundRequest) -> Result<RouteOutcome> {
    let identity = request.identity();
    let class = RequestClass::HotAsset;

    let failure = match self.network.fetch(request).await {
      Ok(response) if response.is_success() => {
        self.store_static(&identity, &response).await;
        return Ok(served(class, CacheResult::from_network(response)));
      }
      Ok(response) => {
        OfflineError::NetworkUnavailable(format!("{} answered HTTP {}", request.url, response.status))
      }
      Err(e) if e.is_network() => e,
      Err(e) => return Err(e),
    };

    match self.cache.match_entry(&identity, None).await? {
      Some(hit) => Ok(served(class, CacheResult::from_cached(hit, CacheSource::Offline))),
      None => Err(failure),
    }
  }

  /// Cache-first for static assets; a miss is fetched and stored.
  async fn cache_first(&self, request: &OutboundRequest) -> Result<RouteOutcome> {
    let identity = request.identity();
    let class = RequestClass::StaticAsset;

    if let Some(hit) = self.cache.match_entry(&identity, None).await? {
      return Ok(served(class, CacheResult::from_cached(hit, CacheSource::Cache)));
    }

    let response = self.network.fetch(request).await?;
    if response.is_success() {
      self.store_static(&identity, &response).await;
    }
    Ok(served(class, CacheResult::from_network(response)))
  }

  /// Network-first for API reads, mirrored into the runtime generation.
  async fn api_read(&self, request: &OutboundRequest) -> Result<RouteOutcome> {
    let identity = request.identity();
    let class = RequestClass::ApiRead;

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          if let Err(e) = self.cache.put_runtime(&identity, &response).await {
            warn!(%identity, error = %e, "failed to mirror API response");
          }
        }
        Ok(served(class, CacheResult::from_network(response)))
      }
      Err(e) if e.is_network() => {
        let runtime = &self.cache.generations().runtime_gen;
        match self.cache.match_entry(&identity, Some(runtime)).await? {
          Some(hit) => Ok(served(class, CacheResult::from_cached(hit, CacheSource::Offline))),
          None => {
            debug!(%identity, "no runtime copy for offline API read");
            Ok(RouteOutcome::Unavailable)
          }
        }
      }
      Err(e) => Err(e),
    }
  }

  /// Keep a copy of a live response. The caller already has the response,
  /// so a failed write only costs offline coverage.
  async fn store_static(&self, identity: &RequestIdentity, response: &ResponseSnapshot) {
    if let Err(e) = self.cache.put_static(identity, response).await {
      warn!(%identity, error = %e, "failed to cache response");
    }
  }
}

fn served(class: RequestClass, result: CacheResult<ResponseSnapshot>) -> RouteOutcome {
  RouteOutcome::Served { class, result }
}
