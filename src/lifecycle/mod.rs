//! Install/activate state machine and the replay trigger.
//!
//! `installing → installed → activating → active`, with `redundant` for an
//! install that could not pre-warm the whole manifest. Each phase resolves
//! only when its work is done; the host must not treat a phase as complete
//! before that.

mod clients;

pub use clients::{ClientPage, Clients};

use futures::future::try_join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheGeneration, CacheStorage, Generations, VersionedCache};
use crate::db::{blocking, DurableStore};
use crate::error::{OfflineError, Result};
use crate::net::{Network, OutboundRequest, RequestIdentity, ResponseSnapshot};
use crate::sync::{DrainReport, SyncQueue};

const STATE_KEY: &str = "lifecycle:state";
const GENERATIONS_KEY: &str = "lifecycle:generations";
const ACTIVE_KEY: &str = "lifecycle:active";

/// Lifecycle state of this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  /// Loaded, not installed yet
  #[default]
  Parsed,
  Installing,
  Installed,
  Activating,
  /// Controlling pages and intercepting requests
  Active,
  /// Install failed; a later install may retry
  Redundant,
}

impl std::fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Active => "active",
      Self::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

/// Result of an activation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationOutcome {
  /// Another build still controls an open page and immediate control is off
  Waiting,
  Activated {
    /// Stale generations garbage-collected
    removed: Vec<CacheGeneration>,
    /// Open pages taken over
    claimed: usize,
  },
}

/// Build-time inputs of the controller.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
  pub origin: Url,
  /// Ordered relative paths that must all be cached at install
  pub precache: Vec<String>,
  /// Replay trigger tag
  pub sync_tag: String,
  /// Take control immediately instead of waiting for older builds' pages to close
  pub skip_waiting: bool,
}

/// What the host and the request path see of the lifecycle. Published on
/// every transition and readable without waiting on one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleSnapshot {
  pub state: LifecycleState,
  /// Generations of the build controlling pages: this build once active,
  /// an earlier activated build until then
  pub controlling: Option<Generations>,
}

/// Lifecycle controller.
pub struct LifecycleController<S: CacheStorage, D: DurableStore> {
  /// Serializes install and activation
  transition: Mutex<()>,
  snapshot: watch::Sender<LifecycleSnapshot>,
  cache: VersionedCache<S>,
  network: Arc<dyn Network>,
  store: Arc<D>,
  queue: SyncQueue<D>,
  clients: Arc<Clients>,
  config: LifecycleConfig,
}

impl<S: CacheStorage, D: DurableStore> LifecycleController<S, D> {
  pub fn new(
    cache: VersionedCache<S>,
    network: Arc<dyn Network>,
    store: Arc<D>,
    queue: SyncQueue<D>,
    clients: Arc<Clients>,
    config: LifecycleConfig,
  ) -> Self {
    let (snapshot, _) = watch::channel(LifecycleSnapshot {
      state: LifecycleState::Parsed,
      controlling: None,
    });
    Self {
      transition: Mutex::new(()),
      snapshot,
      cache,
      network,
      store,
      queue,
      clients,
      config,
    }
  }

  pub fn state(&self) -> LifecycleState {
    self.snapshot.borrow().state
  }

  pub fn snapshot(&self) -> LifecycleSnapshot {
    self.snapshot.borrow().clone()
  }

  pub fn generations(&self) -> &Generations {
    self.cache.generations()
  }

  fn set_state(&self, state: LifecycleState) {
    self.snapshot.send_modify(|s| s.state = state);
  }

  /// Resume from the persisted records.
  ///
  /// This build is `active` when its generations are the recorded active
  /// pair and `installed` when its install was recorded. Otherwise it starts
  /// `parsed`, and the recorded active pair keeps serving until this build
  /// activates.
  pub async fn restore(&self) -> Result<LifecycleState> {
    let _transition = self.transition.lock().await;
    let (state, generations, active) = blocking(&self.store, |s| {
      Ok((
        s.kv_get(STATE_KEY)?,
        s.kv_get(GENERATIONS_KEY)?,
        s.kv_get(ACTIVE_KEY)?,
      ))
    })
    .await?;

    let state: Option<LifecycleState> = decode(state);
    let generations: Option<Generations> = decode(generations);
    let controlling: Option<Generations> = decode(active);
    let own = self.generations();

    let restored = if controlling.as_ref() == Some(own) {
      LifecycleState::Active
    } else if state == Some(LifecycleState::Installed) && generations.as_ref() == Some(own) {
      LifecycleState::Installed
    } else {
      LifecycleState::Parsed
    };

    if let Some(previous) = controlling.as_ref().filter(|g| *g != own) {
      info!(generation = %previous.static_gen, "previous build keeps control until activation");
    }
    debug!(state = %restored, "restored lifecycle state");
    self.snapshot.send_replace(LifecycleSnapshot {
      state: restored,
      controlling,
    });
    Ok(restored)
  }

  /// Pre-warm the static generation with the full manifest.
  ///
  /// Every entry is fetched before anything is written; a single failure
  /// fails the install, caches nothing and leaves this build `redundant`.
  /// Whatever build controlled pages before keeps doing so.
  pub async fn install(&self) -> Result<LifecycleState> {
    let _transition = self.transition.lock().await;
    match self.state() {
      LifecycleState::Parsed | LifecycleState::Redundant => {}
      current @ (LifecycleState::Installed | LifecycleState::Active) => {
        debug!(state = %current, "install requested for an installed build; nothing to do");
        return Ok(current);
      }
      other => {
        return Err(OfflineError::InvalidState(format!("cannot install while {}", other)));
      }
    }

    self.set_state(LifecycleState::Installing);
    info!(generation = %self.generations().static_gen, assets = self.config.precache.len(), "installing");

    match self.prewarm().await {
      Ok(()) => {
        self.set_state(LifecycleState::Installed);
        info!(generation = %self.generations().static_gen, "installed");
        Ok(LifecycleState::Installed)
      }
      Err(e) => {
        warn!(error = %e, "install failed");
        self.set_state(LifecycleState::Redundant);
        Err(e)
      }
    }
  }

  async fn prewarm(&self) -> Result<()> {
    let fetches = self.config.precache.iter().map(|path| self.fetch_precache(path));
    let entries = try_join_all(fetches).await?;

    self.cache.put_all(&self.generations().static_gen, entries).await?;
    self.cache.open_generation(&self.generations().runtime_gen).await?;
    self.persist(LifecycleState::Installed).await
  }

  async fn fetch_precache(&self, path: &str) -> Result<(RequestIdentity, ResponseSnapshot)> {
    let install_failed = |reason: String| OfflineError::InstallFailed {
      path: path.to_string(),
      reason,
    };

    let url = self
      .config
      .origin
      .join(path)
      .map_err(|e| install_failed(format!("invalid path: {}", e)))?;
    let request = OutboundRequest::get(url);

    let response = self
      .network
      .fetch(&request)
      .await
      .map_err(|e| install_failed(e.to_string()))?;
    if !response.is_success() {
      return Err(install_failed(format!("HTTP {}", response.status)));
    }
    Ok((request.identity(), response))
  }

  /// Garbage-collect stale generations and take control of open pages.
  pub async fn activate(&self) -> Result<ActivationOutcome> {
    let _transition = self.transition.lock().await;
    match self.state() {
      LifecycleState::Installed => {}
      LifecycleState::Active => {
        return Ok(ActivationOutcome::Activated {
          removed: Vec::new(),
          claimed: 0,
        });
      }
      other => {
        return Err(OfflineError::InvalidState(format!("cannot activate while {}", other)));
      }
    }

    let version = self.generations().static_gen.clone();
    if !self.config.skip_waiting && self.clients.controlled_by_other(&version)? {
      info!(generation = %version, "waiting for pages controlled by an older build to close");
      return Ok(ActivationOutcome::Waiting);
    }

    self.set_state(LifecycleState::Activating);
    match self.take_control(&version).await {
      Ok((removed, claimed)) => {
        let own = self.generations().clone();
        self.snapshot.send_modify(|s| {
          s.state = LifecycleState::Active;
          s.controlling = Some(own);
        });
        info!(generation = %version, removed = removed.len(), claimed, "activated");
        Ok(ActivationOutcome::Activated { removed, claimed })
      }
      Err(e) => {
        warn!(error = %e, "activation failed");
        self.set_state(LifecycleState::Installed);
        Err(e)
      }
    }
  }

  async fn take_control(&self, version: &CacheGeneration) -> Result<(Vec<CacheGeneration>, usize)> {
    let removed = self
      .cache
      .delete_generations_except(&self.generations().keep_set())
      .await?;
    let claimed = self.clients.claim(version)?;
    self.persist(LifecycleState::Active).await?;
    Ok((removed, claimed))
  }

  /// Replay trigger from the host. Tags other than the configured one are
  /// ignored (`Ok(None)`); drain failures are returned so the host can
  /// schedule a retry.
  pub async fn on_sync(&self, tag: &str) -> Result<Option<DrainReport>> {
    if tag != self.config.sync_tag {
      debug!(tag, "ignoring sync event for unknown tag");
      return Ok(None);
    }
    info!(tag, "replay trigger received");
    self.queue.drain().await.map(Some)
  }

  /// Record `state` for this build; `active` also records it as the build in control.
  async fn persist(&self, state: LifecycleState) -> Result<()> {
    let generations = serde_json::to_string(self.generations())?;
    let active = (state == LifecycleState::Active).then(|| generations.clone());
    let state = serde_json::to_string(&state)?;
    blocking(&self.store, move |s| {
      s.kv_put(STATE_KEY, &state)?;
      s.kv_put(GENERATIONS_KEY, &generations)?;
      match active {
        Some(active) => s.kv_put(ACTIVE_KEY, &active),
        None => Ok(()),
      }
    })
    .await
  }
}

fn decode<T: DeserializeOwned>(raw: Option<String>) -> Option<T> {
  raw.as_deref().and_then(|raw| serde_json::from_str(raw).ok())
}
