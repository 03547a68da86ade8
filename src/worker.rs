//! Explicit wiring of the router, sync queue and lifecycle controller.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheGeneration, CacheStorage, Generations, SqliteStorage, VersionedCache};
use crate::config::Config;
use crate::db::{blocking, DurableStore, QueueItem, SqliteStore};
use crate::error::Result;
use crate::event::{EventOutcome, HostEvent};
use crate::lifecycle::{
  ActivationOutcome, Clients, LifecycleConfig, LifecycleController, LifecycleState,
};
use crate::net::{HttpNetwork, Network, OutboundRequest, ResponseSnapshot};
use crate::router::{RoutePolicy, Router, RouteOutcome};
use crate::sync::{DrainReport, SyncQueue};

/// Build-time settings for a worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
  pub generations: Generations,
  pub policy: RoutePolicy,
  pub lifecycle: LifecycleConfig,
}

impl WorkerSettings {
  pub fn from_config(config: &Config) -> color_eyre::Result<Self> {
    Ok(Self {
      generations: config.generations.clone(),
      policy: config.route_policy()?,
      lifecycle: config.lifecycle_config()?,
    })
  }
}

/// What happened to a mutating request handed to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
  /// The server answered (any status; HTTP errors are the caller's to handle)
  Sent(ResponseSnapshot),
  /// The network was unreachable; the request is queued for replay
  Queued { sequence: i64 },
}

/// Snapshot of the worker for status displays.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
  pub state: LifecycleState,
  pub generations: Generations,
  /// Generations serving requests, when any build is active
  pub controlling: Option<Generations>,
  pub stored_generations: Vec<CacheGeneration>,
  pub pending: usize,
}

/// The offline layer: every component instance, wired once at startup.
pub struct OfflineWorker<S: CacheStorage, D: DurableStore> {
  router: Router<S>,
  queue: SyncQueue<D>,
  lifecycle: LifecycleController<S, D>,
  cache: VersionedCache<S>,
  clients: Arc<Clients>,
  network: Arc<dyn Network>,
  store: Arc<D>,
}

impl OfflineWorker<SqliteStorage, SqliteStore> {
  /// Open the SQLite-backed worker under `data_dir` and restore its lifecycle state.
  pub async fn open(data_dir: &Path, config: &Config) -> color_eyre::Result<Self> {
    let storage = SqliteStorage::open(&data_dir.join("cache.db"))?;
    let store = Arc::new(SqliteStore::open(&data_dir.join("store.db"))?);
    let network: Arc<dyn Network> = Arc::new(HttpNetwork::new(config.network_timeout())?);

    let worker = Self::new(storage, store, network, WorkerSettings::from_config(config)?);
    let state = worker.lifecycle.restore().await?;
    info!(%state, data_dir = %data_dir.display(), "worker ready");
    Ok(worker)
  }
}

impl<S: CacheStorage, D: DurableStore> OfflineWorker<S, D> {
  pub fn new(storage: S, store: Arc<D>, network: Arc<dyn Network>, settings: WorkerSettings) -> Self {
    let cache = VersionedCache::new(storage, settings.generations);
    let clients = Arc::new(Clients::new());
    let queue = SyncQueue::new(store.clone(), network.clone(), settings.policy.origin.clone());
    let router = Router::new(cache.clone(), network.clone(), settings.policy);
    let lifecycle = LifecycleController::new(
      cache.clone(),
      network.clone(),
      store.clone(),
      queue.clone(),
      clients.clone(),
      settings.lifecycle,
    );

    Self {
      router,
      queue,
      lifecycle,
      cache,
      clients,
      network,
      store,
    }
  }

  pub fn clients(&self) -> &Clients {
    &self.clients
  }

  pub async fn restore(&self) -> Result<LifecycleState> {
    self.lifecycle.restore().await
  }

  pub async fn install(&self) -> Result<LifecycleState> {
    self.lifecycle.install().await
  }

  pub async fn activate(&self) -> Result<ActivationOutcome> {
    self.lifecycle.activate().await
  }

  /// Handle an intercepted request.
  ///
  /// Requests are routed over the generations of the build in control: this
  /// one once active, the last activated build until then. With no build in
  /// control they go straight to the network.
  pub async fn fetch(&self, request: &OutboundRequest) -> Result<RouteOutcome> {
    match self.lifecycle.snapshot().controlling {
      None => Ok(RouteOutcome::Passthrough(self.network.fetch(request).await?)),
      Some(generations) if &generations == self.router.generations() => self.router.handle(request).await,
      Some(generations) => {
        debug!(generation = %generations.static_gen, "routing with the previous build");
        self.router.with_generations(generations).handle(request).await
      }
    }
  }

  /// Issue a mutating request on behalf of the application's request layer.
  ///
  /// Only a transport failure queues the request; any HTTP answer, including
  /// an error status, is returned to the caller. A queueing failure is
  /// returned as well, never swallowed.
  pub async fn send_mutation(&self, request: &OutboundRequest) -> Result<MutationOutcome> {
    match self.network.fetch(request).await {
      Ok(response) => Ok(MutationOutcome::Sent(response)),
      Err(e) if e.is_network() => {
        warn!(method = %request.method, url = %request.url, error = %e, "offline; queueing mutation");
        let sequence = self.queue.enqueue_request(request).await?;
        Ok(MutationOutcome::Queued { sequence })
      }
      Err(e) => Err(e),
    }
  }

  /// Replay trigger.
  pub async fn sync(&self, tag: &str) -> Result<Option<DrainReport>> {
    self.lifecycle.on_sync(tag).await
  }

  pub async fn pending(&self) -> Result<Vec<QueueItem>> {
    self.queue.pending().await
  }

  pub async fn clear_queue(&self) -> Result<usize> {
    self.queue.clear().await
  }

  pub async fn kv_get(&self, key: &str) -> Result<Option<String>> {
    let key = key.to_string();
    blocking(&self.store, move |s| s.kv_get(&key)).await
  }

  pub async fn kv_put(&self, key: &str, value: &str) -> Result<()> {
    let (key, value) = (key.to_string(), value.to_string());
    blocking(&self.store, move |s| s.kv_put(&key, &value)).await
  }

  pub async fn kv_delete(&self, key: &str) -> Result<bool> {
    let key = key.to_string();
    blocking(&self.store, move |s| s.kv_delete(&key)).await
  }

  pub async fn status(&self) -> Result<WorkerStatus> {
    let snapshot = self.lifecycle.snapshot();
    Ok(WorkerStatus {
      state: snapshot.state,
      generations: self.lifecycle.generations().clone(),
      controlling: snapshot.controlling,
      stored_generations: self.cache.stored_generations().await?,
      pending: self.queue.len().await?,
    })
  }

  /// Dispatch one host event; resolves when the event's work is complete.
  pub async fn handle_event(&self, event: HostEvent) -> Result<EventOutcome> {
    match event {
      HostEvent::Install => self.install().await.map(EventOutcome::Lifecycle),
      HostEvent::Activate => self.activate().await.map(EventOutcome::Activation),
      HostEvent::Fetch(request) => self.fetch(&request).await.map(EventOutcome::Response),
      HostEvent::Sync { tag } => self.sync(&tag).await.map(EventOutcome::Synced),
      HostEvent::ClientOpened(page) => self.clients.add(page).map(|_| EventOutcome::Ack),
      HostEvent::ClientClosed(id) => self.clients.remove(&id).map(|_| EventOutcome::Ack),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStorage};
  use crate::db::MemoryStore;
  use crate::error::OfflineError;
  use crate::testing::MockNetwork;
  use reqwest::Method;
  use std::time::{Duration, Instant};
  use url::Url;

  const ORIGIN: &str = "http://localhost:3000";

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  fn worker() -> (OfflineWorker<MemoryStorage, MemoryStore>, Arc<MockNetwork>) {
    let config = Config {
      origin: Some(ORIGIN.into()),
      precache: vec!["/index.html".into(), "/app.js".into()],
      ..Config::default()
    };
    let network = Arc::new(MockNetwork::new());
    network.route("GET", &url("/index.html").to_string(), 200, "shell");
    network.route("GET", &url("/app.js").to_string(), 200, "js");

    let worker = OfflineWorker::new(
      MemoryStorage::new(),
      Arc::new(MemoryStore::new()),
      network.clone(),
      WorkerSettings::from_config(&config).unwrap(),
    );
    (worker, network)
  }

  #[tokio::test]
  async fn test_uncontrolled_fetch_passes_through() {
    let (worker, network) = worker();
    network.set_offline(true);
    assert!(worker.fetch(&OutboundRequest::get(url("/app.js"))).await.is_err());
  }

  #[tokio::test]
  async fn test_full_offline_session() {
    let (worker, network) = worker();
    assert_eq!(worker.install().await.unwrap(), LifecycleState::Installed);
    assert!(matches!(
      worker.activate().await.unwrap(),
      ActivationOutcome::Activated { .. }
    ));

    network.set_offline(true);
    let page = worker
      .fetch(&OutboundRequest::navigate(url("/tasks")))
      .await
      .unwrap();
    assert_eq!(page.response().unwrap().body, b"shell");
    assert_eq!(page.source(), Some(CacheSource::Offline));

    let patch = OutboundRequest::get(url("/api/tasks/1"))
      .with_method(Method::PATCH)
      .with_header("content-type", "application/json")
      .with_body(br#"{"completed": true}"#.to_vec());
    let outcome = worker.send_mutation(&patch).await.unwrap();
    assert!(matches!(outcome, MutationOutcome::Queued { .. }));
    assert_eq!(worker.status().await.unwrap().pending, 1);

    network.set_offline(false);
    network.route("PATCH", &url("/api/tasks/1").to_string(), 200, "{}");
    let report = worker.sync("axis-sync").await.unwrap().unwrap();
    assert_eq!(report.replayed.len(), 1);
    assert_eq!(worker.status().await.unwrap().pending, 0);
  }

  #[tokio::test]
  async fn test_failed_update_keeps_previous_shell_offline() {
    let storage = MemoryStorage::new();
    let store = Arc::new(MemoryStore::new());
    let config = Config {
      origin: Some(ORIGIN.into()),
      precache: vec!["/index.html".into(), "/app.js".into()],
      generations: Generations::new("axis-static-v1", "axis-runtime-v1"),
      ..Config::default()
    };
    let network = Arc::new(MockNetwork::new());
    network.route("GET", &url("/index.html").to_string(), 200, "shell v1");
    network.route("GET", &url("/app.js").to_string(), 200, "js");

    let v1 = OfflineWorker::new(
      storage.clone(),
      store.clone(),
      network.clone(),
      WorkerSettings::from_config(&config).unwrap(),
    );
    v1.install().await.unwrap();
    v1.activate().await.unwrap();

    // Next deploy ships while the device is offline
    network.set_offline(true);
    let config = Config {
      generations: Generations::new("axis-static-v2", "axis-runtime-v1"),
      ..config
    };
    let v2 = OfflineWorker::new(
      storage,
      store,
      network.clone(),
      WorkerSettings::from_config(&config).unwrap(),
    );
    assert_eq!(v2.restore().await.unwrap(), LifecycleState::Parsed);
    assert!(matches!(
      v2.install().await,
      Err(OfflineError::InstallFailed { .. })
    ));

    let page = v2.fetch(&OutboundRequest::navigate(url("/tasks"))).await.unwrap();
    assert_eq!(page.response().unwrap().body, b"shell v1");
    assert_eq!(page.source(), Some(CacheSource::Offline));
    assert_eq!(
      v2.status().await.unwrap().controlling,
      Some(Generations::new("axis-static-v1", "axis-runtime-v1"))
    );
  }

  #[tokio::test]
  async fn test_fetch_does_not_wait_for_install() {
    let (worker, network) = worker();
    network.route("GET", &url("/logo.png").to_string(), 200, "png");
    network.set_delay(Duration::from_millis(300));

    let fetch = async {
      tokio::time::sleep(Duration::from_millis(20)).await;
      let started = Instant::now();
      worker.fetch(&OutboundRequest::get(url("/logo.png"))).await.unwrap();
      started.elapsed()
    };
    let (installed, elapsed) = tokio::join!(worker.install(), fetch);

    assert_eq!(installed.unwrap(), LifecycleState::Installed);
    assert!(
      elapsed < Duration::from_millis(500),
      "fetch waited on install: {:?}",
      elapsed
    );
  }

  #[tokio::test]
  async fn test_http_error_mutation_is_not_queued() {
    let (worker, network) = worker();
    network.route("POST", &url("/api/tasks").to_string(), 422, "invalid");
    let post = OutboundRequest::get(url("/api/tasks")).with_method(Method::POST);

    match worker.send_mutation(&post).await.unwrap() {
      MutationOutcome::Sent(response) => assert_eq!(response.status, 422),
      other => panic!("expected Sent, got {:?}", other),
    }
    assert!(worker.pending().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_kv_access() {
    let (worker, _) = worker();
    worker.kv_put("draft:task-1", r#"{"title":"x"}"#).await.unwrap();
    assert_eq!(
      worker.kv_get("draft:task-1").await.unwrap().as_deref(),
      Some(r#"{"title":"x"}"#)
    );
    assert!(worker.kv_delete("draft:task-1").await.unwrap());
  }
}
