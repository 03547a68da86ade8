use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::cache::CacheStorage;
use crate::db::DurableStore;
use crate::error::{OfflineError, Result};
use crate::lifecycle::{ActivationOutcome, ClientPage, LifecycleState};
use crate::net::OutboundRequest;
use crate::router::RouteOutcome;
use crate::sync::DrainReport;
use crate::worker::OfflineWorker;

/// Events delivered by the host environment
#[derive(Debug)]
pub enum HostEvent {
  /// Install phase: pre-warm the static generation
  Install,
  /// Activate phase: collect stale generations and claim pages
  Activate,
  /// An intercepted request
  Fetch(OutboundRequest),
  /// Connectivity restored / background sync conditions met
  Sync { tag: String },
  ClientOpened(ClientPage),
  ClientClosed(String),
}

/// Resolved outcome of a host event
#[derive(Debug)]
pub enum EventOutcome {
  Lifecycle(LifecycleState),
  Activation(ActivationOutcome),
  Response(RouteOutcome),
  /// `None` when the sync tag was not ours
  Synced(Option<DrainReport>),
  Ack,
}

struct Envelope {
  event: HostEvent,
  respond_to: oneshot::Sender<Result<EventOutcome>>,
}

/// Event handler that feeds host events to a worker.
///
/// Each event runs on its own task so concurrent fetches do not wait on one
/// another. `dispatch` resolves only once the event's work has finished,
/// which is the completion the host waits on before moving past a phase.
#[derive(Clone)]
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Envelope>,
}

impl EventHandler {
  /// Spawn the dispatch loop for `worker`
  pub fn spawn<S, D>(worker: Arc<OfflineWorker<S, D>>) -> Self
  where
    S: CacheStorage,
    D: DurableStore,
  {
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    tokio::spawn(async move {
      while let Some(Envelope { event, respond_to }) = rx.recv().await {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
          let outcome = worker.handle_event(event).await;
          if respond_to.send(outcome).is_err() {
            debug!("host stopped waiting for event outcome");
          }
        });
      }
    });

    Self { tx }
  }

  /// Deliver an event and wait for its outcome
  pub async fn dispatch(&self, event: HostEvent) -> Result<EventOutcome> {
    let (respond_to, outcome) = oneshot::channel();
    self
      .tx
      .send(Envelope { event, respond_to })
      .map_err(|_| OfflineError::InvalidState("event loop stopped".into()))?;

    outcome
      .await
      .map_err(|_| OfflineError::InvalidState("event dropped before completion".into()))?
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheGeneration, MemoryStorage};
  use crate::config::Config;
  use crate::db::MemoryStore;
  use crate::testing::MockNetwork;
  use crate::worker::WorkerSettings;
  use url::Url;

  fn handler() -> (EventHandler, Arc<MockNetwork>) {
    handler_with(true)
  }

  fn handler_with(skip_waiting: bool) -> (EventHandler, Arc<MockNetwork>) {
    let config = Config {
      origin: Some("http://localhost:3000".into()),
      precache: vec!["/index.html".into()],
      skip_waiting,
      ..Config::default()
    };
    let network = Arc::new(MockNetwork::new());
    network.route("GET", "http://localhost:3000/index.html", 200, "shell");
    let worker = OfflineWorker::new(
      MemoryStorage::new(),
      Arc::new(MemoryStore::new()),
      network.clone(),
      WorkerSettings::from_config(&config).unwrap(),
    );
    (EventHandler::spawn(Arc::new(worker)), network)
  }

  #[tokio::test]
  async fn test_phases_resolve_in_order() {
    let (handler, _) = handler();
    let installed = handler.dispatch(HostEvent::Install).await.unwrap();
    assert!(matches!(installed, EventOutcome::Lifecycle(LifecycleState::Installed)));

    let activated = handler.dispatch(HostEvent::Activate).await.unwrap();
    assert!(matches!(
      activated,
      EventOutcome::Activation(ActivationOutcome::Activated { .. })
    ));
  }

  #[tokio::test]
  async fn test_concurrent_fetches_after_activation() {
    let (handler, network) = handler();
    handler.dispatch(HostEvent::Install).await.unwrap();
    handler.dispatch(HostEvent::Activate).await.unwrap();
    network.set_offline(true);

    let nav = |path: &str| {
      HostEvent::Fetch(OutboundRequest::navigate(
        Url::parse("http://localhost:3000").unwrap().join(path).unwrap(),
      ))
    };
    let (a, b) = tokio::join!(handler.dispatch(nav("/a")), handler.dispatch(nav("/b")));
    for outcome in [a.unwrap(), b.unwrap()] {
      match outcome {
        EventOutcome::Response(route) => assert_eq!(route.response().unwrap().body, b"shell"),
        other => panic!("unexpected outcome {:?}", other),
      }
    }
  }

  #[tokio::test]
  async fn test_open_page_of_older_build_holds_activation() {
    let (handler, _) = handler_with(false);
    let page = ClientPage {
      id: "tab-1".into(),
      url: Url::parse("http://localhost:3000/tasks").unwrap(),
      controller: Some(CacheGeneration::new("axis-static-v0")),
    };
    handler.dispatch(HostEvent::ClientOpened(page)).await.unwrap();
    handler.dispatch(HostEvent::Install).await.unwrap();

    let held = handler.dispatch(HostEvent::Activate).await.unwrap();
    assert!(matches!(held, EventOutcome::Activation(ActivationOutcome::Waiting)));

    handler
      .dispatch(HostEvent::ClientClosed("tab-1".into()))
      .await
      .unwrap();
    let activated = handler.dispatch(HostEvent::Activate).await.unwrap();
    assert!(matches!(
      activated,
      EventOutcome::Activation(ActivationOutcome::Activated { .. })
    ));
  }

  #[tokio::test]
  async fn test_sync_with_foreign_tag_is_ignored() {
    let (handler, _) = handler();
    let outcome = handler
      .dispatch(HostEvent::Sync {
        tag: "someone-else".into(),
      })
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::Synced(None)));
  }
}
