//! Durable, order-preserving replay queue for mutating requests.
//!
//! Items are replayed strictly in sequence order. The first failure stops the
//! drain and leaves that item and everything after it in place; an item is
//! deleted only after the server confirmed its replay.

use reqwest::Method;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::db::{blocking, DurableStore, NewQueueItem, QueueItem};
use crate::error::{OfflineError, Result};
use crate::net::{Network, OutboundRequest};

/// Summary of one `drain()` call that ran to exhaustion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Sequences replayed and deleted, in replay order
  pub replayed: Vec<i64>,
  /// Malformed sequences deleted without replay
  pub discarded: Vec<i64>,
  /// Items still queued afterwards
  pub remaining: usize,
  /// Another drain was already running; nothing was done
  pub skipped: bool,
}

/// Sync queue manager.
pub struct SyncQueue<D: DurableStore> {
  store: Arc<D>,
  network: Arc<dyn Network>,
  /// Base for resolving relative queued URLs
  origin: Url,
  draining: Arc<Mutex<()>>,
}

impl<D: DurableStore> SyncQueue<D> {
  pub fn new(store: Arc<D>, network: Arc<dyn Network>, origin: Url) -> Self {
    Self {
      store,
      network,
      origin,
      draining: Arc::new(Mutex::new(())),
    }
  }

  /// Durably persist `item` and return its sequence number. The write is
  /// committed once this resolves.
  pub async fn enqueue(&self, item: NewQueueItem) -> Result<i64> {
    let method = item.method.clone();
    let url = item.url.clone();
    let sequence = blocking(&self.store, move |s| s.queue_append(&item)).await?;
    info!(sequence, %method, %url, "queued request for replay");
    Ok(sequence)
  }

  /// Queue an intercepted request exactly as it was issued.
  pub async fn enqueue_request(&self, request: &OutboundRequest) -> Result<i64> {
    self
      .enqueue(NewQueueItem {
        url: request.url.to_string(),
        method: request.method.to_string(),
        headers: request.headers.clone(),
        body: request.body.clone(),
      })
      .await
  }

  /// Replay every queued item in sequence order, stopping at the first failure.
  ///
  /// A transport failure returns `NetworkUnavailable` and a non-2xx answer
  /// returns `ReplayRejected`; in both cases the failing item and all later
  /// items stay queued. Malformed items are deleted and skipped. A call made
  /// while another drain is running returns immediately with `skipped` set.
  pub async fn drain(&self) -> Result<DrainReport> {
    let Ok(_guard) = self.draining.try_lock() else {
      debug!("drain already in progress; coalescing trigger");
      return Ok(DrainReport {
        skipped: true,
        ..DrainReport::default()
      });
    };

    let mut items = blocking(&self.store, |s| s.queue_items()).await?;
    items.sort_by_key(|item| item.sequence);

    let mut report = DrainReport::default();
    for stored in items {
      let sequence = stored.sequence;
      let request = match QueueItem::try_from(stored).and_then(|item| self.to_request(&item)) {
        Ok(request) => request,
        Err(e) => {
          warn!(sequence, error = %e, "discarding malformed queue item");
          blocking(&self.store, move |s| s.queue_delete(sequence)).await?;
          report.discarded.push(sequence);
          continue;
        }
      };

      debug!(sequence, method = %request.method, url = %request.url, "replaying");
      let response = match self.network.fetch(&request).await {
        Ok(response) => response,
        Err(e) => {
          warn!(sequence, error = %e, "replay failed; halting drain");
          return Err(e);
        }
      };
      if !response.is_success() {
        warn!(sequence, status = response.status, "replay rejected; halting drain");
        return Err(OfflineError::ReplayRejected {
          sequence,
          status: response.status,
        });
      }

      blocking(&self.store, move |s| s.queue_delete(sequence)).await?;
      info!(sequence, status = response.status, "replayed queued request");
      report.replayed.push(sequence);
    }

    report.remaining = blocking(&self.store, |s| s.queue_len()).await?;
    Ok(report)
  }

  /// Valid pending items in replay order.
  pub async fn pending(&self) -> Result<Vec<QueueItem>> {
    let items = blocking(&self.store, |s| s.queue_items()).await?;
    Ok(
      items
        .into_iter()
        .filter_map(|stored| QueueItem::try_from(stored).ok())
        .collect(),
    )
  }

  pub async fn len(&self) -> Result<usize> {
    blocking(&self.store, |s| s.queue_len()).await
  }

  /// Drop every pending item without replaying it.
  pub async fn clear(&self) -> Result<usize> {
    let removed = blocking(&self.store, |s| s.queue_clear()).await?;
    warn!(removed, "cleared sync queue");
    Ok(removed)
  }

  fn to_request(&self, item: &QueueItem) -> Result<OutboundRequest> {
    let malformed = |reason: String| OfflineError::MalformedQueueItem {
      sequence: item.sequence,
      reason,
    };

    let url = self
      .origin
      .join(&item.url)
      .map_err(|e| malformed(format!("invalid url '{}': {}", item.url, e)))?;
    let method = Method::from_bytes(item.method.trim().to_ascii_uppercase().as_bytes())
      .map_err(|_| malformed(format!("invalid method '{}'", item.method)))?;

    let mut request = OutboundRequest::get(url).with_method(method);
    request.headers = item.headers.clone();
    request.body = item.body.clone();
    Ok(request)
  }
}

impl<D: DurableStore> Clone for SyncQueue<D> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      network: Arc::clone(&self.network),
      origin: self.origin.clone(),
      draining: Arc::clone(&self.draining),
    }
  }
}
