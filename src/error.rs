//! Error taxonomy for the interception and replay engine.

use thiserror::Error;

/// Errors produced by the router, the stores, the sync queue and the lifecycle controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OfflineError {
  /// The fetch could not reach any server.
  #[error("Network unavailable: {0}")]
  NetworkUnavailable(String),

  /// No stored entry for the requested identity/generation.
  #[error("Cache miss: {0}")]
  CacheMiss(String),

  /// The remote server answered a replayed request with a non-success status.
  #[error("Replay of queue item {sequence} rejected with HTTP {status}")]
  ReplayRejected { sequence: i64, status: u16 },

  /// A persisted queue item is missing required fields.
  #[error("Malformed queue item {sequence}: {reason}")]
  MalformedQueueItem { sequence: i64, reason: String },

  /// The persistence layer failed to open or transact.
  #[error("Store unavailable: {0}")]
  StoreUnavailable(String),

  /// A pre-warm manifest entry could not be fetched during install.
  #[error("Install failed fetching {path}: {reason}")]
  InstallFailed { path: String, reason: String },

  /// A lifecycle transition was requested from the wrong state.
  #[error("Invalid lifecycle state: {0}")]
  InvalidState(String),
}

impl OfflineError {
  /// Whether the host should schedule another attempt later.
  pub fn is_recoverable(&self) -> bool {
    matches!(self, Self::NetworkUnavailable(_) | Self::ReplayRejected { .. })
  }

  /// True for transport-level failures (as opposed to HTTP-level rejections).
  pub fn is_network(&self) -> bool {
    matches!(self, Self::NetworkUnavailable(_))
  }
}

impl From<rusqlite::Error> for OfflineError {
  fn from(e: rusqlite::Error) -> Self {
    Self::StoreUnavailable(e.to_string())
  }
}

impl From<serde_json::Error> for OfflineError {
  fn from(e: serde_json::Error) -> Self {
    Self::StoreUnavailable(format!("serialization failed: {}", e))
  }
}

impl From<tokio::task::JoinError> for OfflineError {
  fn from(e: tokio::task::JoinError) -> Self {
    Self::StoreUnavailable(format!("store task failed: {}", e))
  }
}

pub type Result<T> = std::result::Result<T, OfflineError>;
