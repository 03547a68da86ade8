//! Client-side offline resilience for the Axis web app.
//!
//! Intercepted requests are routed by class: navigations and hot assets go
//! network-first into a versioned static cache, static assets are served
//! cache-first, API reads are mirrored into a runtime cache, and API writes
//! that fail for lack of connectivity are queued durably and replayed in
//! order once the host reports connectivity again.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod net;
pub mod router;
pub mod sync;
pub mod worker;

#[cfg(test)]
mod testing;

pub use error::{OfflineError, Result};
pub use worker::{MutationOutcome, OfflineWorker};
