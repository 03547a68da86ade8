//! Scripted network for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{OfflineError, Result};
use crate::net::{Network, OutboundRequest, ResponseSnapshot};

/// A network that answers from a route table, records every attempted request
/// in order and can be switched offline.
#[derive(Default)]
pub struct MockNetwork {
  routes: Mutex<HashMap<(String, String), ResponseSnapshot>>,
  calls: Mutex<Vec<(String, String, Option<Vec<u8>>)>>,
  offline: AtomicBool,
  delay: Mutex<Option<Duration>>,
}

impl MockNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Answer `method url` with `status` and `body`.
  pub fn route(&self, method: &str, url: &str, status: u16, body: &str) {
    self.routes.lock().unwrap().insert(
      (method.to_string(), url.to_string()),
      ResponseSnapshot::new(
        status,
        vec![("content-type".into(), "text/plain".into())],
        body.as_bytes().to_vec(),
      ),
    );
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  /// `"METHOD url"` for every attempted request, in order.
  pub fn calls(&self) -> Vec<String> {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .map(|(m, u, _)| format!("{} {}", m, u))
      .collect()
  }

  pub fn last_body(&self) -> Option<Vec<u8>> {
    self.calls.lock().unwrap().last().and_then(|(_, _, b)| b.clone())
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

#[async_trait]
impl Network for MockNetwork {
  async fn fetch(&self, request: &OutboundRequest) -> Result<ResponseSnapshot> {
    self.calls.lock().unwrap().push((
      request.method.to_string(),
      request.url.to_string(),
      request.body.clone(),
    ));

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    if self.offline.load(Ordering::SeqCst) {
      return Err(OfflineError::NetworkUnavailable(format!(
        "{} {}: offline",
        request.method, request.url
      )));
    }

    let key = (request.method.to_string(), request.url.to_string());
    Ok(
      self
        .routes
        .lock()
        .unwrap()
        .get(&key)
        .cloned()
        .unwrap_or_else(|| ResponseSnapshot::new(404, Vec::new(), b"not found".to_vec())),
    )
  }
}
