use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::error::{OfflineError, Result};

use super::types::{Headers, OutboundRequest, ResponseSnapshot};

/// Network seam used by the router, the sync queue and the lifecycle controller.
///
/// Implementations return `Err(OfflineError::NetworkUnavailable)` only for
/// transport failures. Any HTTP answer, including 4xx/5xx, is an `Ok` snapshot.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &OutboundRequest) -> Result<ResponseSnapshot>;
}

/// reqwest-backed network client
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| OfflineError::NetworkUnavailable(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &OutboundRequest) -> Result<ResponseSnapshot> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| OfflineError::NetworkUnavailable(format!("{} {}: {}", request.method, request.url, e)))?;

    let status = response.status().as_u16();
    let headers = snapshot_headers(response.headers());

    let body = response
      .bytes()
      .await
      .map_err(|e| OfflineError::NetworkUnavailable(format!("Failed to read body of {}: {}", request.url, e)))?
      .to_vec();

    debug!(method = %request.method, url = %request.url, status, "network response");

    Ok(ResponseSnapshot {
      status,
      headers,
      body,
    })
  }
}

/// Every response header, repeated names included. Values that are not
/// valid UTF-8 are kept with replacement characters.
fn snapshot_headers(headers: &reqwest::header::HeaderMap) -> Headers {
  headers
    .iter()
    .map(|(name, value)| {
      (
        name.as_str().to_string(),
        String::from_utf8_lossy(value.as_bytes()).into_owned(),
      )
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::header::{HeaderMap, HeaderValue};

  #[test]
  fn test_snapshot_keeps_every_header() {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("text/html"));
    headers.append("set-cookie", HeaderValue::from_static("a=1"));
    headers.append("set-cookie", HeaderValue::from_static("b=2"));
    headers.insert("x-title", HeaderValue::from_bytes(b"caf\xe9").unwrap());

    let snapshot = snapshot_headers(&headers);
    assert_eq!(snapshot.len(), 4);
    assert!(snapshot.contains(&("content-type".to_string(), "text/html".to_string())));
    assert_eq!(
      snapshot.iter().filter(|(name, _)| name == "set-cookie").count(),
      2
    );
    assert_eq!(
      snapshot.iter().find(|(name, _)| name == "x-title").map(|(_, v)| v.as_str()),
      Some("caf\u{fffd}")
    );
  }
}
