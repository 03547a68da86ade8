use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Ordered header list; order is preserved on storage and replay.
pub type Headers = Vec<(String, String)>;

/// What kind of resource the page asked for (the fetch destination).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  /// `fetch()`/XHR calls with no destination
  #[default]
  Empty,
  Document,
  Script,
  Style,
  Manifest,
  Font,
  Image,
  Audio,
  Video,
  Worker,
}

impl Destination {
  /// Markup, script, style and structured-data destinations.
  pub fn is_hot(self) -> bool {
    matches!(
      self,
      Self::Document | Self::Script | Self::Style | Self::Manifest | Self::Worker
    )
  }
}

impl std::str::FromStr for Destination {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "" | "empty" => Ok(Self::Empty),
      "document" => Ok(Self::Document),
      "script" => Ok(Self::Script),
      "style" => Ok(Self::Style),
      "manifest" => Ok(Self::Manifest),
      "font" => Ok(Self::Font),
      "image" => Ok(Self::Image),
      "audio" => Ok(Self::Audio),
      "video" => Ok(Self::Video),
      "worker" => Ok(Self::Worker),
      other => Err(format!("unknown destination '{}'", other)),
    }
  }
}

/// Request mode as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// Top-level page load
  Navigate,
  #[default]
  SameOrigin,
  Cors,
  NoCors,
}

/// An intercepted outbound request.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
  pub url: Url,
  pub method: Method,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
  pub destination: Destination,
  pub mode: RequestMode,
}

impl OutboundRequest {
  /// A plain `GET` for the given URL.
  pub fn get(url: Url) -> Self {
    Self {
      url,
      method: Method::GET,
      headers: Vec::new(),
      body: None,
      destination: Destination::Empty,
      mode: RequestMode::SameOrigin,
    }
  }

  /// A top-level document load.
  pub fn navigate(url: Url) -> Self {
    Self {
      destination: Destination::Document,
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  pub fn identity(&self) -> RequestIdentity {
    RequestIdentity::new(&self.method, &self.url)
  }
}

/// Cache key for a request: normalized absolute URL plus method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
  pub method: String,
  pub url: String,
}

impl RequestIdentity {
  pub fn new(method: &Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.as_str().to_string(),
      url: url.to_string(),
    }
  }

  /// Identity of a `GET` for the given URL.
  pub fn get(url: &Url) -> Self {
    Self::new(&Method::GET, url)
  }

  /// Stable fixed-length key for storage.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Display for RequestIdentity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// Captured response: status, headers and the exact body bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl ResponseSnapshot {
  pub fn new(status: u16, headers: Headers, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers,
      body: body.into(),
    }
  }

  /// 2xx status.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// First header value with the given name (case-insensitive).
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}
