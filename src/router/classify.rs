//! Pure request classification.

use url::Url;

use crate::net::{OutboundRequest, RequestMode};

/// Which strategy applies to an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Top-level page load
  Navigation,
  /// Markup, script, style or structured data; network-first
  HotAsset,
  /// Fonts, images and other rarely-changing assets; cache-first
  StaticAsset,
  /// GET against the remote service; network-first with runtime fallback
  ApiRead,
  /// Non-idempotent call against the remote service; never cached
  ApiWrite,
}

impl std::fmt::Display for RequestClass {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Self::Navigation => "navigation",
      Self::HotAsset => "hot-asset",
      Self::StaticAsset => "static-asset",
      Self::ApiRead => "api-read",
      Self::ApiWrite => "api-write",
    };
    f.write_str(name)
  }
}

/// Inputs to classification that come from the build, not the request.
#[derive(Debug, Clone)]
pub struct RoutePolicy {
  /// The application's own origin; anything else passes through
  pub origin: Url,
  /// Path prefix of the remote service (e.g. `/api/`)
  pub api_prefix: String,
  /// File extensions treated as hot assets (without the dot)
  pub hot_extensions: Vec<String>,
  /// Root document served when a navigation misses the cache
  pub navigation_fallback: String,
}

impl RoutePolicy {
  /// Classify `request`. `None` means the request is not intercepted:
  /// cross-origin requests, and non-GET requests outside the API prefix.
  pub fn classify(&self, request: &OutboundRequest) -> Option<RequestClass> {
    if request.url.origin() != self.origin.origin() {
      return None;
    }

    let path = request.url.path();
    let is_api = path.starts_with(&self.api_prefix);

    if !request.is_get() {
      return is_api.then_some(RequestClass::ApiWrite);
    }
    if is_api {
      return Some(RequestClass::ApiRead);
    }
    if request.mode == RequestMode::Navigate {
      return Some(RequestClass::Navigation);
    }
    if request.destination.is_hot() || path.ends_with('/') || self.has_hot_extension(path) {
      return Some(RequestClass::HotAsset);
    }
    Some(RequestClass::StaticAsset)
  }

  fn has_hot_extension(&self, path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rsplit_once('.') {
      Some((_, ext)) => self
        .hot_extensions
        .iter()
        .any(|hot| hot.eq_ignore_ascii_case(ext)),
      None => false,
    }
  }

  /// Absolute URL of the navigation fallback document.
  pub fn fallback_url(&self) -> Option<Url> {
    self.origin.join(&self.navigation_fallback).ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::Destination;
  use reqwest::Method;

  fn policy() -> RoutePolicy {
    RoutePolicy {
      origin: Url::parse("http://localhost:3000").unwrap(),
      api_prefix: "/api/".into(),
      hot_extensions: vec!["html".into(), "js".into(), "css".into(), "json".into()],
      navigation_fallback: "/index.html".into(),
    }
  }

  fn get(path: &str) -> OutboundRequest {
    OutboundRequest::get(policy().origin.join(path).unwrap())
  }

  #[test]
  fn test_cross_origin_is_not_intercepted() {
    let req = OutboundRequest::get(Url::parse("https://fonts.example.com/inter.woff2").unwrap());
    assert_eq!(policy().classify(&req), None);

    let other_port = OutboundRequest::get(Url::parse("http://localhost:4000/app.js").unwrap());
    assert_eq!(policy().classify(&other_port), None);
  }

  #[test]
  fn test_navigation() {
    let req = OutboundRequest::navigate(policy().origin.join("/tasks").unwrap());
    assert_eq!(policy().classify(&req), Some(RequestClass::Navigation));
  }

  #[test]
  fn test_hot_assets_by_extension_and_destination() {
    assert_eq!(policy().classify(&get("/app.js")), Some(RequestClass::HotAsset));
    assert_eq!(policy().classify(&get("/styles.CSS")), Some(RequestClass::HotAsset));
    assert_eq!(policy().classify(&get("/data/seed.json?v=3")), Some(RequestClass::HotAsset));
    assert_eq!(policy().classify(&get("/")), Some(RequestClass::HotAsset));
    assert_eq!(
      policy().classify(&get("/bundle").with_destination(Destination::Script)),
      Some(RequestClass::HotAsset)
    );
  }

  #[test]
  fn test_static_assets() {
    assert_eq!(policy().classify(&get("/icons/logo.png")), Some(RequestClass::StaticAsset));
    assert_eq!(policy().classify(&get("/fonts/inter.woff2")), Some(RequestClass::StaticAsset));
    assert_eq!(
      policy().classify(&get("/manifest.js.map")),
      Some(RequestClass::StaticAsset)
    );
  }

  #[test]
  fn test_api_read_and_write() {
    assert_eq!(policy().classify(&get("/api/tasks")), Some(RequestClass::ApiRead));
    assert_eq!(
      policy().classify(&get("/api/tasks/1").with_method(Method::PATCH)),
      Some(RequestClass::ApiWrite)
    );
    assert_eq!(
      policy().classify(&get("/api/tasks/1").with_method(Method::DELETE)),
      Some(RequestClass::ApiWrite)
    );
  }

  #[test]
  fn test_non_get_outside_api_is_not_intercepted() {
    assert_eq!(policy().classify(&get("/upload").with_method(Method::POST)), None);
  }

  #[test]
  fn test_fallback_url() {
    assert_eq!(
      policy().fallback_url().unwrap().as_str(),
      "http://localhost:3000/index.html"
    );
  }
}
