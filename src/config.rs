use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::Generations;
use crate::lifecycle::LifecycleConfig;
use crate::router::RoutePolicy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Application origin (defaults to http://localhost:$PORT)
  pub origin: Option<String>,
  /// Build identifiers of the current static and runtime cache generations
  pub generations: Generations,
  /// Paths cached at install; all must be fetchable or the install fails
  pub precache: Vec<String>,
  /// Root document served to offline navigations that miss the cache
  pub navigation_fallback: String,
  /// Path prefix of the remote REST API
  pub api_prefix: String,
  /// Extensions fetched network-first (case-insensitive, no dot)
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub hot_extensions: BTreeSet<String>,
  /// Tag of the replay trigger delivered by the host
  pub sync_tag: String,
  /// Take control immediately after install
  pub skip_waiting: bool,
  pub network: NetworkConfig,
  /// Where cache.db, store.db and logs live
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 15 }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: None,
      generations: Generations::new("axis-static-v1", "axis-runtime-v1"),
      precache: [
        "/",
        "/index.html",
        "/styles.css",
        "/app.js",
        "/manifest.webmanifest",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      navigation_fallback: "/index.html".into(),
      api_prefix: "/api/".into(),
      hot_extensions: ["html", "js", "mjs", "css", "json", "webmanifest"]
        .into_iter()
        .map(String::from)
        .collect(),
      sync_tag: "axis-sync".into(),
      skip_waiting: true,
      network: NetworkConfig::default(),
      data_dir: None,
    }
  }
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim_start_matches('.').to_lowercase())
      .collect(),
  )
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./axis-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/axis-offline/config.yaml
  ///
  /// With no file found the built-in defaults apply.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("axis-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("axis-offline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  fn validate(&self) -> Result<()> {
    let origin = self.origin_url()?;
    if !matches!(origin.scheme(), "http" | "https") {
      return Err(eyre!("origin must be an http(s) URL, got {}", origin));
    }

    let g = &self.generations;
    if g.static_gen.as_str().is_empty() || g.runtime_gen.as_str().is_empty() {
      return Err(eyre!("generation identifiers must not be empty"));
    }
    if g.static_gen == g.runtime_gen {
      return Err(eyre!(
        "static and runtime generations must differ (both are '{}')",
        g.static_gen
      ));
    }
    if !self.api_prefix.starts_with('/') {
      return Err(eyre!("api_prefix must start with '/', got '{}'", self.api_prefix));
    }
    Ok(())
  }

  /// The application origin.
  ///
  /// Falls back to `http://localhost:$PORT`, with `PORT` defaulting to 3000
  /// like the web server the app ships with.
  pub fn origin_url(&self) -> Result<Url> {
    let raw = match &self.origin {
      Some(origin) => origin.clone(),
      None => {
        let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
        format!("http://localhost:{}", port)
      }
    };
    Url::parse(&raw).map_err(|e| eyre!("Invalid origin '{}': {}", raw, e))
  }

  /// Get the data directory.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("axis-offline"))
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_secs(self.network.timeout_secs)
  }

  pub fn route_policy(&self) -> Result<RoutePolicy> {
    Ok(RoutePolicy {
      origin: self.origin_url()?,
      api_prefix: self.api_prefix.clone(),
      hot_extensions: self.hot_extensions.iter().cloned().collect(),
      navigation_fallback: self.navigation_fallback.clone(),
    })
  }

  pub fn lifecycle_config(&self) -> Result<LifecycleConfig> {
    Ok(LifecycleConfig {
      origin: self.origin_url()?,
      precache: self.precache.clone(),
      sync_tag: self.sync_tag.clone(),
      skip_waiting: self.skip_waiting,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_are_valid() {
    let config = Config {
      origin: Some("http://localhost:3000".into()),
      ..Config::default()
    };
    config.validate().unwrap();
    assert_eq!(config.sync_tag, "axis-sync");
    assert!(config.hot_extensions.contains("js"));
  }

  #[test]
  fn test_parse_yaml() {
    let config = Config::from_yaml(
      r#"
origin: https://axis.example.com
generations:
  static: axis-static-v12
  runtime: axis-runtime-v3
precache: [/, /index.html]
hot_extensions: [".HTML", JS]
skip_waiting: false
network:
  timeout_secs: 5
"#,
    )
    .unwrap();

    config.validate().unwrap();
    assert_eq!(config.generations, Generations::new("axis-static-v12", "axis-runtime-v3"));
    assert_eq!(config.precache, vec!["/", "/index.html"]);
    assert_eq!(
      config.hot_extensions.iter().cloned().collect::<Vec<_>>(),
      vec!["html", "js"]
    );
    assert!(!config.skip_waiting);
    assert_eq!(config.network_timeout(), Duration::from_secs(5));
    assert_eq!(config.api_prefix, "/api/");
  }

  #[test]
  fn test_identical_generations_rejected() {
    let config = Config {
      origin: Some("http://localhost:3000".into()),
      generations: Generations::new("same", "same"),
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_non_http_origin_rejected() {
    let config = Config {
      origin: Some("file:///tmp/app".into()),
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/axis-offline.yaml"))).is_err());
  }
}
