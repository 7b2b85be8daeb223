use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::StrategyTableUpdate;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin of the app; only same-origin GETs are intercepted
  pub origin: String,
  /// Default notification title
  pub app_name: String,
  pub cache: CacheConfig,
  /// App-shell paths cached on install (all or nothing)
  pub precache: Vec<String>,
  /// Overrides applied on top of the built-in strategy table
  pub strategies: StrategyTableUpdate,
  pub routing: RoutingConfig,
  pub sync: SyncConfig,
  pub notifications: NotificationConfig,
  pub lifecycle: LifecycleConfig,
  /// Request timeout towards the origin, in seconds
  pub network_timeout_secs: u64,
  /// Write logs to a daily rolling file in this directory instead of stderr
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Prefix shared by every store this engine owns
  pub prefix: String,
  /// Bumping this garbage-collects the previous stores on activation
  pub version: String,
  /// SQLite database (default: $XDG_DATA_HOME/offline-sw/cache.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
  /// Regex selecting API requests (network-first)
  pub api_pattern: String,
  /// Regex selecting telemetry requests (network-only)
  pub analytics_pattern: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Tag of sync / periodic sync events that drain the queue
  pub tag: String,
  /// Attempts before a queued mutation is dropped
  pub max_retries: u32,
  /// Best-effort GETs issued on periodic sync
  pub warmup_endpoints: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  /// Tag used when a notification does not carry one
  pub tag: String,
  pub require_interaction: bool,
  pub silent: bool,
  /// Local hour of the daily engagement notification; `null` disables it
  pub daily_hour: Option<u32>,
  /// Action id -> in-app route
  pub action_routes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
  /// Activate right after install instead of waiting for SKIP_WAITING
  pub skip_waiting_on_install: bool,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080".to_string(),
      app_name: "Atlas Sanctum".to_string(),
      cache: CacheConfig::default(),
      precache: [
        "/",
        "/dashboard",
        "/sanctum-map",
        "/analytics",
        "/library",
        "/fellowship",
        "/dignity-coin",
        "/pain-transmutation",
        "/manifest.json",
        "/offline.html",
        "/client/global.css",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      strategies: StrategyTableUpdate::default(),
      routing: RoutingConfig::default(),
      sync: SyncConfig::default(),
      notifications: NotificationConfig::default(),
      lifecycle: LifecycleConfig::default(),
      network_timeout_secs: 30,
      log_dir: None,
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "offline-sw".to_string(),
      version: "1.0.0".to_string(),
      path: None,
    }
  }
}

impl Default for RoutingConfig {
  fn default() -> Self {
    Self {
      api_pattern: "/api/".to_string(),
      analytics_pattern: "analytics|metrics".to_string(),
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "atlas-sync".to_string(),
      max_retries: 3,
      warmup_endpoints: vec!["/api/user/sync".to_string(), "/api/metrics/sync".to_string()],
    }
  }
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      icon: "/icons/icon-192x192.png".to_string(),
      badge: "/icons/badge-72x72.png".to_string(),
      vibrate: vec![100, 50, 100],
      tag: "atlas-sanctum".to_string(),
      require_interaction: false,
      silent: false,
      daily_hour: Some(9),
      action_routes: [
        ("view-dashboard", "/dashboard"),
        ("view-analytics", "/analytics"),
        ("view-map", "/sanctum-map"),
        ("view-fellowship", "/fellowship"),
      ]
      .into_iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect(),
    }
  }
}

impl Default for LifecycleConfig {
  fn default() -> Self {
    Self {
      skip_waiting_on_install: true,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-sw/config.yaml
  ///
  /// Built-in defaults apply when no file is found.
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-sw").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.origin_url()?;
    Ok(config)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Strategy;
  use std::time::Duration;

  #[test]
  fn test_partial_file_keeps_defaults() {
    let config = Config::parse(
      r#"
origin: "https://app.example.com"
cache:
  version: "2.0.0"
strategies:
  images:
    strategy: networkFirst
    maxAge: 1000
notifications:
  daily_hour: null
"#,
    )
    .unwrap();

    assert_eq!(config.origin_url().unwrap().host_str(), Some("app.example.com"));
    assert_eq!(config.cache.version, "2.0.0");
    assert_eq!(config.cache.prefix, "offline-sw");
    let images = config.strategies.images.unwrap();
    assert_eq!(images.strategy, Strategy::NetworkFirst);
    assert_eq!(images.max_age, Duration::from_secs(1));
    assert!(config.strategies.api.is_none());
    assert_eq!(config.notifications.daily_hour, None);
    assert_eq!(config.sync.max_retries, 3);
    assert_eq!(config.sync.tag, "atlas-sync");
    assert_eq!(config.precache.len(), 11);
  }

  #[test]
  fn test_invalid_origin_is_rejected() {
    assert!(Config::parse("origin: not a url").is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    let missing = Path::new("/definitely/not/here/offline-sw.yaml");
    assert!(Config::load(Some(missing)).is_err());
  }

  #[test]
  fn test_load_explicit_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "app_name: Test App\nprecache: ['/']\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.app_name, "Test App");
    assert_eq!(config.precache, vec!["/"]);
  }
}
