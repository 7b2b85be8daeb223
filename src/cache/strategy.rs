//! Strategy selection: which caching policy applies to a request.

use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use url::Url;

use crate::net::Destination;

const MINUTE: u64 = 60;
const DAY: u64 = 24 * 60 * MINUTE;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg"];
const FONT_EXTENSIONS: &[&str] = &["woff", "woff2", "ttf", "otf"];

/// A caching policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Strategy {
  #[serde(alias = "cache-first")]
  CacheFirst,
  #[serde(alias = "network-first")]
  NetworkFirst,
  #[serde(alias = "stale-while-revalidate")]
  StaleWhileRevalidate,
  #[serde(alias = "network-only")]
  NetworkOnly,
}

/// A strategy bound to its max-age. `maxAge` travels as milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyConfig {
  pub strategy: Strategy,
  #[serde(
    default,
    serialize_with = "serialize_millis",
    deserialize_with = "deserialize_millis"
  )]
  pub max_age: Duration,
}

impl StrategyConfig {
  pub const fn new(strategy: Strategy, max_age: Duration) -> Self {
    Self { strategy, max_age }
  }
}

fn serialize_millis<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
  serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn deserialize_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
  let ms = u64::deserialize(deserializer)?;
  Ok(Duration::from_millis(ms))
}

/// Request categories the table has a policy for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
  Api,
  Images,
  Fonts,
  Static,
  Analytics,
}

/// One policy per category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyTable {
  pub api: StrategyConfig,
  pub images: StrategyConfig,
  pub fonts: StrategyConfig,
  #[serde(rename = "static")]
  pub static_assets: StrategyConfig,
  pub analytics: StrategyConfig,
}

impl Default for StrategyTable {
  fn default() -> Self {
    Self {
      api: StrategyConfig::new(Strategy::NetworkFirst, Duration::from_secs(MINUTE)),
      images: StrategyConfig::new(Strategy::CacheFirst, Duration::from_secs(7 * DAY)),
      fonts: StrategyConfig::new(Strategy::CacheFirst, Duration::from_secs(30 * DAY)),
      static_assets: StrategyConfig::new(Strategy::StaleWhileRevalidate, Duration::from_secs(DAY)),
      analytics: StrategyConfig::new(Strategy::NetworkOnly, Duration::ZERO),
    }
  }
}

impl StrategyTable {
  pub fn get(&self, category: Category) -> StrategyConfig {
    match category {
      Category::Api => self.api,
      Category::Images => self.images,
      Category::Fonts => self.fonts,
      Category::Static => self.static_assets,
      Category::Analytics => self.analytics,
    }
  }

  /// Shallow merge: supplied categories replace ours whole, the rest stay.
  pub fn merged(&self, update: &StrategyTableUpdate) -> Self {
    Self {
      api: update.api.unwrap_or(self.api),
      images: update.images.unwrap_or(self.images),
      fonts: update.fonts.unwrap_or(self.fonts),
      static_assets: update.static_assets.unwrap_or(self.static_assets),
      analytics: update.analytics.unwrap_or(self.analytics),
    }
  }
}

/// Partial table as pushed by the page (`CACHE_STRATEGY`) or set in config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StrategyTableUpdate {
  #[serde(default)]
  pub api: Option<StrategyConfig>,
  #[serde(default)]
  pub images: Option<StrategyConfig>,
  #[serde(default)]
  pub fonts: Option<StrategyConfig>,
  #[serde(default, rename = "static")]
  pub static_assets: Option<StrategyConfig>,
  #[serde(default)]
  pub analytics: Option<StrategyConfig>,
}

/// The live table. Readers get a snapshot; writers swap the whole table.
pub struct LiveStrategies {
  table: RwLock<Arc<StrategyTable>>,
}

impl LiveStrategies {
  pub fn new(table: StrategyTable) -> Self {
    Self {
      table: RwLock::new(Arc::new(table)),
    }
  }

  pub fn snapshot(&self) -> Arc<StrategyTable> {
    match self.table.read() {
      Ok(table) => Arc::clone(&table),
      Err(poisoned) => Arc::clone(&poisoned.into_inner()),
    }
  }

  pub fn apply(&self, update: &StrategyTableUpdate) -> Arc<StrategyTable> {
    let mut table = match self.table.write() {
      Ok(table) => table,
      Err(poisoned) => poisoned.into_inner(),
    };
    let merged = Arc::new(table.merged(update));
    *table = Arc::clone(&merged);
    merged
  }
}

/// Maps a request to its category by URL pattern and destination.
#[derive(Debug, Clone)]
pub struct StrategySelector {
  api_pattern: Regex,
  analytics_pattern: Regex,
}

impl StrategySelector {
  pub fn new(api_pattern: &str, analytics_pattern: &str) -> Result<Self> {
    let api_pattern =
      Regex::new(api_pattern).map_err(|e| eyre!("Invalid API pattern '{}': {}", api_pattern, e))?;
    let analytics_pattern = Regex::new(analytics_pattern)
      .map_err(|e| eyre!("Invalid analytics pattern '{}': {}", analytics_pattern, e))?;

    Ok(Self {
      api_pattern,
      analytics_pattern,
    })
  }

  /// First match wins: API, image/font, document, analytics, default.
  pub fn classify(&self, url: &Url, destination: Destination) -> Category {
    let target = url.as_str();
    let extension = url
      .path()
      .rsplit_once('.')
      .map(|(_, ext)| ext.to_ascii_lowercase());
    let has_extension = |list: &[&str]| {
      extension
        .as_deref()
        .is_some_and(|ext| list.contains(&ext))
    };

    if self.api_pattern.is_match(target) {
      Category::Api
    } else if destination == Destination::Image || has_extension(IMAGE_EXTENSIONS) {
      Category::Images
    } else if destination == Destination::Font || has_extension(FONT_EXTENSIONS) {
      Category::Fonts
    } else if destination == Destination::Document {
      Category::Static
    } else if self.analytics_pattern.is_match(target) {
      Category::Analytics
    } else {
      Category::Static
    }
  }

  pub fn select(
    &self,
    table: &StrategyTable,
    url: &Url,
    destination: Destination,
  ) -> (Category, StrategyConfig) {
    let category = self.classify(url, destination);
    (category, table.get(category))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn selector() -> StrategySelector {
    StrategySelector::new(r"/api/", r"analytics|metrics").unwrap()
  }

  fn url(path: &str) -> Url {
    Url::parse("http://localhost:8080").unwrap().join(path).unwrap()
  }

  #[test]
  fn test_api_wins_over_everything() {
    let table = StrategyTable::default();
    let (category, config) = selector().select(&table, &url("/api/metrics/dashboard"), Destination::Empty);
    assert_eq!(category, Category::Api);
    assert_eq!(config.strategy, Strategy::NetworkFirst);
    assert_eq!(config.max_age, Duration::from_secs(60));

    // Even an image served from the API path is API
    assert_eq!(
      selector().classify(&url("/api/avatar.png"), Destination::Image),
      Category::Api
    );
  }

  #[test]
  fn test_images_and_fonts() {
    let s = selector();
    assert_eq!(s.classify(&url("/icons/logo.PNG"), Destination::Empty), Category::Images);
    assert_eq!(s.classify(&url("/hero"), Destination::Image), Category::Images);
    assert_eq!(s.classify(&url("/fonts/inter.woff2"), Destination::Empty), Category::Fonts);
    assert_eq!(s.classify(&url("/typeface"), Destination::Font), Category::Fonts);
  }

  #[test]
  fn test_document_beats_analytics() {
    let s = selector();
    assert_eq!(s.classify(&url("/analytics"), Destination::Document), Category::Static);
    assert_eq!(s.classify(&url("/analytics/track.js"), Destination::Script), Category::Analytics);
  }

  #[test]
  fn test_default_is_static() {
    let table = StrategyTable::default();
    let (category, config) = selector().select(&table, &url("/client/global.css"), Destination::Style);
    assert_eq!(category, Category::Static);
    assert_eq!(config.strategy, Strategy::StaleWhileRevalidate);
    assert_eq!(config.max_age, Duration::from_secs(DAY));
  }

  #[test]
  fn test_update_is_shallow_merge() {
    let live = LiveStrategies::new(StrategyTable::default());
    let update: StrategyTableUpdate =
      serde_json::from_str(r#"{"api": {"strategy": "cacheFirst", "maxAge": 5000}}"#).unwrap();

    let before = live.snapshot();
    let after = live.apply(&update);

    assert_eq!(after.api, StrategyConfig::new(Strategy::CacheFirst, Duration::from_secs(5)));
    assert_eq!(after.images, before.images);
    assert_eq!(after.static_assets, before.static_assets);
    // Old snapshot is untouched
    assert_eq!(before.api.strategy, Strategy::NetworkFirst);
    assert_eq!(live.snapshot().api.strategy, Strategy::CacheFirst);
  }

  #[test]
  fn test_update_accepts_kebab_names_and_missing_max_age() {
    let update: StrategyTableUpdate =
      serde_json::from_str(r#"{"analytics": {"strategy": "network-only"}, "static": {"strategy": "network-first", "maxAge": 1}}"#)
        .unwrap();
    assert_eq!(update.analytics, Some(StrategyConfig::new(Strategy::NetworkOnly, Duration::ZERO)));
    assert_eq!(update.static_assets.unwrap().strategy, Strategy::NetworkFirst);
    assert!(update.api.is_none());
  }

  #[test]
  fn test_invalid_pattern_is_rejected() {
    assert!(StrategySelector::new("(", "x").is_err());
  }
}
