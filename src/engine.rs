//! The cache engine: owns every component and dispatches host events.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use reqwest::Method;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{
  BackgroundTasks, CacheStorage, CacheStoreManager, Category, LiveStrategies, StoreNames,
  StrategyExecutor, StrategySelector, StrategyTable,
};
use crate::config::Config;
use crate::event::{Event, Message, Reply};
use crate::lifecycle::{LifecycleController, LifecycleState};
use crate::net::{Destination, Network, Request};
use crate::notify::NotificationDispatcher;
use crate::platform::Platform;
use crate::sync::{SyncOperation, SyncQueue};

pub struct CacheEngine<N: Network, S: CacheStorage, P: Platform> {
  origin: Url,
  version: String,
  sync_tag: String,
  warmup_endpoints: Vec<String>,
  skip_waiting_on_install: bool,
  strategies: LiveStrategies,
  selector: StrategySelector,
  network: Arc<N>,
  stores: CacheStoreManager<S>,
  executor: StrategyExecutor<N, S>,
  sync: Arc<SyncQueue<N, S>>,
  notifications: Arc<NotificationDispatcher<P>>,
  lifecycle: LifecycleController<N, S>,
  platform: Arc<P>,
  background: BackgroundTasks,
  online: AtomicBool,
  skip_waiting: AtomicBool,
}

impl<N: Network, S: CacheStorage, P: Platform> CacheEngine<N, S, P> {
  pub fn new(config: &Config, network: Arc<N>, storage: S, platform: Arc<P>) -> Result<Self> {
    let origin = config.origin_url()?;
    let stores = CacheStoreManager::new(
      storage,
      StoreNames::new(&config.cache.prefix, &config.cache.version),
    );
    let background = BackgroundTasks::new();

    let selector = StrategySelector::new(
      &config.routing.api_pattern,
      &config.routing.analytics_pattern,
    )?;
    let strategies = LiveStrategies::new(StrategyTable::default().merged(&config.strategies));

    let executor = StrategyExecutor::new(
      Arc::clone(&network),
      stores.clone(),
      origin.clone(),
      background.clone(),
    );
    let sync = Arc::new(SyncQueue::new(
      Arc::clone(&network),
      stores.clone(),
      origin.clone(),
      config.sync.max_retries,
    ));
    let notifications = Arc::new(NotificationDispatcher::new(
      Arc::clone(&platform),
      config.notifications.clone(),
      &config.app_name,
    ));
    let lifecycle = LifecycleController::new(
      Arc::clone(&network),
      stores.clone(),
      origin.clone(),
      config.precache.clone(),
    );

    Ok(Self {
      origin,
      version: config.cache.version.clone(),
      sync_tag: config.sync.tag.clone(),
      warmup_endpoints: config.sync.warmup_endpoints.clone(),
      skip_waiting_on_install: config.lifecycle.skip_waiting_on_install,
      strategies,
      selector,
      network,
      stores,
      executor,
      sync,
      notifications,
      lifecycle,
      platform,
      background,
      online: AtomicBool::new(true),
      skip_waiting: AtomicBool::new(false),
    })
  }

  pub fn notifications(&self) -> &Arc<NotificationDispatcher<P>> {
    &self.notifications
  }

  pub fn lifecycle_state(&self) -> LifecycleState {
    self.lifecycle.state()
  }

  /// Restore the persisted sync queue (e.g. at process start).
  pub fn restore_sync_queue(&self) {
    if let Err(e) = self.sync.load() {
      warn!(error = %e, "Failed to load sync queue");
    }
  }

  /// Wait for background revalidations and drains to finish.
  pub async fn wait_for_background(&self) {
    self.background.wait().await;
  }

  /// Handle one host event. Never fails: errors become replies.
  pub async fn dispatch(&self, event: Event) -> Reply {
    match event {
      Event::Install => self.install().await,
      Event::Activate => self.activate().await,
      Event::Fetch {
        url,
        method,
        destination,
      } => match parse_request(&url, &method, destination) {
        Ok(request) => self.handle_fetch(request).await,
        Err(e) => Reply::error(e),
      },
      Event::Sync { tag } => {
        if tag != self.sync_tag {
          debug!(tag, "Ignoring sync for unknown tag");
          return Reply::Ack;
        }
        Reply::SyncReport {
          report: self.sync.drain().await,
        }
      }
      Event::PeriodicSync { tag } => {
        if tag != self.sync_tag {
          debug!(tag, "Ignoring periodic sync for unknown tag");
          return Reply::Ack;
        }
        let (report, ()) = futures::join!(self.sync.drain(), self.warm_up());
        Reply::SyncReport { report }
      }
      Event::Push { data } => {
        match self
          .notifications
          .handle_push(data.as_deref().map(str::as_bytes))
          .await
        {
          Ok(shown) => Reply::NotificationShown {
            tag: shown.tag,
            title: shown.title,
          },
          Err(e) => Reply::error(e),
        }
      }
      Event::NotificationClick { tag, action } => {
        match self.notifications.on_click(&tag, action.as_deref()).await {
          Ok(navigation) => Reply::Navigated { navigation },
          Err(e) => Reply::error(e),
        }
      }
      Event::NotificationClose { tag } => match self.notifications.on_close(&tag).await {
        Ok(Some(operation)) => self.enqueue(operation),
        Ok(None) => Reply::Ack,
        Err(e) => Reply::error(e),
      },
      Event::Message { data } => self.handle_message(data).await,
      Event::Online => {
        info!("Back online - processing sync queue");
        self.online.store(true, Ordering::SeqCst);
        Reply::SyncReport {
          report: self.sync.drain().await,
        }
      }
      Event::Offline => {
        info!("Gone offline");
        self.online.store(false, Ordering::SeqCst);
        Reply::Ack
      }
    }
  }

  /// Intercept a page request.
  pub async fn handle_fetch(&self, request: Request) -> Reply {
    // Non-GET and cross-origin requests are none of our business
    if !request.is_get() || request.url.origin() != self.origin.origin() {
      return Reply::PassThrough;
    }
    if !self.lifecycle.is_active() {
      return Reply::PassThrough;
    }

    let table = self.strategies.snapshot();
    let (category, config) = self
      .selector
      .select(&table, &request.url, request.destination);
    let store = match category {
      Category::Api => self.stores.names().dynamic_store(),
      Category::Images | Category::Fonts | Category::Static | Category::Analytics => {
        self.stores.names().static_store()
      }
    };
    debug!(url = %request.url, ?category, strategy = ?config.strategy, "Handling fetch");

    let result = self.executor.execute(&request, config, &store).await;
    Reply::Response {
      status: result.response.status,
      body: result.response.body_text().into_owned(),
      headers: result.response.headers,
      source: result.source,
    }
  }

  async fn handle_message(&self, message: Message) -> Reply {
    match message {
      Message::SkipWaiting => {
        self.skip_waiting.store(true, Ordering::SeqCst);
        if self.lifecycle.state() == LifecycleState::Installed {
          self.activate().await
        } else {
          Reply::Ack
        }
      }
      Message::CacheStrategy { strategy } => {
        let table = self.strategies.apply(&strategy);
        info!("Cache strategy table updated");
        Reply::StrategyTable {
          table: (*table).clone(),
        }
      }
      Message::AddToSyncQueue { data } => self.enqueue(data),
      Message::ShowNotification { data } => {
        match self.notifications.show(&data.title, data.options).await {
          Ok(shown) => Reply::NotificationShown {
            tag: shown.tag,
            title: shown.title,
          },
          Err(e) => Reply::error(e),
        }
      }
      Message::GetCacheSize => Reply::CacheSize {
        cache_size: self.cache_size(),
      },
      Message::ClearCache => Reply::Cleared {
        cleared: self.clear_cache(),
      },
    }
  }

  async fn install(&self) -> Reply {
    match self.lifecycle.install(&self.version).await {
      Ok(_) => {
        if self.skip_waiting_on_install || self.skip_waiting.load(Ordering::SeqCst) {
          self.activate().await
        } else {
          Reply::Lifecycle {
            state: self.lifecycle.state(),
          }
        }
      }
      Err(e) => {
        error!(error = %e, "Install failed");
        Reply::error(e)
      }
    }
  }

  async fn activate(&self) -> Reply {
    if let Err(e) = self.lifecycle.activate(&self.version) {
      return Reply::error(e);
    }

    self.restore_sync_queue();
    match self.platform.claim_clients().await {
      Ok(claimed) => debug!(claimed, "Claimed clients"),
      Err(e) => warn!(error = %e, "Failed to claim clients"),
    }

    Reply::Lifecycle {
      state: self.lifecycle.state(),
    }
  }

  /// Queue a mutation; kick off a drain right away when online.
  fn enqueue(&self, operation: SyncOperation) -> Reply {
    let id = self.sync.enqueue(operation);

    if self.online.load(Ordering::SeqCst) {
      let sync = Arc::clone(&self.sync);
      self.background.spawn(async move {
        let report = sync.drain().await;
        debug!(?report, "Drained sync queue after enqueue");
      });
    }

    Reply::Enqueued { id }
  }

  /// Best-effort refresh of critical data during periodic sync.
  async fn warm_up(&self) {
    let requests = self
      .warmup_endpoints
      .iter()
      .filter_map(|endpoint| self.origin.join(endpoint).ok())
      .map(|url| Request::get(url, Destination::Empty))
      .collect::<Vec<_>>();

    let results = join_all(requests.iter().map(|request| self.network.fetch(request))).await;
    for (request, result) in requests.iter().zip(results) {
      if let Err(e) = result {
        debug!(url = %request.url, error = %e, "Warm-up fetch failed");
      }
    }
  }

  fn cache_size(&self) -> usize {
    self
      .stores
      .names()
      .response_stores()
      .iter()
      .map(|store| {
        self.stores.entry_count(store).unwrap_or_else(|e| {
          warn!(store, error = %e, "Failed to count cache entries");
          0
        })
      })
      .sum()
  }

  fn clear_cache(&self) -> bool {
    let mut cleared = true;
    for store in self.stores.names().response_stores() {
      if let Err(e) = self.stores.delete_store(&store) {
        warn!(store, error = %e, "Failed to clear cache");
        cleared = false;
      }
    }
    cleared
  }
}

fn parse_request(url: &str, method: &str, destination: Destination) -> Result<Request> {
  let url = Url::parse(url).map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
  let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
  Ok(Request::new(method, url, destination))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage, Strategy};
  use crate::platform::InMemoryPlatform;
  use crate::testing::MockNetwork;
  use serde_json::json;

  type TestEngine = CacheEngine<MockNetwork, SqliteStorage, InMemoryPlatform>;

  fn config() -> Config {
    Config {
      precache: vec!["/".to_string(), "/offline.html".to_string()],
      ..Config::default()
    }
  }

  fn engine(network: &Arc<MockNetwork>) -> TestEngine {
    network.respond("/", 200, "app shell");
    network.respond("/offline.html", 200, "offline page");
    CacheEngine::new(
      &config(),
      Arc::clone(network),
      SqliteStorage::open_in_memory().unwrap(),
      Arc::new(InMemoryPlatform::new()),
    )
    .unwrap()
  }

  async fn active_engine(network: &Arc<MockNetwork>) -> TestEngine {
    let engine = engine(network);
    let reply = engine.dispatch(Event::Install).await;
    assert!(matches!(
      reply,
      Reply::Lifecycle {
        state: LifecycleState::Active
      }
    ));
    engine
  }

  fn fetch(path: &str, destination: Destination) -> Event {
    Event::Fetch {
      url: format!("http://localhost:8080{}", path),
      method: "GET".to_string(),
      destination,
    }
  }

  fn response_body(reply: &Reply) -> (&str, CacheSource) {
    match reply {
      Reply::Response { body, source, .. } => (body.as_str(), *source),
      other => panic!("expected response, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_requests_pass_through_before_activation() {
    let network = Arc::new(MockNetwork::new());
    let engine = engine(&network);
    let reply = engine.dispatch(fetch("/", Destination::Document)).await;
    assert!(matches!(reply, Reply::PassThrough));
  }

  #[tokio::test]
  async fn test_non_get_and_cross_origin_bypass() {
    let network = Arc::new(MockNetwork::new());
    let engine = active_engine(&network).await;

    let post = Event::Fetch {
      url: "http://localhost:8080/api/user/profile".to_string(),
      method: "POST".to_string(),
      destination: Destination::Empty,
    };
    assert!(matches!(engine.dispatch(post).await, Reply::PassThrough));

    let foreign = Event::Fetch {
      url: "https://cdn.example.com/lib.js".to_string(),
      method: "GET".to_string(),
      destination: Destination::Script,
    };
    assert!(matches!(engine.dispatch(foreign).await, Reply::PassThrough));
    assert_eq!(network.requests().len(), 2); // install only
  }

  #[tokio::test]
  async fn test_precached_shell_served_offline() {
    let network = Arc::new(MockNetwork::new());
    let engine = active_engine(&network).await;
    network.set_offline(true);

    let reply = engine.dispatch(fetch("/", Destination::Document)).await;
    assert_eq!(response_body(&reply), ("app shell", CacheSource::CacheFresh));
    engine.wait_for_background().await;

    // Never cached, document: offline page from the install manifest
    let reply = engine.dispatch(fetch("/library", Destination::Document)).await;
    assert_eq!(response_body(&reply), ("offline page", CacheSource::Fallback));
  }

  #[tokio::test]
  async fn test_images_served_from_cache_after_first_fetch() {
    let network = Arc::new(MockNetwork::new());
    let engine = active_engine(&network).await;
    network.respond("/icons/logo.png", 200, "png-bytes");

    let first = engine.dispatch(fetch("/icons/logo.png", Destination::Image)).await;
    assert_eq!(response_body(&first), ("png-bytes", CacheSource::Network));
    let second = engine.dispatch(fetch("/icons/logo.png", Destination::Image)).await;
    assert_eq!(response_body(&second), ("png-bytes", CacheSource::CacheFresh));
    assert_eq!(network.calls("/icons/logo.png"), 1);

    // Never seen, offline: placeholder image
    network.set_offline(true);
    match engine.dispatch(fetch("/icons/other.png", Destination::Image)).await {
      Reply::Response { status, headers, source, .. } => {
        assert_eq!(status, 200);
        assert_eq!(source, CacheSource::Fallback);
        assert!(headers.iter().any(|(_, v)| v == "image/svg+xml"));
      }
      other => panic!("unexpected reply {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_api_requests_use_dynamic_store() {
    let network = Arc::new(MockNetwork::new());
    let engine = active_engine(&network).await;
    network.respond("/api/metrics/dashboard", 200, "{\"flow\":1}");

    engine.dispatch(fetch("/api/metrics/dashboard", Destination::Empty)).await;
    let names = engine.stores.names();
    assert_eq!(engine.stores.entry_count(&names.dynamic_store()).unwrap(), 1);

    network.fail("/api/metrics/dashboard");
    let reply = engine.dispatch(fetch("/api/metrics/dashboard", Destination::Empty)).await;
    assert_eq!(response_body(&reply), ("{\"flow\":1}", CacheSource::Offline));
  }

  #[tokio::test]
  async fn test_analytics_is_never_cached() {
    let network = Arc::new(MockNetwork::new());
    let engine = active_engine(&network).await;
    network.respond("/analytics/collect", 200, "ok");

    let before = engine.cache_size();
    engine.dispatch(fetch("/analytics/collect", Destination::Empty)).await;
    engine.dispatch(fetch("/analytics/collect", Destination::Empty)).await;
    assert_eq!(engine.cache_size(), before);
    assert_eq!(network.calls("/analytics/collect"), 2);
  }

  #[tokio::test]
  async fn test_strategy_update_changes_behavior() {
    let network = Arc::new(MockNetwork::new());
    let engine = active_engine(&network).await;
    network.respond("/api/user", 200, "v1");

    let update = serde_json::from_value(json!({
      "type": "CACHE_STRATEGY",
      "strategy": {"api": {"strategy": "cacheFirst", "maxAge": 60000}}
    }))
    .unwrap();
    match engine.dispatch(Event::Message { data: update }).await {
      Reply::StrategyTable { table } => {
        assert_eq!(table.api.strategy, Strategy::CacheFirst);
        assert_eq!(table.images, StrategyTable::default().images);
      }
      other => panic!("unexpected reply {:?}", other),
    }

    engine.dispatch(fetch("/api/user", Destination::Empty)).await;
    network.respond("/api/user", 200, "v2");
    let reply = engine.dispatch(fetch("/api/user", Destination::Empty)).await;
    assert_eq!(response_body(&reply), ("v1", CacheSource::CacheFresh));
    assert_eq!(network.calls("/api/user"), 1);
  }

  #[tokio::test]
  async fn test_cache_size_and_clear() {
    let network = Arc::new(MockNetwork::new());
    let engine = active_engine(&network).await;

    let size = engine
      .dispatch(Event::Message {
        data: Message::GetCacheSize,
      })
      .await;
    assert!(matches!(size, Reply::CacheSize { cache_size: 2 }));

    let cleared = engine
      .dispatch(Event::Message {
        data: Message::ClearCache,
      })
      .await;
    assert!(matches!(cleared, Reply::Cleared { cleared: true }));
    assert_eq!(engine.cache_size(), 0);
  }

  #[tokio::test]
  async fn test_offline_enqueue_then_online_drain() {
    let network = Arc::new(MockNetwork::new());
    let engine = active_engine(&network).await;
    network.respond("/api/user/profile", 200, "saved");

    engine.dispatch(Event::Offline).await;
    let op = serde_json::from_value(json!({
      "type": "ADD_TO_SYNC_QUEUE",
      "data": {"endpoint": "/api/user/profile", "method": "PUT", "payload": {"name": "Ada"}}
    }))
    .unwrap();
    let reply = engine.dispatch(Event::Message { data: op }).await;
    assert!(matches!(reply, Reply::Enqueued { .. }));
    engine.wait_for_background().await;
    assert_eq!(network.calls("/api/user/profile"), 0);
    assert_eq!(engine.sync.len(), 1);

    match engine.dispatch(Event::Online).await {
      Reply::SyncReport { report } => {
        assert_eq!(report.delivered, 1);
        assert_eq!(report.remaining, 0);
      }
      other => panic!("unexpected reply {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_enqueue_while_online_drains_in_background() {
    let network = Arc::new(MockNetwork::new());
    let engine = active_engine(&network).await;
    network.respond("/api/notifications", 200, "ok");

    let op = serde_json::from_value(json!({
      "type": "ADD_TO_SYNC_QUEUE",
      "data": {"endpoint": "/api/notifications", "payload": {"read": true}}
    }))
    .unwrap();
    engine.dispatch(Event::Message { data: op }).await;
    engine.wait_for_background().await;

    assert_eq!(network.calls("/api/notifications"), 1);
    assert_eq!(engine.sync.len(), 0);
  }

  #[tokio::test]
  async fn test_sync_tag_must_match() {
    let network = Arc::new(MockNetwork::new());
    let engine = active_engine(&network).await;

    let reply = engine
      .dispatch(Event::Sync {
        tag: "something-else".to_string(),
      })
      .await;
    assert!(matches!(reply, Reply::Ack));

    let reply = engine
      .dispatch(Event::PeriodicSync {
        tag: "atlas-sync".to_string(),
      })
      .await;
    assert!(matches!(reply, Reply::SyncReport { .. }));
    assert_eq!(network.calls("/api/user/sync"), 1);
    assert_eq!(network.calls("/api/metrics/sync"), 1);
  }

  #[tokio::test]
  async fn test_push_and_click() {
    let network = Arc::new(MockNetwork::new());
    let engine = active_engine(&network).await;

    let reply = engine
      .dispatch(Event::Push {
        data: Some("Hello".to_string()),
      })
      .await;
    let tag = match reply {
      Reply::NotificationShown { tag, title } => {
        assert_eq!(title, "Atlas Sanctum");
        tag
      }
      other => panic!("unexpected reply {:?}", other),
    };
    let shown = engine.platform.notifications().await.unwrap();
    assert_eq!(shown[0].body.as_deref(), Some("Hello"));

    let reply = engine
      .dispatch(Event::NotificationClick {
        tag,
        action: Some("view-map".to_string()),
      })
      .await;
    match reply {
      Reply::Navigated { navigation } => {
        assert_eq!(navigation.url, "/sanctum-map");
        assert!(navigation.opened);
      }
      other => panic!("unexpected reply {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_skip_waiting_activates_installed_worker() {
    let network = Arc::new(MockNetwork::new());
    network.respond("/", 200, "app shell");
    network.respond("/offline.html", 200, "offline page");
    let mut config = config();
    config.lifecycle.skip_waiting_on_install = false;
    let engine: TestEngine = CacheEngine::new(
      &config,
      Arc::clone(&network),
      SqliteStorage::open_in_memory().unwrap(),
      Arc::new(InMemoryPlatform::new()),
    )
    .unwrap();

    let reply = engine.dispatch(Event::Install).await;
    assert!(matches!(
      reply,
      Reply::Lifecycle {
        state: LifecycleState::Installed
      }
    ));

    let reply = engine
      .dispatch(Event::Message {
        data: Message::SkipWaiting,
      })
      .await;
    assert!(matches!(
      reply,
      Reply::Lifecycle {
        state: LifecycleState::Active
      }
    ));
    assert!(engine.platform.is_claimed());
  }

  #[tokio::test]
  async fn test_failed_install_reports_error() {
    let network = Arc::new(MockNetwork::new());
    let engine = engine(&network);
    network.fail("/offline.html");

    assert!(matches!(engine.dispatch(Event::Install).await, Reply::Error { .. }));
    assert_eq!(engine.lifecycle_state(), LifecycleState::Redundant);
  }

  #[tokio::test]
  async fn test_invalid_fetch_url() {
    let network = Arc::new(MockNetwork::new());
    let engine = engine(&network);
    let reply = engine
      .dispatch(Event::Fetch {
        url: "not a url".to_string(),
        method: "GET".to_string(),
        destination: Destination::Empty,
      })
      .await;
    assert!(matches!(reply, Reply::Error { .. }));
  }
}
