//! Test doubles for the network origin and the storage backend.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;

use crate::cache::{CacheStorage, CachedResponse, StoredEntry};
use crate::net::{Network, NetworkError, Request, Response};

#[derive(Clone)]
enum Scripted {
  Respond(Response),
  Fail,
}

/// Scripted origin keyed by URL path. Unknown paths answer 404.
#[derive(Default)]
pub struct MockNetwork {
  routes: Mutex<HashMap<String, Scripted>>,
  calls: Mutex<HashMap<String, usize>>,
  requests: Mutex<Vec<Request>>,
  offline: AtomicBool,
  gate: Mutex<Option<watch::Receiver<bool>>>,
}

/// Holds every fetch until released.
pub struct Gate {
  tx: watch::Sender<bool>,
}

impl Gate {
  pub fn release(&self) {
    let _ = self.tx.send(true);
  }
}

impl MockNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, path: &str, status: u16, body: &str) {
    self.respond_with(path, Response::text(status, body));
  }

  pub fn respond_with(&self, path: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(path.to_string(), Scripted::Respond(response));
  }

  /// Transport failure for `path`.
  pub fn fail(&self, path: &str) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(path.to_string(), Scripted::Fail);
  }

  /// Transport failure for every path.
  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn hold(&self) -> Gate {
    let (tx, rx) = watch::channel(false);
    *self.gate.lock().unwrap() = Some(rx);
    Gate { tx }
  }

  pub fn calls(&self, path: &str) -> usize {
    self.calls.lock().unwrap().get(path).copied().unwrap_or(0)
  }

  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }
}

#[async_trait]
impl Network for MockNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    let path = request.url.path().to_string();
    *self.calls.lock().unwrap().entry(path.clone()).or_default() += 1;
    self.requests.lock().unwrap().push(request.clone());

    let gate = self.gate.lock().unwrap().clone();
    if let Some(mut rx) = gate {
      let _ = rx.wait_for(|open| *open).await;
    }

    if self.offline.load(Ordering::SeqCst) {
      return Err(NetworkError::Unreachable("offline".to_string()));
    }

    let scripted = self.routes.lock().unwrap().get(&path).cloned();
    match scripted {
      Some(Scripted::Respond(response)) => Ok(response),
      Some(Scripted::Fail) => Err(NetworkError::Unreachable(format!("{} unreachable", path))),
      None => Ok(Response::text(404, "Not Found")),
    }
  }
}

/// Storage whose every operation fails (quota exceeded, API unavailable).
pub struct FailingStorage;

impl CacheStorage for FailingStorage {
  fn open_store(&self, _store: &str) -> Result<()> {
    Err(eyre!("storage unavailable"))
  }

  fn store_names(&self) -> Result<Vec<String>> {
    Err(eyre!("storage unavailable"))
  }

  fn delete_store(&self, _store: &str) -> Result<bool> {
    Err(eyre!("storage unavailable"))
  }

  fn get_entry(&self, _store: &str, _key: &str) -> Result<Option<CachedResponse>> {
    Err(eyre!("storage unavailable"))
  }

  fn put_entries(&self, _store: &str, _entries: &[StoredEntry]) -> Result<()> {
    Err(eyre!("quota exceeded"))
  }

  fn entry_urls(&self, _store: &str) -> Result<Vec<(String, String)>> {
    Err(eyre!("storage unavailable"))
  }

  fn delete_entries(&self, _store: &str, _keys: &[String]) -> Result<usize> {
    Err(eyre!("storage unavailable"))
  }

  fn count_entries(&self, _store: &str) -> Result<usize> {
    Err(eyre!("storage unavailable"))
  }
}
