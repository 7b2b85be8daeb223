//! Host platform surface: notification display and page clients.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub icon: Option<String>,
}

impl NotificationAction {
  pub fn new(action: &str, title: &str, icon: Option<&str>) -> Self {
    Self {
      action: action.to_string(),
      title: title.to_string(),
      icon: icon.map(String::from),
    }
  }
}

/// Data attached to a notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub url: Option<String>,
  #[serde(default)]
  pub track_close: bool,
}

/// A notification as handed to the platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub title: String,
  pub body: Option<String>,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub tag: String,
  pub actions: Vec<NotificationAction>,
  pub data: NotificationData,
  pub require_interaction: bool,
  pub silent: bool,
  pub timestamp: DateTime<Utc>,
}

/// An open page controlled by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Client {
  pub id: u64,
  pub url: String,
  pub focused: bool,
}

#[async_trait]
pub trait Platform: Send + Sync + 'static {
  /// Display a notification. A notification with the same tag is replaced.
  async fn show_notification(&self, notification: Notification) -> Result<()>;

  /// Close and return the notification with this tag, if shown.
  async fn close_notification(&self, tag: &str) -> Result<Option<Notification>>;

  async fn notifications(&self) -> Result<Vec<Notification>>;

  async fn clients(&self) -> Result<Vec<Client>>;

  async fn focus_client(&self, id: u64) -> Result<Client>;

  async fn open_window(&self, url: &str) -> Result<Client>;

  /// Take control of every open client. Returns how many were claimed.
  async fn claim_clients(&self) -> Result<usize>;
}

/// In-process platform: keeps notifications and clients in memory.
#[derive(Default)]
pub struct InMemoryPlatform {
  notifications: Mutex<Vec<Notification>>,
  clients: Mutex<Vec<Client>>,
  next_client_id: AtomicU64,
  claimed: AtomicBool,
}

impl InMemoryPlatform {
  pub fn new() -> Self {
    Self::default()
  }

  /// Platform with pages already open at `urls`.
  #[allow(dead_code)]
  pub fn with_clients(urls: &[&str]) -> Self {
    let platform = Self::new();
    if let Ok(mut clients) = platform.clients.lock() {
      for url in urls {
        let id = platform.next_client_id.fetch_add(1, Ordering::SeqCst);
        clients.push(Client {
          id,
          url: (*url).to_string(),
          focused: false,
        });
      }
    }
    platform
  }

  #[allow(dead_code)]
  pub fn is_claimed(&self) -> bool {
    self.claimed.load(Ordering::SeqCst)
  }

  fn lock_notifications(&self) -> Result<MutexGuard<'_, Vec<Notification>>> {
    self
      .notifications
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn lock_clients(&self) -> Result<MutexGuard<'_, Vec<Client>>> {
    self
      .clients
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

#[async_trait]
impl Platform for InMemoryPlatform {
  async fn show_notification(&self, notification: Notification) -> Result<()> {
    let mut shown = self.lock_notifications()?;
    shown.retain(|n| n.tag != notification.tag);
    shown.push(notification);
    Ok(())
  }

  async fn close_notification(&self, tag: &str) -> Result<Option<Notification>> {
    let mut shown = self.lock_notifications()?;
    let index = shown.iter().position(|n| n.tag == tag);
    Ok(index.map(|i| shown.remove(i)))
  }

  async fn notifications(&self) -> Result<Vec<Notification>> {
    Ok(self.lock_notifications()?.clone())
  }

  async fn clients(&self) -> Result<Vec<Client>> {
    Ok(self.lock_clients()?.clone())
  }

  async fn focus_client(&self, id: u64) -> Result<Client> {
    let mut clients = self.lock_clients()?;
    let mut focused = None;
    for client in clients.iter_mut() {
      client.focused = client.id == id;
      if client.focused {
        focused = Some(client.clone());
      }
    }
    focused.ok_or_else(|| eyre!("No client with id {}", id))
  }

  async fn open_window(&self, url: &str) -> Result<Client> {
    let mut clients = self.lock_clients()?;
    for client in clients.iter_mut() {
      client.focused = false;
    }
    let client = Client {
      id: self.next_client_id.fetch_add(1, Ordering::SeqCst),
      url: url.to_string(),
      focused: true,
    };
    clients.push(client.clone());
    Ok(client)
  }

  async fn claim_clients(&self) -> Result<usize> {
    self.claimed.store(true, Ordering::SeqCst);
    Ok(self.lock_clients()?.len())
  }
}
