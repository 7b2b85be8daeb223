use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

use crate::cache::{CacheSource, StrategyTable, StrategyTableUpdate};
use crate::lifecycle::LifecycleState;
use crate::net::Destination;
use crate::notify::{Navigation, NotificationOptions};
use crate::sync::{SyncOperation, SyncReport};

/// Inbound host events
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
  Install,
  Activate,
  /// Page request to intercept
  Fetch {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    destination: Destination,
  },
  /// One-off background sync
  Sync { tag: String },
  PeriodicSync { tag: String },
  /// Push message; `data` is the raw body
  Push {
    #[serde(default)]
    data: Option<String>,
  },
  NotificationClick {
    tag: String,
    #[serde(default)]
    action: Option<String>,
  },
  NotificationClose { tag: String },
  /// postMessage from a page
  Message { data: Message },
  Online,
  Offline,
}

fn default_method() -> String {
  "GET".to_string()
}

/// Messages a page can post to the engine
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
  SkipWaiting,
  CacheStrategy { strategy: StrategyTableUpdate },
  AddToSyncQueue { data: SyncOperation },
  ShowNotification { data: ShowNotification },
  GetCacheSize,
  ClearCache,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShowNotification {
  pub title: String,
  #[serde(default)]
  pub options: NotificationOptions,
}

/// Outbound replies, one per event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
  Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
    source: CacheSource,
  },
  /// Not handled by the engine; the host performs the request itself
  PassThrough,
  Lifecycle { state: LifecycleState },
  StrategyTable { table: StrategyTable },
  CacheSize {
    #[serde(rename = "cacheSize")]
    cache_size: usize,
  },
  Cleared { cleared: bool },
  Enqueued { id: String },
  SyncReport { report: SyncReport },
  NotificationShown { tag: String, title: String },
  Navigated { navigation: Navigation },
  Ack,
  Error { message: String },
}

impl Reply {
  pub fn error(message: impl std::fmt::Display) -> Self {
    Reply::Error {
      message: message.to_string(),
    }
  }
}

/// Reply tagged with the sequence number of the event it answers
#[derive(Debug, Serialize)]
pub struct Envelope {
  pub seq: u64,
  #[serde(flatten)]
  pub reply: Reply,
}

/// Produces events from JSON lines on stdin
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn stdin reader
    tokio::spawn(async move {
      let mut lines = BufReader::new(tokio::io::stdin()).lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => {
            if line.trim().is_empty() {
              continue;
            }
            match serde_json::from_str::<Event>(&line) {
              Ok(event) => {
                if tx.send(event).is_err() {
                  break;
                }
              }
              Err(e) => warn!(error = %e, "Ignoring malformed event"),
            }
          }
          Ok(None) => break,
          Err(e) => {
            warn!(error = %e, "Failed to read stdin");
            break;
          }
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event; `None` once stdin is closed
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
