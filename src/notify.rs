//! Notification dispatcher: push handling, click routing, daily engagement.

use chrono::{DateTime, Local, NaiveTime, TimeZone, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NotificationConfig;
use crate::platform::{Client, Notification, NotificationAction, NotificationData, Platform};
use crate::sync::SyncOperation;

const CLOSE_TRACKING_ENDPOINT: &str = "/api/analytics/notification-close";

/// Caller-supplied options, merged over the configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationOptions {
  pub body: Option<String>,
  pub icon: Option<String>,
  pub badge: Option<String>,
  pub vibrate: Option<Vec<u32>>,
  pub tag: Option<String>,
  pub actions: Option<Vec<NotificationAction>>,
  pub data: Option<NotificationData>,
  pub require_interaction: Option<bool>,
  pub silent: Option<bool>,
}

/// Push body contract. Every field is optional.
#[derive(Debug, Default, Deserialize)]
struct PushPayload {
  title: Option<String>,
  body: Option<String>,
  icon: Option<String>,
  badge: Option<String>,
  data: Option<NotificationData>,
  actions: Option<Vec<NotificationAction>>,
  tag: Option<String>,
}

/// Where a notification click took the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Navigation {
  pub url: String,
  pub client: Client,
  /// `false` when an existing client was focused
  pub opened: bool,
}

pub struct NotificationDispatcher<P: Platform> {
  platform: Arc<P>,
  config: NotificationConfig,
  /// Title used when none is given
  default_title: String,
}

impl<P: Platform> NotificationDispatcher<P> {
  pub fn new(platform: Arc<P>, config: NotificationConfig, default_title: &str) -> Self {
    Self {
      platform,
      config,
      default_title: default_title.to_string(),
    }
  }

  /// Merge `options` over the defaults and hand the result to the platform.
  pub async fn show(&self, title: &str, options: NotificationOptions) -> Result<Notification> {
    let notification = Notification {
      title: title.to_string(),
      body: options.body,
      icon: options.icon.unwrap_or_else(|| self.config.icon.clone()),
      badge: options.badge.unwrap_or_else(|| self.config.badge.clone()),
      vibrate: options.vibrate.unwrap_or_else(|| self.config.vibrate.clone()),
      tag: options.tag.unwrap_or_else(|| self.config.tag.clone()),
      actions: options.actions.unwrap_or_default(),
      data: options.data.unwrap_or_default(),
      require_interaction: options
        .require_interaction
        .unwrap_or(self.config.require_interaction),
      silent: options.silent.unwrap_or(self.config.silent),
      timestamp: Utc::now(),
    };

    self.platform.show_notification(notification.clone()).await?;
    debug!(tag = %notification.tag, title = %notification.title, "Notification shown");
    Ok(notification)
  }

  /// Show a notification for a push message. A body that is not a JSON
  /// object becomes the notification text.
  pub async fn handle_push(&self, payload: Option<&[u8]>) -> Result<Notification> {
    let push = match payload.filter(|bytes| !bytes.is_empty()) {
      None => PushPayload::default(),
      Some(bytes) => match serde_json::from_slice::<PushPayload>(bytes) {
        Ok(push) => push,
        Err(e) => {
          debug!(error = %e, "Push payload is not JSON, using plain text");
          PushPayload {
            body: Some(String::from_utf8_lossy(bytes).into_owned()),
            ..PushPayload::default()
          }
        }
      },
    };

    let title = push.title.unwrap_or_else(|| self.default_title.clone());
    let options = NotificationOptions {
      body: Some(push.body.unwrap_or_else(|| "New update available".to_string())),
      icon: push.icon,
      badge: push.badge,
      tag: Some(push.tag.unwrap_or_else(|| format!("{}-update", self.config.tag))),
      actions: push.actions,
      data: push.data,
      ..NotificationOptions::default()
    };

    self.show(&title, options).await
  }

  /// Close the notification and bring the user to its route.
  pub async fn on_click(&self, tag: &str, action: Option<&str>) -> Result<Navigation> {
    let closed = self.platform.close_notification(tag).await?;
    let explicit = closed.and_then(|n| n.data.url);

    let url = match (explicit, action) {
      (Some(url), _) => url,
      (None, Some(action)) => self.route_for_action(action).to_string(),
      (None, None) => "/".to_string(),
    };

    for client in self.platform.clients().await? {
      if client.url.contains(&url) {
        let client = self.platform.focus_client(client.id).await?;
        info!(url, client = client.id, "Focused existing client");
        return Ok(Navigation {
          url,
          client,
          opened: false,
        });
      }
    }

    let client = self.platform.open_window(&url).await?;
    info!(url, client = client.id, "Opened new client");
    Ok(Navigation {
      url,
      client,
      opened: true,
    })
  }

  /// Notification dismissed. Returns the tracking operation to queue, if
  /// the notification asked for close tracking.
  pub async fn on_close(&self, tag: &str) -> Result<Option<SyncOperation>> {
    debug!(tag, "Notification closed");
    let Some(closed) = self.platform.close_notification(tag).await? else {
      return Ok(None);
    };
    if !closed.data.track_close {
      return Ok(None);
    }

    Ok(Some(SyncOperation::post(
      CLOSE_TRACKING_ENDPOINT,
      json!({
        "tag": closed.tag,
        "timestamp": Utc::now().timestamp_millis(),
      }),
    )))
  }

  /// Static action -> route lookup; unknown actions go home.
  pub fn route_for_action(&self, action: &str) -> &str {
    self
      .config
      .action_routes
      .get(action)
      .map_or("/", String::as_str)
  }

  /// Schedule the daily engagement notification. Best effort only: the host
  /// may suspend the process and the timer with it.
  pub fn schedule_daily(self: &Arc<Self>, hour: u32) -> JoinHandle<()> {
    let dispatcher = Arc::clone(self);

    tokio::spawn(async move {
      loop {
        let delay = delay_until_next(Local::now(), hour);
        debug!(secs = delay.as_secs(), "Daily notification scheduled");
        tokio::time::sleep(delay).await;

        if let Err(e) = dispatcher.show_daily().await {
          warn!(error = %e, "Failed to show daily notification");
        }
      }
    })
  }

  async fn show_daily(&self) -> Result<Notification> {
    let options = NotificationOptions {
      body: Some("Check your impact metrics and global flow updates".to_string()),
      actions: Some(vec![
        NotificationAction::new("view-dashboard", "View Dashboard", Some("/icons/dashboard-32x32.png")),
        NotificationAction::new("view-analytics", "View Analytics", Some("/icons/analytics-32x32.png")),
      ]),
      data: Some(NotificationData {
        url: Some("/dashboard".to_string()),
        track_close: false,
      }),
      ..NotificationOptions::default()
    };
    let title = format!("{} Daily Update", self.default_title);
    self.show(&title, options).await
  }
}

/// Time until the next local `hour`:00. An hour that is already past today
/// (or exactly now) lands tomorrow.
pub fn delay_until_next<Tz: TimeZone>(now: DateTime<Tz>, hour: u32) -> Duration {
  let at = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
  let tz = now.timezone();
  let mut day = now.date_naive();

  for _ in 0..3 {
    // Skips days where the wall-clock time does not exist (DST gap)
    if let Some(target) = tz.from_local_datetime(&day.and_time(at)).earliest() {
      if target > now {
        return (target - now.clone()).to_std().unwrap_or_default();
      }
    }
    match day.succ_opt() {
      Some(next) => day = next,
      None => break,
    }
  }

  Duration::from_secs(24 * 60 * 60)
}
