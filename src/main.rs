mod cache;
mod config;
mod engine;
mod event;
mod lifecycle;
mod net;
mod notify;
mod platform;
mod sync;
#[cfg(test)]
mod testing;

use clap::Parser;
use color_eyre::Result;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cache::SqliteStorage;
use engine::CacheEngine;
use event::{Envelope, Event, EventHandler};
use net::HttpNetwork;
use platform::InMemoryPlatform;

#[derive(Parser, Debug)]
#[command(name = "offline-sw")]
#[command(about = "Offline caching and background-sync engine, driven by JSON events on stdin")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-sw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin to serve, overriding the config file
  #[arg(short, long)]
  origin: Option<String>,

  /// Cache database path (default: $XDG_DATA_HOME/offline-sw/cache.db)
  #[arg(long)]
  db: Option<PathBuf>,
}

/// Logs go to stderr, or a daily file under `log_dir`; stdout carries replies.
fn init_tracing(log_dir: Option<&PathBuf>) -> WorkerGuard {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let (writer, guard) = match log_dir {
    Some(dir) => tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "offline-sw.log")),
    None => tracing_appender::non_blocking(io::stderr()),
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(writer).with_ansi(log_dir.is_none()))
    .with(filter)
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;
  if let Some(origin) = args.origin {
    config.origin = origin;
    config.origin_url()?;
  }
  if let Some(db) = args.db {
    config.cache.path = Some(db);
  }

  let _guard = init_tracing(config.log_dir.as_ref());
  info!(origin = %config.origin, version = %config.cache.version, "Starting offline-sw");

  let network = Arc::new(HttpNetwork::new(Duration::from_secs(config.network_timeout_secs))?);
  let storage = SqliteStorage::open(config.cache.path.as_deref())?;
  let platform = Arc::new(InMemoryPlatform::new());
  let engine = Arc::new(CacheEngine::new(&config, network, storage, platform)?);

  // Mutations queued by a previous run
  engine.restore_sync_queue();

  if let Some(hour) = config.notifications.daily_hour {
    engine.notifications().schedule_daily(hour);
  }

  let mut events = EventHandler::new();
  let mut in_flight = JoinSet::new();
  let mut seq: u64 = 0;

  while let Some(event) = events.next().await {
    seq += 1;

    // Lifecycle transitions are ordered; everything else runs concurrently
    match event {
      Event::Install | Event::Activate => {
        let reply = engine.dispatch(event).await;
        emit(Envelope { seq, reply });
      }
      event => {
        let engine = Arc::clone(&engine);
        in_flight.spawn(async move {
          let reply = engine.dispatch(event).await;
          emit(Envelope { seq, reply });
        });
      }
    }

    // Reap finished handlers
    while in_flight.try_join_next().is_some() {}
  }

  info!(state = ?engine.lifecycle_state(), "Input closed, waiting for background work");
  while in_flight.join_next().await.is_some() {}
  engine.wait_for_background().await;

  Ok(())
}

fn emit(envelope: Envelope) {
  match serde_json::to_string(&envelope) {
    Ok(line) => println!("{}", line),
    Err(e) => warn!(seq = envelope.seq, error = %e, "Failed to serialize reply"),
  }
}
