mod cache;
mod config;
mod event;
mod gateway;
mod queue;
mod sync;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use url::Url;

use event::{EventRouter, LifecycleEvent};
use gateway::types::Request;
use gateway::{Gateway, HttpFetcher};

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Offline-first request gateway with a durable retry queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Populate the current cache version and evict stale ones
  Install,
  /// Fetch a URL through the gateway's read path
  Fetch {
    url: String,
  },
  /// Submit a payload to the configured endpoint through the write path
  Submit {
    data: String,
  },
  /// Drain the retry queue now
  Sync,
  /// Show cache stores and queued submissions
  Status,
  /// Run as a daemon: prime the cache, watch connectivity, drain on reconnect
  Run,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_tracing()?;

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;
  let gateway = Gateway::new(config.clone())?;

  match args.command {
    Command::Install => {
      gateway.handle_install().await?;
      gateway.handle_activate().await?;
      println!(
        "Cache {} populated with {} assets",
        config.cache_version,
        config.assets.len()
      );
    }
    Command::Fetch { url } => {
      let url = Url::parse(&url).map_err(|e| eyre!("Invalid URL: {}", e))?;
      let router = EventRouter::spawn(Arc::new(gateway));

      let result = router.fetch(Request::get(url)).await?;
      eprintln!("{:?} ({})", result.outcome, result.response.status);
      println!("{}", String::from_utf8_lossy(&result.response.body));
    }
    Command::Submit { data } => {
      let request = Request::post(
        config.endpoint.clone(),
        config.policy.write_body_encoding.content_type(),
        data.into_bytes(),
      );
      let router = EventRouter::spawn(Arc::new(gateway));

      let result = router.fetch(request).await?;
      println!("{:?} ({})", result.outcome, result.response.status);
    }
    Command::Sync => {
      let report = gateway.handle_sync(&config.sync_tag).await?;
      println!(
        "Delivered {} queued submission(s), {} remaining",
        report.delivered, report.remaining
      );
    }
    Command::Status => {
      for (name, count) in gateway.cache().stores()? {
        let marker = if name == config.cache_version {
          " (current)"
        } else {
          ""
        };
        println!("cache {}: {} entries{}", name, count, marker);
      }
      let queued = gateway.queued_keys().await?;
      println!("queued submissions: {}", queued.len());
      for key in queued {
        println!("  {}", key);
      }
    }
    Command::Run => {
      let gateway = Arc::new(gateway);
      let router = EventRouter::spawn(Arc::clone(&gateway));

      router.send(LifecycleEvent::Install)?;
      router.send(LifecycleEvent::Activate)?;

      let probe = Arc::new(HttpFetcher::new()?);
      event::spawn_reconnect_watcher(
        router.clone(),
        probe,
        config.origin.clone(),
        config.sync_tag.clone(),
        Duration::from_secs(30),
      );

      wait_for_shutdown(router).await?;
    }
  }

  Ok(())
}

/// Block until Ctrl-C. On unix, SIGHUP acts as the skip-waiting directive:
/// it forces the configured cache version active immediately.
#[cfg(unix)]
async fn wait_for_shutdown(router: EventRouter) -> Result<()> {
  use event::ControlMessage;
  use tokio::signal::unix::{signal, SignalKind};

  let mut hangup = signal(SignalKind::hangup())?;
  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => return Ok(()),
      _ = hangup.recv() => {
        router.send(LifecycleEvent::Message(ControlMessage::SkipWaiting))?;
      }
    }
  }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_router: EventRouter) -> Result<()> {
  tokio::signal::ctrl_c().await?;
  Ok(())
}

fn init_tracing() -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  let file_appender = tracing_appender::rolling::daily(data_dir.join("offsync"), "offsync.log");
  let (writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("offsync=info")),
    )
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}
