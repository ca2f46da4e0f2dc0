mod commands;
mod logging;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::debug;

use leadsync::api::CachedClient;
use leadsync::config::Config;
use leadsync::notify::{Level, Notification};

#[derive(Parser, Debug)]
#[command(name = "leadsync")]
#[command(about = "Command-line client for a lead-generation CRM and its scraping jobs")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/leadsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Job service URL, overriding the config file
  #[arg(long)]
  base_url: Option<String>,

  /// Log at debug level unless RUST_LOG is set
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(base_url) = args.base_url {
    config.api.base_url = base_url;
  }

  let _log_guard = logging::init(&config.log, args.verbose)?;
  debug!(base_url = %config.api.base_url, "configuration loaded");

  let client = CachedClient::new(&config)?;
  let gc = client
    .cache()
    .spawn_gc(Duration::from_secs(config.cache.gc_secs.max(1)));
  let mut notifications = client.notifier().subscribe();

  let result = commands::run(&client, args.command).await;

  loop {
    match notifications.try_recv() {
      Ok(notification) => print_notification(&notification),
      Err(TryRecvError::Lagged(missed)) => debug!(missed, "notifications dropped"),
      Err(TryRecvError::Empty | TryRecvError::Closed) => break,
    }
  }

  gc.abort();
  client.shutdown();
  result
}

fn print_notification(notification: &Notification) {
  let marker = match notification.level {
    Level::Success => "ok",
    Level::Failure => "error",
  };
  eprintln!("[{}] {}", marker, notification);
}
