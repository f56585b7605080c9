mod cache;
mod config;
mod db;
mod http;
mod interceptor;
mod lifecycle;
mod notify;
mod outbox;
mod runtime;
#[cfg(test)]
mod testing;
mod triggers;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cache::{Dispatcher, SqlitePartitionStore};
use crate::config::Config;
use crate::db::Database;
use crate::http::{HttpNetwork, Request, Served};
use crate::interceptor::Interceptor;
use crate::lifecycle::LifecycleController;
use crate::notify::{parse_payload, ClientNotifier, LoggingOpener, SessionRegistry};
use crate::outbox::{OutboxIntake, OutboxStore, ReplayEngine, SqliteOutbox, SyncTag};
use crate::runtime::TriggerLoop;
use crate::triggers::TriggerBoard;

#[derive(Parser, Debug)]
#[command(name = "lifeline")]
#[command(about = "Offline-first request layer: cache partitions, durable outbox and replay")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./lifeline.yaml or $XDG_CONFIG_HOME/lifeline/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Log at info level unless RUST_LOG says otherwise
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Open the current partitions and pre-populate them
  Install,
  /// Evict old partitions and arm sync triggers
  Activate,
  /// Issue a GET through the strategy dispatcher
  Fetch {
    /// Absolute URL or path relative to the configured origin
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Issue a mutating request through the outbox intake
  Send {
    method: String,
    url: String,
    #[arg(long)]
    body: Option<String>,
    /// Request header as name:value (repeatable)
    #[arg(long = "header")]
    headers: Vec<String>,
  },
  /// Replay queued requests for one tag, or for every tag
  Drain { tag: Option<SyncTag> },
  /// List queued and abandoned requests
  Outbox,
  /// Render a push payload and optionally route a notification action
  Notify {
    payload: String,
    #[arg(long)]
    action: Option<String>,
  },
  /// Watch connectivity and replay queued requests until Ctrl-C
  Run,
}

/// Components wired from one config and one database.
struct Services {
  config: Arc<Config>,
  network: Arc<HttpNetwork>,
  outbox: Arc<SqliteOutbox>,
  triggers: Arc<TriggerBoard>,
  notifier: ClientNotifier,
  replay: ReplayEngine,
  interceptor: Interceptor,
  lifecycle: Arc<LifecycleController>,
}

impl Services {
  fn build(config: Config) -> Result<Self> {
    let config = Arc::new(config);
    let db = Arc::new(Database::open(&config.database_path()?)?);
    let store = Arc::new(SqlitePartitionStore::new(db.clone()));
    let outbox = Arc::new(SqliteOutbox::new(db));
    let network = Arc::new(HttpNetwork::new()?);
    let triggers = Arc::new(TriggerBoard::new());
    let notifier = ClientNotifier::new(
      config.clone(),
      Arc::new(SessionRegistry::new()),
      network.clone(),
      Arc::new(LoggingOpener),
    );
    let dispatcher = Dispatcher::new(config.clone(), store.clone(), network.clone());
    let intake = OutboxIntake::new(config.clone(), outbox.clone(), network.clone(), triggers.clone());
    let replay = ReplayEngine::new(
      outbox.clone(),
      network.clone(),
      notifier.clone(),
      config.sync.max_attempts,
    );
    let lifecycle = Arc::new(LifecycleController::new(
      config.clone(),
      store,
      dispatcher.clone(),
      outbox.clone(),
      replay.clone(),
      notifier.clone(),
      triggers.clone(),
    ));

    Ok(Self {
      config,
      network,
      outbox,
      triggers,
      notifier,
      replay,
      interceptor: Interceptor::new(dispatcher, intake),
      lifecycle,
    })
  }
}

fn init_tracing(verbose: bool, log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
  let default_level = if verbose { "info" } else { "warn" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "lifeline.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_ansi(false).with_writer(writer)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(io::stderr))
    .with(file_layer)
    .with(filter)
    .init();

  guard
}

fn parse_header(raw: &str) -> Result<(String, String)> {
  let (name, value) = raw
    .split_once(':')
    .ok_or_else(|| eyre!("Invalid header '{}', expected name:value", raw))?;
  Ok((name.trim().to_string(), value.trim().to_string()))
}

fn print_served(served: &Served) {
  println!("HTTP {} ({:?})", served.response.status, served.source);
  if let Some(cached_at) = served.cached_at {
    println!("cached-at: {}", cached_at.to_rfc3339());
  }
  for (name, value) in &served.response.headers {
    println!("{}: {}", name, value);
  }
  println!();
  println!("{}", served.response.text());
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_tracing(args.verbose, config.log_dir.as_ref());

  let services = Services::build(config)?;

  match args.command {
    Command::Install => {
      let report = services.lifecycle.on_install().await?;
      println!(
        "installed {}: {} essential, {} api, {} images",
        services.config.version, report.essential, report.api_warmed, report.images_warmed
      );
    }
    Command::Activate => {
      let report = services.lifecycle.on_activate().await?;
      for name in &report.evicted {
        println!("evicted {}", name);
      }
      println!(
        "activated {}: periodic sync {}, {} tag(s) re-armed",
        services.config.version,
        if report.periodic_armed { "armed" } else { "unsupported" },
        report.rearmed.len()
      );
    }
    Command::Fetch { url, navigate } => {
      let url = services.config.resolve(&url)?;
      let request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      };
      print_served(&services.interceptor.handle(&request).await?);
    }
    Command::Send {
      method,
      url,
      body,
      headers,
    } => {
      let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let mut request = Request::new(method, services.config.resolve(&url)?);
      for raw in &headers {
        let (name, value) = parse_header(raw)?;
        request = request.with_header(&name, &value);
      }
      if let Some(body) = body {
        request = request.with_body(body);
      }
      print_served(&services.interceptor.handle(&request).await?);
    }
    Command::Drain { tag } => {
      let report = match tag {
        Some(tag) => services.replay.drain(tag).await?,
        None => services.replay.drain_all().await?,
      };
      println!(
        "{} synced, {} failed, {} abandoned",
        report.succeeded, report.failed, report.abandoned
      );
    }
    Command::Outbox => {
      let pending = services.outbox.list_all()?;
      println!("pending: {}", pending.len());
      for entry in &pending {
        println!(
          "  #{} [{}] {} {} (queued {})",
          entry.id,
          entry.tag,
          entry.request.method,
          entry.request.url,
          entry.enqueued_at.to_rfc3339()
        );
      }
      let dead = services.outbox.dead_letters()?;
      println!("abandoned: {}", dead.len());
      for letter in &dead {
        println!(
          "  #{} [{}] {} {} after {} attempts: {}",
          letter.id,
          letter.tag,
          letter.request.method,
          letter.request.url,
          letter.attempts,
          letter.last_error
        );
      }
    }
    Command::Notify { payload, action } => {
      let notification = services.notifier.render_notification(Some(payload.as_bytes()));
      println!("{}", serde_json::to_string_pretty(&notification)?);
      if action.is_some() {
        let outcome = services
          .notifier
          .route_action(action.as_deref(), &parse_payload(Some(payload.as_bytes())))
          .await?;
        println!("{:?}", outcome);
      }
    }
    Command::Run => {
      services.lifecycle.on_activate().await?;
      let runtime = TriggerLoop::new(
        services.config.clone(),
        services.network.clone(),
        services.triggers.clone(),
        services.outbox.clone(),
        services.replay.clone(),
        services.lifecycle.clone(),
      );
      runtime.run(runtime::shutdown_signal()).await?;
    }
  }

  Ok(())
}
