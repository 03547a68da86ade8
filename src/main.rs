use axis_offline::cache::CacheGeneration;
use axis_offline::config::Config;
use axis_offline::event::{EventHandler, EventOutcome, HostEvent};
use axis_offline::lifecycle::{ActivationOutcome, ClientPage};
use axis_offline::net::{Destination, OutboundRequest, ResponseSnapshot};
use axis_offline::{MutationOutcome, OfflineError, OfflineWorker};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "axis-offline")]
#[command(about = "Offline caching and write replay for the Axis web app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/axis-offline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-warm the static cache generation with the asset manifest
  Install,
  /// Drop stale cache generations and take control of open pages
  Activate {
    /// Open page as "<id>" or "<id>=<controlling static generation>" (repeatable)
    #[arg(long = "page")]
    pages: Vec<String>,
  },
  /// Route a GET through the offline layer and print the response body
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    /// Fetch destination (document, script, style, image, font, ...)
    #[arg(short, long, default_value = "empty")]
    destination: Destination,
    /// Treat as a top-level navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Send a mutating request, queueing it if the network is unreachable
  Send {
    url: String,
    #[arg(short = 'X', long, default_value = "POST")]
    method: String,
    /// Header as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    #[arg(short, long)]
    body: Option<String>,
  },
  /// Replay queued requests (the host's connectivity trigger)
  Sync {
    #[arg(long)]
    tag: Option<String>,
  },
  /// List queued requests
  Queue {
    /// Discard every queued request instead of listing
    #[arg(long)]
    clear: bool,
  },
  /// Read or write the key/value store
  Kv {
    #[command(subcommand)]
    action: KvAction,
  },
  /// Show lifecycle state, cache generations and queue length
  Status,
}

#[derive(Subcommand, Debug)]
enum KvAction {
  Get { key: String },
  Set { key: String, value: String },
  Delete { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let data_dir = config.data_dir()?;
  let _guard = init_tracing(&data_dir)?;

  let worker = Arc::new(OfflineWorker::open(&data_dir, &config).await?);
  let events = EventHandler::spawn(Arc::clone(&worker));
  run(&events, &*worker, &config, args.command).await
}

/// Lifecycle, fetch and sync commands go through the host event surface;
/// queue, kv and status inspect the worker directly.
async fn run<S, D>(
  events: &EventHandler,
  worker: &OfflineWorker<S, D>,
  config: &Config,
  command: Command,
) -> Result<()>
where
  S: axis_offline::cache::CacheStorage,
  D: axis_offline::db::DurableStore,
{
  let origin = config.origin_url()?;

  match command {
    Command::Install => match events.dispatch(HostEvent::Install).await? {
      EventOutcome::Lifecycle(state) => println!("{}", state),
      other => return Err(unexpected(other)),
    },
    Command::Activate { pages } => {
      let pages = pages
        .iter()
        .map(|page| parse_page(&origin, page))
        .collect::<Vec<_>>();
      for page in &pages {
        events.dispatch(HostEvent::ClientOpened(page.clone())).await?;
      }

      let outcome = events.dispatch(HostEvent::Activate).await;

      // The pages only live as long as this command
      for page in pages {
        events.dispatch(HostEvent::ClientClosed(page.id)).await?;
      }

      match outcome? {
        EventOutcome::Activation(ActivationOutcome::Waiting) => {
          println!("waiting (pages controlled by an older build are still open)")
        }
        EventOutcome::Activation(ActivationOutcome::Activated { removed, claimed }) => {
          println!("active (removed {} stale generations, claimed {} pages)", removed.len(), claimed);
          for generation in removed {
            println!("  - {}", generation);
          }
        }
        other => return Err(unexpected(other)),
      }
    }
    Command::Fetch {
      url,
      destination,
      navigate,
    } => {
      let url = resolve(&origin, &url)?;
      let request = if navigate {
        OutboundRequest::navigate(url)
      } else {
        OutboundRequest::get(url).with_destination(destination)
      };

      let outcome = match events.dispatch(HostEvent::Fetch(request.clone())).await? {
        EventOutcome::Response(outcome) => outcome,
        other => return Err(unexpected(other)),
      };
      match outcome.response() {
        Some(response) => {
          eprintln!("HTTP {} ({:?})", response.status, outcome.source());
          write_body(response)?;
        }
        None => return Err(OfflineError::CacheMiss(request.url.to_string()).into()),
      }
    }
    Command::Send {
      url,
      method,
      headers,
      body,
    } => {
      let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| eyre!("Invalid method '{}'", method))?;
      let mut request = OutboundRequest::get(resolve(&origin, &url)?).with_method(method);
      for header in headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Header must be 'Name: value', got '{}'", header))?;
        request = request.with_header(name.trim(), value.trim());
      }
      if let Some(body) = body {
        request = request.with_body(body.into_bytes());
      }

      match worker.send_mutation(&request).await? {
        MutationOutcome::Sent(response) => {
          eprintln!("HTTP {}", response.status);
          write_body(&response)?;
        }
        MutationOutcome::Queued { sequence } => println!("queued #{}", sequence),
      }
    }
    Command::Sync { tag } => {
      let tag = tag.unwrap_or_else(|| config.sync_tag.clone());
      let synced = events
        .dispatch(HostEvent::Sync { tag: tag.clone() })
        .await
        .map_err(|e| {
          if e.is_recoverable() {
            warn!(error = %e, "sync incomplete; queued requests kept for the next trigger");
          }
          e
        })?;
      let report = match synced {
        EventOutcome::Synced(report) => report,
        other => return Err(unexpected(other)),
      };
      match report {
        Some(report) => println!(
          "replayed {}, discarded {}, remaining {}{}",
          report.replayed.len(),
          report.discarded.len(),
          report.remaining,
          if report.skipped { " (another sync is running)" } else { "" }
        ),
        None => println!("ignored sync tag '{}'", tag),
      }
    }
    Command::Queue { clear } => {
      if clear {
        println!("cleared {} queued requests", worker.clear_queue().await?);
      } else {
        for item in worker.pending().await? {
          println!(
            "#{:<5} {:<7} {}  ({})",
            item.sequence,
            item.method,
            item.url,
            item.enqueued_at.format("%Y-%m-%d %H:%M:%S")
          );
        }
      }
    }
    Command::Kv { action } => match action {
      KvAction::Get { key } => match worker.kv_get(&key).await? {
        Some(value) => println!("{}", value),
        None => return Err(eyre!("No value for key '{}'", key)),
      },
      KvAction::Set { key, value } => worker.kv_put(&key, &value).await?,
      KvAction::Delete { key } => {
        if !worker.kv_delete(&key).await? {
          return Err(eyre!("No value for key '{}'", key));
        }
      }
    },
    Command::Status => {
      let status = worker.status().await?;
      println!("state:       {}", status.state);
      println!("static:      {}", status.generations.static_gen);
      println!("runtime:     {}", status.generations.runtime_gen);
      match &status.controlling {
        Some(g) => println!("serving:     {} + {}", g.static_gen, g.runtime_gen),
        None => println!("serving:     (network only)"),
      }
      let stored: Vec<String> = status
        .stored_generations
        .iter()
        .map(ToString::to_string)
        .collect();
      println!("stored:      {}", stored.join(", "));
      println!("pending:     {}", status.pending);
    }
  }

  Ok(())
}

fn unexpected(outcome: EventOutcome) -> color_eyre::Report {
  eyre!("Unexpected event outcome: {:?}", outcome)
}

/// "<id>" or "<id>=<generation>"
fn parse_page(origin: &Url, raw: &str) -> ClientPage {
  let (id, controller) = match raw.split_once('=') {
    Some((id, generation)) => (id, Some(CacheGeneration::new(generation.trim()))),
    None => (raw, None),
  };
  ClientPage {
    id: id.trim().to_string(),
    url: origin.clone(),
    controller,
  }
}

fn resolve(origin: &Url, url: &str) -> Result<Url> {
  origin
    .join(url)
    .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))
}

fn write_body(response: &ResponseSnapshot) -> Result<()> {
  let mut stdout = std::io::stdout().lock();
  stdout.write_all(&response.body)?;
  stdout.flush()?;
  Ok(())
}

/// Log to stderr and to a daily rolling file under the data directory.
fn init_tracing(data_dir: &Path) -> Result<WorkerGuard> {
  let log_dir = data_dir.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let file_appender = tracing_appender::rolling::daily(&log_dir, "axis-offline.log");
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  let filter = EnvFilter::try_from_env("AXIS_OFFLINE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(fmt::layer().with_ansi(false).with_writer(file_writer))
    .init();

  Ok(guard)
}
