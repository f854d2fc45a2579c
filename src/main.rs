use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use restocache::lifecycle::{spawn_probe, EventHandler, EventLoop, Lifecycle};
use restocache::queue::{DrainReport, Mutation};
use restocache::store::{CatalogRecord, ReviewDraft};
use restocache::{
  logging, Accepted, Config, HttpOrigin, OfflineContext, Reconciler, Request, Router,
};

#[derive(Parser, Debug)]
#[command(name = "restocache")]
#[command(about = "Offline-first cache and write queue for the restaurant reviews API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/restocache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin base url, overriding the config file
  #[arg(short, long)]
  origin: Option<Url>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-warm the blob cache with the configured asset list
  Install,
  /// Purge stale cache generations and replay pending writes
  Activate,
  /// List restaurants, optionally filtered ("all" matches everything)
  List {
    #[arg(long)]
    cuisine: Option<String>,
    #[arg(long)]
    neighborhood: Option<String>,
  },
  /// Show one restaurant
  Show { id: u64 },
  /// Show the reviews of one restaurant
  Reviews { id: u64 },
  Neighborhoods,
  Cuisines,
  /// Mark or unmark a restaurant as favorite
  Favorite { id: u64, state: Toggle },
  /// Submit a review
  Review {
    id: u64,
    #[arg(long)]
    name: String,
    #[arg(long)]
    rating: u8,
    #[arg(long)]
    comments: String,
  },
  /// Show writes not yet acknowledged by the origin
  Pending,
  /// Replay pending writes now
  Drain,
  /// Fetch a url through the request router and print the body
  Get { url: Url },
  /// Run the lifecycle loop with a connectivity probe until interrupted
  Watch,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Toggle {
  On,
  Off,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let config = match args.origin {
    Some(url) => config.with_origin(url),
    None => config,
  };

  let _log_guard = logging::init(config.log_file)?;

  let origin = Arc::new(HttpOrigin::new(&config.origin)?);
  let context = OfflineContext::open(config, origin)?;
  if let Some(reason) = context.degraded_reason() {
    eprintln!("warning: running without offline storage ({})", reason);
  }
  let reconciler = Arc::new(Reconciler::new(context));

  run(args.command, reconciler).await
}

async fn run(command: Command, reconciler: Arc<Reconciler>) -> Result<()> {
  match command {
    Command::Install => {
      let assets = reconciler.install().await?;
      println!("cached {} assets", assets);
    }
    Command::Activate => {
      let report = reconciler.activate().await?;
      print_report(&report);
    }
    Command::List {
      cuisine,
      neighborhood,
    } => {
      let records = reconciler
        .filter(any_filter(&cuisine), any_filter(&neighborhood))
        .await?;
      for record in &records {
        print_restaurant(record);
      }
    }
    Command::Show { id } => {
      let record = reconciler.restaurant(id).await?;
      println!("{}", serde_json::to_string_pretty(&record)?);
    }
    Command::Reviews { id } => {
      for review in reconciler.reviews_for(id).await? {
        let marker = if review.id.is_provisional() { " (pending)" } else { "" };
        println!(
          "[{}] {} {}/5{}: {}",
          review.id, review.name, review.rating, marker, review.comments
        );
      }
    }
    Command::Neighborhoods => {
      for n in reconciler.neighborhoods().await? {
        println!("{}", n);
      }
    }
    Command::Cuisines => {
      for c in reconciler.cuisines().await? {
        println!("{}", c);
      }
    }
    Command::Favorite { id, state } => {
      let accepted = reconciler
        .toggle_favorite(id, matches!(state, Toggle::On))
        .await?;
      print_accepted(accepted);
      replay(&reconciler).await?;
    }
    Command::Review {
      id,
      name,
      rating,
      comments,
    } => {
      let accepted = reconciler
        .submit_review(ReviewDraft::new(id, &name, rating, &comments))
        .await?;
      print_accepted(accepted);
      replay(&reconciler).await?;
    }
    Command::Pending => {
      for m in reconciler.pending()? {
        let what = match &m.mutation {
          Mutation::FavoriteToggle {
            restaurant_id,
            is_favorite,
          } => format!("favorite {} -> {}", restaurant_id, is_favorite),
          Mutation::ReviewCreate { draft } => {
            format!("review for {} by {}", draft.restaurant_id, draft.name)
          }
        };
        println!(
          "#{} {} [{}, {} attempts]{}",
          m.local_id,
          what,
          m.status,
          m.attempts,
          m.last_error.map(|e| format!(" {}", e)).unwrap_or_default()
        );
      }
    }
    Command::Drain => {
      let report = reconciler.drain().await?;
      print_report(&report);
    }
    Command::Get { url } => {
      let router = Router::new(reconciler.clone());
      let response = router.intercept(&Request::get(url)).await?;
      eprintln!("{} ({:?})", response.status, response.source);
      std::io::stdout()
        .write_all(&response.body)
        .map_err(|e| eyre!("Failed to write response: {}", e))?;
    }
    Command::Watch => watch(reconciler).await?,
  }
  Ok(())
}

async fn watch(reconciler: Arc<Reconciler>) -> Result<()> {
  let (sender, events) = EventHandler::channel();
  let interval = Duration::from_secs(reconciler.context().config().connectivity.probe_secs);
  let probe = spawn_probe(reconciler.context().origin().clone(), interval, sender.clone());

  sender.send(Lifecycle::Activate);
  let event_loop = EventLoop::new(reconciler, events);

  tokio::select! {
    result = event_loop.run() => result?,
    _ = tokio::signal::ctrl_c() => {},
  }
  probe.abort();
  Ok(())
}

/// Try to replay right away; failures stay queued for the next drain.
async fn replay(reconciler: &Reconciler) -> Result<()> {
  let report = reconciler.drain().await?;
  if report.failed > 0 || report.skipped > 0 {
    println!("origin unavailable, will retry on reconnect");
  }
  Ok(())
}

fn any_filter(value: &Option<String>) -> Option<&str> {
  value.as_deref().filter(|v| *v != "all")
}

fn print_restaurant(record: &CatalogRecord) {
  let star = if record.is_favorite { "*" } else { " " };
  println!(
    "{} {:>3}  {}  ({}, {})",
    star, record.id, record.name, record.neighborhood, record.cuisine_type
  );
}

fn print_accepted(accepted: Accepted) {
  match accepted {
    Accepted::Queued { local_id } => println!("queued as #{}", local_id),
    Accepted::Applied => println!("applied"),
  }
}

fn print_report(report: &DrainReport) {
  println!(
    "acknowledged {}, failed {}, skipped {}",
    report.acknowledged, report.failed, report.skipped
  );
}
