use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use petrack::api::{CachedApiClient, LocationSample, Owner, Pet};
use petrack::cache::{CacheResult, CacheSource, KeyValueStore, SqliteStore};
use petrack::config::{self, Config};
use petrack::location::{
  FilePositionSource, LocationTracker, PendingQueue, Position, StaticPosition, TrackerSettings,
};

/// Environment variable holding the log filter, e.g. `PETRACK_LOG=petrack=debug`
const LOG_ENV: &str = "PETRACK_LOG";

#[derive(Parser, Debug)]
#[command(name = "petrack")]
#[command(about = "Pet tracking client: browse pets and owners, report GPS positions")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/petrack/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Browse and delete pets
  #[command(subcommand)]
  Pets(EntityCommand),

  /// Browse and delete owners
  #[command(subcommand)]
  Owners(EntityCommand),

  /// Location history
  #[command(subcommand)]
  Locations(LocationsCommand),

  /// Send one position for a pet right now
  Send {
    #[arg(long)]
    pet: i64,
    #[arg(long, allow_hyphen_values = true)]
    lat: String,
    #[arg(long, allow_hyphen_values = true)]
    lon: String,
  },

  /// Report a pet's position periodically until interrupted
  Track {
    #[arg(long)]
    pet: i64,
    /// File whose last `lat,lon` line is the current position
    #[arg(long)]
    positions: PathBuf,
  },

  /// Samples that could not be delivered yet
  #[command(subcommand)]
  Pending(PendingCommand),

  /// Local cache maintenance
  #[command(subcommand)]
  Cache(CacheCommand),

  /// Show or change settings
  #[command(subcommand)]
  Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
enum EntityCommand {
  List {
    /// Ignore cached data
    #[arg(long)]
    refresh: bool,
  },
  Get {
    id: i64,
    #[arg(long)]
    refresh: bool,
  },
  Delete {
    id: i64,
  },
}

#[derive(Subcommand, Debug)]
enum LocationsCommand {
  /// Every stored location
  List,
  /// Locations of one pet over the last minutes
  Recent {
    pet: i64,
    #[arg(long, default_value_t = 30)]
    minutes: u32,
  },
}

#[derive(Subcommand, Debug)]
enum PendingCommand {
  List,
  /// Try to send every queued sample now
  Flush,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// Drop all cached responses
  Clear,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
  /// Persist a new API base URL
  SetUrl { url: String },
  Show,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let _log_guard = init_logging(args.verbose)?;

  let store: Arc<dyn KeyValueStore> = Arc::new(
    SqliteStore::open(config.storage.path.as_deref()).wrap_err("Failed to open local storage")?,
  );
  let api = CachedApiClient::new(&config, Arc::clone(&store))?;
  let queue = PendingQueue::new(Arc::clone(&store), config.tracking.pending_capacity);

  match args.command {
    Command::Pets(cmd) => pets(&api, cmd).await,
    Command::Owners(cmd) => owners(&api, cmd).await,
    Command::Locations(LocationsCommand::List) => {
      print_locations(&api.list_locations().await?);
      Ok(())
    }
    Command::Locations(LocationsCommand::Recent { pet, minutes }) => {
      print_locations(&api.recent_locations(pet, minutes).await?);
      Ok(())
    }
    Command::Send { pet, lat, lon } => {
      let position = Position::parse(&lat, &lon)?;
      let tracker = LocationTracker::new(
        pet,
        Arc::new(StaticPosition(position)),
        Arc::new(api.raw().clone()),
        queue,
        TrackerSettings::from(&config.tracking),
      );
      let sent = tracker.send_now().await?;
      println!("Location {} sent for pet {}", sent, pet);
      Ok(())
    }
    Command::Track { pet, positions } => track(&api, queue, &config, pet, &positions).await,
    Command::Pending(PendingCommand::List) => {
      let samples = queue.snapshot()?;
      if samples.is_empty() {
        println!("No pending locations");
      }
      for s in samples {
        let captured = chrono::DateTime::from_timestamp_millis(s.captured_at_millis)
          .map(|t| t.to_rfc3339())
          .unwrap_or_default();
        println!("pet {:>5}  {:>14} {:>14}  {}", s.pet_id, s.latitude, s.longitude, captured);
      }
      Ok(())
    }
    Command::Pending(PendingCommand::Flush) => {
      let report = queue.send_pending(api.raw()).await?;
      println!(
        "Sent {}, rejected {}, still pending {}",
        report.sent, report.rejected, report.remaining
      );
      Ok(())
    }
    Command::Cache(CacheCommand::Clear) => {
      let removed = api.clear_all_stored_data();
      println!("Removed {} cached entries", removed);
      Ok(())
    }
    Command::Config(ConfigCommand::SetUrl { url }) => {
      let url = api.endpoint().set_base_url(&url)?;
      println!("API base URL set to {}", url);
      Ok(())
    }
    Command::Config(ConfigCommand::Show) => {
      println!("api.base_url:       {}", api.endpoint().base_url());
      println!("api.timeout_secs:   {}", config.api.timeout_secs);
      println!("cache.enabled:      {}", config.cache.enabled);
      println!("tracking.interval:  {}s", config.tracking.interval().as_secs());
      println!("tracking.min_move:  {}m", config.tracking.min_displacement_meters);
      println!("pending samples:    {}", queue.len());
      Ok(())
    }
  }
}

/// Log to a daily rolling file in the data directory, and to stderr with `--verbose`.
fn init_logging(verbose: bool) -> Result<Option<WorkerGuard>> {
  let filter = || EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

  let (file_layer, guard) = match config::data_dir() {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir.join("logs"), "petrack.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(filter())
        .boxed();
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  let stderr_layer = verbose.then(|| {
    fmt::layer()
      .with_writer(std::io::stderr)
      .with_target(false)
      .with_filter(filter())
      .boxed()
  });

  tracing_subscriber::registry()
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install logger: {}", e))?;

  Ok(guard)
}

async fn pets(api: &CachedApiClient, cmd: EntityCommand) -> Result<()> {
  match cmd {
    EntityCommand::List { refresh } => {
      let result = api.pets().list(refresh).await?;
      note_source(&result);
      for pet in &result.data {
        print_pet(pet);
      }
    }
    EntityCommand::Get { id, refresh } => {
      let result = api.pets().get_by_id(id, refresh).await?;
      note_source(&result);
      print_pet(&result.data);
      if let Some(fix) = &result.data.last_fix {
        println!("  last seen at ({}, {}) on {}", fix.latitude, fix.longitude, fix.created_at);
      }
    }
    EntityCommand::Delete { id } => {
      api.pets().delete(id).await?;
      println!("Pet {} deleted", id);
    }
  }
  Ok(())
}

async fn owners(api: &CachedApiClient, cmd: EntityCommand) -> Result<()> {
  match cmd {
    EntityCommand::List { refresh } => {
      let result = api.owners().list(refresh).await?;
      note_source(&result);
      for owner in &result.data {
        print_owner(owner);
      }
    }
    EntityCommand::Get { id, refresh } => {
      let result = api.owners().get_by_id(id, refresh).await?;
      note_source(&result);
      print_owner(&result.data);
      for pet in &result.data.mascotas {
        println!("  - {} ({})", pet.nombre, pet.id);
      }
    }
    EntityCommand::Delete { id } => {
      if api.owner_has_pets(id).await? {
        bail!("Owner {} still has pets; delete or reassign them first", id);
      }
      api.owners().delete(id).await?;
      println!("Owner {} deleted", id);
    }
  }
  Ok(())
}

async fn track(api: &CachedApiClient, queue: PendingQueue, config: &Config, pet: i64, positions: &Path) -> Result<()> {
  let tracker = LocationTracker::new(
    pet,
    Arc::new(FilePositionSource::new(positions)),
    Arc::new(api.raw().clone()),
    queue,
    TrackerSettings::from(&config.tracking),
  );

  tracker.start();
  println!(
    "Tracking pet {} every {}s from {} (Ctrl-C to stop)",
    pet,
    config.tracking.interval().as_secs(),
    positions.display()
  );

  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
  tracker.stop();

  let status = tracker.status();
  println!("Reported {} positions", status.history.len());
  if let Some(at) = status.last_sent_at {
    println!("Last sent at {}", at.to_rfc3339());
  }
  if let Some(message) = status.message {
    println!("Status: {}", message);
  }
  if status.pending > 0 {
    println!("{} samples waiting to be sent (petrack pending flush)", status.pending);
  }
  Ok(())
}

fn note_source<T>(result: &CacheResult<T>) {
  if result.source == CacheSource::Offline {
    let when = result.cached_at.map(|t| t.to_rfc3339()).unwrap_or_default();
    eprintln!("Offline: showing cached data from {}", when);
  }
}

fn print_pet(pet: &Pet) {
  println!(
    "{:>5}  {:<16} {:<10} {:<14} {:>3}y {:>7}kg  owner {}",
    pet.id, pet.nombre, pet.especie, pet.raza, pet.edad, pet.peso, pet.owner_id
  );
}

fn print_owner(owner: &Owner) {
  println!(
    "{:>5}  {:<28} {:<28} {:<14} {}",
    owner.id,
    owner.full_name(),
    owner.email,
    owner.telefono,
    owner.ciudad
  );
}

fn print_locations(samples: &[LocationSample]) {
  if samples.is_empty() {
    println!("No locations");
  }
  for s in samples {
    println!(
      "{:>6}  pet {:>5}  {:>14} {:>14}  {}",
      s.id,
      s.pet_id,
      s.latitude,
      s.longitude,
      s.created_at.to_rfc3339()
    );
  }
}
