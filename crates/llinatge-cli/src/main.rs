//! `llinatge`: maintenance commands for a Llinatge catalogue.
//!
//! Reads `llinatge.toml` (or the path given with `--config`) plus any
//! `LLINATGE_*` environment variables, opens the SQLite store and runs one
//! command.
//!
//! ```
//! llinatge init-db
//! llinatge import --template baptismes.json --csv girona.csv --user 3
//! llinatge search "Joan Moia" --entity persona
//! llinatge rebuild --municipi 12
//! ```

use std::{
  collections::HashMap,
  fs::File,
  io,
  path::{Path, PathBuf},
};

use anyhow::Context as _;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use llinatge_core::{
  config::{LogLevel, Settings},
  entity::{ObjectType, ScopeLevel},
  search::SearchQuery,
  services::Services,
  store::{Rollups, Search},
};
use llinatge_import::{ImportJob, Ingestion, Template};
use llinatge_store_sqlite::SqliteStore;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Llinatge catalogue maintenance")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "llinatge.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Create the schema and seed policies (drops everything first with RECREADB).
  InitDb,

  /// Run a CSV import under a JSON template.
  Import {
    #[arg(long)]
    template: PathBuf,
    #[arg(long)]
    csv:      PathBuf,
    /// Id of the user the rows are attributed to.
    #[arg(long)]
    user:     i64,
    /// Stop starting new rows after this many seconds.
    #[arg(long)]
    deadline: Option<i64>,
  },

  /// Replay demographic and name aggregates from the raw tables.
  Rebuild {
    /// Only this municipality; every one when omitted.
    #[arg(long)]
    municipi: Option<i64>,
  },

  /// Recompute every search document.
  Reindex,

  /// Run a faceted search and print the page as JSON.
  Search {
    #[arg(default_value = "")]
    q:             String,
    #[arg(long)]
    entity:        Option<ObjectType>,
    #[arg(long, requires = "ancestor_id")]
    ancestor_type: Option<ScopeLevel>,
    #[arg(long, requires = "ancestor_type")]
    ancestor_id:   Option<i64>,
    #[arg(long)]
    from:          Option<String>,
    #[arg(long)]
    to:            Option<String>,
    #[arg(long, default_value_t = 1)]
    page:          usize,
  },

  /// Print a municipality's demographic totals and top names as JSON.
  Stats {
    municipi: i64,
    #[arg(long, default_value_t = 10)]
    top:      usize,
  },

  /// Print the argon2 hash for a password read from stdin.
  HashPassword,
}

fn load_settings(path: &Path) -> anyhow::Result<Settings> {
  let raw: HashMap<String, String> = config::Config::builder()
    .add_source(config::File::from(path).required(false))
    .add_source(config::Environment::with_prefix("LLINATGE"))
    .build()
    .context("failed to read configuration")?
    .try_deserialize()
    .context("configuration values must be scalars")?;
  Settings::from_map(raw).context("invalid configuration")
}

fn read_password() -> anyhow::Result<String> {
  let mut line = String::new();
  io::stdin().read_line(&mut line)?;
  Ok(line.trim_end_matches(['\n', '\r']).to_owned())
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();

  if let Command::HashPassword = cli.command {
    println!("{}", llinatge_store_sqlite::hash_password(&read_password()?)?);
    return Ok(());
  }

  let settings = load_settings(&cli.config)?;
  // RUST_LOG wins, then a bare LOG_LEVEL, then the configured level.
  let level = std::env::var("LOG_LEVEL")
    .ok()
    .and_then(|v| v.parse::<LogLevel>().ok())
    .unwrap_or(settings.log_level);
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));
  tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();

  let db_path = settings.db_path.clone();
  let store = SqliteStore::open_with(&db_path, Services::new(settings))
    .await
    .with_context(|| format!("failed to open store at {db_path:?}"))?;

  match cli.command {
    Command::InitDb => {
      tracing::info!(path = ?db_path, "schema ready");
    }
    Command::Import { template, csv, user, deadline } => {
      let raw = std::fs::read_to_string(&template)
        .with_context(|| format!("reading template {}", template.display()))?;
      let template = Template::parse(&raw).context("invalid template")?;
      let reader = File::open(&csv).with_context(|| format!("opening {}", csv.display()))?;
      let mut job = ImportJob::new(user);
      if let Some(secs) = deadline {
        job = job.with_deadline(Utc::now() + Duration::seconds(secs));
      }
      let report = store.run_import(job, &template, reader).await?;
      print_json(&report)?;
    }
    Command::Rebuild { municipi: Some(id) } => {
      store.rebuild(id).await?;
      tracing::info!(municipi_id = id, "rebuilt");
    }
    Command::Rebuild { municipi: None } => {
      let n = store.rebuild_all().await?;
      tracing::info!(municipis = n, "rebuilt");
    }
    Command::Reindex => {
      let n = store.reindex_all().await?;
      tracing::info!(documents = n, "reindexed");
    }
    Command::Search { q, entity, ancestor_type, ancestor_id, from, to, page } => {
      let query = SearchQuery {
        q,
        entity,
        ancestor_type,
        ancestor_id,
        from,
        to,
        page,
        ..SearchQuery::default()
      };
      print_json(&store.search(&query).await?)?;
    }
    Command::Stats { municipi, top } => {
      let meta = store.demografia_meta(municipi).await?;
      let years = store.demografia(municipi).await?;
      let noms = store.top_noms(municipi, top).await?;
      let cognoms = store.top_cognoms(municipi, top).await?;
      print_json(&serde_json::json!({
        "meta": meta,
        "years": years,
        "top_noms": noms,
        "top_cognoms": cognoms,
      }))?;
    }
    Command::HashPassword => {}
  }
  Ok(())
}
