//! # dbgate CLI
//!
//! The `dbgate` binary drives the gateway from the command line: register
//! connections, run incremental syncs, execute queries and inspect what
//! the local store is tracking.
//!
//! ## Usage
//!
//! ```bash
//! dbgate --config ./config/dbgate.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dbgate init` | Create the SQLite store and run migrations |
//! | `dbgate connect` | Probe, introspect and register a database |
//! | `dbgate connections` | List registered connections |
//! | `dbgate schema <id>` | Print a connection's schema snapshot |
//! | `dbgate sync <id\|all>` | Re-fetch tables whose row count grew |
//! | `dbgate query <id> <text>` | Execute a query and print the JSON result |
//! | `dbgate stats` | Per-connection sync overview |
//! | `dbgate delete <id>` | Remove a connection and everything stored for it |
//!
//! Ctrl-C / SIGTERM closes every open pool before exiting.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use dbgate::app::App;
use dbgate::config::{self, Config};
use dbgate::connections::NewConnection;
use dbgate::models::{Dialect, PipelineMode, QueryRequest};
use dbgate::progress::ProgressMode;
use dbgate::strategy::redact_uri;
use dbgate::sync::{SyncOutcome, SyncReport};
use dbgate::{logging, stats};

/// dbgate: database gateway with incremental, count-based sync.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/dbgate.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "dbgate", version, about = "Database gateway with incremental sync")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/dbgate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the local store.
    ///
    /// Creates the SQLite database file and its tables. Safe to run
    /// repeatedly.
    Init,

    /// Register a database.
    ///
    /// Opens a pool (trying permissive TLS if the plain URI fails),
    /// introspects every table, stores the snapshot and seeds watermarks.
    /// Nothing is stored if the database cannot be reached.
    Connect {
        /// Display name.
        #[arg(long)]
        name: String,

        /// `postgres`, `mysql` or `mongodb`.
        #[arg(long)]
        dialect: String,

        /// Connection URI. MongoDB URIs must name a database.
        #[arg(long)]
        uri: String,

        #[arg(long, default_value = "local")]
        owner: String,

        /// `indexed` hands synced tables to the index; `direct` does not.
        #[arg(long, default_value = "indexed")]
        pipeline: String,
    },

    /// List registered connections (credentials masked).
    Connections,

    /// Print a connection's stored schema snapshot.
    Schema {
        id: String,

        /// Emit the full snapshot as JSON, including sample rows.
        #[arg(long)]
        json: bool,
    },

    /// Incrementally sync one connection, or `all`.
    Sync {
        target: String,

        /// Progress on stderr. Defaults to human when stderr is a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,

        /// Print sync reports as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Execute a query and print the normalized JSON response.
    ///
    /// SQL for relational connections; a JSON command document for
    /// MongoDB, e.g. `{"find": "users", "limit": 10}`.
    Query { id: String, text: String },

    /// Show per-connection tables, tracked rows and last sync time.
    Stats,

    /// Delete a connection, its snapshot and its watermarks.
    Delete { id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Human,
    Json,
    Off,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
            ProgressArg::Off => ProgressMode::Off,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;

    let app = App::open(&cfg).await?;
    let outcome = tokio::select! {
        result = run(cli.command, &app, &cfg) => result,
        _ = shutdown_signal() => {
            eprintln!("Interrupted, closing pools...");
            app.shutdown().await;
            std::process::exit(130);
        }
    };
    app.shutdown().await;

    match outcome {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => Err(e),
    }
}

/// Run one command. `Ok(false)` means the command ran but reports failure.
async fn run(command: Commands, app: &App, cfg: &Config) -> anyhow::Result<bool> {
    match command {
        Commands::Init => {
            println!("Store initialized at {}.", cfg.db.path.display());
        }
        Commands::Connect {
            name,
            dialect,
            uri,
            owner,
            pipeline,
        } => {
            let report = app
                .service
                .establish(NewConnection {
                    owner_id: owner,
                    display_name: name,
                    dialect: dialect.parse::<Dialect>()?,
                    credentials_uri: uri,
                    pipeline_mode: pipeline.parse::<PipelineMode>()?,
                })
                .await?;
            println!("Connected: {}", report.connection_id);
            println!("  tables:  {}", report.tables);
            for table in &report.failed_tables {
                println!("  failed:  {}", table);
            }
            if let Some(handoff) = &report.handoff {
                println!("  indexed: {} entries", handoff.entries);
            }
            if let Some(err) = &report.handoff_error {
                println!("  index hand-off failed: {}", err);
            }
        }
        Commands::Connections => {
            let connections = app.connections.list_connections().await?;
            if connections.is_empty() {
                println!("No connections.");
            }
            for c in connections {
                println!(
                    "{}  {:<20} {:<8} {:<8} {}",
                    c.id,
                    c.display_name,
                    c.dialect,
                    c.pipeline_mode.as_str(),
                    redact_uri(&c.credentials_uri)
                );
            }
        }
        Commands::Schema { id, json } => {
            if app.connections.get_connection(&id).await?.is_none() {
                anyhow::bail!("connection not found: {}", id);
            }
            let snapshot = app.connections.load_snapshot(&id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                for table in &snapshot.schema.tables {
                    let rows = snapshot.data.rows(&table.table_name).map_or(0, |r| r.len());
                    match &table.error {
                        Some(err) => println!("{}  (error: {})", table.table_name, err),
                        None => println!("{}  ({} sampled rows)", table.table_name, rows),
                    }
                    for col in &table.columns {
                        println!("    {:<32} {}", col.name, col.data_type);
                    }
                }
            }
        }
        Commands::Sync {
            target,
            progress,
            json,
        } => {
            let mode = progress
                .map(ProgressMode::from)
                .unwrap_or_else(ProgressMode::default_for_tty);
            let reporter = mode.reporter();
            let reports = if target == "all" {
                app.sync.sync_all(reporter.as_ref()).await?
            } else {
                vec![app.sync.sync_with_progress(&target, reporter.as_ref()).await]
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                reports.iter().for_each(print_sync_report);
            }
            let all_ok = reports
                .iter()
                .all(|r| !matches!(r.outcome, SyncOutcome::Failed { .. }));
            return Ok(all_ok);
        }
        Commands::Query { id, text } => {
            let response = app
                .gateway
                .execute(&QueryRequest {
                    connection_id: id,
                    query_text: text,
                })
                .await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            return Ok(response.success);
        }
        Commands::Delete { id } => {
            if app.service.delete(&id).await? {
                println!("Deleted {}.", id);
            } else {
                println!("No connection {}.", id);
                return Ok(false);
            }
        }
        Commands::Stats => {
            stats::run_stats(cfg).await?;
        }
    }
    Ok(true)
}

fn print_sync_report(report: &SyncReport) {
    match &report.outcome {
        SyncOutcome::Synced => println!(
            "{}: synced {} table(s), {} unchanged ({} ms)",
            report.connection_id,
            report.updated.len(),
            report.unchanged,
            report.duration_ms
        ),
        SyncOutcome::NoChange => println!(
            "{}: no change ({} table(s) checked)",
            report.connection_id,
            report.unchanged + report.skipped.len()
        ),
        SyncOutcome::Failed { stage, message } => {
            println!("{}: failed at {:?}: {}", report.connection_id, stage, message)
        }
    }
    for change in &report.updated {
        let previous = change
            .previous_count
            .map_or_else(|| "-".to_string(), |n| n.to_string());
        println!("  {:<32} {} -> {} rows", change.table, previous, change.current_count);
    }
    for skipped in &report.skipped {
        println!("  {:<32} skipped ({:?}): {}", skipped.table, skipped.stage, skipped.reason);
    }
    if let Some(err) = &report.handoff_error {
        println!("  index hand-off failed: {}", err);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
