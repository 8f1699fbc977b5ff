//! # memctl
//!
//! Operator CLI for a bridge's memory database. Every command works on one
//! tenant, selected with `--bridge`, `--login` and `--agent`.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `memctl init` | Create the SQLite database and run schema migrations |
//! | `memctl write <path>` | Create, overwrite or append to a memory file |
//! | `memctl append-session <key> <text>` | Append to a session transcript |
//! | `memctl sync` | Index changed documents |
//! | `memctl search "<query>"` | Hybrid search |
//! | `memctl read <path>` | Print a file or a line window of it |
//! | `memctl status` | Index, provider and engine diagnostics |
//! | `memctl prune` | Drop transcripts past retention from the index |
//! | `memctl probe` | Check vector and embedding availability |
//!
//! ## Examples
//!
//! ```bash
//! memctl --config ./config/memctl.toml init
//! memctl --login @alice:example.org write memory/prefs.md --text "Prefers metric units."
//! memctl --login @alice:example.org search "units" --json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use bridge_memory::backend::SqliteBackend;
use bridge_memory::config::{self, Config};
use bridge_memory::embedding::DefaultProviderFactory;
use bridge_memory::logging::init_logging;
use bridge_memory::manager::SearchOptions;
use bridge_memory::registry::ManagerRegistry;
use bridge_memory::search::run_search;
use bridge_memory::status::print_status;
use bridge_memory::sync::{SyncOptions, SyncReason};
use bridge_memory_core::models::TenantScope;

/// Inspect and maintain a bridge's long-term memory.
#[derive(Parser)]
#[command(name = "memctl", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/memctl.toml")]
    config: PathBuf,

    /// Bridge identifier of the tenant.
    #[arg(long, global = true, default_value = "matrix")]
    bridge: String,

    /// Login identifier of the tenant.
    #[arg(long, global = true, default_value = "default")]
    login: String,

    /// Agent identifier of the tenant.
    #[arg(long, global = true, default_value = "default")]
    agent: String,

    /// Debug logging (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Write a memory file.
    Write {
        /// Relative path, e.g. `memory/projects.md` or `MEMORY.md`.
        path: String,

        /// Inline content.
        #[arg(long, conflicts_with = "file")]
        text: Option<String>,

        /// Read content from a local file.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Append instead of overwriting.
        #[arg(long)]
        append: bool,
    },

    /// Append a message to a session transcript.
    AppendSession {
        session_key: String,
        text: String,
    },

    /// Index documents that changed since the last sync.
    Sync {
        /// Re-index every document, ignoring hashes and deltas.
        #[arg(long)]
        force: bool,
    },

    /// Search notes and transcripts.
    Search {
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Drop results scoring below this (0..1).
        #[arg(long)]
        min_score: Option<f64>,

        /// Print the full outcome as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print a file, or `--lines` lines starting at line `--from`.
    Read {
        path: String,

        /// First line to print (1-based).
        #[arg(long)]
        from: Option<usize>,

        /// Number of lines to print.
        #[arg(long)]
        lines: Option<usize>,
    },

    /// Show index and provider diagnostics.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Drop session transcripts past the retention window from the index.
    Prune,

    /// Check whether vector search and the embedding provider work.
    Probe,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cfg = config::load_config(&cli.config)?;
    let backend = Arc::new(SqliteBackend::connect(&cfg.db).await?);

    if let Commands::Init = cli.command {
        println!("Database initialized at {}", cfg.db.path.display());
        backend.pool().close().await;
        return Ok(());
    }

    let registry = ManagerRegistry::new(backend.clone(), Arc::new(DefaultProviderFactory));
    let scope = TenantScope::new(&cli.bridge, &cli.login, &cli.agent);
    let result = run_command(&registry, &scope, &cfg, cli.command).await;

    registry.close_all().await;
    backend.pool().close().await;
    result
}

async fn run_command(
    registry: &ManagerRegistry,
    scope: &TenantScope,
    cfg: &Config,
    command: Commands,
) -> Result<()> {
    let manager = registry.get(scope, &cfg.memory).await?;

    match command {
        Commands::Init => {}
        Commands::Write {
            path,
            text,
            file,
            append,
        } => {
            let body = match (text, file) {
                (Some(text), None) => text,
                (None, Some(file)) => std::fs::read_to_string(&file)?,
                _ => bail!("Provide exactly one of --text or --file"),
            };
            let meta = manager.write_file(&path, &body, append).await?;
            println!("Wrote {} ({} bytes, {})", meta.path, meta.size, meta.source);
        }
        Commands::AppendSession { session_key, text } => {
            let meta = manager.append_session(&session_key, &text).await?;
            println!("Appended to {} ({} bytes)", meta.path, meta.size);
        }
        Commands::Sync { force } => {
            let opts = if force {
                SyncOptions::forced(SyncReason::Manual)
            } else {
                SyncOptions::new(SyncReason::Manual)
            };
            if let Some(report) = manager.sync(opts).await? {
                println!(
                    "sync: generation {}, {} scanned, {} indexed, {} unchanged, {} removed, {} expired",
                    report.generation,
                    report.scanned,
                    report.indexed,
                    report.unchanged,
                    report.removed,
                    report.expired
                );
                println!(
                    "chunks: {} written, {} deleted; cache: {} hits, {} misses, {} pruned",
                    report.chunks_written,
                    report.chunks_deleted,
                    report.cache_hits,
                    report.cache_misses,
                    report.cache_pruned
                );
                for failure in &report.failed {
                    eprintln!("failed: {}: {}", failure.path, failure.error);
                }
                if !report.succeeded() {
                    bail!("{} document(s) failed to index", report.failed.len());
                }
            }
        }
        Commands::Search {
            query,
            limit,
            min_score,
            json,
        } => {
            let opts = SearchOptions {
                max_results: limit,
                min_score,
                deadline: None,
            };
            run_search(&manager, &query, opts, json).await?;
        }
        Commands::Read { path, from, lines } => {
            let result = manager.read_file(&path, from, lines).await?;
            print!("{}", result.text);
            if !result.text.is_empty() && !result.text.ends_with('\n') {
                println!();
            }
        }
        Commands::Status { json } => {
            let status = manager.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        Commands::Prune => {
            let report = manager.prune_sessions().await?;
            println!(
                "pruned {} session(s), {} chunk(s)",
                report.sessions_removed, report.chunks_deleted
            );
        }
        Commands::Probe => {
            let vector = manager.probe_vector_availability();
            let embedding = manager.probe_embedding_availability().await;
            println!("vector:    {}", vector.error().unwrap_or("ready"));
            println!("embedding: {}", embedding.error().unwrap_or("ready"));
        }
    }
    Ok(())
}
