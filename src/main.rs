//! # Submission index CLI (`subidx`)
//!
//! ## Usage
//!
//! ```bash
//! subidx --config ./config/subidx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `subidx init` | Create the SQLite database and run schema migrations |
//! | `subidx submit <id> <owner/repo@sha>` | Register a submission's repository revision |
//! | `subidx index <id>` | Index the submission's revision in the foreground |
//! | `subidx status <id>` | Print the submission's index status record |
//! | `subidx search <id> "<query>"` | Retrieve the most relevant chunks |
//! | `subidx serve` | Start the HTTP API |
//!
//! Log verbosity is controlled with `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use submission_index::config;
use submission_index::migrate;
use submission_index::models::{IndexStatus, RepoReference, SearchOptions};
use submission_index::pipeline::Engine;
use submission_index::server;

/// Index pinned repository revisions and retrieve relevant code chunks.
#[derive(Parser)]
#[command(name = "subidx", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/subidx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Register the repository revision for a submission.
    Submit {
        submission_id: String,
        /// `owner/repo@<commit sha>`
        reference: String,
    },

    /// Index a submission's revision and wait for the result.
    ///
    /// Returns immediately with cached counts when the revision is already
    /// indexed, or with the in-flight status when another run holds it.
    Index { submission_id: String },

    /// Show the index status record.
    Status { submission_id: String },

    /// Retrieve chunks relevant to a query.
    Search {
        submission_id: String,
        query: String,

        #[arg(long)]
        top_k: Option<usize>,

        #[arg(long)]
        max_chunks: Option<usize>,

        #[arg(long)]
        max_total_chars: Option<usize>,

        #[arg(long)]
        max_chunk_chars: Option<usize>,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Submit {
            submission_id,
            reference,
        } => {
            let repo = RepoReference::parse(&reference)?;
            let engine = Engine::from_config(&cfg).await?;
            engine.indexer.register(&submission_id, &repo).await?;
            println!("Registered {} -> {}", submission_id, repo);
        }
        Commands::Index { submission_id } => {
            let (engine, worker) = Engine::with_worker(&cfg).await?;
            let outcome = engine.indexer.start_indexing(&submission_id).await?;
            drop(engine);
            // Deliver the completion event before exiting.
            let _ = worker.await;

            println!("status: {}", outcome.status);
            if let (Some(files), Some(chunks)) = (outcome.file_count, outcome.chunk_count) {
                println!("files: {}", files);
                println!("chunks: {}", chunks);
            }
            if let Some(error) = outcome.error {
                println!("error: {}", error);
            }
            if outcome.status == IndexStatus::Failed {
                std::process::exit(1);
            }
        }
        Commands::Status { submission_id } => {
            let engine = Engine::from_config(&cfg).await?;
            let record = engine.indexer.get_index_status(&submission_id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Search {
            submission_id,
            query,
            top_k,
            max_chunks,
            max_total_chars,
            max_chunk_chars,
        } => {
            let engine = Engine::from_config(&cfg).await?;
            let options = SearchOptions {
                top_k,
                max_chunks,
                max_total_chars,
                max_chunk_chars,
            };
            let response = engine
                .retriever
                .search(&submission_id, &query, &options)
                .await?;

            if response.chunks.is_empty() {
                println!("No results.");
                return Ok(());
            }

            for (i, chunk) in response.chunks.iter().enumerate() {
                println!(
                    "{}. [{:.2}] {}:{}-{} ({})",
                    i + 1,
                    chunk.score,
                    chunk.path,
                    chunk.start_line,
                    chunk.end_line,
                    chunk.language
                );
                for line in chunk.content.lines().take(3) {
                    println!("    {}", line);
                }
                println!();
            }
            println!(
                "{} of {} candidates, {} chars",
                response.stats.returned, response.stats.candidates, response.stats.total_chars
            );
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
