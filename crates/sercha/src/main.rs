//! # Sercha CLI (`sercha`)
//!
//! ```bash
//! sercha --config ./config/sercha.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sercha init` | Write a default config if missing and create the database |
//! | `sercha sources add/list/remove/types` | Manage configured sources |
//! | `sercha documents list/get` | List a source's documents, show one |
//! | `sercha credentials set-pat/set-oauth` | Attach credentials to a source |
//! | `sercha sync <source>` / `--all` | Run an incremental sync |
//! | `sercha search "<query>"` | Search indexed documents |
//! | `sercha exclude <document>` | Drop a document and keep it out |
//! | `sercha exclusions list/remove` | Manage exclusions |
//! | `sercha tasks list/run/history` | Inspect and trigger scheduled tasks |
//! | `sercha daemon` | Run the scheduler until interrupted |

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tokio_util::sync::CancellationToken;

use sercha::app::{connectors, App};
use sercha::config::{self, DEFAULT_CONFIG};
use sercha::logging;
use sercha_core::models::{CredentialSecret, OAuthTokens, Source};
use sercha_core::search::{SearchMode, SearchOptions};
use sercha_core::sync::SyncOutcome;

/// Sercha: local-first document search with incremental sync.
#[derive(Parser)]
#[command(name = "sercha", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sercha.toml")]
    config: PathBuf,

    /// Debug-level logging for the sercha crates.
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config (if none exists) and create the database.
    Init,

    /// Manage sources.
    Sources {
        #[command(subcommand)]
        action: SourcesAction,
    },

    /// Inspect indexed documents.
    Documents {
        #[command(subcommand)]
        action: DocumentsAction,
    },

    /// Attach credentials to a source.
    Credentials {
        #[command(subcommand)]
        action: CredentialsAction,
    },

    /// Sync one source, or every source with `--all`.
    Sync {
        source_id: Option<String>,
        #[arg(long, conflicts_with = "source_id")]
        all: bool,
    },

    /// Search indexed documents.
    Search {
        query: String,
        /// text_only, hybrid, llm_assisted or full.
        #[arg(long, default_value = "text_only")]
        mode: SearchMode,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        /// Restrict to a source; repeatable.
        #[arg(long = "source")]
        sources: Vec<String>,
        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Remove a document from the index and keep it out of future syncs.
    Exclude {
        document_id: String,
        #[arg(long, default_value = "excluded by user")]
        reason: String,
    },

    /// Manage exclusions.
    Exclusions {
        #[command(subcommand)]
        action: ExclusionsAction,
    },

    /// Inspect and trigger scheduled tasks. Lists them by default.
    Tasks {
        #[command(subcommand)]
        action: Option<TasksAction>,
    },

    /// Run the scheduler in the foreground until Ctrl-C.
    Daemon {
        /// Seconds running tasks get to finish on shutdown.
        #[arg(long, default_value_t = 30)]
        grace_secs: u64,
    },

    /// Print shell completions.
    Completions { shell: Shell },
}

#[derive(Subcommand)]
enum SourcesAction {
    /// Register a new source.
    Add {
        id: String,
        source_type: String,
        name: String,
        /// Connector setting as KEY=VALUE; repeatable.
        #[arg(long = "set", value_parser = parse_key_val)]
        settings: Vec<(String, String)>,
    },
    List,
    /// Remove a source with its documents, sync state, exclusions and credentials.
    Remove { id: String },
    /// Connector types available in this build.
    Types,
}

#[derive(Subcommand)]
enum CredentialsAction {
    /// Store a personal access token.
    SetPat {
        source_id: String,
        token: String,
        #[arg(long)]
        account: Option<String>,
    },
    /// Store OAuth tokens obtained out of band.
    SetOauth {
        source_id: String,
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        refresh_token: Option<String>,
        /// Access token lifetime in seconds.
        #[arg(long)]
        expires_in: Option<i64>,
        #[arg(long)]
        account: Option<String>,
    },
}

#[derive(Subcommand)]
enum DocumentsAction {
    /// List the indexed documents of a source.
    List { source_id: String },
    /// Show one document's details, or its indexed text with `--content`.
    Get {
        id: String,
        #[arg(long)]
        content: bool,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ExclusionsAction {
    List {
        #[arg(long)]
        source: Option<String>,
    },
    Remove { id: String },
}

#[derive(Subcommand)]
enum TasksAction {
    List,
    /// Run a task now and wait for it.
    Run { id: String },
    History {
        id: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{s}'"))?;
    Ok((key.to_string(), value.to_string()))
}

fn write_default_config(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, DEFAULT_CONFIG)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

/// Cancelled on the first Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping after the current item");
            child.cancel();
        }
    });
    token
}

fn print_report(report: &sercha_core::sync::SyncReport) {
    println!(
        "{}: {} processed, {} deleted, {} skipped, {} failed",
        report.source_id,
        report.items_processed,
        report.items_deleted,
        report.items_skipped,
        report.items_failed
    );
    for failure in &report.failures {
        println!("  ! {}: {}", failure.uri, failure.error);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "sercha", &mut std::io::stdout());
        return Ok(());
    }

    logging::init(cli.verbose, cli.log_json)?;

    if matches!(cli.command, Commands::Init) && write_default_config(&cli.config)? {
        println!("Wrote default config to {}", cli.config.display());
    }
    if let Commands::Sources {
        action: SourcesAction::Types,
    } = &cli.command
    {
        for source_type in connectors().types() {
            println!("{source_type}");
        }
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    let app = App::open(cfg).await?;

    match cli.command {
        Commands::Init => {
            println!(
                "Database initialized at {}",
                app.config.db.path.display()
            );
        }
        Commands::Sources { action } => match action {
            SourcesAction::Add {
                id,
                source_type,
                name,
                settings,
            } => {
                let source = settings
                    .into_iter()
                    .fold(Source::new(&id, &source_type, &name), |s, (k, v)| {
                        s.with_config(k, v)
                    });
                app.catalog.add_source(&source).await?;
                println!("Added source {id} ({source_type})");
            }
            SourcesAction::List => {
                let sources = app.catalog.list_sources().await?;
                if sources.is_empty() {
                    println!("No sources configured.");
                }
                for source in sources {
                    let last_sync = match app.stores.sync_states.get_sync_state(&source.id).await {
                        Ok(state) => state.last_sync.to_rfc3339(),
                        Err(e) if e.is_not_found() => "never".to_string(),
                        Err(e) => return Err(e.into()),
                    };
                    println!(
                        "{:<20} {:<12} {:<30} last sync: {}",
                        source.id, source.source_type, source.name, last_sync
                    );
                }
            }
            SourcesAction::Remove { id } => {
                let removed = app.catalog.remove_source(&id).await?;
                println!(
                    "Removed source {id}: {} documents, {} exclusions",
                    removed.documents, removed.exclusions
                );
            }
            // Printed before the database is opened.
            SourcesAction::Types => {}
        },
        Commands::Documents { action } => match action {
            DocumentsAction::List { source_id } => {
                for doc in app.catalog.list_documents(&source_id).await? {
                    println!("{}  {}  {}", doc.id, doc.uri, doc.title);
                }
            }
            DocumentsAction::Get { id, content: true, .. } => {
                println!("{}", app.catalog.document_content(&id).await?);
            }
            DocumentsAction::Get { id, json, .. } => {
                let details = app.catalog.document_details(&id).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&details)?);
                } else {
                    println!("ID:       {}", details.id);
                    println!("Title:    {}", details.title);
                    println!("URI:      {}", details.uri);
                    println!(
                        "Source:   {} ({}, {})",
                        details.source_id,
                        details.source_name.as_deref().unwrap_or("-"),
                        details.source_type.as_deref().unwrap_or("-")
                    );
                    println!("Chunks:   {}", details.chunk_count);
                    println!("Created:  {}", details.created_at.to_rfc3339());
                    println!("Updated:  {}", details.updated_at.to_rfc3339());
                    for (key, value) in &details.metadata {
                        match value.as_str() {
                            Some(text) => println!("  {key}: {text}"),
                            None => println!("  {key}: {value}"),
                        }
                    }
                }
            }
        },
        Commands::Credentials { action } => {
            let (source_id, secret, account) = match action {
                CredentialsAction::SetPat {
                    source_id,
                    token,
                    account,
                } => (source_id, CredentialSecret::Pat { token }, account),
                CredentialsAction::SetOauth {
                    source_id,
                    access_token,
                    refresh_token,
                    expires_in,
                    account,
                } => {
                    let tokens = OAuthTokens {
                        access_token,
                        refresh_token,
                        token_type: "Bearer".to_string(),
                        expiry: expires_in
                            .map(|secs| chrono::Utc::now() + chrono::Duration::seconds(secs)),
                    };
                    (source_id, CredentialSecret::OAuth(tokens), account)
                }
            };
            let credentials = app
                .catalog
                .set_credentials(&source_id, secret, account)
                .await?;
            println!("Saved credentials {} for source {source_id}", credentials.id);
        }
        Commands::Sync { source_id, all } => {
            let cancel = interrupt_token();
            if all {
                let mut failed = 0;
                for outcome in app.orchestrator.sync_all(&cancel).await? {
                    match outcome.outcome {
                        SyncOutcome::Completed(report) => print_report(&report),
                        SyncOutcome::Skipped => {
                            println!("{}: skipped, sync already running", outcome.source_id)
                        }
                        SyncOutcome::Failed(err) => {
                            failed += 1;
                            println!("{}: failed: {err}", outcome.source_id);
                        }
                    }
                }
                if failed > 0 {
                    bail!("{failed} source(s) failed to sync");
                }
            } else {
                let Some(source_id) = source_id else {
                    bail!("pass a source id or --all");
                };
                let report = app.orchestrator.sync_source(&source_id, &cancel).await?;
                print_report(&report);
            }
        }
        Commands::Search {
            query,
            mode,
            limit,
            offset,
            sources,
            json,
        } => {
            let mut options = SearchOptions::mode(mode).sources(sources);
            options.limit = limit;
            options.offset = offset;
            let results = app.search.search(&query, &options).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("No results.");
            } else {
                for (i, result) in results.iter().enumerate() {
                    println!(
                        "{}. [{:.2}] {} ({})",
                        offset + i + 1,
                        result.score,
                        result.document.title,
                        result.source_name
                    );
                    println!("    {}", result.document.uri);
                    for highlight in &result.highlights {
                        println!("    > {highlight}");
                    }
                }
            }
        }
        Commands::Exclude {
            document_id,
            reason,
        } => {
            let exclusion = app.catalog.exclude_document(&document_id, &reason).await?;
            println!("Excluded {} ({})", exclusion.uri, exclusion.id);
        }
        Commands::Exclusions { action } => match action {
            ExclusionsAction::List { source } => {
                for exclusion in app.catalog.list_exclusions(source.as_deref()).await? {
                    println!(
                        "{}  {}  {}  {}",
                        exclusion.id, exclusion.source_id, exclusion.uri, exclusion.reason
                    );
                }
            }
            ExclusionsAction::Remove { id } => {
                app.catalog.remove_exclusion(&id).await?;
                println!("Removed exclusion {id}");
            }
        },
        Commands::Tasks { action } => {
            app.scheduler.init_tasks().await?;
            match action.unwrap_or(TasksAction::List) {
                TasksAction::List => {
                    for task in app.scheduler.tasks().await? {
                        let next = task
                            .next_run
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "{:<16} enabled={:<5} every {:>6}s next: {}{}",
                            task.id,
                            task.enabled,
                            task.interval.as_secs(),
                            next,
                            task.last_error
                                .map(|e| format!("  last error: {e}"))
                                .unwrap_or_default()
                        );
                    }
                }
                TasksAction::Run { id } => {
                    let result = app.scheduler.run_now(&id)?.await?;
                    app.scheduler.shutdown(Duration::ZERO).await;
                    println!(
                        "{}: success={} processed={} failed={}",
                        result.task_id, result.success, result.items_processed, result.items_failed
                    );
                    if let Some(error) = result.error {
                        bail!(error);
                    }
                }
                TasksAction::History { id, limit } => {
                    for result in app.scheduler.history(&id, limit).await? {
                        println!(
                            "{}  {:>6}ms  success={}  processed={}  failed={}{}",
                            result.started_at.to_rfc3339(),
                            (result.ended_at - result.started_at).num_milliseconds(),
                            result.success,
                            result.items_processed,
                            result.items_failed,
                            result
                                .error
                                .map(|e| format!("  {e}"))
                                .unwrap_or_default()
                        );
                    }
                }
            }
        }
        Commands::Daemon { grace_secs } => {
            app.scheduler.start().await?;
            tracing::info!("daemon running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            let clean = app.scheduler.shutdown(Duration::from_secs(grace_secs)).await;
            if !clean {
                tracing::warn!("some tasks were cancelled during shutdown");
            }
        }
        Commands::Completions { .. } => unreachable!("handled before logging is set up"),
    }

    Ok(())
}
