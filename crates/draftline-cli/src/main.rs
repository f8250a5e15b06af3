//! Draftline CLI: operator access to the draft store and render tasks.
//!
//! Reads the same environment as the services (DATABASE_URL, CELERY_BROKER_URL,
//! CELERY_RESULT_BACKEND, ...). Results are printed to stdout as JSON.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use draftline_cli::{
    init_tracing, parse_extra, parse_patch, print_json, report_error, run_render,
};
use draftline_core::models::{DraftDocument, DraftOrigin, DraftSearch};
use draftline_core::Config;
use draftline_db::{
    setup_database, DraftBackend, PostgresDraftRepository, PostgresRenderTaskRepository,
    RenderTaskStore,
};
use draftline_services::{DraftCleanupService, DraftStore};
use draftline_worker::{
    CeleryRedisQueue, RenderConfig, RenderOrchestrator, RenderQueue, RenderRequest,
};

#[derive(Parser)]
#[command(name = "draftline", about = "Draft store and render task CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Draft store operations
    Drafts {
        #[command(subcommand)]
        sub: DraftCommands,
    },
    /// Dispatch a render for a stored draft
    Render {
        /// Draft ID
        draft_id: String,
        /// Output resolution, e.g. 1080P
        #[arg(long)]
        resolution: Option<String>,
        /// Output framerate, e.g. 30fps
        #[arg(long)]
        framerate: Option<String>,
        /// Name for the rendered video
        #[arg(long)]
        name: Option<String>,
        /// Return right after dispatch. Nothing in this process then records
        /// the render outcome; the task stays as the worker last patched it.
        #[arg(long)]
        detach: bool,
    },
    /// Render task bookkeeping
    Tasks {
        #[command(subcommand)]
        sub: TaskCommands,
    },
}

#[derive(Subcommand)]
enum DraftCommands {
    /// Store a draft document read from a JSON file
    Save {
        /// Draft ID
        draft_id: String,
        /// Path to the draft JSON
        file: PathBuf,
        /// Record where the draft came from: api or mcp
        #[arg(long)]
        origin: Option<DraftOrigin>,
    },
    /// Print a draft document
    Show {
        /// Draft ID
        draft_id: String,
    },
    /// Print stored metadata for a draft
    Info {
        /// Draft ID
        draft_id: String,
    },
    /// Check whether a draft exists
    Exists {
        /// Draft ID
        draft_id: String,
    },
    /// List recently updated drafts
    List {
        /// Maximum number of items
        #[arg(long, default_value = "100")]
        limit: usize,
    },
    /// Filter recent drafts by dimensions and duration
    Search {
        #[arg(long)]
        width: Option<i32>,
        #[arg(long)]
        height: Option<i32>,
        /// Minimum duration in microseconds
        #[arg(long)]
        min_duration: Option<i64>,
        /// Maximum duration in microseconds
        #[arg(long)]
        max_duration: Option<i64>,
    },
    /// Delete a draft
    Delete {
        /// Draft ID
        draft_id: String,
        /// Flag the row as deleted instead of removing it
        #[arg(long)]
        soft: bool,
    },
    /// Cache and backend statistics
    Stats,
    /// Remove drafts past the retention window
    Cleanup {
        /// Keep running and sweep every SECS seconds
        #[arg(long, value_name = "SECS")]
        every: Option<u64>,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Get a render task by ID
    Get {
        /// Task ID
        task_id: String,
    },
    /// List render tasks of a draft, newest first
    List {
        /// Draft ID
        draft_id: String,
    },
    /// Register a task row
    Create {
        /// Task ID
        task_id: String,
        /// Draft ID
        draft_id: String,
        /// Extra metadata as a JSON object
        #[arg(long)]
        extra: Option<String>,
    },
    /// Update one task, e.g. '{"status": "processing", "progress": 40}'
    Patch {
        /// Task ID
        task_id: String,
        /// Fields to update as a JSON object
        patch: String,
    },
    /// Update every task of a draft
    PatchByDraft {
        /// Draft ID
        draft_id: String,
        /// Fields to update as a JSON object
        patch: String,
    },
}

struct App {
    drafts: Arc<DraftStore>,
    orchestrator: RenderOrchestrator,
}

async fn build_app(config: &Config) -> anyhow::Result<App> {
    let pool = setup_database(config).await?;

    let backend: Arc<dyn DraftBackend> = Arc::new(PostgresDraftRepository::new(
        pool.clone(),
        config.draft_retention_days,
    ));
    let drafts = Arc::new(DraftStore::new(backend, config.memory_cache_size));
    let tasks: Arc<dyn RenderTaskStore> = Arc::new(PostgresRenderTaskRepository::new(pool));

    let queue = match CeleryRedisQueue::from_config(config)? {
        Some(queue) => {
            let queue: Arc<dyn RenderQueue> = Arc::new(queue);
            Some(queue)
        }
        None => {
            tracing::warn!("Render queue not configured, render dispatch is disabled");
            None
        }
    };

    let orchestrator = RenderOrchestrator::new(
        drafts.clone(),
        tasks,
        queue,
        RenderConfig::from_config(config),
    );

    Ok(App {
        drafts,
        orchestrator,
    })
}

async fn run_drafts(app: &App, sub: DraftCommands) -> anyhow::Result<()> {
    let drafts = &app.drafts;
    match sub {
        DraftCommands::Save {
            draft_id,
            file,
            origin,
        } => {
            let raw = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let document = DraftDocument::from_bytes(&raw)?;
            let outcome = drafts.save_with_origin(&draft_id, &document, origin).await?;
            print_json(&serde_json::json!({
                "draft_id": draft_id,
                "persisted": outcome.persisted,
            }))?;
        }
        DraftCommands::Show { draft_id } => {
            let document = drafts.fetch(&draft_id).await?;
            print_json(&document)?;
        }
        DraftCommands::Info { draft_id } => {
            let metadata = drafts.get_metadata(&draft_id).await?;
            print_json(&metadata)?;
        }
        DraftCommands::Exists { draft_id } => {
            let exists = drafts.exists(&draft_id).await?;
            print_json(&serde_json::json!({ "draft_id": draft_id, "exists": exists }))?;
        }
        DraftCommands::List { limit } => {
            let listed = drafts.list(limit).await?;
            print_json(&listed)?;
        }
        DraftCommands::Search {
            width,
            height,
            min_duration,
            max_duration,
        } => {
            let search = DraftSearch {
                width,
                height,
                min_duration,
                max_duration,
            };
            let result = drafts.search(&search).await?;
            print_json(&result)?;
        }
        DraftCommands::Delete { draft_id, soft } => {
            if soft {
                let deleted = drafts.soft_delete(&draft_id).await?;
                print_json(&serde_json::json!({ "draft_id": draft_id, "deleted": deleted }))?;
            } else {
                let outcome = drafts.remove(&draft_id).await?;
                print_json(&serde_json::json!({
                    "draft_id": draft_id,
                    "deleted": outcome.removed(),
                    "removed_from_cache": outcome.removed_from_cache,
                    "removed_from_store": outcome.removed_from_store,
                }))?;
            }
        }
        DraftCommands::Stats => {
            let stats = drafts.stats().await;
            print_json(&stats)?;
        }
        DraftCommands::Cleanup { every } => match every {
            None => {
                let removed = drafts.cleanup_expired().await?;
                print_json(&serde_json::json!({ "removed": removed }))?;
            }
            Some(secs) => {
                let service = Arc::new(DraftCleanupService::new(
                    drafts.clone(),
                    Duration::from_secs(secs.max(1)),
                ));
                let handle = service.start();
                tokio::signal::ctrl_c()
                    .await
                    .context("Failed to listen for shutdown signal")?;
                tracing::info!("Shutting down draft cleanup");
                handle.abort();
            }
        },
    }
    Ok(())
}

async fn run_tasks(app: &App, sub: TaskCommands) -> anyhow::Result<()> {
    let orchestrator = &app.orchestrator;
    match sub {
        TaskCommands::Get { task_id } => {
            let task = orchestrator.get_task(&task_id).await?;
            print_json(&task)?;
        }
        TaskCommands::List { draft_id } => {
            let tasks = orchestrator.list_tasks_for_draft(&draft_id).await?;
            print_json(&tasks)?;
        }
        TaskCommands::Create {
            task_id,
            draft_id,
            extra,
        } => {
            let extra = parse_extra(extra.as_deref())?;
            let task = orchestrator.create_task(&task_id, &draft_id, extra).await?;
            print_json(&task)?;
        }
        TaskCommands::Patch { task_id, patch } => {
            let patch = parse_patch(&patch)?;
            let task = orchestrator.patch_task(&task_id, &patch).await?;
            print_json(&task)?;
        }
        TaskCommands::PatchByDraft { draft_id, patch } => {
            let patch = parse_patch(&patch)?;
            let outcome = orchestrator.patch_tasks_by_draft(&draft_id, &patch).await?;
            print_json(&outcome)?;
        }
    }
    Ok(())
}

async fn run(cli: Cli, config: &Config) -> anyhow::Result<()> {
    let app = build_app(config).await?;

    match cli.command {
        Commands::Drafts { sub } => run_drafts(&app, sub).await?,
        Commands::Render {
            draft_id,
            resolution,
            framerate,
            name,
            detach,
        } => {
            let request = RenderRequest {
                draft_id,
                resolution,
                framerate,
                name,
            };
            let report = run_render(&app.orchestrator, request, detach).await?;
            print_json(&report)?;
        }
        Commands::Tasks { sub } => run_tasks(&app, sub).await?,
    }

    let pending = app.orchestrator.active_watchers();
    if pending > 0 {
        tracing::warn!(pending, "Exiting with render watchers still running");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.log_format);

    match run(cli, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let report = report_error(&err);
            match serde_json::to_string_pretty(&report) {
                Ok(out) => eprintln!("{}", out),
                Err(_) => eprintln!("{:#}", err),
            }
            ExitCode::FAILURE
        }
    }
}
