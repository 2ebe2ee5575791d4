//! CLI for operating background migrations
//!
//! `run` performs one scheduler tick and is meant to be called from cron. Every command
//! prints one JSON object per line on stdout; logs go to stderr.

use std::sync::Arc;

use anyhow::{Context, Result};
use background_migrations::builtin::register_builtins;
use background_migrations::{
    BackgroundMigrations, Config, EnqueueOptions, Job, Migration, MigrationRegistry,
    PostgresMigrationStore, Progress,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "background_migrations")]
#[command(about = "Batched background data migrations for PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update the bookkeeping tables
    Migrate,

    /// List top-level migrations
    List,

    /// Enqueue a registered migration
    Enqueue {
        name: String,
        /// JSON arguments passed to the migration
        #[arg(long, default_value = "null")]
        arguments: String,
        #[arg(long)]
        batch_size: Option<i64>,
        #[arg(long)]
        sub_batch_size: Option<i64>,
        #[arg(long)]
        batch_pause_ms: Option<i64>,
        #[arg(long)]
        sub_batch_pause_ms: Option<i64>,
        #[arg(long)]
        max_attempts: Option<i32>,
        #[arg(long)]
        min_value: Option<i64>,
        #[arg(long)]
        max_value: Option<i64>,
    },

    /// Show progress of a migration
    Status { id: Uuid },

    /// Pause a migration
    Pause { id: Uuid },

    /// Resume a paused migration
    Resume { id: Uuid },

    /// Reset failed jobs and re-enqueue the migration
    Retry { id: Uuid },

    /// Delete a migration with its jobs and children
    Delete { id: Uuid },

    /// Run one scheduler tick
    Run {
        #[arg(long)]
        shard: Option<String>,
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
    },

    /// Run a migration to completion (not available in production)
    RunAll { id: Uuid },
}

// ============================================================================
// JSON Response Types
// ============================================================================

#[derive(Serialize, Default)]
struct Response {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    migration: Option<Migration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    migrations: Option<Vec<Migration>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<Progress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    jobs: Option<Vec<Job>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<usize>,
}

fn output(resp: Response) -> Result<()> {
    println!("{}", serde_json::to_string(&resp)?);
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,background_migrations=debug,sqlx=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let store = PostgresMigrationStore::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    if let Commands::Migrate = cli.command {
        store.migrate().await?;
        return output(Response {
            success: true,
            message: Some("schema is up to date".to_string()),
            ..Default::default()
        });
    }

    let mut registry = MigrationRegistry::new();
    register_builtins(&mut registry, store.pool().clone())?;
    let migrations = BackgroundMigrations::new(
        Arc::new(store),
        Arc::new(registry),
        config.settings(),
    );

    let result = run(&migrations, cli.command).await;
    if let Err(err) = &result {
        output(Response {
            success: false,
            message: Some(format!("{:#}", err)),
            ..Default::default()
        })?;
    }
    result
}

async fn run(migrations: &BackgroundMigrations, command: Commands) -> Result<()> {
    match command {
        Commands::Migrate => Ok(()),
        Commands::List => output(Response {
            success: true,
            migrations: Some(migrations.list().await?),
            ..Default::default()
        }),
        Commands::Enqueue {
            name,
            arguments,
            batch_size,
            sub_batch_size,
            batch_pause_ms,
            sub_batch_pause_ms,
            max_attempts,
            min_value,
            max_value,
        } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&arguments).context("--arguments must be valid JSON")?;
            let options = EnqueueOptions {
                arguments,
                batch_size,
                sub_batch_size,
                batch_pause_ms,
                sub_batch_pause_ms,
                batch_max_attempts: max_attempts,
                min_value,
                max_value,
                ..Default::default()
            };

            let result = migrations.enqueue(&name, options).await?;
            let message = if result.is_created() {
                "enqueued"
            } else {
                "already enqueued"
            };
            output(Response {
                success: true,
                message: Some(message.to_string()),
                migration: Some(result.into_migration()),
                ..Default::default()
            })
        }
        Commands::Status { id } => output(Response {
            success: true,
            migration: Some(migrations.find(id).await?),
            progress: Some(migrations.progress(id).await?),
            ..Default::default()
        }),
        Commands::Pause { id } => output(Response {
            success: true,
            migration: Some(migrations.pause(id).await?),
            ..Default::default()
        }),
        Commands::Resume { id } => output(Response {
            success: true,
            migration: Some(migrations.resume(id).await?),
            ..Default::default()
        }),
        Commands::Retry { id } => {
            let reset = migrations.retry_failed_jobs(id).await?;
            output(Response {
                success: true,
                count: Some(reset),
                migration: Some(migrations.find(id).await?),
                ..Default::default()
            })
        }
        Commands::Delete { id } => {
            let deleted = migrations.delete(id).await?;
            output(Response {
                success: deleted,
                message: (!deleted).then(|| format!("Migration {} not found", id)),
                ..Default::default()
            })
        }
        Commands::Run { shard, concurrency } => {
            let dispatched = migrations
                .scheduler()
                .run(shard.as_deref(), concurrency)
                .await?;
            output(Response {
                success: true,
                count: Some(dispatched),
                ..Default::default()
            })
        }
        Commands::RunAll { id } => {
            migrations.run_all_migration_jobs(id).await?;
            output(Response {
                success: true,
                migration: Some(migrations.find(id).await?),
                jobs: Some(migrations.jobs(id).await?),
                ..Default::default()
            })
        }
    }
}
