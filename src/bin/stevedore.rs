//! Admin tool for Stevedore job queues stored in PostgreSQL.
//!
//! Usage:
//!   stevedore migrate --database-url postgresql://localhost/stevedore
//!   stevedore status
//!   stevedore counts --queue emails
//!   stevedore clean --queue emails --grace 1h --limit 1000 --status completed
//!   stevedore enqueue --queue emails --name send-email --payload '{"to":"a@b.com"}'

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{sync::Arc, time::Duration};
use stevedore::{
    JobStatus, QueueService, StevedoreConfig,
    clock::system_clock,
    config::duration_str::parse_duration,
    logging::init_logging,
    migrations::MigrationManager,
    options::JobOptionsPatch,
    repository::PostgresJobRepository,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "stevedore")]
#[command(about = "Manage Stevedore job queues")]
#[command(version, propagate_version = true)]
struct Cli {
    #[arg(
        long = "database-url",
        env = "STEVEDORE_DATABASE_URL",
        global = true,
        help = "Database connection URL",
        value_name = "URL"
    )]
    database_url: Option<String>,

    #[arg(long, global = true, help = "Load configuration from a TOML file")]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Run pending database migrations")]
    Migrate,

    #[command(about = "Show migration status")]
    Status,

    #[command(about = "Count jobs per status")]
    Counts {
        #[arg(long, help = "Queue name")]
        queue: String,
    },

    #[command(about = "Delete old finished jobs")]
    Clean {
        #[arg(long, help = "Queue name")]
        queue: String,

        #[arg(long, default_value = "1h", value_parser = parse_duration, help = "Only jobs older than this, e.g. 30s, 15m, 24h")]
        grace: Duration,

        #[arg(long, default_value_t = 1000, help = "Maximum number of jobs to delete")]
        limit: usize,

        #[arg(long, value_parser = parse_status, help = "Only jobs with this status")]
        status: Option<JobStatus>,
    },

    #[command(about = "Add a job to a queue")]
    Enqueue {
        #[arg(long, help = "Queue name")]
        queue: String,

        #[arg(long, help = "Job name")]
        name: String,

        #[arg(long, default_value = "{}", help = "JSON payload")]
        payload: String,

        #[arg(long, help = "Priority, lower runs first")]
        priority: Option<i32>,

        #[arg(long, help = "Maximum number of attempts")]
        attempts: Option<u32>,
    },
}

fn parse_status(s: &str) -> std::result::Result<JobStatus, String> {
    s.parse().map_err(|e: stevedore::StevedoreError| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => StevedoreConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => StevedoreConfig::from_env()?,
    };
    if let Some(url) = &cli.database_url {
        config = config.with_database_url(url);
    }
    init_logging(&config.logging)?;

    match cli.command {
        Command::Migrate => {
            let repo = connect(&config).await?;
            MigrationManager::new(repo.pool().clone())
                .run_migrations()
                .await?;
            println!("Migrations completed");
        }
        Command::Status => {
            let repo = connect(&config).await?;
            let status = MigrationManager::new(repo.pool().clone())
                .get_migration_status()
                .await?;
            for (migration, applied) in status {
                let mark = if applied { "applied" } else { "pending" };
                println!(
                    "{:>3}  {:<24} {:<8} {}",
                    migration.version, migration.id, mark, migration.description
                );
            }
        }
        Command::Counts { queue } => {
            let service = queue_service(&config, queue).await?;
            let counts = service.count_jobs_by_status(None).await?;
            for status in JobStatus::ALL {
                println!(
                    "{:<10} {}",
                    status.as_str(),
                    counts.get(&status).copied().unwrap_or(0)
                );
            }
        }
        Command::Clean {
            queue,
            grace,
            limit,
            status,
        } => {
            let service = queue_service(&config, queue).await?;
            let removed = service.clean(grace, limit, status).await?;
            println!("Removed {} jobs", removed);
        }
        Command::Enqueue {
            queue,
            name,
            payload,
            priority,
            attempts,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            let mut options = JobOptionsPatch::new();
            if let Some(priority) = priority {
                options = options.priority(priority);
            }
            if let Some(attempts) = attempts {
                options = options.attempts(attempts);
            }

            let service = queue_service(&config, queue).await?;
            let job = service.add(name, payload, options).await?;
            info!(job_id = %job.id(), "Job enqueued");
            println!("{}", job.id());
        }
    }

    Ok(())
}

async fn connect(config: &StevedoreConfig) -> Result<PostgresJobRepository> {
    anyhow::ensure!(
        !config.database.url.is_empty(),
        "No database URL, pass --database-url or set STEVEDORE_DATABASE_URL"
    );
    let repo = PostgresJobRepository::connect(&config.database, system_clock())
        .await
        .context("Failed to connect to database")?;
    Ok(repo)
}

async fn queue_service(
    config: &StevedoreConfig,
    queue: String,
) -> Result<QueueService<PostgresJobRepository>> {
    let repo = connect(config).await?;
    Ok(QueueService::new(queue, Arc::new(repo), config.queue.clone()))
}
