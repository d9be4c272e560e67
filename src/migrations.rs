//! Database migrations for the PostgreSQL backend.
//!
//! Migrations are versioned and recorded in `stevedore_migrations`, so running them
//! again is a no-op. Each migration runs in its own transaction together with the
//! row that records it.
//!
//! The admin binary wraps this:
//!
//! ```bash
//! stevedore migrate --database-url postgresql://localhost/stevedore
//! stevedore status --database-url postgresql://localhost/stevedore
//! ```
//!
//! Or from code:
//!
//! ```rust,no_run
//! use stevedore::migrations::MigrationManager;
//!
//! # async fn example() -> stevedore::Result<()> {
//! let pool = sqlx::PgPool::connect("postgresql://localhost/stevedore").await?;
//! MigrationManager::new(pool).run_migrations().await?;
//! # Ok(())
//! # }
//! ```

use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};
use std::collections::HashSet;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Migration {
    pub id: &'static str,
    pub description: &'static str,
    pub version: u32,
}

#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub migration_id: String,
    pub executed_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}

struct MigrationScript {
    migration: Migration,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[MigrationScript] = &[
    MigrationScript {
        migration: Migration {
            id: "001_create_jobs",
            description: "Create stevedore_jobs table",
            version: 1,
        },
        statements: &[r#"
            CREATE TABLE IF NOT EXISTS stevedore_jobs (
                id TEXT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                name TEXT NOT NULL,
                payload JSONB NOT NULL,
                options JSONB NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                processed_on TIMESTAMPTZ,
                finished_on TIMESTAMPTZ,
                delay_until TIMESTAMPTZ,
                lock_until TIMESTAMPTZ,
                worker_id TEXT,
                attempts_made BIGINT NOT NULL DEFAULT 0,
                progress JSONB NOT NULL DEFAULT '0'::jsonb,
                logs JSONB NOT NULL DEFAULT '[]'::jsonb,
                return_value JSONB,
                failed_reason TEXT,
                stacktrace JSONB NOT NULL DEFAULT '[]'::jsonb
            )
            "#],
    },
    MigrationScript {
        migration: Migration {
            id: "002_job_indexes",
            description: "Indexes for fetching, stall detection and cleaning",
            version: 2,
        },
        statements: &[
            r#"
            CREATE INDEX IF NOT EXISTS idx_stevedore_jobs_fetch
                ON stevedore_jobs (queue_name, status, priority, created_at)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_stevedore_jobs_lock
                ON stevedore_jobs (queue_name, lock_until)
                WHERE status = 'active'
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_stevedore_jobs_finished
                ON stevedore_jobs (queue_name, status, finished_on)
            "#,
        ],
    },
    MigrationScript {
        migration: Migration {
            id: "003_stalled_count",
            description: "Track how often a job was recovered from a stall",
            version: 3,
        },
        statements: &[r#"
            ALTER TABLE stevedore_jobs
                ADD COLUMN IF NOT EXISTS stalled_count BIGINT NOT NULL DEFAULT 0
            "#],
    },
];

pub struct MigrationManager {
    pool: PgPool,
}

impl MigrationManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// All known migrations, ordered by version.
    pub fn migrations() -> Vec<Migration> {
        let mut migrations: Vec<Migration> =
            MIGRATIONS.iter().map(|m| m.migration.clone()).collect();
        migrations.sort_by_key(|m| m.version);
        migrations
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Starting migration process...");
        self.create_migration_table().await?;

        let executed: HashSet<String> = self
            .get_executed_migrations()
            .await?
            .into_iter()
            .map(|r| r.migration_id)
            .collect();

        let mut pending: Vec<&MigrationScript> = MIGRATIONS
            .iter()
            .filter(|m| !executed.contains(m.migration.id))
            .collect();
        pending.sort_by_key(|m| m.migration.version);

        if pending.is_empty() {
            info!("No pending migrations to run");
            return Ok(());
        }

        info!("Found {} pending migrations", pending.len());

        for script in pending {
            let migration = &script.migration;
            info!(
                "Running migration: {} - {}",
                migration.id, migration.description
            );
            let start_time = std::time::Instant::now();

            let mut tx = self.pool.begin().await?;
            for statement in script.statements {
                sqlx::query(*statement).execute(&mut *tx).await?;
            }
            let execution_time_ms = start_time.elapsed().as_millis() as i64;
            sqlx::query(
                r#"
                INSERT INTO stevedore_migrations (migration_id, executed_at, execution_time_ms)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(migration.id)
            .bind(Utc::now())
            .bind(execution_time_ms)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            info!(
                "Completed migration {} in {}ms",
                migration.id, execution_time_ms
            );
        }

        info!("All migrations completed successfully");
        Ok(())
    }

    /// Every known migration paired with whether it has been applied.
    pub async fn get_migration_status(&self) -> Result<Vec<(Migration, bool)>> {
        let executed: HashSet<String> = if self.migration_table_exists().await? {
            self.get_executed_migrations()
                .await?
                .into_iter()
                .map(|r| r.migration_id)
                .collect()
        } else {
            HashSet::new()
        };

        Ok(Self::migrations()
            .into_iter()
            .map(|m| {
                let applied = executed.contains(m.id);
                (m, applied)
            })
            .collect())
    }

    async fn migration_table_exists(&self) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT FROM information_schema.tables
                WHERE table_name = 'stevedore_migrations'
            ) AS exists
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("exists"))
    }

    async fn create_migration_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stevedore_migrations (
                migration_id TEXT PRIMARY KEY,
                executed_at TIMESTAMPTZ NOT NULL,
                execution_time_ms BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_executed_migrations(&self) -> Result<Vec<MigrationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT migration_id, executed_at, execution_time_ms
            FROM stevedore_migrations
            ORDER BY executed_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| MigrationRecord {
                migration_id: row.get("migration_id"),
                executed_at: row.get("executed_at"),
                execution_time_ms: row.get::<i64, _>("execution_time_ms").max(0) as u64,
            })
            .collect())
    }
}
