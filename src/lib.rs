//! # Stevedore
//!
//! A durable, database-backed job queue for Rust.
//!
//! Producers add jobs with options (priority, delay, retries with backoff). Workers
//! claim jobs atomically, process them one at a time, and report the outcome. Jobs
//! whose worker crashed are recovered automatically once their lock expires.
//!
//! ## Features
//!
//! - **Atomic claim-and-lock**: a job is processed by at most one worker at a time
//! - **Retries with backoff**: fixed, exponential (capped, jittered) or custom strategies
//! - **Stalled-job recovery**: a maintenance loop requeues or fails jobs left behind
//! - **Graceful shutdown**: workers wait for the in-flight job before closing
//! - **Events**: every lifecycle step is published on a broadcast channel
//! - **Pluggable storage**: an in-memory repository and a PostgreSQL one
//!
//! ## Quick Start
//!
//! ```rust
//! use stevedore::{
//!     JobStatus, QueueService, Worker,
//!     config::{QueueConfig, WorkerConfig},
//!     options::JobOptionsPatch,
//!     repository::InMemoryJobRepository,
//!     retry::BackoffStrategy,
//!     worker::{JobContext, processor_fn},
//! };
//! use serde_json::json;
//! use std::{sync::Arc, time::Duration};
//!
//! #[tokio::main]
//! async fn main() -> stevedore::Result<()> {
//!     let repo = Arc::new(InMemoryJobRepository::new());
//!     let queue = Arc::new(QueueService::new("emails", repo, QueueConfig::default()));
//!     queue.start_maintenance().await;
//!
//!     let job = queue
//!         .add(
//!             "send-email",
//!             json!({"to": "a@b.com"}),
//!             JobOptionsPatch::new()
//!                 .attempts(3)
//!                 .backoff(BackoffStrategy::exponential(Duration::from_millis(100))),
//!         )
//!         .await?;
//!
//!     let processor = processor_fn(|ctx: JobContext| async move {
//!         ctx.log(format!("sending to {}", ctx.payload()["to"]));
//!         Ok(json!({"status": "sent"}))
//!     });
//!     let config = WorkerConfig {
//!         poll_interval: Duration::from_millis(10),
//!         ..Default::default()
//!     };
//!     let worker = Worker::new(queue.clone(), processor, config)?;
//!     let mut events = queue.subscribe();
//!     worker.run().await?;
//!
//!     while events.recv().await.map(|e| e.kind()) != Ok("job.completed") {}
//!
//!     worker.close().await;
//!     queue.close().await;
//!
//!     let stored = queue.get_job(job.id()).await?.unwrap();
//!     assert_eq!(stored.status(), JobStatus::Completed);
//!     Ok(())
//! }
//! ```
//!
//! ## Core Concepts
//!
//! ### Jobs
//!
//! A [`Job`] moves through `waiting`, `delayed`, `active`, `completed` and `failed`
//! (plus `paused`). Its fields are private; every change goes through a transition
//! method that enforces the state machine.
//!
//! ### Queue service
//!
//! [`QueueService`] owns the lifecycle decisions: when a failed job is retried, when
//! it fails for good, which jobs count as stalled. Storage is reached only through
//! the [`JobRepository`](repository::JobRepository) trait.
//!
//! ### Workers
//!
//! A [`Worker`] polls one queue, renews the lock of the job it is processing and
//! reports the outcome. Attempts are counted when a job is claimed.
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL repository and migrations
//! - `cli` - the `stevedore` admin binary

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod logging;
pub mod options;
pub mod queue;
pub mod repository;
pub mod retry;
pub mod worker;

#[cfg(feature = "postgres")]
pub mod migrations;

pub use clock::{Clock, MockClock, SharedClock, SystemClock};
pub use config::StevedoreConfig;
pub use error::{ProcessingFailure, StevedoreError};
pub use events::{EventBus, QueueEvent};
pub use job::{Job, JobId, JobLogEntry, JobProgress, JobStatus, LogLevel};
pub use options::{JobOptions, JobOptionsPatch, RemovalPolicy};
pub use queue::{NewJob, QueueService};
pub use repository::{InMemoryJobRepository, JobRepository};
pub use retry::BackoffStrategy;
pub use worker::{JobContext, Processor, Worker, WorkerState, processor_fn};

#[cfg(feature = "postgres")]
pub use repository::PostgresJobRepository;

/// Convenient type alias for Results with [`StevedoreError`] as the error type.
pub type Result<T> = std::result::Result<T, StevedoreError>;
