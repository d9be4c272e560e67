//! Lifecycle events emitted by the queue service and workers.
//!
//! Events go out on a single tokio broadcast channel owned by an [`EventBus`]. A
//! queue service and the workers driving it share one bus, so a subscriber sees the
//! events of one job in the order they happened: `job.active`, any number of
//! `job.progress`/`job.log`, then `job.completed` or `job.failed` (or
//! `worker.job.interrupted`).
//!
//! Subscribers that fall more than the channel capacity behind lose the oldest events
//! and get a `Lagged` error from the receiver; emitting never blocks.
//!
//! ```rust
//! use stevedore::events::{EventBus, QueueEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(16);
//! let mut rx = bus.subscribe();
//!
//! bus.emit(QueueEvent::QueuePaused { queue_name: "emails".to_string() });
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.kind(), "queue.paused");
//! # }
//! ```

use crate::job::{Job, JobId, JobLogEntry, JobProgress};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    JobAdded {
        job: Job,
    },
    JobActive {
        job: Job,
    },
    JobCompleted {
        job: Job,
        return_value: serde_json::Value,
    },
    /// Emitted for both retries and permanent failures; inspect `job.status()`.
    JobFailed {
        job: Job,
        error: String,
    },
    JobProgress {
        job_id: JobId,
        queue_name: String,
        progress: JobProgress,
    },
    JobLog {
        job_id: JobId,
        queue_name: String,
        entry: JobLogEntry,
    },
    JobLockExtended {
        job_id: JobId,
        queue_name: String,
        worker_id: String,
        lock_until: DateTime<Utc>,
    },
    JobStalled {
        job: Job,
    },
    QueuePaused {
        queue_name: String,
    },
    QueueResumed {
        queue_name: String,
    },
    QueueClosed {
        queue_name: String,
    },
    QueueError {
        queue_name: String,
        error: String,
    },
    WorkerJobActive {
        worker_id: String,
        job: Job,
    },
    WorkerJobProcessed {
        worker_id: String,
        job: Job,
        return_value: serde_json::Value,
    },
    WorkerJobErrored {
        worker_id: String,
        job: Job,
        error: String,
    },
    WorkerJobInterrupted {
        worker_id: String,
        job: Job,
    },
    WorkerError {
        worker_id: String,
        job_id: Option<JobId>,
        error: String,
    },
    WorkerClosed {
        worker_id: String,
    },
}

impl QueueEvent {
    /// Dotted event name, e.g. `job.lock.extended`.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueEvent::JobAdded { .. } => "job.added",
            QueueEvent::JobActive { .. } => "job.active",
            QueueEvent::JobCompleted { .. } => "job.completed",
            QueueEvent::JobFailed { .. } => "job.failed",
            QueueEvent::JobProgress { .. } => "job.progress",
            QueueEvent::JobLog { .. } => "job.log",
            QueueEvent::JobLockExtended { .. } => "job.lock.extended",
            QueueEvent::JobStalled { .. } => "job.stalled",
            QueueEvent::QueuePaused { .. } => "queue.paused",
            QueueEvent::QueueResumed { .. } => "queue.resumed",
            QueueEvent::QueueClosed { .. } => "queue.closed",
            QueueEvent::QueueError { .. } => "queue.error",
            QueueEvent::WorkerJobActive { .. } => "worker.job.active",
            QueueEvent::WorkerJobProcessed { .. } => "worker.job.processed",
            QueueEvent::WorkerJobErrored { .. } => "worker.job.errored",
            QueueEvent::WorkerJobInterrupted { .. } => "worker.job.interrupted",
            QueueEvent::WorkerError { .. } => "worker.error",
            QueueEvent::WorkerClosed { .. } => "worker.closed",
        }
    }

    /// The job this event is about, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            QueueEvent::JobAdded { job }
            | QueueEvent::JobActive { job }
            | QueueEvent::JobCompleted { job, .. }
            | QueueEvent::JobFailed { job, .. }
            | QueueEvent::JobStalled { job }
            | QueueEvent::WorkerJobActive { job, .. }
            | QueueEvent::WorkerJobProcessed { job, .. }
            | QueueEvent::WorkerJobErrored { job, .. }
            | QueueEvent::WorkerJobInterrupted { job, .. } => Some(job.id()),
            QueueEvent::JobProgress { job_id, .. }
            | QueueEvent::JobLog { job_id, .. }
            | QueueEvent::JobLockExtended { job_id, .. } => Some(job_id),
            QueueEvent::WorkerError { job_id, .. } => job_id.as_ref(),
            QueueEvent::QueuePaused { .. }
            | QueueEvent::QueueResumed { .. }
            | QueueEvent::QueueClosed { .. }
            | QueueEvent::QueueError { .. }
            | QueueEvent::WorkerClosed { .. } => None,
        }
    }
}

/// Broadcast hub shared by a queue service and its workers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: QueueEvent) {
        let kind = event.kind();
        if self.sender.send(event).is_err() {
            trace!(event = kind, "No subscribers for event");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::JobOptions;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_ok() {
        let bus = EventBus::new(4);
        bus.emit(QueueEvent::QueueClosed {
            queue_name: "q".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let job = Job::new(
            "q",
            "n",
            serde_json::json!({}),
            JobOptions::default(),
            Utc::now(),
        );

        bus.emit(QueueEvent::JobActive { job: job.clone() });
        bus.emit(QueueEvent::JobCompleted {
            job: job.clone(),
            return_value: serde_json::json!(1),
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.kind(), "job.active");
        assert_eq!(second.kind(), "job.completed");
        assert_eq!(second.job_id(), Some(job.id()));
    }

    #[test]
    fn test_serialized_tag() {
        let event = QueueEvent::QueueError {
            queue_name: "q".to_string(),
            error: "db down".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "queue_error");
        assert_eq!(json["error"], "db down");
    }
}
