//! Worker runtime: polls one queue and runs a processor over each claimed job.
//!
//! A [`Worker`] processes jobs strictly one at a time. Run several workers against
//! the same queue for parallelism; the claim protocol keeps them from picking up the
//! same job.
//!
//! While a job is processed its lock is renewed every
//! [`renew_interval`](crate::config::WorkerConfig::renew_interval). If the worker
//! dies, the lock runs out and the queue's maintenance loop hands the job to someone
//! else.
//!
//! # Examples
//!
//! ```rust
//! use stevedore::{
//!     QueueService, Worker, JobProgress,
//!     config::{QueueConfig, WorkerConfig},
//!     options::JobOptionsPatch,
//!     repository::InMemoryJobRepository,
//!     worker::{JobContext, processor_fn},
//! };
//! use serde_json::json;
//! use std::{sync::Arc, time::Duration};
//!
//! # #[tokio::main]
//! # async fn main() -> stevedore::Result<()> {
//! let repo = Arc::new(InMemoryJobRepository::new());
//! let queue = Arc::new(QueueService::new("emails", repo, QueueConfig::default()));
//!
//! let processor = processor_fn(|ctx: JobContext| async move {
//!     ctx.update_progress(JobProgress::Number(50.0));
//!     let to = ctx.payload()["to"].as_str().unwrap_or_default().to_string();
//!     ctx.log(format!("sending to {}", to));
//!     Ok(json!({"status": "sent"}))
//! });
//!
//! let config = WorkerConfig {
//!     poll_interval: Duration::from_millis(10),
//!     ..Default::default()
//! };
//! let worker = Worker::new(queue.clone(), processor, config)?;
//! worker.run().await?;
//!
//! queue.add("send-email", json!({"to": "a@b.com"}), JobOptionsPatch::new()).await?;
//! # tokio::time::sleep(Duration::from_millis(100)).await;
//! worker.close().await;
//! # Ok(())
//! # }
//! ```

use crate::{
    Result, StevedoreError,
    config::WorkerConfig,
    error::ProcessingFailure,
    events::QueueEvent,
    job::{Job, JobId, JobProgress, LogLevel},
    queue::QueueService,
    repository::JobRepository,
};
use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, sleep},
};
use tracing::{debug, error, info, warn};

/// Outcome of a processor run: a return value to store, or the failure to record.
pub type ProcessorResult = std::result::Result<serde_json::Value, ProcessingFailure>;

/// The business logic run for every job.
pub type Processor = Arc<
    dyn Fn(JobContext) -> Pin<Box<dyn Future<Output = ProcessorResult> + Send>> + Send + Sync,
>;

/// Wrap an async closure as a [`Processor`].
pub fn processor_fn<F, Fut>(func: F) -> Processor
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProcessorResult> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(func(ctx)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Closing,
    Closed,
}

enum JobUpdate {
    Progress(JobProgress),
    Log(String, LogLevel),
}

/// What a processor sees of the job it runs.
///
/// Progress and log updates are forwarded to the queue in the background. They never
/// fail from the processor's point of view; problems surface as `worker.error` events.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    worker_id: String,
    updates: mpsc::UnboundedSender<JobUpdate>,
}

impl JobContext {
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn id(&self) -> &JobId {
        self.job.id()
    }

    pub fn name(&self) -> &str {
        self.job.name()
    }

    pub fn payload(&self) -> &serde_json::Value {
        self.job.payload()
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// The attempt this run is, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.job.attempts_made()
    }

    pub fn update_progress(&self, progress: JobProgress) {
        let _ = self.updates.send(JobUpdate::Progress(progress));
    }

    pub fn log(&self, message: impl Into<String>) {
        self.log_with_level(message, LogLevel::Info);
    }

    pub fn log_with_level(&self, message: impl Into<String>, level: LogLevel) {
        let _ = self.updates.send(JobUpdate::Log(message.into(), level));
    }
}

struct WorkerShared {
    state: StdMutex<WorkerState>,
    shutdown: watch::Sender<bool>,
    abandon: AtomicBool,
    current_job: StdMutex<Option<JobId>>,
}

impl WorkerShared {
    fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    fn current_job(&self) -> Option<JobId> {
        self.current_job
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn set_current_job(&self, job_id: Option<JobId>) {
        *self.current_job.lock().unwrap_or_else(|p| p.into_inner()) = job_id;
    }
}

pub struct Worker<R: JobRepository> {
    queue: Arc<QueueService<R>>,
    processor: Processor,
    config: WorkerConfig,
    worker_id: String,
    shared: Arc<WorkerShared>,
    poll_loop: Mutex<Option<JoinHandle<()>>>,
}

impl<R: JobRepository + 'static> Worker<R> {
    pub fn new(queue: Arc<QueueService<R>>, processor: Processor, config: WorkerConfig) -> Result<Self> {
        config.validate()?;
        if config.concurrency > 1 {
            warn!(
                concurrency = config.concurrency,
                "Worker concurrency above 1 is not supported, run more workers instead"
            );
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            queue,
            processor,
            config,
            worker_id: uuid::Uuid::new_v4().to_string(),
            shared: Arc::new(WorkerShared {
                state: StdMutex::new(WorkerState::Idle),
                shutdown,
                abandon: AtomicBool::new(false),
                current_job: StdMutex::new(None),
            }),
            poll_loop: Mutex::new(None),
        })
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Whether a job is being processed right now.
    pub fn is_processing(&self) -> bool {
        self.shared.current_job().is_some()
    }

    /// Start polling in the background. Calling it again while running does nothing.
    pub async fn run(&self) -> Result<()> {
        let mut poll_loop = self.poll_loop.lock().await;
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|p| p.into_inner());
            match *state {
                WorkerState::Running => return Ok(()),
                WorkerState::Closing | WorkerState::Closed => {
                    return Err(StevedoreError::Worker {
                        message: format!("worker {} is closed", self.worker_id),
                    });
                }
                WorkerState::Idle => *state = WorkerState::Running,
            }
        }

        let runner = PollLoop {
            queue: self.queue.clone(),
            processor: self.processor.clone(),
            config: self.config.clone(),
            worker_id: self.worker_id.clone(),
            shared: self.shared.clone(),
            shutdown: self.shared.shutdown.subscribe(),
        };
        *poll_loop = Some(tokio::spawn(runner.run()));

        info!(
            worker_id = %self.worker_id,
            queue_name = self.queue.queue_name(),
            "Worker started"
        );
        Ok(())
    }

    /// Stop polling and wait for the in-flight job, up to the shutdown timeout.
    ///
    /// An outcome that arrives in time is persisted as usual. Past the timeout the job
    /// is abandoned: its late outcome is discarded and maintenance recovers it once the
    /// lock expires. Emits `worker.closed` exactly once.
    pub async fn close(&self) {
        let mut poll_loop = self.poll_loop.lock().await;
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|p| p.into_inner());
            match *state {
                WorkerState::Closing | WorkerState::Closed => return,
                WorkerState::Idle | WorkerState::Running => *state = WorkerState::Closing,
            }
        }

        info!(worker_id = %self.worker_id, "Worker closing");
        self.shared.shutdown.send_replace(true);

        if let Some(mut handle) = poll_loop.take() {
            let timeout = self.config.shutdown_timeout();
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(worker_id = %self.worker_id, "Poll loop ended abnormally: {}", e);
                }
                Err(_) => {
                    self.shared.abandon.store(true, Ordering::SeqCst);
                    let job_id = self.shared.current_job();
                    warn!(
                        worker_id = %self.worker_id,
                        ?timeout,
                        "Active job did not finish before shutdown timeout"
                    );
                    self.queue.events().emit(QueueEvent::WorkerError {
                        worker_id: self.worker_id.clone(),
                        job_id,
                        error: format!("shutdown timed out after {:?} with a job still active", timeout),
                    });
                }
            }
        }

        self.shared.set_state(WorkerState::Closed);
        info!(worker_id = %self.worker_id, "Worker closed");
        self.queue.events().emit(QueueEvent::WorkerClosed {
            worker_id: self.worker_id.clone(),
        });
    }
}

struct PollLoop<R: JobRepository> {
    queue: Arc<QueueService<R>>,
    processor: Processor,
    config: WorkerConfig,
    worker_id: String,
    shared: Arc<WorkerShared>,
    shutdown: watch::Receiver<bool>,
}

impl<R: JobRepository + 'static> PollLoop<R> {
    async fn run(mut self) {
        debug!(worker_id = %self.worker_id, "Poll loop started");

        loop {
            if self.shutdown_requested() {
                break;
            }

            if self.queue.is_paused() {
                if self.wait(self.config.poll_interval).await {
                    break;
                }
                continue;
            }

            match self
                .queue
                .fetch_next_job_and_lock(&self.worker_id, self.config.lock_duration)
                .await
            {
                Ok(Some(job)) => {
                    if self.shutdown_requested() {
                        info!(
                            worker_id = %self.worker_id,
                            job_id = %job.id(),
                            "Shutdown requested during fetch, leaving job to lock expiry"
                        );
                        break;
                    }
                    self.process(job).await;
                }
                Ok(None) => {
                    if self.wait(self.config.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.worker_id, "Error fetching job: {}", e);
                    self.emit_error(None, e.to_string());
                    if self.wait(self.config.poll_interval.saturating_mul(2)).await {
                        break;
                    }
                }
            }
        }

        debug!(worker_id = %self.worker_id, "Poll loop stopped");
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `duration`. Returns true if shutdown was requested meanwhile.
    async fn wait(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = sleep(duration) => self.shutdown_requested(),
            changed = self.shutdown.changed() => changed.is_err() || self.shutdown_requested(),
        }
    }

    async fn process(&self, job: Job) {
        let job_id = job.id().clone();
        self.shared.set_current_job(Some(job_id.clone()));
        debug!(worker_id = %self.worker_id, job_id = %job_id, "Processing job");
        self.queue.events().emit(QueueEvent::WorkerJobActive {
            worker_id: self.worker_id.clone(),
            job: job.clone(),
        });

        let (updates, update_rx) = mpsc::unbounded_channel();
        let reporter = tokio::spawn(report_updates(
            self.queue.clone(),
            job_id.clone(),
            self.worker_id.clone(),
            update_rx,
        ));
        let renewal = tokio::spawn(renew_lock(
            self.queue.clone(),
            job_id.clone(),
            self.worker_id.clone(),
            self.config.clone(),
            self.shared.clone(),
        ));

        let context = JobContext {
            job: job.clone(),
            worker_id: self.worker_id.clone(),
            updates,
        };
        let outcome = match tokio::spawn((self.processor)(context)).await {
            Ok(outcome) => outcome,
            Err(e) => Err(ProcessingFailure::new(format!("processor panicked: {}", e))),
        };

        renewal.abort();
        self.drain_updates(reporter).await;

        if self.shared.abandon.load(Ordering::SeqCst) {
            warn!(
                worker_id = %self.worker_id,
                job_id = %job_id,
                "Discarding outcome of abandoned job"
            );
            self.queue.events().emit(QueueEvent::WorkerJobInterrupted {
                worker_id: self.worker_id.clone(),
                job,
            });
        } else {
            self.report_outcome(job, outcome).await;
        }

        self.shared.set_current_job(None);
    }

    /// Let pending progress and log updates land before the outcome is recorded.
    async fn drain_updates(&self, reporter: JoinHandle<()>) {
        let abort = reporter.abort_handle();
        if tokio::time::timeout(self.config.renew_interval(), reporter)
            .await
            .is_err()
        {
            warn!(worker_id = %self.worker_id, "Job updates still pending, dropping them");
            abort.abort();
        }
    }

    async fn report_outcome(&self, job: Job, outcome: ProcessorResult) {
        match outcome {
            Ok(return_value) => {
                match self
                    .queue
                    .mark_job_as_completed(job.id(), &self.worker_id, return_value.clone())
                    .await
                {
                    Ok(true) => {
                        self.queue.events().emit(QueueEvent::WorkerJobProcessed {
                            worker_id: self.worker_id.clone(),
                            job,
                            return_value,
                        });
                    }
                    Ok(false) => {
                        debug!(job_id = %job.id(), "Completion ignored, job no longer owned");
                    }
                    Err(e) => {
                        error!(job_id = %job.id(), "Failed to complete job: {}", e);
                        self.emit_error(Some(job.id().clone()), e.to_string());
                    }
                }
            }
            Err(failure) => {
                match self
                    .queue
                    .mark_job_as_failed(job.id(), &self.worker_id, &failure)
                    .await
                {
                    Ok(true) => {
                        self.queue.events().emit(QueueEvent::WorkerJobErrored {
                            worker_id: self.worker_id.clone(),
                            job,
                            error: failure.message,
                        });
                    }
                    Ok(false) => {
                        debug!(job_id = %job.id(), "Failure ignored, job no longer owned");
                    }
                    Err(e) => {
                        error!(job_id = %job.id(), "Failed to record job failure: {}", e);
                        self.emit_error(Some(job.id().clone()), e.to_string());
                    }
                }
            }
        }
    }

    fn emit_error(&self, job_id: Option<JobId>, error: String) {
        self.queue.events().emit(QueueEvent::WorkerError {
            worker_id: self.worker_id.clone(),
            job_id,
            error,
        });
    }
}

async fn report_updates<R: JobRepository + 'static>(
    queue: Arc<QueueService<R>>,
    job_id: JobId,
    worker_id: String,
    mut updates: mpsc::UnboundedReceiver<JobUpdate>,
) {
    while let Some(update) = updates.recv().await {
        let result = match update {
            JobUpdate::Progress(progress) => {
                queue.update_job_progress(&job_id, &worker_id, progress).await
            }
            JobUpdate::Log(message, level) => {
                queue.add_job_log(&job_id, &worker_id, message, level).await
            }
        };

        if let Err(e) = result {
            warn!(job_id = %job_id, worker_id, "Failed to forward job update: {}", e);
            queue.events().emit(QueueEvent::WorkerError {
                worker_id: worker_id.clone(),
                job_id: Some(job_id.clone()),
                error: e.to_string(),
            });
        }
    }
}

async fn renew_lock<R: JobRepository + 'static>(
    queue: Arc<QueueService<R>>,
    job_id: JobId,
    worker_id: String,
    config: WorkerConfig,
    shared: Arc<WorkerShared>,
) {
    let period = config.renew_interval();
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if shared.abandon.load(Ordering::SeqCst) {
            break;
        }

        match queue
            .extend_job_lock(&job_id, &worker_id, config.lock_duration)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = %job_id, worker_id, "Lock lost, no longer renewing");
                break;
            }
            Err(e) => {
                error!(job_id = %job_id, worker_id, "Failed to renew lock: {}", e);
                queue.events().emit(QueueEvent::WorkerError {
                    worker_id: worker_id.clone(),
                    job_id: Some(job_id.clone()),
                    error: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::QueueConfig,
        job::JobStatus,
        options::JobOptionsPatch,
        repository::InMemoryJobRepository,
    };
    use serde_json::json;
    use tokio::sync::{Notify, broadcast};

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            lock_duration: Duration::from_millis(300),
            lock_renew_time_buffer: Some(Duration::from_millis(200)),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn setup() -> Arc<QueueService<InMemoryJobRepository>> {
        let repo = Arc::new(InMemoryJobRepository::new());
        Arc::new(QueueService::new("test", repo, QueueConfig::default()))
    }

    async fn wait_for(rx: &mut broadcast::Receiver<QueueEvent>, kind: &str) -> QueueEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.kind() == kind {
                    return event;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", kind))
    }

    fn returning(value: serde_json::Value) -> Processor {
        processor_fn(move |_ctx| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = WorkerConfig {
            poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(Worker::new(setup(), returning(json!(null)), config).is_err());
    }

    #[tokio::test]
    async fn test_processes_job_to_completion() {
        let queue = setup();
        let mut rx = queue.subscribe();
        let worker = Worker::new(queue.clone(), returning(json!({"ok": true})), test_config())
            .unwrap()
            .with_worker_id("w1");

        let job = queue.add("work", json!({}), JobOptionsPatch::new()).await.unwrap();
        worker.run().await.unwrap();
        worker.run().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Running);

        wait_for(&mut rx, "worker.job.processed").await;
        let stored = queue.get_job(job.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Completed);
        assert_eq!(stored.return_value(), Some(&json!({"ok": true})));

        worker.close().await;
        assert_eq!(worker.state(), WorkerState::Closed);
    }

    #[tokio::test]
    async fn test_failure_is_recorded() {
        let queue = setup();
        let mut rx = queue.subscribe();
        let processor = processor_fn(|_ctx| async { Err(ProcessingFailure::new("smtp down")) });
        let worker = Worker::new(queue.clone(), processor, test_config()).unwrap();

        let job = queue.add("work", json!({}), JobOptionsPatch::new()).await.unwrap();
        worker.run().await.unwrap();

        match wait_for(&mut rx, "worker.job.errored").await {
            QueueEvent::WorkerJobErrored { error, .. } => assert_eq!(error, "smtp down"),
            other => panic!("unexpected event {:?}", other.kind()),
        }
        let stored = queue.get_job(job.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Failed);
        assert_eq!(stored.failed_reason(), Some("smtp down"));
        worker.close().await;
    }

    #[tokio::test]
    async fn test_panicking_processor_fails_the_job() {
        let queue = setup();
        let mut rx = queue.subscribe();
        let processor = processor_fn(|ctx: JobContext| async move {
            if ctx.attempt() > 0 {
                panic!("handler bug");
            }
            Ok(json!(null))
        });
        let worker = Worker::new(queue.clone(), processor, test_config()).unwrap();

        let job = queue.add("work", json!({}), JobOptionsPatch::new()).await.unwrap();
        worker.run().await.unwrap();

        wait_for(&mut rx, "worker.job.errored").await;
        let stored = queue.get_job(job.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Failed);
        assert!(stored.failed_reason().unwrap().contains("panicked"));
        worker.close().await;
    }

    #[tokio::test]
    async fn test_progress_and_logs_land_before_completion() {
        let queue = setup();
        let mut rx = queue.subscribe();
        let processor = processor_fn(|ctx: JobContext| async move {
            ctx.update_progress(JobProgress::Number(50.0));
            ctx.log("halfway");
            Ok(json!(null))
        });
        let worker = Worker::new(queue.clone(), processor, test_config()).unwrap();

        let job = queue.add("work", json!({}), JobOptionsPatch::new()).await.unwrap();
        worker.run().await.unwrap();

        let mut kinds = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            kinds.push(event.kind());
            if event.kind() == "job.completed" {
                break;
            }
        }
        assert_eq!(
            kinds,
            vec![
                "job.added",
                "job.active",
                "worker.job.active",
                "job.progress",
                "job.log",
                "job.completed"
            ]
        );

        let stored = queue.get_job(job.id()).await.unwrap().unwrap();
        assert_eq!(stored.logs()[0].message, "halfway");
        worker.close().await;
    }

    #[tokio::test]
    async fn test_lock_is_renewed_while_processing() {
        let queue = setup();
        let mut rx = queue.subscribe();
        let processor = processor_fn(|_ctx| async {
            sleep(Duration::from_millis(450)).await;
            Ok(json!(null))
        });
        let worker = Worker::new(queue.clone(), processor, test_config()).unwrap();

        queue.add("slow", json!({}), JobOptionsPatch::new()).await.unwrap();
        worker.run().await.unwrap();

        wait_for(&mut rx, "job.lock.extended").await;
        wait_for(&mut rx, "worker.job.processed").await;
        worker.close().await;
    }

    #[tokio::test]
    async fn test_close_waits_for_active_job() {
        let queue = setup();
        let mut rx = queue.subscribe();
        let started = Arc::new(Notify::new());
        let signal = started.clone();
        let processor = processor_fn(move |_ctx| {
            let signal = signal.clone();
            async move {
                signal.notify_one();
                sleep(Duration::from_millis(100)).await;
                Ok(json!("done"))
            }
        });
        let worker = Worker::new(queue.clone(), processor, test_config()).unwrap();

        let first = queue.add("a", json!({}), JobOptionsPatch::new()).await.unwrap();
        worker.run().await.unwrap();
        started.notified().await;
        assert!(worker.is_processing());

        let second = queue.add("b", json!({}), JobOptionsPatch::new()).await.unwrap();
        worker.close().await;

        let first = queue.get_job(first.id()).await.unwrap().unwrap();
        assert_eq!(first.status(), JobStatus::Completed);
        let second = queue.get_job(second.id()).await.unwrap().unwrap();
        assert_eq!(second.status(), JobStatus::Waiting);

        wait_for(&mut rx, "worker.closed").await;
        assert!(worker.run().await.is_err());
    }

    #[tokio::test]
    async fn test_close_timeout_abandons_job() {
        let queue = setup();
        let mut rx = queue.subscribe();
        let started = Arc::new(Notify::new());
        let signal = started.clone();
        let processor = processor_fn(move |_ctx| {
            let signal = signal.clone();
            async move {
                signal.notify_one();
                sleep(Duration::from_millis(500)).await;
                Ok(json!("late"))
            }
        });
        let config = WorkerConfig {
            lock_duration: Duration::from_millis(100),
            lock_renew_time_buffer: Some(Duration::from_millis(50)),
            poll_interval: Duration::from_millis(10),
            shutdown_timeout_multiplier: 1,
            ..Default::default()
        };
        let worker = Worker::new(queue.clone(), processor, config).unwrap();

        let job = queue.add("a", json!({}), JobOptionsPatch::new()).await.unwrap();
        worker.run().await.unwrap();
        started.notified().await;
        worker.close().await;

        wait_for(&mut rx, "worker.error").await;
        wait_for(&mut rx, "worker.closed").await;
        wait_for(&mut rx, "worker.job.interrupted").await;

        let stored = queue.get_job(job.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Active);
    }

    #[tokio::test]
    async fn test_paused_queue_is_not_polled() {
        let queue = setup();
        queue.pause();
        let worker = Worker::new(queue.clone(), returning(json!(null)), test_config()).unwrap();

        let job = queue.add("work", json!({}), JobOptionsPatch::new()).await.unwrap();
        worker.run().await.unwrap();
        sleep(Duration::from_millis(50)).await;

        let stored = queue.get_job(job.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Waiting);
        worker.close().await;
    }

    #[tokio::test]
    async fn test_close_idle_worker_emits_closed_once() {
        let queue = setup();
        let mut rx = queue.subscribe();
        let worker = Worker::new(queue.clone(), returning(json!(null)), test_config()).unwrap();

        worker.close().await;
        worker.close().await;

        assert_eq!(rx.recv().await.unwrap().kind(), "worker.closed");
        assert!(rx.try_recv().is_err());
    }
}
