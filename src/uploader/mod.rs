pub mod policy;

use backoff::{future::retry, Error as BackoffError};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::api::{ApiClient, ApiError, ImageMetadata, MediaReference, ObservationApi, ObservationPayload};
use crate::bus::{RemovalReason, SubscriptionBus, TaskEvent};
use crate::models::*;
use crate::settings::UploaderConfig;
use crate::store::{Discarded, Snapshot, StoreError, TaskStore};

pub use policy::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum UploaderError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("task {id} is {status}, only failed tasks can be retried")]
    NotRetryable { id: TaskId, status: TaskStatus },
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// What one attempt on a task ended with.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed { observation_id: String },
    Retrying { delay: Duration, error: TaskError },
    Failed(TaskError),
    Discarded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Processed {
    pub task_id: TaskId,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Discard {
    /// The task was idle and is gone.
    Removed,
    /// The task is uploading; it is dropped once the in-flight call returns.
    Deferred,
}

struct Inner {
    store: TaskStore,
    bus: SubscriptionBus,
    api: Arc<dyn ObservationApi>,
    config: UploaderConfig,
    policy: RetryPolicy,
    // held for the whole of one attempt; serializes the drain
    drain: tokio::sync::Mutex<()>,
    wake: Notify,
    online: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
}

/// Drives queued observations to the server, one task at a time.
///
/// Cheap to clone; every clone shares the same store, bus and worker state.
#[derive(Clone)]
pub struct Uploader {
    inner: Arc<Inner>,
}

impl Uploader {
    pub fn new(store: TaskStore, api: Arc<dyn ObservationApi>, config: UploaderConfig) -> Result<Self, UploaderError> {
        let uploader = Self {
            inner: Arc::new(Inner {
                store,
                bus: SubscriptionBus::new(),
                api,
                policy: RetryPolicy::from_config(&config),
                config,
                drain: tokio::sync::Mutex::new(()),
                wake: Notify::new(),
                online: watch::channel(true).0,
                shutdown: watch::channel(false).0,
            }),
        };
        uploader.purge_discarded()?;
        Ok(uploader)
    }

    /// Opens the task store at `db_path` and talks to the real API.
    pub fn open(db_path: &Path, config: UploaderConfig) -> Result<Self, UploaderError> {
        let store = TaskStore::open(db_path)?;
        let api = ApiClient::new(config.api_prefix.clone(), config.request_timeout)?;
        Self::new(store, Arc::new(api), config)
    }

    pub fn store(&self) -> &TaskStore {
        &self.inner.store
    }

    pub fn bus(&self) -> &SubscriptionBus {
        &self.inner.bus
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.inner.config
    }

    pub fn pending(&self) -> Snapshot {
        self.inner.store.list()
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    pub fn set_online(&self, online: bool) {
        let was = self.inner.online.send_replace(online);
        if online && !was {
            tracing::info!("network available, resuming uploads");
        }
        self.inner.wake.notify_one();
    }

    /// Persists a new observation and wakes the worker.
    pub fn submit(&self, form: ObservationForm, extra: SubmissionExtra) -> Result<Task, UploaderError> {
        let task = self.inner.store.enqueue(Task::new(form, extra))?;
        tracing::info!(task_id = %task.id, images = task.form.images.len(), "observation queued");
        self.publish_status(&task, None);
        self.inner.wake.notify_one();
        Ok(task)
    }

    /// Puts a failed task back in the queue with a fresh attempt budget.
    pub fn retry(&self, id: TaskId) -> Result<Task, UploaderError> {
        let task = self
            .inner
            .store
            .requeue_from(id, TaskStatus::Failed, |t| {
                t.status = TaskStatus::Pending;
                t.retry_floor = t.attempts;
                t.last_error = None;
                t.next_attempt_at = None;
                t.discard_requested = false;
            })
            .map_err(|e| match e {
                StoreError::UnexpectedStatus { id, status } => UploaderError::NotRetryable { id, status },
                e => e.into(),
            })?;
        tracing::info!(task_id = %id, "manual retry");
        self.publish_status(&task, None);
        self.inner.wake.notify_one();
        Ok(task)
    }

    pub fn discard(&self, id: TaskId) -> Result<Discard, UploaderError> {
        match self.inner.store.discard(id)? {
            Discarded::Flagged(_) => {
                tracing::info!(task_id = %id, "discard requested during upload");
                Ok(Discard::Deferred)
            }
            Discarded::Removed(_) => {
                tracing::info!(task_id = %id, "observation discarded");
                self.inner.bus.publish(&TaskEvent::Removed { task_id: id, reason: RemovalReason::Discarded });
                Ok(Discard::Removed)
            }
        }
    }

    /// Spawns the background worker on the current tokio runtime.
    pub fn start(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.wake.notify_one();
    }

    async fn run(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut online = self.inner.online.subscribe();
        tracing::debug!("upload worker started");

        while !*shutdown.borrow() {
            let wait = match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) if self.is_online() => self.next_wakeup(),
                Ok(None) => None,
                Err(e) => {
                    tracing::error!(error = %e, "upload worker step failed");
                    Some(self.inner.config.backoff_base)
                }
            };

            tokio::select! {
                _ = self.inner.wake.notified() => {}
                _ = shutdown.changed() => {}
                _ = online.changed() => {}
                _ = sleep_for(wait) => {}
            }
        }
        tracing::debug!("upload worker stopped");
    }

    /// Time until the earliest pending task becomes due, if any are queued.
    pub fn next_wakeup(&self) -> Option<Duration> {
        let now = now_millis();
        self.inner
            .store
            .list()
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && !t.discard_requested)
            .map(|t| t.next_attempt_at.unwrap_or(now))
            .min()
            .map(|at| Duration::from_millis(at.saturating_sub(now).max(0) as u64))
    }

    /// Runs the first due task through one attempt. `None` when nothing is due
    /// or the device is offline.
    pub async fn process_next(&self) -> Result<Option<Processed>, UploaderError> {
        let _drain = self.inner.drain.lock().await;
        if !self.is_online() {
            return Ok(None);
        }

        let now = now_millis();
        let Some(task) = self.inner.store.list().iter().find(|t| t.is_due(now)).cloned() else {
            return Ok(None);
        };

        let task_id = task.id;
        let span = tracing::info_span!("upload", %task_id, attempt = task.attempts + 1);
        let outcome = match self.attempt(task).instrument(span).await {
            Ok(outcome) => outcome,
            // removed by a discard while idle; that path already published
            Err(StoreError::NotFound(id)) if id == task_id => Outcome::Discarded,
            Err(e) => return Err(e.into()),
        };
        Ok(Some(Processed { task_id, outcome }))
    }

    /// Processes tasks until none is pending, sleeping through backoff delays.
    pub async fn run_until_idle(&self) -> Result<Vec<Processed>, UploaderError> {
        let mut out = vec![];
        loop {
            if let Some(p) = self.process_next().await? {
                out.push(p);
                continue;
            }
            if !self.is_online() {
                break;
            }
            match self.next_wakeup() {
                Some(wait) => tokio::time::sleep(wait).await,
                None => break,
            }
        }
        Ok(out)
    }

    async fn attempt(&self, task: Task) -> Result<Outcome, StoreError> {
        let id = task.id;
        let task = self.transition(id, |t| {
            t.status = TaskStatus::UploadingImages;
            t.attempts += 1;
            t.last_error = None;
            t.next_attempt_at = None;
        })?;
        tracing::info!(images = task.form.images.len(), done = task.media.len(), "upload attempt started");

        for attachment in task.form.images.iter().skip(task.media.len()) {
            let media = match self.upload_attachment(&task, attachment).await {
                Ok(media) => media,
                Err(e) => {
                    if self.discard_requested(id)? {
                        return Ok(self.finish_discard(id));
                    }
                    return self.fail_attempt(id, e);
                }
            };
            if self.inner.store.update(id, |t| t.media.push(media))?.discard_requested {
                return Ok(self.finish_discard(id));
            }
        }

        if self.discard_requested(id)? {
            return Ok(self.finish_discard(id));
        }
        let task = self.transition(id, |t| t.status = TaskStatus::UploadingObservation)?;

        let payload = ObservationPayload::new(&task.form, &task.extra, task.media.clone());
        let result = self.inner.api.upload_observation(&task.extra.url, &payload).await;

        if self.discard_requested(id)? {
            return Ok(self.finish_discard(id));
        }
        match result {
            Ok(record) => {
                let done = self.inner.store.update(id, |t| t.status = TaskStatus::Complete)?;
                if done.discard_requested {
                    return Ok(self.finish_discard(id));
                }
                self.publish_status(&done, None);
                self.inner.store.remove(id)?;
                tracing::info!(observation_id = %record.id, "observation uploaded");
                self.inner.bus.publish(&TaskEvent::Removed { task_id: id, reason: RemovalReason::Completed });
                Ok(Outcome::Completed { observation_id: record.id })
            }
            Err(e) => self.fail_attempt(id, e),
        }
    }

    async fn upload_attachment(&self, task: &Task, attachment: &ImageAttachment) -> Result<MediaReference, ApiError> {
        let api = &self.inner.api;
        let center_id = task.extra.center_id.as_str();
        let metadata = ImageMetadata::for_attachment(&task.form, attachment);
        let max_retries = self.inner.config.attachment_retries;
        let tries = AtomicU32::new(0);

        let operation = || async {
            let n = tries.fetch_add(1, Ordering::Relaxed);
            match api.upload_image(attachment, center_id, &metadata).await {
                Ok(media) => Ok(media),
                Err(e) if e.is_retryable() && n < max_retries => {
                    tracing::debug!(file = attachment.file_name(), error = %e, "attachment upload retry");
                    Err(BackoffError::transient(e))
                }
                Err(e) => Err(BackoffError::permanent(e)),
            }
        };

        retry(policy::attachment_backoff(&self.inner.config), operation).await
    }

    fn fail_attempt(&self, id: TaskId, err: ApiError) -> Result<Outcome, StoreError> {
        let task = self.inner.store.get(id)?;
        let error = err.to_task_error();
        let exhausted = task.budget_used() >= self.inner.config.max_attempts;

        if !err.is_retryable() || exhausted {
            tracing::warn!(error = %err, attempts = task.attempts, exhausted, "upload failed");
            let failed = error.clone();
            let task = self.inner.store.update(id, move |t| {
                t.status = TaskStatus::Failed;
                t.last_error = Some(failed);
                t.next_attempt_at = None;
            })?;
            if task.discard_requested {
                return Ok(self.finish_discard(id));
            }
            self.publish_status(&task, task.last_error.clone());
            return Ok(Outcome::Failed(error));
        }

        let delay = self.inner.policy.delay_for(task.budget_used());
        let at = now_millis() + delay.as_millis() as i64;
        tracing::warn!(error = %err, attempts = task.attempts, delay_ms = delay.as_millis() as u64, "upload will be retried");
        let task = self.inner.store.requeue(id, |t| {
            t.status = TaskStatus::Pending;
            t.next_attempt_at = Some(at);
        })?;
        if task.discard_requested {
            return Ok(self.finish_discard(id));
        }
        self.publish_status(&task, Some(error.clone()));
        Ok(Outcome::Retrying { delay, error })
    }

    fn transition<F>(&self, id: TaskId, mutation: F) -> Result<Task, StoreError>
    where
        F: FnOnce(&mut Task),
    {
        let task = self.inner.store.update(id, mutation)?;
        self.publish_status(&task, task.last_error.clone());
        Ok(task)
    }

    fn publish_status(&self, task: &Task, error: Option<TaskError>) {
        self.inner.bus.publish(&TaskEvent::StatusChanged {
            task_id: task.id,
            status: task.status,
            attempts: task.attempts,
            error,
        });
    }

    fn discard_requested(&self, id: TaskId) -> Result<bool, StoreError> {
        Ok(self.inner.store.get(id)?.discard_requested)
    }

    fn finish_discard(&self, id: TaskId) -> Outcome {
        match self.inner.store.remove(id) {
            Ok(_) | Err(StoreError::NotFound(_)) => {}
            Err(e) => tracing::error!(task_id = %id, error = %e, "could not remove discarded task"),
        }
        tracing::info!(task_id = %id, "in-flight result dropped for discarded task");
        self.inner.bus.publish(&TaskEvent::Removed { task_id: id, reason: RemovalReason::Discarded });
        Outcome::Discarded
    }

    /// Drops tasks whose discard was requested before the last shutdown.
    fn purge_discarded(&self) -> Result<(), StoreError> {
        let stale: Vec<TaskId> = self.inner.store.list().iter().filter(|t| t.discard_requested).map(|t| t.id).collect();
        for id in stale {
            self.inner.store.remove(id)?;
        }
        Ok(())
    }
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}
