use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::SubscriptionId;
use crate::db;
use crate::logging::{self, LogBuffer};
use crate::models::*;
use crate::settings::UploaderConfig;
use crate::uploader::{Discard, Uploader};

/// Row shown in the pending-observations list.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct PendingObservation {
  pub id: TaskId,
  pub status: TaskStatus,
  pub attempts: u32,
  pub zone: String,
  pub location_name: String,
  pub start_date: String,
  pub images: usize,
  pub images_uploaded: usize,
  pub last_error: Option<TaskError>,
  pub next_attempt_at: Option<i64>,
  pub discard_requested: bool,
  pub created_at: String,
}

impl From<&Task> for PendingObservation {
  fn from(t: &Task) -> Self {
    PendingObservation {
      id: t.id,
      status: t.status,
      attempts: t.attempts,
      zone: t.form.zone.clone(),
      location_name: t.form.location_name.clone(),
      start_date: t.form.start_date.clone(),
      images: t.form.images.len(),
      images_uploaded: t.media.len(),
      last_error: t.last_error.clone(),
      next_attempt_at: t.next_attempt_at,
      discard_requested: t.discard_requested,
      created_at: t.created_at.clone(),
    }
  }
}

fn parse_id(task_id: &str) -> Result<TaskId, String> {
  TaskId::parse(task_id).map_err(|e| format!("invalid task id {task_id}: {e}"))
}

pub fn uploader_health(uploader: &Uploader) -> Result<serde_json::Value, String> {
  let tasks = uploader.pending();
  let failed = tasks.iter().filter(|t| t.status == TaskStatus::Failed).count();
  Ok(serde_json::json!({
    "ok": true,
    "online": uploader.is_online(),
    "queued": tasks.len() - failed,
    "failed": failed,
  }))
}

pub fn submit_observation(uploader: &Uploader, form: ObservationForm, extra: SubmissionExtra) -> Result<PendingObservation, String> {
  let task = uploader.submit(form, extra).map_err(|e| e.to_string())?;
  Ok(PendingObservation::from(&task))
}

pub fn list_pending_observations(uploader: &Uploader) -> Vec<PendingObservation> {
  uploader.pending().iter().map(PendingObservation::from).collect()
}

pub fn get_observation_task(uploader: &Uploader, task_id: String) -> Result<Task, String> {
  let id = parse_id(&task_id)?;
  uploader.store().get(id).map_err(|e| e.to_string())
}

pub fn retry_observation(uploader: &Uploader, task_id: String) -> Result<PendingObservation, String> {
  let id = parse_id(&task_id)?;
  let task = uploader.retry(id).map_err(|e| e.to_string())?;
  Ok(PendingObservation::from(&task))
}

pub fn discard_observation(uploader: &Uploader, task_id: String) -> Result<Discard, String> {
  let id = parse_id(&task_id)?;
  uploader.discard(id).map_err(|e| e.to_string())
}

pub fn set_network_available(uploader: &Uploader, online: bool) {
  uploader.set_online(online);
}

/// Pull-based view of the queue, refreshed on every bus notification.
///
/// UI bindings either read [`PendingObservations::current`] or await changes
/// on the receiver and feed them into their own state primitive.
pub struct PendingObservations {
  uploader: Uploader,
  subscription: SubscriptionId,
  rx: watch::Receiver<Vec<PendingObservation>>,
}

impl PendingObservations {
  pub fn attach(uploader: &Uploader) -> Self {
    let (tx, rx) = watch::channel(list_pending_observations(uploader));
    let source = uploader.clone();
    let subscription = uploader.bus().subscribe(move |_| {
      tx.send_replace(list_pending_observations(&source));
    });
    Self { uploader: uploader.clone(), subscription, rx }
  }

  pub fn current(&self) -> Vec<PendingObservation> {
    self.rx.borrow().clone()
  }

  pub fn receiver(&self) -> watch::Receiver<Vec<PendingObservation>> {
    self.rx.clone()
  }
}

impl Drop for PendingObservations {
  fn drop(&mut self) {
    // the handler holds an uploader clone; unsubscribing releases it
    self.uploader.bus().unsubscribe(self.subscription);
  }
}

/// Everything the app shell holds on to: the uploader, its worker and the log buffer.
pub struct AppState {
  pub uploader: Uploader,
  pub log: Option<Arc<LogBuffer>>,
  worker: JoinHandle<()>,
  flusher: Option<JoinHandle<()>>,
}

impl AppState {
  /// Opens the queue under `data_dir` and starts the worker. Must run inside a tokio runtime.
  pub fn start(data_dir: &Path, with_logging: bool) -> Result<AppState, String> {
    let p = db::paths(data_dir).map_err(|e| e.to_string())?;
    let config = {
      let conn = db::open(&p.db_path).map_err(|e| e.to_string())?;
      UploaderConfig::load(&conn).map_err(|e| e.to_string())?
    };

    let (log, flusher) = if with_logging {
      let buffer = logging::init(&p.log_dir, &config.log_filter).map_err(|e| e.to_string())?;
      let flusher = logging::spawn_flusher(buffer.clone(), std::time::Duration::from_secs(5));
      (Some(buffer), Some(flusher))
    } else {
      (None, None)
    };

    let uploader = Uploader::open(&p.db_path, config).map_err(|e| e.to_string())?;
    let worker = uploader.start();
    tracing::info!(path = %p.db_path.display(), "observation uploader started");

    Ok(AppState { uploader, log, worker, flusher })
  }

  pub async fn stop(self) {
    self.uploader.shutdown();
    if let Err(e) = self.worker.await {
      tracing::error!(error = %e, "upload worker ended abnormally");
    }
    if let Some(flusher) = self.flusher {
      flusher.abort();
    }
    if let Some(log) = &self.log {
      let _ = log.flush();
    }
  }
}
