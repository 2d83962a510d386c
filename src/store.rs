use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use thiserror::Error;

use crate::db::{self, DbError};
use crate::models::*;

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("invalid observation: {}", .0.join(", "))]
  Validation(Vec<String>),
  #[error("no task with id {0}")]
  NotFound(TaskId),
  #[error("task {id} is {status}")]
  UnexpectedStatus { id: TaskId, status: TaskStatus },
  #[error("invalid transition for task {id}: {reason}")]
  InvalidTransition { id: TaskId, reason: &'static str },
  #[error("corrupt task record {id}: {message}")]
  Corrupt { id: String, message: String },
  #[error("database error: {0}")]
  Db(#[from] DbError),
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("serialization error: {0}")]
  Serde(#[from] serde_json::Error),
}

/// What [`TaskStore::discard`] did with the task.
#[derive(Debug, Clone, PartialEq)]
pub enum Discarded {
  /// The task was idle and has been deleted.
  Removed(Task),
  /// The task is uploading; it now carries `discard_requested`.
  Flagged(Task),
}

/// Immutable view of the queue as of the last committed write.
pub type Snapshot = Arc<Vec<Task>>;

struct Writer {
  conn: Connection,
  next_seq: i64,
}

/// Durable, ordered task collection backed by SQLite.
///
/// Writes are serialized behind one connection and committed before the call
/// returns. Readers clone the current [`Snapshot`] and never block on writers.
pub struct TaskStore {
  writer: Mutex<Writer>,
  snapshot: RwLock<Snapshot>,
}

const SELECT_TASKS: &str = "SELECT id, status, attempts, retry_floor, form_json, extra_json, media_json, last_error_json, \
   next_attempt_at, discard_requested, created_at, updated_at, seq FROM tasks ORDER BY seq ASC";

struct RawRow {
  id: String,
  status: String,
  attempts: i64,
  retry_floor: i64,
  form_json: String,
  extra_json: String,
  media_json: String,
  last_error_json: Option<String>,
  next_attempt_at: Option<i64>,
  discard_requested: i64,
  created_at: String,
  updated_at: String,
  seq: i64,
}

impl RawRow {
  fn into_task(self) -> Result<Task, StoreError> {
    let corrupt = |message: String| StoreError::Corrupt { id: self.id.clone(), message };
    let id = TaskId::parse(&self.id).map_err(|e| corrupt(e.to_string()))?;
    let status = TaskStatus::parse(&self.status).ok_or_else(|| corrupt(format!("unknown status {}", self.status)))?;
    Ok(Task {
      id,
      form: serde_json::from_str(&self.form_json).map_err(|e| corrupt(e.to_string()))?,
      extra: serde_json::from_str(&self.extra_json).map_err(|e| corrupt(e.to_string()))?,
      status,
      attempts: self.attempts.max(0) as u32,
      retry_floor: self.retry_floor.max(0) as u32,
      media: serde_json::from_str(&self.media_json).map_err(|e| corrupt(e.to_string()))?,
      last_error: match &self.last_error_json {
        Some(s) => Some(serde_json::from_str(s).map_err(|e| corrupt(e.to_string()))?),
        None => None,
      },
      next_attempt_at: self.next_attempt_at,
      discard_requested: self.discard_requested != 0,
      created_at: self.created_at,
      updated_at: self.updated_at,
    })
  }
}

fn insert_row(conn: &Connection, task: &Task, seq: i64) -> Result<(), StoreError> {
  let last_error = task.last_error.as_ref().map(serde_json::to_string).transpose()?;
  conn.execute(
    "INSERT INTO tasks (id, seq, status, attempts, retry_floor, form_json, extra_json, media_json, last_error_json, \
     next_attempt_at, discard_requested, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
    params![
      task.id.to_string(),
      seq,
      task.status.as_str(),
      task.attempts,
      task.retry_floor,
      serde_json::to_string(&task.form)?,
      serde_json::to_string(&task.extra)?,
      serde_json::to_string(&task.media)?,
      last_error,
      task.next_attempt_at,
      task.discard_requested as i64,
      task.created_at,
      task.updated_at,
    ],
  )?;
  Ok(())
}

fn update_row(conn: &Connection, task: &Task, seq: Option<i64>) -> Result<(), StoreError> {
  let last_error = task.last_error.as_ref().map(serde_json::to_string).transpose()?;
  conn.execute(
    "UPDATE tasks SET status = ?2, attempts = ?3, retry_floor = ?4, form_json = ?5, extra_json = ?6, media_json = ?7, \
     last_error_json = ?8, next_attempt_at = ?9, discard_requested = ?10, updated_at = ?11, seq = COALESCE(?12, seq) \
     WHERE id = ?1",
    params![
      task.id.to_string(),
      task.status.as_str(),
      task.attempts,
      task.retry_floor,
      serde_json::to_string(&task.form)?,
      serde_json::to_string(&task.extra)?,
      serde_json::to_string(&task.media)?,
      last_error,
      task.next_attempt_at,
      task.discard_requested as i64,
      task.updated_at,
      seq,
    ],
  )?;
  Ok(())
}

fn check_transition(before: &Task, after: &Task) -> Result<(), StoreError> {
  let reason = if after.id != before.id {
    Some("id is immutable")
  } else if before.status == TaskStatus::Complete && after.status != TaskStatus::Complete {
    Some("a complete task cannot move backward")
  } else if after.attempts < before.attempts {
    Some("attempts cannot decrease")
  } else {
    None
  };
  match reason {
    Some(reason) => Err(StoreError::InvalidTransition { id: before.id, reason }),
    None => Ok(()),
  }
}

impl TaskStore {
  /// Opens (or creates) the store. Tasks left mid-upload by a previous
  /// process are put back to `Pending`.
  pub fn open(db_path: &Path) -> Result<Self, StoreError> {
    let mut conn = db::open(db_path)?;

    let mut raw = vec![];
    {
      let mut stmt = conn.prepare(SELECT_TASKS)?;
      let rows = stmt.query_map([], |r| {
        Ok(RawRow {
          id: r.get(0)?,
          status: r.get(1)?,
          attempts: r.get(2)?,
          retry_floor: r.get(3)?,
          form_json: r.get(4)?,
          extra_json: r.get(5)?,
          media_json: r.get(6)?,
          last_error_json: r.get(7)?,
          next_attempt_at: r.get(8)?,
          discard_requested: r.get(9)?,
          created_at: r.get(10)?,
          updated_at: r.get(11)?,
          seq: r.get(12)?,
        })
      })?;
      for row in rows {
        raw.push(row?);
      }
    }

    let next_seq = raw.iter().map(|r| r.seq).max().unwrap_or(0) + 1;
    let mut tasks = raw.into_iter().map(RawRow::into_task).collect::<Result<Vec<_>, _>>()?;

    let tx = conn.transaction()?;
    for task in tasks.iter_mut().filter(|t| t.status.is_uploading()) {
      tracing::info!(task_id = %task.id, status = %task.status, "recovering interrupted upload");
      task.status = TaskStatus::Pending;
      task.updated_at = now_iso();
      update_row(&tx, task, None)?;
    }
    tx.commit()?;

    tracing::debug!(path = %db_path.display(), tasks = tasks.len(), "task store opened");

    Ok(Self {
      writer: Mutex::new(Writer { conn, next_seq }),
      snapshot: RwLock::new(Arc::new(tasks)),
    })
  }

  fn writer(&self) -> MutexGuard<'_, Writer> {
    self.writer.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn replace_snapshot(&self, tasks: Vec<Task>) {
    *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(tasks);
  }

  pub fn list(&self) -> Snapshot {
    self.snapshot.read().unwrap_or_else(PoisonError::into_inner).clone()
  }

  pub fn get(&self, id: TaskId) -> Result<Task, StoreError> {
    self.list().iter().find(|t| t.id == id).cloned().ok_or(StoreError::NotFound(id))
  }

  pub fn len(&self) -> usize {
    self.list().len()
  }

  pub fn is_empty(&self) -> bool {
    self.list().is_empty()
  }

  /// Validates and persists a new task at the back of the queue.
  pub fn enqueue(&self, task: Task) -> Result<Task, StoreError> {
    let problems = task.problems();
    if !problems.is_empty() {
      return Err(StoreError::Validation(problems));
    }

    let mut w = self.writer();
    let seq = w.next_seq;
    insert_row(&w.conn, &task, seq)?;
    w.next_seq += 1;

    let mut tasks = (*self.list()).clone();
    tasks.push(task.clone());
    self.replace_snapshot(tasks);
    Ok(task)
  }

  /// Applies `mutation` to the task in place and commits it.
  pub fn update<F>(&self, id: TaskId, mutation: F) -> Result<Task, StoreError>
  where
    F: FnOnce(&mut Task),
  {
    self.mutate(id, None, mutation, false)
  }

  /// Like [`TaskStore::update`], and moves the task to the back of the queue.
  pub fn requeue<F>(&self, id: TaskId, mutation: F) -> Result<Task, StoreError>
  where
    F: FnOnce(&mut Task),
  {
    self.mutate(id, None, mutation, true)
  }

  /// [`TaskStore::requeue`] that only applies while the task is still in `expected`.
  pub fn requeue_from<F>(&self, id: TaskId, expected: TaskStatus, mutation: F) -> Result<Task, StoreError>
  where
    F: FnOnce(&mut Task),
  {
    self.mutate(id, Some(expected), mutation, true)
  }

  fn mutate<F>(&self, id: TaskId, expected: Option<TaskStatus>, mutation: F, to_back: bool) -> Result<Task, StoreError>
  where
    F: FnOnce(&mut Task),
  {
    let mut w = self.writer();
    let current = self.list();
    let idx = current.iter().position(|t| t.id == id).ok_or(StoreError::NotFound(id))?;
    if let Some(expected) = expected {
      if current[idx].status != expected {
        return Err(StoreError::UnexpectedStatus { id, status: current[idx].status });
      }
    }

    let mut next = current[idx].clone();
    mutation(&mut next);
    check_transition(&current[idx], &next)?;
    next.updated_at = now_iso();

    let seq = to_back.then_some(w.next_seq);
    update_row(&w.conn, &next, seq)?;
    if to_back {
      w.next_seq += 1;
    }

    let mut tasks = (*current).clone();
    if to_back {
      tasks.remove(idx);
      tasks.push(next.clone());
    } else {
      tasks[idx] = next.clone();
    }
    self.replace_snapshot(tasks);
    Ok(next)
  }

  /// Deletes an idle task, or flags an uploading one so the worker drops it
  /// when its request returns. The status check and the write happen under
  /// the same lock as every worker transition.
  pub fn discard(&self, id: TaskId) -> Result<Discarded, StoreError> {
    let w = self.writer();
    let current = self.list();
    let idx = current.iter().position(|t| t.id == id).ok_or(StoreError::NotFound(id))?;
    let mut tasks = (*current).clone();

    if current[idx].status.is_uploading() {
      let mut next = current[idx].clone();
      next.discard_requested = true;
      next.updated_at = now_iso();
      update_row(&w.conn, &next, None)?;
      tasks[idx] = next.clone();
      self.replace_snapshot(tasks);
      return Ok(Discarded::Flagged(next));
    }

    w.conn.execute("DELETE FROM tasks WHERE id = ?1", [id.to_string()])?;
    let removed = tasks.remove(idx);
    self.replace_snapshot(tasks);
    Ok(Discarded::Removed(removed))
  }

  pub fn remove(&self, id: TaskId) -> Result<Task, StoreError> {
    let w = self.writer();
    let current = self.list();
    let idx = current.iter().position(|t| t.id == id).ok_or(StoreError::NotFound(id))?;

    w.conn.execute("DELETE FROM tasks WHERE id = ?1", [id.to_string()])?;

    let mut tasks = (*current).clone();
    let removed = tasks.remove(idx);
    self.replace_snapshot(tasks);
    Ok(removed)
  }
}
