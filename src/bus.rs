use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::models::{TaskError, TaskId, TaskStatus};

/// Handle returned by [`SubscriptionBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    Completed,
    Discarded,
}

/// A task transition published by the uploader.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    StatusChanged {
        task_id: TaskId,
        status: TaskStatus,
        attempts: u32,
        error: Option<TaskError>,
    },
    Removed {
        task_id: TaskId,
        reason: RemovalReason,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::StatusChanged { task_id, .. } | TaskEvent::Removed { task_id, .. } => *task_id,
        }
    }

    pub fn status(&self) -> Option<TaskStatus> {
        match self {
            TaskEvent::StatusChanged { status, .. } => Some(*status),
            TaskEvent::Removed { .. } => None,
        }
    }
}

/// Callback type for task notifications.
pub type EventHandler = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

/// In-process observer list.
///
/// - `subscribe(handler)` registers a callback and returns its id.
/// - `unsubscribe(id)` removes it.
/// - `publish(event)` calls every handler synchronously on the caller's thread.
///
/// A handler that panics is logged and skipped; the rest still receive the event.
pub struct SubscriptionBus {
    handlers: RwLock<Vec<(SubscriptionId, EventHandler)>>,
    next_id: AtomicU64,
}

impl SubscriptionBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));
        id
    }

    /// Returns whether the id was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to every subscriber. Returns how many handlers panicked.
    pub fn publish(&self, event: &TaskEvent) -> usize {
        // Copy the list out so handlers may (un)subscribe while being called.
        let handlers: Vec<(SubscriptionId, EventHandler)> =
            self.handlers.read().unwrap_or_else(PoisonError::into_inner).clone();

        let mut panicked = 0;
        for (id, handler) in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                panicked += 1;
                tracing::warn!(subscription = id.0, task_id = %event.task_id(), "task observer panicked");
            }
        }
        panicked
    }
}

impl Default for SubscriptionBus {
    fn default() -> Self {
        Self::new()
    }
}
