mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use avy_observations_lib::bus::RemovalReason;
use avy_observations_lib::models::{ErrorKind, TaskStatus};
use avy_observations_lib::uploader::{Discard, Outcome};
use avy_observations_lib::{ApiError, StoreError, TaskEvent, TaskStore, UploaderError};

use common::*;

fn statuses(events: &Mutex<Vec<TaskEvent>>) -> Vec<Option<TaskStatus>> {
    events.lock().unwrap().iter().map(|e| e.status()).collect()
}

#[tokio::test]
async fn server_error_on_image_is_retried_then_completes() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeApi::default().script_images(vec![server_error(500)]));
    let up = uploader(&dir, api.clone(), config());
    let events = record(&up);

    let task = up.submit(form(&["/photos/crown.jpg"]), extra()).unwrap();

    let first = up.process_next().await.unwrap().unwrap();
    assert!(matches!(first.outcome, Outcome::Retrying { ref error, .. } if error.status == Some(500)));
    let pending = up.store().get(task.id).unwrap();
    assert_eq!(pending.status, TaskStatus::Pending);
    assert_eq!(pending.attempts, 1);
    assert!(pending.last_error.is_none());
    assert!(pending.next_attempt_at.is_some());

    let rest = up.run_until_idle().await.unwrap();
    assert_eq!(rest.len(), 1);
    assert!(matches!(rest[0].outcome, Outcome::Completed { .. }));
    assert!(up.store().is_empty());
    assert_eq!(api.image_calls(), 2);

    let events = events.lock().unwrap();
    let failures = events
        .iter()
        .filter(|e| matches!(e, TaskEvent::StatusChanged { error: Some(_), status: TaskStatus::Pending, .. }))
        .count();
    assert_eq!(failures, 1);
    assert!(events.contains(&TaskEvent::StatusChanged {
        task_id: task.id,
        status: TaskStatus::Complete,
        attempts: 2,
        error: None,
    }));
    assert_eq!(
        events.last(),
        Some(&TaskEvent::Removed { task_id: task.id, reason: RemovalReason::Completed })
    );
}

#[tokio::test]
async fn unsupported_attachment_fails_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeApi::default());
    let up = uploader(&dir, api.clone(), config());

    let task = up.submit(form(&["/photos/scan.bmp"]), extra()).unwrap();
    let processed = up.run_until_idle().await.unwrap();

    assert_eq!(processed.len(), 1);
    match &processed[0].outcome {
        Outcome::Failed(e) => assert_eq!(e.kind, ErrorKind::Encoding),
        other => panic!("unexpected {other:?}"),
    }
    let failed = up.store().get(task.id).unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.last_error.as_ref().map(|e| e.kind), Some(ErrorKind::Encoding));
    assert_eq!(api.image_calls(), 0);
    assert_eq!(api.observation_calls(), 0);
}

#[tokio::test]
async fn tasks_drain_in_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let up = uploader(&dir, Arc::new(FakeApi::default()), config());
    let events = record(&up);

    let a = up.submit(form(&["/photos/a.jpg"]), extra()).unwrap();
    let b = up.submit(form(&[]), extra()).unwrap();
    up.run_until_idle().await.unwrap();

    let events = events.lock().unwrap();
    let a_done = events
        .iter()
        .position(|e| *e == TaskEvent::Removed { task_id: a.id, reason: RemovalReason::Completed })
        .unwrap();
    let b_started = events
        .iter()
        .position(|e| e.task_id() == b.id && e.status() == Some(TaskStatus::UploadingImages))
        .unwrap();
    assert!(a_done < b_started);
}

#[tokio::test]
async fn retried_task_goes_behind_the_rest_of_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeApi::default().script_observations(vec![server_error(503)]));
    let up = uploader(&dir, api, config());

    let a = up.submit(form(&[]), extra()).unwrap();
    let b = up.submit(form(&[]), extra()).unwrap();

    let order: Vec<_> = up
        .run_until_idle()
        .await
        .unwrap()
        .into_iter()
        .map(|p| (p.task_id, matches!(p.outcome, Outcome::Completed { .. })))
        .collect();
    assert_eq!(order, vec![(a.id, false), (b.id, true), (a.id, true)]);
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeApi::default().script_observations((0..10).map(|_| server_error(502)).collect()));
    let up = uploader(&dir, api.clone(), config());
    let events = record(&up);

    let task = up.submit(form(&[]), extra()).unwrap();
    let processed = up.run_until_idle().await.unwrap();

    assert_eq!(processed.len(), 3);
    assert!(matches!(processed[2].outcome, Outcome::Failed(ref e) if e.status == Some(502)));
    let failed = up.store().get(task.id).unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.attempts, 3);
    assert_eq!(api.observation_calls(), 3);

    let attempts: Vec<u32> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            TaskEvent::StatusChanged { attempts, .. } => Some(*attempts),
            _ => None,
        })
        .collect();
    assert!(attempts.windows(2).all(|w| w[0] <= w[1]), "{attempts:?}");
}

#[tokio::test]
async fn observation_waits_for_every_attachment() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeApi::default());
    let up = uploader(&dir, api.clone(), config());

    let media_at_phase = Arc::new(Mutex::new(vec![]));
    let (probe, seen) = (up.clone(), media_at_phase.clone());
    up.bus().subscribe(move |e| {
        if e.status() == Some(TaskStatus::UploadingObservation) {
            let t = probe.store().get(e.task_id()).unwrap();
            seen.lock().unwrap().push((t.media.len(), t.form.images.len()));
        }
    });

    up.submit(form(&["/p/1.jpg", "/p/2.png", "/p/3.heic"]), extra()).unwrap();
    up.run_until_idle().await.unwrap();

    assert_eq!(*media_at_phase.lock().unwrap(), vec![(3, 3)]);
    assert_eq!(*api.observation_media.lock().unwrap(), vec![3]);
}

#[tokio::test]
async fn uploaded_attachments_are_not_sent_twice() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeApi::default().script_images(vec![Ok(()), server_error(500)]));
    let up = uploader(&dir, api.clone(), config());

    let task = up.submit(form(&["/p/1.jpg", "/p/2.jpg"]), extra()).unwrap();
    let first = up.process_next().await.unwrap().unwrap();
    assert!(matches!(first.outcome, Outcome::Retrying { .. }));
    assert_eq!(up.store().get(task.id).unwrap().media.len(), 1);

    up.run_until_idle().await.unwrap();
    assert_eq!(api.image_calls(), 3);
    assert_eq!(*api.observation_media.lock().unwrap(), vec![2]);
}

#[tokio::test]
async fn attachment_retries_happen_inside_one_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeApi::default().script_images(vec![server_error(503), Err(ApiError::Timeout)]));
    let up = uploader(&dir, api.clone(), avy_observations_lib::UploaderConfig { attachment_retries: 2, ..config() });

    up.submit(form(&["/p/1.jpg"]), extra()).unwrap();
    let processed = up.run_until_idle().await.unwrap();

    assert_eq!(processed.len(), 1);
    assert!(matches!(processed[0].outcome, Outcome::Completed { .. }));
    assert_eq!(api.image_calls(), 3);
}

#[tokio::test]
async fn discarding_an_in_flight_task_drops_its_result() {
    let dir = tempfile::tempdir().unwrap();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let api = Arc::new(FakeApi { gate: Some((entered.clone(), release.clone())), ..Default::default() });
    let up = uploader(&dir, api.clone(), config());
    let events = record(&up);

    let task = up.submit(form(&[]), extra()).unwrap();
    let worker = {
        let up = up.clone();
        tokio::spawn(async move { up.process_next().await })
    };

    entered.notified().await;
    assert_eq!(up.store().get(task.id).unwrap().status, TaskStatus::UploadingObservation);
    assert_eq!(up.discard(task.id).unwrap(), Discard::Deferred);
    assert!(up.store().get(task.id).unwrap().discard_requested);
    release.notify_one();

    let processed = worker.await.unwrap().unwrap().unwrap();
    assert_eq!(processed.outcome, Outcome::Discarded);
    assert!(up.store().is_empty());
    assert_eq!(api.observation_calls(), 1);
    assert_eq!(
        events.lock().unwrap().last(),
        Some(&TaskEvent::Removed { task_id: task.id, reason: RemovalReason::Discarded })
    );
    assert!(!statuses(&events).contains(&Some(TaskStatus::Complete)));
}

#[tokio::test]
async fn discarding_idle_tasks_removes_them() {
    let dir = tempfile::tempdir().unwrap();
    let up = uploader(&dir, Arc::new(FakeApi::default()), config());

    let task = up.submit(form(&[]), extra()).unwrap();
    assert_eq!(up.discard(task.id).unwrap(), Discard::Removed);
    assert!(up.store().is_empty());
    assert!(matches!(up.discard(task.id), Err(UploaderError::Store(StoreError::NotFound(_)))));
    assert!(up.process_next().await.unwrap().is_none());
}

#[tokio::test]
async fn manual_retry_gets_a_fresh_budget() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeApi::default().script_observations(vec![server_error(400)]));
    let up = uploader(&dir, api, config());

    let task = up.submit(form(&[]), extra()).unwrap();
    assert!(matches!(up.retry(task.id), Err(UploaderError::NotRetryable { status: TaskStatus::Pending, .. })));

    up.run_until_idle().await.unwrap();
    let failed = up.store().get(task.id).unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.last_error.as_ref().and_then(|e| e.status), Some(400));

    let retried = up.retry(task.id).unwrap();
    assert_eq!(retried.status, TaskStatus::Pending);
    assert_eq!(retried.retry_floor, 1);
    assert!(retried.last_error.is_none());

    let processed = up.run_until_idle().await.unwrap();
    assert!(matches!(processed[0].outcome, Outcome::Completed { .. }));
    assert!(up.store().is_empty());
}

#[tokio::test]
async fn queue_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let task = {
        let up = uploader(&dir, Arc::new(FakeApi::default()), config());
        up.set_online(false);
        up.submit(form(&["/p/1.jpg"]), extra()).unwrap()
    };

    let store = TaskStore::open(&dir.path().join("obs.sqlite")).unwrap();
    let back = store.get(task.id).unwrap();
    assert_eq!(back.id, task.id);
    assert_eq!(back.status, task.status);
    assert_eq!(back.form, task.form);
    drop(store);

    let api = Arc::new(FakeApi::default());
    let up = uploader(&dir, api.clone(), config());
    up.run_until_idle().await.unwrap();
    assert!(up.store().is_empty());
    assert_eq!(api.image_calls(), 1);
}

#[tokio::test]
async fn panicking_observer_does_not_stop_uploads() {
    let dir = tempfile::tempdir().unwrap();
    let up = uploader(&dir, Arc::new(FakeApi::default()), config());
    up.bus().subscribe(|_| panic!("broken widget"));
    let events = record(&up);

    up.submit(form(&[]), extra()).unwrap();
    let processed = up.run_until_idle().await.unwrap();
    assert!(matches!(processed[0].outcome, Outcome::Completed { .. }));
    assert!(events.lock().unwrap().len() >= 4);
}

#[tokio::test]
async fn offline_pauses_the_drain() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeApi::default());
    let up = uploader(&dir, api.clone(), config());

    up.set_online(false);
    up.submit(form(&[]), extra()).unwrap();
    assert!(up.process_next().await.unwrap().is_none());
    assert!(up.run_until_idle().await.unwrap().is_empty());
    assert_eq!(api.observation_calls(), 0);

    up.set_online(true);
    assert_eq!(up.run_until_idle().await.unwrap().len(), 1);
}

#[tokio::test]
async fn background_worker_uploads_submissions() {
    let dir = tempfile::tempdir().unwrap();
    let up = uploader(&dir, Arc::new(FakeApi::default()), config());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    up.bus().subscribe(move |e| {
        if let TaskEvent::Removed { task_id, reason } = e {
            let _ = tx.send((*task_id, *reason));
        }
    });

    let worker = up.start();
    let task = up.submit(form(&["/p/1.jpg"]), extra()).unwrap();

    let (id, reason) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(id, task.id);
    assert_eq!(reason, RemovalReason::Completed);

    up.shutdown();
    tokio::time::timeout(Duration::from_secs(5), worker).await.unwrap().unwrap();
}

#[tokio::test]
async fn invalid_submissions_are_rejected_before_queueing() {
    let dir = tempfile::tempdir().unwrap();
    let up = uploader(&dir, Arc::new(FakeApi::default()), config());

    let mut f = form(&[]);
    f.zone.clear();
    match up.submit(f, extra()) {
        Err(UploaderError::Store(StoreError::Validation(problems))) => {
            assert_eq!(problems, vec!["zone is required".to_string()]);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(up.store().is_empty());
}

#[tokio::test]
async fn each_task_backs_off_from_its_own_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeApi::default().script_observations((0..3).map(|_| server_error(503)).collect()));
    let config = avy_observations_lib::UploaderConfig {
        backoff_base: Duration::from_millis(20),
        backoff_cap: Duration::from_secs(1),
        ..config()
    };
    let up = uploader(&dir, api, config);

    let a = up.submit(form(&[]), extra()).unwrap();
    let b = up.submit(form(&[]), extra()).unwrap();

    let delays: Vec<_> = up
        .run_until_idle()
        .await
        .unwrap()
        .into_iter()
        .map(|p| match p.outcome {
            Outcome::Retrying { delay, .. } => (p.task_id, Some(delay)),
            _ => (p.task_id, None),
        })
        .collect();
    assert_eq!(
        delays,
        vec![
            (a.id, Some(Duration::from_millis(20))),
            (b.id, Some(Duration::from_millis(20))),
            (a.id, Some(Duration::from_millis(40))),
            (b.id, None),
            (a.id, None),
        ]
    );
}

#[tokio::test]
async fn discarding_a_task_waiting_to_retry_removes_it() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeApi::default().script_observations(vec![server_error(503)]));
    let up = uploader(&dir, api, config());

    let task = up.submit(form(&[]), extra()).unwrap();
    let first = up.process_next().await.unwrap().unwrap();
    assert!(matches!(first.outcome, Outcome::Retrying { .. }));

    assert_eq!(up.discard(task.id).unwrap(), Discard::Removed);
    assert!(up.store().is_empty());
    assert!(up.run_until_idle().await.unwrap().is_empty());
}

#[tokio::test]
async fn manual_retry_clears_a_stale_discard_flag() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeApi::default().script_observations(vec![server_error(400)]));
    let up = uploader(&dir, api.clone(), config());

    let task = up.submit(form(&[]), extra()).unwrap();
    up.run_until_idle().await.unwrap();
    up.store().update(task.id, |t| t.discard_requested = true).unwrap();

    let retried = up.retry(task.id).unwrap();
    assert_eq!(retried.status, TaskStatus::Pending);
    assert!(!retried.discard_requested);

    let processed = up.run_until_idle().await.unwrap();
    assert_eq!(processed.len(), 1);
    assert!(matches!(processed[0].outcome, Outcome::Completed { .. }));
    assert!(up.store().is_empty());
    assert_eq!(api.observation_calls(), 2);
}

#[tokio::test]
async fn concurrent_drains_upload_one_task_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FakeApi { latency: Some(Duration::from_millis(10)), ..Default::default() });
    let up = uploader(&dir, api.clone(), config());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    up.bus().subscribe(move |e| {
        if let TaskEvent::Removed { task_id, reason } = e {
            let _ = tx.send((*task_id, *reason));
        }
    });

    let submitted: Vec<_> = (0..4).map(|_| up.submit(form(&[]), extra()).unwrap().id).collect();
    let worker = up.start();
    let drains: Vec<_> = (0..2)
        .map(|_| {
            let up = up.clone();
            tokio::spawn(async move { up.run_until_idle().await })
        })
        .collect();
    for drain in drains {
        drain.await.unwrap().unwrap();
    }

    let mut removed = vec![];
    while removed.len() < submitted.len() {
        let (id, reason) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(reason, RemovalReason::Completed);
        removed.push(id);
    }
    up.shutdown();
    tokio::time::timeout(Duration::from_secs(5), worker).await.unwrap().unwrap();

    assert_eq!(removed, submitted);
    assert!(rx.try_recv().is_err());
    assert_eq!(api.observation_calls(), submitted.len());
    assert_eq!(api.max_in_flight(), 1);
    assert!(up.store().is_empty());
}
