#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use avy_observations_lib::api::{image_mime_type, ImageMetadata, MediaReference, ObservationPayload, ObservationRecord};
use avy_observations_lib::models::{ImageAttachment, Instability, ObservationForm, PhotoUsage, SubmissionExtra};
use avy_observations_lib::{ApiError, ObservationApi, TaskEvent, TaskStore, Uploader, UploaderConfig};

/// Scripted transport: each call pops the next scripted result, succeeding once the script runs out.
#[derive(Default)]
pub struct FakeApi {
    pub images: Mutex<VecDeque<Result<(), ApiError>>>,
    pub observations: Mutex<VecDeque<Result<(), ApiError>>>,
    pub image_calls: AtomicUsize,
    pub observation_calls: AtomicUsize,
    pub observation_media: Mutex<Vec<usize>>,
    /// (entered, release): the observation call signals `entered` then waits for `release`.
    pub gate: Option<(Arc<Notify>, Arc<Notify>)>,
    /// How long each observation call stays open.
    pub latency: Option<Duration>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeApi {
    pub fn script_images(self, script: Vec<Result<(), ApiError>>) -> Self {
        *self.images.lock().unwrap() = script.into();
        self
    }

    pub fn script_observations(self, script: Vec<Result<(), ApiError>>) -> Self {
        *self.observations.lock().unwrap() = script.into();
        self
    }

    pub fn image_calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }

    pub fn observation_calls(&self) -> usize {
        self.observation_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

pub fn media(id: String) -> MediaReference {
    MediaReference { media_type: "image".into(), id: Some(id), caption: None, extra: Default::default() }
}

#[async_trait]
impl ObservationApi for FakeApi {
    async fn upload_image(
        &self,
        attachment: &ImageAttachment,
        _center_id: &str,
        _metadata: &ImageMetadata,
    ) -> Result<MediaReference, ApiError> {
        image_mime_type(attachment)?;
        let n = self.image_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.images.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(()))?;
        Ok(media(format!("m-{n}")))
    }

    async fn upload_observation(&self, _url: &str, payload: &ObservationPayload) -> Result<ObservationRecord, ApiError> {
        let open = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(open, Ordering::SeqCst);
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let n = self.observation_calls.fetch_add(1, Ordering::SeqCst);
        self.observation_media.lock().unwrap().push(payload.media.len());
        let scripted = self.observations.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(()))?;
        Ok(ObservationRecord { id: format!("obs-{n}"), extra: Default::default() })
    }
}

pub fn server_error(status: u16) -> Result<(), ApiError> {
    Err(ApiError::Remote { status, body: "{\"detail\":\"boom\"}".into() })
}

pub fn form(images: &[&str]) -> ObservationForm {
    ObservationForm {
        name: "Sam Skier".into(),
        email: "sam@example.com".into(),
        start_date: "2024-02-11".into(),
        zone: "Stevens Pass".into(),
        activity: vec!["skiing_snowboarding".into()],
        location_name: "Skyline Ridge".into(),
        location_point: None,
        instability: Instability { collapsing: true, ..Default::default() },
        observation_summary: "Whumpfing on northerly aspects above 5000ft".into(),
        photo_usage: PhotoUsage::Anonymous,
        images: images.iter().map(|p| ImageAttachment::new(*p)).collect(),
    }
}

pub fn extra() -> SubmissionExtra {
    SubmissionExtra::new("https://api.example.com/obs/v1/public/observation/", "NWAC")
}

pub fn config() -> UploaderConfig {
    UploaderConfig {
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(5),
        max_attempts: 3,
        attachment_retries: 0,
        attachment_backoff: Duration::from_millis(1),
        ..Default::default()
    }
}

pub fn uploader(dir: &tempfile::TempDir, api: Arc<FakeApi>, config: UploaderConfig) -> Uploader {
    let store = TaskStore::open(&dir.path().join("obs.sqlite")).unwrap();
    Uploader::new(store, api, config).unwrap()
}

pub fn record(uploader: &Uploader) -> Arc<Mutex<Vec<TaskEvent>>> {
    let events = Arc::new(Mutex::new(vec![]));
    let sink = events.clone();
    uploader.bus().subscribe(move |e| sink.lock().unwrap().push(e.clone()));
    events
}
