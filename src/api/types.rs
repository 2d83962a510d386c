use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{
    ErrorKind, ImageAttachment, Instability, LocationPoint, ObservationForm, PhotoUsage, SubmissionExtra, TaskError,
};

/// Media record returned by the media endpoint. Unknown fields are kept so the
/// observation payload can echo the reference back exactly as the server sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaReference {
    #[serde(rename = "type")]
    pub media_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageMetadata {
    pub name: String,
    pub photo_usage: PhotoUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

impl ImageMetadata {
    pub fn for_attachment(form: &ObservationForm, attachment: &ImageAttachment) -> Self {
        Self {
            name: form.name.clone(),
            photo_usage: form.photo_usage,
            caption: attachment.caption.clone(),
        }
    }

    pub fn access(&self) -> &'static str {
        match self.photo_usage {
            PhotoUsage::Private => "private",
            _ => "public",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaUploadRequest<'a> {
    pub file: String, // data URI
    pub filename: &'a str,
    pub center_id: &'a str,
    pub access: &'a str,
    pub photo_usage: PhotoUsage,
    pub name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<&'a str>,
}

/// The body posted to the submission url once every attachment has a media reference.
#[derive(Debug, Clone, Serialize)]
pub struct ObservationPayload {
    pub name: String,
    pub email: String,
    pub start_date: String,
    pub zone: String,
    pub activity: Vec<String>,
    pub location_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_point: Option<LocationPoint>,
    pub instability: Instability,
    pub observation_summary: String,
    pub photo_usage: PhotoUsage,
    pub media: Vec<MediaReference>,
    pub center_id: String,
    pub source: String,
}

impl ObservationPayload {
    pub fn new(form: &ObservationForm, extra: &SubmissionExtra, media: Vec<MediaReference>) -> Self {
        Self {
            name: form.name.clone(),
            email: form.email.clone(),
            start_date: form.start_date.clone(),
            zone: form.zone.clone(),
            activity: form.activity.clone(),
            location_name: form.location_name.clone(),
            location_point: form.location_point,
            instability: form.instability.clone(),
            observation_summary: form.observation_summary.clone(),
            photo_usage: form.photo_usage,
            media,
            center_id: extra.center_id.clone(),
            source: extra.source.clone(),
        }
    }
}

/// The persisted observation as echoed by the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ObservationRecord {
    pub id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("API error {status}: {body}")]
    Remote { status: u16, body: String },
    #[error("unsupported attachment encoding: {0}")]
    Encoding(String),
    #[error("no network path: {0}")]
    Connectivity(String),
    #[error("Timeout")]
    Timeout,
    #[error("unreadable attachment {path}: {message}")]
    Attachment { path: String, message: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Transient failures the uploader may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Remote { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            ApiError::Connectivity(_) | ApiError::Timeout => true,
            ApiError::Encoding(_) | ApiError::Attachment { .. } | ApiError::InvalidResponse(_) => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Remote { .. } => ErrorKind::Remote,
            ApiError::Encoding(_) => ErrorKind::Encoding,
            ApiError::Connectivity(_) => ErrorKind::Connectivity,
            ApiError::Timeout => ErrorKind::Timeout,
            ApiError::Attachment { .. } => ErrorKind::Attachment,
            ApiError::InvalidResponse(_) => ErrorKind::InvalidResponse,
        }
    }

    pub fn to_task_error(&self) -> TaskError {
        let status = match self {
            ApiError::Remote { status, .. } => Some(*status),
            _ => None,
        };
        TaskError { kind: self.kind(), status, message: self.to_string() }
    }
}

/// Transport seam used by the uploader. Implementations own request and
/// response shapes only; retries are the caller's business.
#[async_trait]
pub trait ObservationApi: Send + Sync {
    async fn upload_image(
        &self,
        attachment: &ImageAttachment,
        center_id: &str,
        metadata: &ImageMetadata,
    ) -> Result<MediaReference, ApiError>;

    async fn upload_observation(
        &self,
        url: &str,
        payload: &ObservationPayload,
    ) -> Result<ObservationRecord, ApiError>;
}
