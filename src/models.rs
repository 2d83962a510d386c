use serde::{Deserialize, Serialize};
use std::fmt;
use time::macros::format_description;
use uuid::Uuid;

use crate::api::MediaReference;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
  pub fn new() -> Self {
    Self(Uuid::new_v4())
  }

  pub fn parse(s: &str) -> Result<Self, uuid::Error> {
    Uuid::parse_str(s).map(Self)
  }
}

impl Default for TaskId {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for TaskId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
  Pending,
  UploadingImages,
  UploadingObservation,
  Complete,
  Failed,
}

impl TaskStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      TaskStatus::Pending => "pending",
      TaskStatus::UploadingImages => "uploading_images",
      TaskStatus::UploadingObservation => "uploading_observation",
      TaskStatus::Complete => "complete",
      TaskStatus::Failed => "failed",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "pending" => Some(TaskStatus::Pending),
      "uploading_images" => Some(TaskStatus::UploadingImages),
      "uploading_observation" => Some(TaskStatus::UploadingObservation),
      "complete" => Some(TaskStatus::Complete),
      "failed" => Some(TaskStatus::Failed),
      _ => None,
    }
  }

  /// No automatic transition leaves a terminal status.
  pub fn is_terminal(&self) -> bool {
    matches!(self, TaskStatus::Complete | TaskStatus::Failed)
  }

  pub fn is_uploading(&self) -> bool {
    matches!(self, TaskStatus::UploadingImages | TaskStatus::UploadingObservation)
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct LocationPoint {
  pub lat: f64,
  pub lng: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Instability {
  pub avalanches: bool,
  pub cracking: bool,
  pub collapsing: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhotoUsage {
  #[default]
  Anonymous,
  Credit,
  Private,
}

/// A photo picked on the device, referenced by its local path until uploaded.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
  pub uri: String,
  #[serde(default)]
  pub caption: Option<String>,
}

impl ImageAttachment {
  pub fn new(uri: impl Into<String>) -> Self {
    Self { uri: uri.into(), caption: None }
  }

  pub fn file_name(&self) -> &str {
    self.uri.rsplit(['/', '\\']).next().unwrap_or(&self.uri)
  }

  pub fn extension(&self) -> Option<String> {
    let name = self.file_name();
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
      return None;
    }
    Some(ext.to_ascii_lowercase())
  }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ObservationForm {
  pub name: String,
  pub email: String,
  pub start_date: String, // YYYY-MM-DD
  pub zone: String,
  #[serde(default)]
  pub activity: Vec<String>,
  pub location_name: String,
  #[serde(default)]
  pub location_point: Option<LocationPoint>,
  #[serde(default)]
  pub instability: Instability,
  pub observation_summary: String,
  #[serde(default)]
  pub photo_usage: PhotoUsage,
  #[serde(default)]
  pub images: Vec<ImageAttachment>,
}

impl ObservationForm {
  pub fn problems(&self) -> Vec<String> {
    let mut out = vec![];
    for (field, value) in [
      ("name", &self.name),
      ("email", &self.email),
      ("zone", &self.zone),
      ("location_name", &self.location_name),
      ("observation_summary", &self.observation_summary),
    ] {
      if value.trim().is_empty() {
        out.push(format!("{field} is required"));
      }
    }
    if !self.email.trim().is_empty() && !self.email.contains('@') {
      out.push("email is not a valid address".to_string());
    }
    if time::Date::parse(&self.start_date, format_description!("[year]-[month]-[day]")).is_err() {
      out.push("start_date must be YYYY-MM-DD".to_string());
    }
    if self.activity.iter().all(|a| a.trim().is_empty()) {
      out.push("at least one activity is required".to_string());
    }
    if self.images.iter().any(|i| i.uri.trim().is_empty()) {
      out.push("image attachments need a file path".to_string());
    }
    out
  }
}

/// Submission parameters that are not part of the visible form.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SubmissionExtra {
  pub url: String,
  pub center_id: String,
  #[serde(default = "default_source")]
  pub source: String,
}

fn default_source() -> String {
  "public".to_string()
}

impl SubmissionExtra {
  pub fn new(url: impl Into<String>, center_id: impl Into<String>) -> Self {
    Self { url: url.into(), center_id: center_id.into(), source: default_source() }
  }

  pub fn problems(&self) -> Vec<String> {
    let mut out = vec![];
    if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
      out.push("url must be an http(s) url".to_string());
    }
    if self.center_id.trim().is_empty() {
      out.push("center_id is required".to_string());
    }
    out
  }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  Remote,
  Encoding,
  Connectivity,
  Timeout,
  Attachment,
  InvalidResponse,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TaskError {
  pub kind: ErrorKind,
  #[serde(default)]
  pub status: Option<u16>,
  pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Task {
  pub id: TaskId,
  pub form: ObservationForm,
  pub extra: SubmissionExtra,
  pub status: TaskStatus,
  pub attempts: u32,
  /// `attempts` at the last manual retry; only attempts above it count against the limit.
  pub retry_floor: u32,
  /// Media already uploaded, index-aligned with `form.images`.
  pub media: Vec<MediaReference>,
  pub last_error: Option<TaskError>,
  pub next_attempt_at: Option<i64>, // unix millis
  pub discard_requested: bool,
  pub created_at: String,
  pub updated_at: String,
}

impl Task {
  pub fn new(form: ObservationForm, extra: SubmissionExtra) -> Self {
    let ts = now_iso();
    Task {
      id: TaskId::new(),
      form,
      extra,
      status: TaskStatus::Pending,
      attempts: 0,
      retry_floor: 0,
      media: vec![],
      last_error: None,
      next_attempt_at: None,
      discard_requested: false,
      created_at: ts.clone(),
      updated_at: ts,
    }
  }

  pub fn problems(&self) -> Vec<String> {
    let mut out = self.form.problems();
    out.extend(self.extra.problems());
    out
  }

  pub fn budget_used(&self) -> u32 {
    self.attempts.saturating_sub(self.retry_floor)
  }

  pub fn images_uploaded(&self) -> bool {
    self.media.len() >= self.form.images.len()
  }

  /// Eligible for the worker at `now` (unix millis).
  pub fn is_due(&self, now: i64) -> bool {
    self.status == TaskStatus::Pending
      && !self.discard_requested
      && self.next_attempt_at.map_or(true, |t| t <= now)
  }
}

pub fn now_iso() -> String {
  // RFC3339-ish without nanos; good enough for sorting/display.
  let t = time::OffsetDateTime::now_utc();
  t.format(&time::format_description::well_known::Rfc3339).unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

pub fn now_millis() -> i64 {
  (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
