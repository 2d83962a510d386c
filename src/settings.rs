use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::models::now_iso;

pub const DEFAULT_API_PREFIX: &str = "https://api.avalanche.org";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SettingsKV {
  pub key: String,
  pub value: String,
  pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct SettingInput {
  pub key: String,
  pub value: String,
}

/// Tunables for the uploader and its transport.
#[derive(Debug, Clone, PartialEq)]
pub struct UploaderConfig {
  pub api_prefix: String,
  pub backoff_base: Duration,
  pub backoff_cap: Duration,
  pub max_attempts: u32,
  /// Extra tries per attachment before the image phase gives up.
  pub attachment_retries: u32,
  pub attachment_backoff: Duration,
  pub request_timeout: Duration,
  pub log_filter: String,
}

impl Default for UploaderConfig {
  fn default() -> Self {
    Self {
      api_prefix: DEFAULT_API_PREFIX.to_string(),
      backoff_base: Duration::from_secs(2),
      backoff_cap: Duration::from_secs(60),
      max_attempts: 5,
      attachment_retries: 2,
      attachment_backoff: Duration::from_millis(500),
      request_timeout: Duration::from_secs(60),
      log_filter: "info".to_string(),
    }
  }
}

pub fn get_settings(conn: &Connection) -> Result<Vec<SettingsKV>, rusqlite::Error> {
  let mut stmt = conn.prepare("SELECT key, value, updated_at FROM settings ORDER BY key")?;
  let rows = stmt.query_map([], |r| {
    Ok(SettingsKV {
      key: r.get(0)?,
      value: r.get(1)?,
      updated_at: r.get(2)?,
    })
  })?;

  let mut out = vec![];
  for row in rows {
    out.push(row?);
  }
  Ok(out)
}

pub fn get_setting(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
  conn.query_row("SELECT value FROM settings WHERE key = ?1", [key], |r| r.get(0)).optional()
}

pub fn set_setting(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
  let updated_at = now_iso();
  conn.execute(
    "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
     ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at",
    (key, value, &updated_at),
  )?;
  Ok(())
}

pub fn set_settings(conn: &mut Connection, pairs: Vec<SettingInput>) -> Result<(), rusqlite::Error> {
  let tx = conn.transaction()?;
  let updated_at = now_iso();

  for pair in pairs {
    tx.execute(
      "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
       ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at",
      (&pair.key, &pair.value, &updated_at),
    )?;
  }

  tx.commit()?;
  Ok(())
}

pub fn load_settings(conn: &Connection) -> Result<HashMap<String, String>, rusqlite::Error> {
  Ok(get_settings(conn)?.into_iter().map(|kv| (kv.key, kv.value)).collect())
}

fn millis(settings: &HashMap<String, String>, key: &str) -> Option<Duration> {
  settings.get(key).and_then(|s| s.parse().ok()).map(Duration::from_millis)
}

pub fn build_uploader_config(settings: &HashMap<String, String>) -> UploaderConfig {
  let d = UploaderConfig::default();
  UploaderConfig {
    api_prefix: settings.get("api_prefix").filter(|s| !s.is_empty()).cloned().unwrap_or(d.api_prefix),
    backoff_base: millis(settings, "backoff_base_ms").unwrap_or(d.backoff_base),
    backoff_cap: millis(settings, "backoff_cap_ms").unwrap_or(d.backoff_cap),
    max_attempts: settings.get("max_attempts")
      .and_then(|s| s.parse().ok()).filter(|n| *n > 0).unwrap_or(d.max_attempts),
    attachment_retries: settings.get("attachment_retries")
      .and_then(|s| s.parse().ok()).unwrap_or(d.attachment_retries),
    attachment_backoff: millis(settings, "attachment_backoff_ms").unwrap_or(d.attachment_backoff),
    request_timeout: settings.get("request_timeout_secs")
      .and_then(|s| s.parse().ok()).map(Duration::from_secs).unwrap_or(d.request_timeout),
    log_filter: settings.get("log_filter").filter(|s| !s.is_empty()).cloned().unwrap_or(d.log_filter),
  }
}

impl UploaderConfig {
  /// Stored settings first, then `AVY_API_PREFIX` / `AVY_LOG` from the environment.
  pub fn load(conn: &Connection) -> Result<Self, rusqlite::Error> {
    let config = build_uploader_config(&load_settings(conn)?);
    Ok(config.with_env_overrides(|k| std::env::var(k).ok()))
  }

  pub fn with_env_overrides<F>(mut self, env: F) -> Self
  where
    F: Fn(&str) -> Option<String>,
  {
    if let Some(prefix) = env("AVY_API_PREFIX").filter(|s| !s.is_empty()) {
      self.api_prefix = prefix;
    }
    if let Some(filter) = env("AVY_LOG").filter(|s| !s.is_empty()) {
      self.log_filter = filter;
    }
    self
  }
}
