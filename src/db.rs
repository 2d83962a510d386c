use rusqlite::Connection;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

pub struct DbPaths {
  pub db_path: PathBuf,
  pub log_dir: PathBuf,
}

/// Resolves the on-device layout under the app data directory, creating it if needed.
pub fn paths(data_dir: &Path) -> Result<DbPaths, DbError> {
  std::fs::create_dir_all(data_dir)?;
  let db_path = data_dir.join("observations.sqlite");

  let log_dir = data_dir.join("logs");
  std::fs::create_dir_all(&log_dir)?;

  Ok(DbPaths { db_path, log_dir })
}

pub fn connect(db_path: &Path) -> Result<Connection, DbError> {
  if let Some(parent) = db_path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  let conn = Connection::open(db_path)?;
  // Acknowledged writes must survive the app being killed.
  conn.pragma_update(None, "synchronous", "FULL")?;
  Ok(conn)
}

pub fn init_db(conn: &Connection) -> Result<(), DbError> {
  // Apply migrations in order. Each uses IF NOT EXISTS for idempotency.
  let init_sql = include_str!("../migrations/001_init.sql");
  conn.execute_batch(init_sql)?;
  let settings_sql = include_str!("../migrations/002_settings.sql");
  conn.execute_batch(settings_sql)?;
  Ok(())
}

/// Opens the database at `db_path` with every migration applied.
pub fn open(db_path: &Path) -> Result<Connection, DbError> {
  let conn = connect(db_path)?;
  init_db(&conn)?;
  Ok(conn)
}
