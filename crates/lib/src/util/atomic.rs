//! Durable whole-file writes.
//!
//! Every write goes to `<path>.tmp`, is flushed and fsynced, then renamed over
//! the destination. Readers observe either the previous complete file or the
//! new one, never a partial write.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AtomicWriteError {
  #[error("failed to create directory {path}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to replace {path}: {source}")]
  Rename {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to serialize {path}: {message}")]
  Serialize { path: PathBuf, message: String },
}

/// Path of the temporary sibling used while writing `path`.
pub fn temp_path(path: &Path) -> PathBuf {
  let mut name = path.as_os_str().to_os_string();
  name.push(".tmp");
  PathBuf::from(name)
}

/// Atomically replace `path` with `bytes`.
///
/// Parent directories are created as needed. On any failure the destination
/// is left untouched and the temp file is removed on a best-effort basis.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), AtomicWriteError> {
  if let Some(parent) = path.parent()
    && !parent.as_os_str().is_empty()
  {
    fs::create_dir_all(parent).map_err(|source| AtomicWriteError::CreateDir {
      path: parent.to_path_buf(),
      source,
    })?;
  }

  let tmp = temp_path(path);
  if let Err(source) = write_synced(&tmp, bytes) {
    let _ = fs::remove_file(&tmp);
    return Err(AtomicWriteError::Write {
      path: path.to_path_buf(),
      source,
    });
  }

  if let Err(source) = fs::rename(&tmp, path) {
    let _ = fs::remove_file(&tmp);
    return Err(AtomicWriteError::Rename {
      path: path.to_path_buf(),
      source,
    });
  }

  Ok(())
}

/// Serialize `value` as YAML and write it atomically.
pub fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<(), AtomicWriteError> {
  let text = serde_yaml::to_string(value).map_err(|e| AtomicWriteError::Serialize {
    path: path.to_path_buf(),
    message: e.to_string(),
  })?;
  write_atomic(path, text.as_bytes())
}

/// Serialize `value` as pretty JSON (with trailing newline) and write it atomically.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), AtomicWriteError> {
  let mut text = serde_json::to_string_pretty(value).map_err(|e| AtomicWriteError::Serialize {
    path: path.to_path_buf(),
    message: e.to_string(),
  })?;
  text.push('\n');
  write_atomic(path, text.as_bytes())
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
  let mut file = File::create(path)?;
  file.write_all(bytes)?;
  file.flush()?;
  file.sync_all()
}
