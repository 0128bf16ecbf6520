//! Hashing utilities for fingerprints and content verification.
//!
//! This module provides:
//! - `hash_paths()`: deterministic hashing of a set of files and directories
//! - `hash_file()`: single file hashing
//! - `short_hex()`: truncated hex digests used for labels and cache keys

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Error during path hashing.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
  #[error("failed to walk {path}: {message}")]
  WalkDir { path: PathBuf, message: String },

  #[error("failed to read {path}: {source}")]
  ReadFile {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Hex encoding of the first `bytes` bytes of a SHA-256 digest over `data`.
pub fn short_hex(data: &[u8], bytes: usize) -> String {
  let digest = Sha256::digest(data);
  hex::encode(&digest[..bytes.min(digest.len())])
}

/// Full SHA-256 hex digest of a single file's contents.
pub fn hash_file(path: &Path) -> Result<String, HashError> {
  let mut hasher = Sha256::new();
  let mut file = File::open(path).map_err(|source| HashError::ReadFile {
    path: path.to_path_buf(),
    source,
  })?;
  io::copy(&mut file, &mut hasher).map_err(|source| HashError::ReadFile {
    path: path.to_path_buf(),
    source,
  })?;
  Ok(hex::encode(hasher.finalize()))
}

/// Hash a set of files and directories relative to `base`.
///
/// Directories are expanded to every file beneath them. The combined file list
/// is sorted, then each file contributes its `/`-separated path relative to
/// `base`, a NUL byte, its contents, and another NUL byte. The result depends
/// only on relative paths and contents, never on traversal order.
///
/// Returns the first `bytes` bytes of the digest, hex-encoded.
pub fn hash_paths(base: &Path, paths: &[PathBuf], bytes: usize) -> Result<String, HashError> {
  let mut files: Vec<PathBuf> = Vec::new();
  for path in paths {
    if path.is_dir() {
      for entry in WalkDir::new(path) {
        let entry = entry.map_err(|e| HashError::WalkDir {
          path: path.clone(),
          message: e.to_string(),
        })?;
        if !entry.file_type().is_dir() {
          files.push(entry.into_path());
        }
      }
    } else {
      files.push(path.clone());
    }
  }

  let mut keyed: Vec<(String, PathBuf)> = files
    .into_iter()
    .map(|file| {
      let rel = file.strip_prefix(base).unwrap_or(&file);
      let rel = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
      (rel, file)
    })
    .collect();
  keyed.sort();

  let mut hasher = Sha256::new();
  for (rel, file) in &keyed {
    hasher.update(rel.as_bytes());
    hasher.update([0u8]);
    let mut handle = File::open(file).map_err(|source| HashError::ReadFile {
      path: file.clone(),
      source,
    })?;
    io::copy(&mut handle, &mut hasher).map_err(|source| HashError::ReadFile {
      path: file.clone(),
      source,
    })?;
    hasher.update([0u8]);
  }

  let digest = hasher.finalize();
  Ok(hex::encode(&digest[..bytes.min(digest.len())]))
}
