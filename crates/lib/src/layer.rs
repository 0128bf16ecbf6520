//! Zip layer extraction into a content-addressed cache directory.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use thiserror::Error;
use tracing::debug;

/// Largest single entry a layer archive may contain.
pub const MAX_ENTRY_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum LayerError {
  #[error("layer cache dir is required")]
  CacheDirRequired,

  #[error("zip path escapes target: {0}")]
  PathTraversal(String),

  #[error("zip entry too large: {0}")]
  EntryTooLarge(String),

  #[error("failed to open zip {path}: {source}")]
  Archive {
    path: PathBuf,
    #[source]
    source: zip::result::ZipError,
  },

  #[error("layer io error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> LayerError + '_ {
  move |source| LayerError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// Extract `src` under `cache_dir` and return the extraction directory.
///
/// The directory name carries the archive stem, mtime and size, so an
/// unchanged archive reuses its earlier extraction.
pub fn extract_zip_layer(src: &Path, cache_dir: &Path) -> Result<PathBuf, LayerError> {
  extract_with_limit(src, cache_dir, MAX_ENTRY_BYTES)
}

fn extract_with_limit(src: &Path, cache_dir: &Path, limit: u64) -> Result<PathBuf, LayerError> {
  if cache_dir.as_os_str().is_empty() {
    return Err(LayerError::CacheDirRequired);
  }
  let meta = fs::metadata(src).map_err(io_err(src))?;
  let mtime = meta
    .modified()
    .ok()
    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
    .map_or(0, |d| d.as_secs());
  let stem = src.file_stem().and_then(|s| s.to_str()).unwrap_or("layer");
  let dest = cache_dir.join(format!("{stem}_{mtime}_{}", meta.len()));
  if dest.is_dir() {
    debug!(path = %dest.display(), "reusing extracted layer");
    return Ok(dest);
  }

  let tmp = dest.with_file_name(format!(
    "{}.tmp",
    dest.file_name().and_then(|n| n.to_str()).unwrap_or("layer")
  ));
  if tmp.exists() {
    fs::remove_dir_all(&tmp).map_err(io_err(&tmp))?;
  }
  fs::create_dir_all(&tmp).map_err(io_err(&tmp))?;

  if let Err(err) = unzip(src, &tmp, limit) {
    let _ = fs::remove_dir_all(&tmp);
    return Err(err);
  }
  fs::rename(&tmp, &dest).map_err(io_err(&dest))?;
  debug!(src = %src.display(), dest = %dest.display(), "extracted layer");
  Ok(dest)
}

fn unzip(src: &Path, dest: &Path, limit: u64) -> Result<(), LayerError> {
  let file = File::open(src).map_err(io_err(src))?;
  let archive_err = |source| LayerError::Archive {
    path: src.to_path_buf(),
    source,
  };
  let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(archive_err)?;

  for i in 0..archive.len() {
    let mut entry = archive.by_index(i).map_err(archive_err)?;
    let name = entry.name().to_string();
    let Some(relative) = entry.enclosed_name() else {
      return Err(LayerError::PathTraversal(name));
    };
    if relative.as_os_str().is_empty() {
      continue;
    }
    let target = dest.join(&relative);

    if entry.is_dir() {
      fs::create_dir_all(&target).map_err(io_err(&target))?;
      continue;
    }
    if entry.size() > limit {
      return Err(LayerError::EntryTooLarge(name));
    }
    if let Some(parent) = target.parent() {
      fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let mut out = File::create(&target).map_err(io_err(&target))?;
    let written = io::copy(&mut (&mut entry).take(limit + 1), &mut out).map_err(io_err(&target))?;
    if written > limit {
      return Err(LayerError::EntryTooLarge(name));
    }

    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      if let Some(mode) = entry.unix_mode() {
        fs::set_permissions(&target, fs::Permissions::from_mode(mode)).map_err(io_err(&target))?;
      }
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use tempfile::TempDir;
  use zip::write::SimpleFileOptions;

  fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
    for (name, data) in entries {
      if name.ends_with('/') {
        zip.add_directory(*name, SimpleFileOptions::default()).unwrap();
      } else {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(data).unwrap();
      }
    }
    zip.finish().unwrap();
  }

  fn leftovers(cache: &Path) -> Vec<String> {
    match fs::read_dir(cache) {
      Ok(entries) => entries
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect(),
      Err(_) => Vec::new(),
    }
  }

  #[test]
  fn extracts_into_keyed_dir() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("deps.zip");
    write_zip(&src, &[("python/", b""), ("python/mod.py", b"x = 1\n")]);
    let cache = temp.path().join("cache");

    let dest = extract_zip_layer(&src, &cache).unwrap();

    let name = dest.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("deps_"));
    assert!(name.ends_with(&format!("_{}", fs::metadata(&src).unwrap().len())));
    assert_eq!(fs::read_to_string(dest.join("python/mod.py")).unwrap(), "x = 1\n");
    assert_eq!(leftovers(&cache), vec![name]);
  }

  #[test]
  fn existing_extraction_is_reused() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("deps.zip");
    write_zip(&src, &[("a.txt", b"a")]);
    let cache = temp.path().join("cache");

    let first = extract_zip_layer(&src, &cache).unwrap();
    fs::write(first.join("marker"), "kept").unwrap();
    let second = extract_zip_layer(&src, &cache).unwrap();

    assert_eq!(first, second);
    assert!(second.join("marker").exists());
  }

  #[test]
  fn traversal_entry_is_rejected() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("evil.zip");
    write_zip(&src, &[("ok.txt", b"ok"), ("../escape.txt", b"bad")]);
    let cache = temp.path().join("cache");

    let err = extract_zip_layer(&src, &cache).unwrap_err();

    assert!(matches!(err, LayerError::PathTraversal(ref n) if n == "../escape.txt"));
    assert!(!temp.path().join("escape.txt").exists());
    assert!(leftovers(&cache).is_empty());
  }

  #[test]
  fn oversized_entry_is_rejected() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("big.zip");
    write_zip(&src, &[("big.bin", &[0u8; 64])]);
    let cache = temp.path().join("cache");

    let err = extract_with_limit(&src, &cache, 16).unwrap_err();

    assert!(matches!(err, LayerError::EntryTooLarge(ref n) if n == "big.bin"));
    assert!(leftovers(&cache).is_empty());
  }

  #[test]
  fn missing_cache_dir_is_an_error() {
    let err = extract_zip_layer(Path::new("x.zip"), Path::new("")).unwrap_err();
    assert!(matches!(err, LayerError::CacheDirRequired));
  }
}
