//! Named advisory file locks.
//!
//! Locks live under a lock root as `.lock-<name>` and only coordinate
//! processes on the same host that choose to take them. The holder writes
//! [`LockMetadata`] into the file so contention errors can name it.
//!
//! Handles release on drop, so every exit path (including unwinding and
//! cancelled waits) gives the lock back.

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::consts::LOCK_DEPLOY;

/// Interval between non-blocking attempts when polling for a lock.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long the config merge waits for the deploy lock.
pub const DEPLOY_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMetadata {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub command: String,
}

#[derive(Debug, Error)]
pub enum LockError {
  #[error("lock root is empty")]
  EmptyRoot,

  #[error("failed to create lock directory {path}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to open lock file {path}: {source}")]
  OpenFile {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to acquire lock {path}: {source}")]
  LockFailed {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("timed out after {waited:?} waiting for {path}{}", describe_holder(.holder))]
  Timeout {
    path: PathBuf,
    waited: Duration,
    holder: Option<LockMetadata>,
  },

  #[error("cancelled while waiting for {path}")]
  Cancelled { path: PathBuf },
}

fn describe_holder(holder: &Option<LockMetadata>) -> String {
  match holder {
    Some(h) => format!(" (held by {} PID {})", h.command, h.pid),
    None => String::new(),
  }
}

/// Path of the lock file for `name` under `root`.
pub fn lock_path(root: &Path, name: &str) -> PathBuf {
  root.join(format!(".lock-{}", name.trim()))
}

/// An exclusive claim on a lock file, released on drop.
#[derive(Debug)]
pub struct LockHandle {
  file: File,
  path: PathBuf,
}

impl LockHandle {
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Reads the metadata through the held handle.
  ///
  /// Opening a second handle would fail on Windows, where the lock is mandatory.
  pub fn read_metadata(&self) -> io::Result<LockMetadata> {
    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  fn claim(file: File, path: PathBuf, command: &str) -> Self {
    if let Err(err) = write_metadata(&file, command) {
      debug!(path = %path.display(), error = %err, "could not record lock metadata");
    }
    LockHandle { file, path }
  }
}

impl Drop for LockHandle {
  fn drop(&mut self) {
    let _ = unlock(&self.file);
  }
}

/// Locks for builder, bake, and base-image operations.
pub struct BuildLock;

impl BuildLock {
  /// Block until `<root>/.lock-<name>` is held exclusively.
  pub fn acquire(root: &Path, name: &str, command: &str) -> Result<LockHandle, LockError> {
    let (file, path) = open_lock_file(root, name)?;
    debug!(path = %path.display(), "waiting for lock");
    lock_blocking(&file).map_err(|source| LockError::LockFailed {
      path: path.clone(),
      source,
    })?;
    Ok(LockHandle::claim(file, path, command))
  }

  /// Wait for the lock without blocking the runtime.
  ///
  /// Polls indefinitely; only `cancel` ends the wait early.
  pub async fn acquire_cancellable(
    root: &Path,
    name: &str,
    command: &str,
    cancel: &CancellationToken,
  ) -> Result<LockHandle, LockError> {
    let (file, path) = open_lock_file(root, name)?;
    poll_lock(file, path, command, None, cancel).await
  }
}

/// The lock guarding the merged config store of one deployment.
pub struct DeployLock;

impl DeployLock {
  /// Poll for `<config_dir>/.lock-deploy`, giving up after `timeout`.
  pub fn acquire(config_dir: &Path, timeout: Duration, command: &str) -> Result<LockHandle, LockError> {
    let (file, path) = open_lock_file(config_dir, LOCK_DEPLOY)?;
    let start = Instant::now();
    loop {
      match try_lock(&file) {
        Ok(()) => return Ok(LockHandle::claim(file, path, command)),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
          if start.elapsed() >= timeout {
            return Err(timeout_error(path, start.elapsed()));
          }
          std::thread::sleep(POLL_INTERVAL);
        }
        Err(source) => return Err(LockError::LockFailed { path, source }),
      }
    }
  }

  /// Async form of [`DeployLock::acquire`] that also honours `cancel`.
  pub async fn acquire_cancellable(
    config_dir: &Path,
    timeout: Duration,
    command: &str,
    cancel: &CancellationToken,
  ) -> Result<LockHandle, LockError> {
    let (file, path) = open_lock_file(config_dir, LOCK_DEPLOY)?;
    poll_lock(file, path, command, Some(timeout), cancel).await
  }
}

/// Run `f` while holding the named lock. An empty name runs `f` unlocked.
pub fn with_lock<T, E, F>(root: &Path, name: &str, command: &str, f: F) -> Result<T, E>
where
  F: FnOnce() -> Result<T, E>,
  E: From<LockError>,
{
  if name.trim().is_empty() {
    return f();
  }
  let _guard = BuildLock::acquire(root, name, command)?;
  f()
}

/// Await `fut` while holding the named lock. An empty name awaits it unlocked.
///
/// `fut` does not start running until the lock is held.
pub async fn with_lock_async<T, E, Fut>(
  root: &Path,
  name: &str,
  command: &str,
  cancel: &CancellationToken,
  fut: Fut,
) -> Result<T, E>
where
  Fut: Future<Output = Result<T, E>>,
  E: From<LockError>,
{
  if name.trim().is_empty() {
    return fut.await;
  }
  let _guard = BuildLock::acquire_cancellable(root, name, command, cancel).await?;
  fut.await
}

fn open_lock_file(root: &Path, name: &str) -> Result<(File, PathBuf), LockError> {
  if root.as_os_str().is_empty() {
    return Err(LockError::EmptyRoot);
  }
  std::fs::create_dir_all(root).map_err(|source| LockError::CreateDir {
    path: root.to_path_buf(),
    source,
  })?;

  let path = lock_path(root, name);
  let file = OpenOptions::new()
    .read(true)
    .write(true)
    .create(true)
    .truncate(false)
    .open(&path)
    .map_err(|source| LockError::OpenFile {
      path: path.clone(),
      source,
    })?;
  Ok((file, path))
}

async fn poll_lock(
  file: File,
  path: PathBuf,
  command: &str,
  timeout: Option<Duration>,
  cancel: &CancellationToken,
) -> Result<LockHandle, LockError> {
  let start = Instant::now();
  let mut logged = false;
  loop {
    match try_lock(&file) {
      Ok(()) => return Ok(LockHandle::claim(file, path, command)),
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
        if let Some(timeout) = timeout
          && start.elapsed() >= timeout
        {
          return Err(timeout_error(path, start.elapsed()));
        }
        if !logged {
          debug!(path = %path.display(), "lock busy, waiting");
          logged = true;
        }
        tokio::select! {
          _ = cancel.cancelled() => return Err(LockError::Cancelled { path }),
          _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
      }
      Err(source) => return Err(LockError::LockFailed { path, source }),
    }
  }
}

fn timeout_error(path: PathBuf, waited: Duration) -> LockError {
  let holder = read_holder(&path);
  LockError::Timeout { path, waited, holder }
}

fn read_holder(path: &Path) -> Option<LockMetadata> {
  let contents = std::fs::read_to_string(path).ok()?;
  serde_json::from_str(&contents).ok()
}

fn write_metadata(file: &File, command: &str) -> io::Result<()> {
  let metadata = LockMetadata {
    version: 1,
    pid: std::process::id(),
    started_at_unix: SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs(),
    command: command.to_string(),
  };

  file.set_len(0)?;
  let mut writer = io::BufWriter::new(file);
  writer.seek(SeekFrom::Start(0))?;
  serde_json::to_writer_pretty(&mut writer, &metadata).map_err(io::Error::other)?;
  writer.flush()
}

#[cfg(unix)]
fn flock(file: &File, operation: rustix::fs::FlockOperation) -> io::Result<()> {
  use std::os::unix::io::AsFd;

  rustix::fs::flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(unix)]
fn try_lock(file: &File) -> io::Result<()> {
  flock(file, rustix::fs::FlockOperation::NonBlockingLockExclusive)
}

#[cfg(unix)]
fn lock_blocking(file: &File) -> io::Result<()> {
  flock(file, rustix::fs::FlockOperation::LockExclusive)
}

#[cfg(unix)]
fn unlock(file: &File) -> io::Result<()> {
  flock(file, rustix::fs::FlockOperation::Unlock)
}

#[cfg(windows)]
fn lock_file_ex(file: &File, flags: u32) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::LockFileEx;

  let handle = file.as_raw_handle() as HANDLE;

  // SAFETY: OVERLAPPED is a plain data struct that is valid when zero-initialized.
  // LockFileEx is safe to call with a valid file handle and zeroed OVERLAPPED.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
  };

  if result == 0 {
    let err = io::Error::last_os_error();
    // ERROR_LOCK_VIOLATION
    if err.raw_os_error() == Some(33) {
      return Err(io::Error::new(io::ErrorKind::WouldBlock, err));
    }
    Err(err)
  } else {
    Ok(())
  }
}

#[cfg(windows)]
fn try_lock(file: &File) -> io::Result<()> {
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};
  lock_file_ex(file, LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK)
}

#[cfg(windows)]
fn lock_blocking(file: &File) -> io::Result<()> {
  use windows_sys::Win32::Storage::FileSystem::LOCKFILE_EXCLUSIVE_LOCK;
  lock_file_ex(file, LOCKFILE_EXCLUSIVE_LOCK)
}

#[cfg(windows)]
fn unlock(file: &File) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::UnlockFile;

  let handle = file.as_raw_handle() as HANDLE;
  // SAFETY: the handle is owned by `file` and stays valid for the call.
  let result = unsafe { UnlockFile(handle, 0, 0, 1, 0) };
  if result == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}
