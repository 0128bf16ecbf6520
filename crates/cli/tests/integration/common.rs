//! Shared test helpers for CLI integration tests.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Isolated test environment.
///
/// Each test gets its own temporary directory with a rendered output tree and
/// an isolated config store and lock root.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  /// Write a file relative to the temp directory.
  pub fn write_file(&self, relative_path: &str, content: &str) {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  pub fn read_file(&self, relative_path: &str) -> String {
    std::fs::read_to_string(self.temp.path().join(relative_path)).unwrap()
  }

  /// Render the three config documents into `out/config`.
  pub fn stage(&self, functions: &str, routing: &str, resources: &str) {
    self.write_file("out/config/functions.yml", functions);
    self.write_file("out/config/routing.yml", routing);
    self.write_file("out/config/resources.yml", resources);
  }

  /// Rendered output directory.
  pub fn output_path(&self) -> PathBuf {
    let p = self.temp.path().join("out");
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  /// Config store path; not created so first merges start empty.
  pub fn store_path(&self) -> PathBuf {
    self.root().join("store")
  }

  pub fn root(&self) -> &Path {
    self.temp.path()
  }

  /// Get a pre-configured Command for the fnbox binary.
  ///
  /// Sets environment variables for isolated testing:
  /// - `FNBOX_LOCK_DIR`: Isolated lock root
  /// - `FNBOX_STAGING_DIR`: Isolated staging root
  /// - `XDG_CACHE_HOME`: Isolated cache path
  /// - `LOCALAPPDATA`: Isolated cache path (for Windows)
  pub fn fnbox_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("fnbox");
    cmd.env("FNBOX_LOCK_DIR", self.root().join("locks"));
    cmd.env("FNBOX_STAGING_DIR", self.root().join("staging"));
    cmd.env("XDG_CACHE_HOME", self.root().join("cache"));
    cmd.env("LOCALAPPDATA", self.root().join("cache"));
    cmd.env_remove("RUST_LOG");
    cmd
  }
}
