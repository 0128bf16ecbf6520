//! Platform directory resolution.
//!
//! Every function takes an environment lookup so that configuration can be
//! resolved once into [`crate::config::BuildEnv`] and tested without touching
//! the process environment.

use std::path::PathBuf;

use crate::consts::APP_NAME;

/// Returns the user's home directory
#[cfg(windows)]
pub fn home_dir(lookup: &dyn Fn(&str) -> Option<String>) -> Option<PathBuf> {
  non_empty(lookup("USERPROFILE")).map(PathBuf::from)
}

/// Returns the user's home directory
#[cfg(not(windows))]
pub fn home_dir(lookup: &dyn Fn(&str) -> Option<String>) -> Option<PathBuf> {
  non_empty(lookup("HOME")).map(PathBuf::from)
}

/// Returns the directory for cache files for the application
#[cfg(windows)]
pub fn cache_dir(lookup: &dyn Fn(&str) -> Option<String>) -> Option<PathBuf> {
  non_empty(lookup("LOCALAPPDATA")).map(|p| PathBuf::from(p).join(APP_NAME).join("Cache"))
}

/// Returns the directory for cache files for the application
#[cfg(not(windows))]
pub fn cache_dir(lookup: &dyn Fn(&str) -> Option<String>) -> Option<PathBuf> {
  let cache_home = non_empty(lookup("XDG_CACHE_HOME"))
    .map(PathBuf::from)
    .or_else(|| home_dir(lookup).map(|h| h.join(".cache")))?;
  Some(cache_home.join(APP_NAME))
}

/// Root directory for named lock files: `FNBOX_LOCK_DIR`, else the cache dir.
pub fn lock_root(lookup: &dyn Fn(&str) -> Option<String>) -> Option<PathBuf> {
  non_empty(lookup("FNBOX_LOCK_DIR"))
    .map(PathBuf::from)
    .or_else(|| cache_dir(lookup))
}

/// Directory holding the docker CLI config: `DOCKER_CONFIG`, else `~/.docker`.
pub fn docker_config_dir(lookup: &dyn Fn(&str) -> Option<String>) -> Option<PathBuf> {
  non_empty(lookup("DOCKER_CONFIG"))
    .map(PathBuf::from)
    .or_else(|| home_dir(lookup).map(|h| h.join(".docker")))
}

fn non_empty(value: Option<String>) -> Option<String> {
  value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
