//! Staging directory layout shared by the builder and the runtime.

use std::path::{Path, PathBuf};

use crate::consts::{APP_NAME, CONFIG_DIR, FINGERPRINT_BYTES};
use crate::util::hash::short_hex;

/// Filesystem-safe key for a compose project.
///
/// Falls back to `fnbox-<env>` and then `fnbox` when the project is blank.
pub fn project_key(project: &str, env: &str) -> String {
  let project = project.trim();
  if !project.is_empty() {
    return project.to_string();
  }
  let env = env.trim();
  if !env.is_empty() {
    return format!("{}-{}", APP_NAME, env.to_lowercase());
  }
  APP_NAME.to_string()
}

/// Stable cache key for a project and environment: `<projectKey>-<8 hex>`.
pub fn cache_key(project: &str, env: &str) -> String {
  let key = project_key(project, env);
  let env = env.trim();
  let seed = if env.is_empty() {
    key.clone()
  } else {
    format!("{}:{}", key, env.to_lowercase())
  };
  format!("{}-{}", key, short_hex(seed.as_bytes(), FINGERPRINT_BYTES))
}

/// `<root>/<projectKey>/<env|default>`
pub fn base_dir(root: &Path, project: &str, env: &str) -> PathBuf {
  let env_key = match env.trim() {
    "" => "default".to_string(),
    env => env.to_lowercase(),
  };
  root.join(project_key(project, env)).join(env_key)
}

/// The merged config store for a project and environment.
pub fn config_dir(root: &Path, project: &str, env: &str) -> PathBuf {
  base_dir(root, project, env).join(CONFIG_DIR)
}
