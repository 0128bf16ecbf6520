//! Last-write-wins merge of generated config into the shared config store.
//!
//! Several independent template deployments feed one running platform. Each
//! deploy stages its own `functions.yml`, `routing.yml`, `resources.yml` and
//! optionally `image-import.json`; this module folds them into the store
//! under the deploy lock.
//!
//! Every section is merged in memory first. Files are only written once all
//! sections merged successfully, each through the atomic store, so a bad
//! existing document never leaves the store half updated.
//!
//! # Submodules
//!
//! - [`functions`] - functions by name, defaults fill gaps only
//! - [`routes`] - routes by `path:method`
//! - [`resources`] - tables, buckets and layers by name
//! - [`image_import`] - image import entries by function name

pub mod functions;
pub mod image_import;
pub mod resources;
pub mod routes;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::consts::{APP_NAME, CONFIG_DIR, FUNCTIONS_FILE, IMAGE_IMPORT_FILE, RESOURCES_FILE, ROUTING_FILE};
use crate::image::ImageImportManifest;
use crate::lock::{DeployLock, LockError};
use crate::util::atomic::{AtomicWriteError, write_json, write_yaml};

#[derive(Debug, Error)]
pub enum MergeError {
  #[error("output dir is required")]
  OutputDirRequired,

  #[error("config dir is required")]
  ConfigDirRequired,

  #[error("config not found: {0}")]
  SourceMissing(PathBuf),

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse {path}: {source}")]
  ParseYaml {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("failed to parse {path}: {source}")]
  ParseJson {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to acquire deploy lock: {0}")]
  Lock(#[from] LockError),

  #[error(transparent)]
  Write(#[from] AtomicWriteError),
}

/// Entry counts in the store after a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
  pub config_dir: PathBuf,
  pub functions: usize,
  pub routes: usize,
  pub tables: usize,
  pub buckets: usize,
  pub layers: usize,
  /// `None` when the deploy staged no image import manifest.
  pub images: Option<usize>,
}

/// The fully merged store, not yet written.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedConfig {
  pub functions: Mapping,
  pub routing: Mapping,
  pub resources: Mapping,
  pub image_import: Option<ImageImportManifest>,
}

impl MergedConfig {
  /// Merge the staged `src_dir` documents over those in `dest_dir`.
  ///
  /// Staged YAML documents are required; the staged image import manifest
  /// is optional. Missing store documents read as empty.
  pub fn load(src_dir: &Path, dest_dir: &Path) -> Result<Self, MergeError> {
    let functions = functions::merge_functions(
      &load_yaml(&dest_dir.join(FUNCTIONS_FILE), false)?,
      &load_yaml(&src_dir.join(FUNCTIONS_FILE), true)?,
    );
    let routing = routes::merge_routes(
      &load_yaml(&dest_dir.join(ROUTING_FILE), false)?,
      &load_yaml(&src_dir.join(ROUTING_FILE), true)?,
    );
    let resources = resources::merge_resources(
      &load_yaml(&dest_dir.join(RESOURCES_FILE), false)?,
      &load_yaml(&src_dir.join(RESOURCES_FILE), true)?,
    );
    let image_import = match load_manifest(&src_dir.join(IMAGE_IMPORT_FILE))? {
      Some(incoming) => {
        let existing = load_manifest(&dest_dir.join(IMAGE_IMPORT_FILE))?.unwrap_or_default();
        Some(image_import::merge_image_import(&existing, &incoming))
      }
      None => None,
    };

    Ok(Self {
      functions,
      routing,
      resources,
      image_import,
    })
  }

  pub fn write(&self, dest_dir: &Path) -> Result<(), MergeError> {
    write_yaml(&dest_dir.join(FUNCTIONS_FILE), &self.functions)?;
    write_yaml(&dest_dir.join(ROUTING_FILE), &self.routing)?;
    write_yaml(&dest_dir.join(RESOURCES_FILE), &self.resources)?;
    if let Some(manifest) = &self.image_import {
      write_json(&dest_dir.join(IMAGE_IMPORT_FILE), manifest)?;
    }
    Ok(())
  }

  pub fn report(&self, config_dir: &Path) -> MergeReport {
    let resources = functions::section(&self.resources, "resources");
    let count = |kind: &str| resources.get(kind).and_then(Value::as_sequence).map_or(0, Vec::len);
    MergeReport {
      config_dir: config_dir.to_path_buf(),
      functions: functions::section(&self.functions, "functions").len(),
      routes: routes::sequence(&self.routing, "routes").len(),
      tables: count("dynamodb"),
      buckets: count("s3"),
      layers: count("layers"),
      images: self.image_import.as_ref().map(|m| m.images.len()),
    }
  }
}

/// Merge `<output_dir>/config` into `config_dir`, waiting at most `timeout`
/// for the deploy lock.
pub fn merge_config(output_dir: &Path, config_dir: &Path, timeout: Duration) -> Result<MergeReport, MergeError> {
  validate(output_dir, config_dir)?;
  let command = format!("{APP_NAME} merge");
  let _lock = DeployLock::acquire(config_dir, timeout, &command)?;
  merge_locked(output_dir, config_dir)
}

/// Async form of [`merge_config`]; the lock wait also stops on `cancel`.
pub async fn merge_config_cancellable(
  output_dir: &Path,
  config_dir: &Path,
  timeout: Duration,
  cancel: &CancellationToken,
) -> Result<MergeReport, MergeError> {
  validate(output_dir, config_dir)?;
  let command = format!("{APP_NAME} deploy");
  let _lock = DeployLock::acquire_cancellable(config_dir, timeout, &command, cancel).await?;
  merge_locked(output_dir, config_dir)
}

fn validate(output_dir: &Path, config_dir: &Path) -> Result<(), MergeError> {
  if output_dir.as_os_str().is_empty() {
    return Err(MergeError::OutputDirRequired);
  }
  if config_dir.as_os_str().is_empty() {
    return Err(MergeError::ConfigDirRequired);
  }
  Ok(())
}

fn merge_locked(output_dir: &Path, config_dir: &Path) -> Result<MergeReport, MergeError> {
  let src_dir = output_dir.join(CONFIG_DIR);
  let merged = MergedConfig::load(&src_dir, config_dir)?;
  merged.write(config_dir)?;
  let report = merged.report(config_dir);
  info!(
    config_dir = %config_dir.display(),
    functions = report.functions,
    routes = report.routes,
    "merged config"
  );
  Ok(report)
}

fn load_yaml(path: &Path, required: bool) -> Result<Mapping, MergeError> {
  let Some(text) = read_optional(path)? else {
    if required {
      return Err(MergeError::SourceMissing(path.to_path_buf()));
    }
    debug!(path = %path.display(), "no existing document");
    return Ok(Mapping::new());
  };
  let doc: Option<Mapping> = serde_yaml::from_str(&text).map_err(|source| MergeError::ParseYaml {
    path: path.to_path_buf(),
    source,
  })?;
  Ok(doc.unwrap_or_default())
}

fn load_manifest(path: &Path) -> Result<Option<ImageImportManifest>, MergeError> {
  let Some(text) = read_optional(path)? else {
    return Ok(None);
  };
  serde_json::from_str(&text)
    .map(Some)
    .map_err(|source| MergeError::ParseJson {
      path: path.to_path_buf(),
      source,
    })
}

fn read_optional(path: &Path) -> Result<Option<String>, MergeError> {
  match std::fs::read_to_string(path) {
    Ok(text) => Ok(Some(text)),
    Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
    Err(source) => Err(MergeError::Read {
      path: path.to_path_buf(),
      source,
    }),
  }
}
