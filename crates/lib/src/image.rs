//! External image references.
//!
//! Functions backed by a pre-built image carry an `image_source` hosted
//! somewhere outside the platform. Runtime containers only pull from the
//! internal registry, so every foreign source is mapped to an internal
//! reference and recorded in the image-import manifest.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::consts::DEFAULT_REGISTRY;
use crate::exec::{CommandRunner, ExecError, args, cancellable};
use crate::types::FunctionSpec;
use crate::util::atomic::{AtomicWriteError, write_json};

const DEFAULT_HOST: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";
const MANIFEST_VERSION: &str = "1";
const DIGEST_TAG_LEN: usize = 12;
const MAX_TAG_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum ImageError {
  #[error("image reference is empty")]
  EmptyReference,

  #[error("invalid image reference: {0}")]
  InvalidReference(String),

  #[error("image pull failed: image={image}: {source}")]
  PullFailed {
    image: String,
    #[source]
    source: ExecError,
  },

  #[error("image authentication failed: image={image}: {source}")]
  AuthFailed {
    image: String,
    #[source]
    source: ExecError,
  },

  #[error("no repo digest for {0} after pull")]
  NoDigest(String),

  #[error("failed to write image import manifest: {0}")]
  Write(#[from] AtomicWriteError),

  #[error("operation cancelled")]
  Cancelled,
}

/// An image reference split into its components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
  pub host: String,
  pub repository: String,
  /// Always populated: the explicit tag, a tag derived from the digest, or `latest`.
  pub tag: String,
  pub digest: Option<String>,
}

impl ImageReference {
  /// Split `reference` using the usual docker grammar.
  ///
  /// The digest follows `@`, the tag follows the last `:` after the last `/`.
  /// The first path component is a registry host only when it looks like one
  /// (contains `.` or `:`, or is `localhost`); otherwise the host is
  /// `docker.io` and single-component names get the `library/` namespace.
  pub fn parse(reference: &str) -> Result<Self, ImageError> {
    let trimmed = reference.trim();
    if trimmed.is_empty() {
      return Err(ImageError::EmptyReference);
    }

    let (name, digest) = match trimmed.split_once('@') {
      Some((name, digest)) => (name, Some(digest.trim().to_string()).filter(|d| !d.is_empty())),
      None => (trimmed, None),
    };
    if let Some(digest) = &digest
      && !is_valid_digest(digest)
    {
      return Err(ImageError::InvalidReference(reference.to_string()));
    }

    let last_slash = name.rfind('/');
    let (name, tag) = match name.rfind(':') {
      Some(colon) if last_slash.is_none_or(|slash| colon > slash) => (&name[..colon], Some(&name[colon + 1..])),
      _ => (name, None),
    };

    let tag = match tag.map(str::trim).filter(|t| !t.is_empty()) {
      Some(tag) => tag.to_string(),
      None => digest.as_deref().map(digest_to_tag).unwrap_or_else(|| DEFAULT_TAG.to_string()),
    };

    let (host, repository) = match name.split_once('/') {
      Some((first, rest)) if is_registry_host(first) => (first.to_string(), rest.to_string()),
      _ => (DEFAULT_HOST.to_string(), name.to_string()),
    };
    let repository = if host == DEFAULT_HOST && !repository.contains('/') && !repository.is_empty() {
      format!("library/{repository}")
    } else {
      repository
    };

    if repository.is_empty() || repository.starts_with('/') || repository.ends_with('/') {
      return Err(ImageError::InvalidReference(reference.to_string()));
    }

    Ok(Self {
      host,
      repository,
      tag,
      digest,
    })
  }

  pub fn is_digest_pinned(&self) -> bool {
    self.digest.as_deref().is_some_and(|d| d.starts_with("sha256:"))
  }
}

fn is_registry_host(component: &str) -> bool {
  component.contains('.') || component.contains(':') || component == "localhost"
}

/// `<algorithm>:<hex>` with an ASCII algorithm name and a non-empty hex part.
fn is_valid_digest(digest: &str) -> bool {
  let Some((algorithm, hex)) = digest.split_once(':') else {
    return false;
  };
  !algorithm.is_empty()
    && algorithm
      .bytes()
      .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'+' | b'.' | b'_' | b'-'))
    && !hex.is_empty()
    && hex.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Deterministic tag for a digest-only reference: `sha256-<first 12 hex>`.
///
/// Anything else is reduced to the docker tag alphabet `[A-Za-z0-9_.-]`.
pub fn digest_to_tag(digest: &str) -> String {
  let trimmed = digest.trim();
  if let Some(hex) = trimmed.strip_prefix("sha256:")
    && let Some(short) = hex.get(..hex.len().min(DIGEST_TAG_LEN))
    && short.bytes().all(|b| b.is_ascii_hexdigit())
  {
    return format!("sha256-{short}");
  }

  let sanitized: String = trimmed
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') { c } else { '-' })
    .take(MAX_TAG_LEN)
    .collect();
  // A tag may not start with '.' or '-'.
  match sanitized.trim_start_matches(['.', '-']) {
    "" => DEFAULT_TAG.to_string(),
    tag => tag.to_string(),
  }
}

/// Host part of a runtime registry address, defaulting to the control-plane registry.
pub fn resolve_internal_registry(runtime_registry: &str) -> String {
  let trimmed = runtime_registry.trim();
  let trimmed = trimmed
    .strip_prefix("http://")
    .or_else(|| trimmed.strip_prefix("https://"))
    .unwrap_or(trimmed);
  let host = trimmed.trim_end_matches('/').split('/').next().unwrap_or_default().trim();
  if host.is_empty() {
    DEFAULT_REGISTRY.to_string()
  } else {
    host.to_string()
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageImportEntry {
  pub function_name: String,
  pub image_source: String,
  pub image_ref: String,
}

/// On-disk form of `config/image-import.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageImportManifest {
  pub version: String,
  pub push_target: String,
  pub images: Vec<ImageImportEntry>,
}

/// Map an external source to its internal reference.
///
/// Returns the entry and whether an import is required. Sources already
/// hosted on the internal registry are returned unchanged.
pub fn build_image_import_entry(
  function_name: &str,
  source: &str,
  internal_registry: &str,
) -> Result<(ImageImportEntry, bool), ImageError> {
  let source = source.trim();
  let reference = ImageReference::parse(source)?;
  let internal = resolve_internal_registry(internal_registry);

  if reference.host.eq_ignore_ascii_case(&internal) {
    let entry = ImageImportEntry {
      function_name: function_name.to_string(),
      image_source: source.to_string(),
      image_ref: source.to_string(),
    };
    return Ok((entry, false));
  }

  let image_ref = format!(
    "{}/{}/{}:{}",
    internal,
    reference.host.replace(':', "_"),
    reference.repository,
    reference.tag
  );
  let entry = ImageImportEntry {
    function_name: function_name.to_string(),
    image_source: source.to_string(),
    image_ref,
  };
  Ok((entry, true))
}

/// Fill `image_ref` on every externally sourced function and return the
/// entries that need an import, sorted by function name then ref.
pub fn resolve_image_imports(
  functions: &mut [FunctionSpec],
  runtime_registry: &str,
) -> Result<Vec<ImageImportEntry>, ImageError> {
  let mut entries = Vec::new();
  for function in functions.iter_mut().filter(|f| f.has_image_source()) {
    let (entry, needs_import) = build_image_import_entry(&function.name, &function.image_source, runtime_registry)?;
    function.image_ref = entry.image_ref.clone();
    if needs_import {
      entries.push(entry);
    }
  }
  entries.sort_by(|a, b| {
    a.function_name
      .cmp(&b.function_name)
      .then_with(|| a.image_ref.cmp(&b.image_ref))
  });
  Ok(entries)
}

pub fn write_image_import_manifest(
  path: &Path,
  entries: &[ImageImportEntry],
  push_target: &str,
) -> Result<(), ImageError> {
  let manifest = ImageImportManifest {
    version: MANIFEST_VERSION.to_string(),
    push_target: push_target.trim().to_string(),
    images: entries.to_vec(),
  };
  write_json(path, &manifest)?;
  debug!(path = ?path, images = entries.len(), "wrote image import manifest");
  Ok(())
}

// Inspection helpers. A failed inspection means "absent" so callers fall
// back to rebuilding rather than aborting.

pub async fn image_exists(runner: &dyn CommandRunner, dir: &Path, tag: &str) -> bool {
  if tag.is_empty() {
    return false;
  }
  match runner.run_output(dir, "docker", &args(["image", "ls", "-q", tag])).await {
    Ok(out) => !out.trim().is_empty(),
    Err(_) => false,
  }
}

pub async fn image_id(runner: &dyn CommandRunner, dir: &Path, tag: &str) -> Option<String> {
  if !image_exists(runner, dir, tag).await {
    return None;
  }
  let out = runner
    .run_output(dir, "docker", &args(["image", "inspect", "--format", "{{.Id}}", tag]))
    .await
    .ok()?;
  Some(out.trim().to_string()).filter(|id| !id.is_empty())
}

pub async fn image_has_label_value(
  runner: &dyn CommandRunner,
  dir: &Path,
  tag: &str,
  label: &str,
  expected: &str,
) -> bool {
  if label.is_empty() || expected.is_empty() || !image_exists(runner, dir, tag).await {
    return false;
  }
  let format = format!("{{{{ index .Config.Labels {label:?} }}}}");
  match runner
    .run_output(dir, "docker", &args(["image", "inspect", "--format", format.as_str(), tag]))
    .await
  {
    Ok(out) => out.trim() == expected,
    Err(_) => false,
  }
}

/// Repo digests of a local image, deduplicated and sorted.
pub async fn image_repo_digests(runner: &dyn CommandRunner, dir: &Path, tag: &str) -> Vec<String> {
  if tag.is_empty() {
    return Vec::new();
  }
  let format = "{{range .RepoDigests}}{{println .}}{{end}}";
  let Ok(out) = runner
    .run_output(dir, "docker", &args(["image", "inspect", "--format", format, tag]))
    .await
  else {
    return Vec::new();
  };
  out
    .lines()
    .map(str::trim)
    .filter(|line| !line.is_empty())
    .map(String::from)
    .collect::<BTreeSet<_>>()
    .into_iter()
    .collect()
}

/// Resolve a digest for every external image source.
///
/// Digest-pinned sources are taken as-is. Mutable tags are pulled so the
/// recorded digest tracks upstream changes.
pub async fn resolve_source_digests(
  runner: &dyn CommandRunner,
  dir: &Path,
  functions: &[FunctionSpec],
  cancel: &CancellationToken,
) -> Result<BTreeMap<String, String>, ImageError> {
  let sources: BTreeSet<&str> = functions
    .iter()
    .filter(|f| f.has_image_source())
    .map(|f| f.image_source.trim())
    .collect();

  let mut digests = BTreeMap::new();
  for source in sources {
    let reference = ImageReference::parse(source)?;
    if reference.is_digest_pinned()
      && let Some(digest) = reference.digest
    {
      debug!(source = %source, digest = %digest, "using pinned digest");
      digests.insert(source.to_string(), digest);
      continue;
    }

    info!(image = %source, "pulling image source");
    let pull_args = args(["pull", source]);
    let pull = runner.run_output(dir, "docker", &pull_args);
    cancellable(cancel, pull)
      .await
      .map_err(|err| classify_pull_error(source, err))?;

    let resolved = image_repo_digests(runner, dir, source).await;
    let digest = resolved
      .into_iter()
      .next()
      .ok_or_else(|| ImageError::NoDigest(source.to_string()))?;
    debug!(source = %source, digest = %digest, "resolved source digest");
    digests.insert(source.to_string(), digest);
  }
  Ok(digests)
}

fn classify_pull_error(image: &str, err: ExecError) -> ImageError {
  if matches!(err, ExecError::Cancelled) {
    return ImageError::Cancelled;
  }
  let message = err.output().unwrap_or_default().to_lowercase();
  let image = image.to_string();
  if ["unauthorized", "authentication required", "denied"]
    .iter()
    .any(|needle| message.contains(needle))
  {
    ImageError::AuthFailed { image, source: err }
  } else {
    ImageError::PullFailed { image, source: err }
  }
}
