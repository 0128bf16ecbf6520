//! Bake targets and the buildx JSON definition they serialize to.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::consts::{FINGERPRINT_BYTES, LABEL_CA_FINGERPRINT, LABEL_MANAGED, ROOT_CA_FILENAME, ROOT_CA_SECRET_ID};
use crate::exec::ExecError;
use crate::lock::LockError;
use crate::registry::{is_local_registry_host, registry_host};
use crate::util::hash::short_hex;

/// Errors from assembling or running a bake group.
#[derive(Debug, Error)]
pub enum BakeError {
  #[error("repo root is required")]
  RepoRootRequired,

  #[error("group name is required")]
  GroupRequired,

  #[error("bake file not found: {path}")]
  BakeFileNotFound { path: PathBuf },

  #[error("function name is required")]
  FunctionNameRequired,

  #[error("function image name is required for {function}")]
  ImageNameRequired { function: String },

  #[error("dockerfile not found: {path}")]
  DockerfileNotFound { path: PathBuf },

  #[error("root CA not found at {path}")]
  RootCaNotFound { path: PathBuf },

  #[error("root CA path is not configured")]
  RootCaUnset,

  #[error("failed to read root CA {path}: {source}")]
  RootCaRead {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to create cache dir {path}: {source}")]
  CacheDir {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to write bake definition: {0}")]
  WriteDefinition(#[source] std::io::Error),

  #[error("failed to encode bake definition: {0}")]
  EncodeDefinition(#[from] serde_json::Error),

  #[error("buildx bake failed: {source}{}", failure_detail(.output, .hint))]
  Failed {
    group: String,
    #[source]
    source: ExecError,
    /// Captured builder output, trimmed. Empty when output was streamed.
    output: String,
    hint: Option<String>,
  },

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error("operation cancelled")]
  Cancelled,
}

fn failure_detail(output: &str, hint: &Option<String>) -> String {
  let mut detail = String::new();
  if !output.is_empty() {
    detail.push('\n');
    detail.push_str(output);
  }
  if let Some(hint) = hint {
    detail.push('\n');
    detail.push_str(hint);
  }
  detail
}

impl From<ExecError> for BakeError {
  fn from(err: ExecError) -> Self {
    match err {
      ExecError::Cancelled => BakeError::Cancelled,
      source => BakeError::Failed {
        group: String::new(),
        source,
        output: String::new(),
        hint: None,
      },
    }
  }
}

/// What a target builds. Each kind has its own constructor and skip rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
  /// The lambda base image every function image is layered on. Never skipped.
  LambdaBase,
  /// OS or language base carrying the root CA; skipped when its CA label matches.
  CaBase,
  /// A function image; skipped when its fingerprint label matches.
  Function,
}

/// One buildable unit handed to `docker buildx bake`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BakeTarget {
  pub name: String,
  pub kind: TargetKind,
  /// Build context. `None` leaves it to the repository bake file.
  pub context: Option<PathBuf>,
  pub dockerfile: Option<PathBuf>,
  pub tags: Vec<String>,
  pub outputs: Vec<String>,
  pub labels: BTreeMap<String, String>,
  pub args: BTreeMap<String, String>,
  /// Secondary named contexts.
  pub contexts: BTreeMap<String, String>,
  /// Mount-style secrets, `id=<id>,src=<path>`.
  pub secrets: Vec<String>,
  pub cache_from: Vec<String>,
  pub cache_to: Vec<String>,
  pub no_cache: bool,
}

impl BakeTarget {
  fn new(name: impl Into<String>, kind: TargetKind) -> Self {
    Self {
      name: name.into(),
      kind,
      context: None,
      dockerfile: None,
      tags: Vec::new(),
      outputs: Vec::new(),
      labels: BTreeMap::new(),
      args: BTreeMap::new(),
      contexts: BTreeMap::new(),
      secrets: Vec::new(),
      cache_from: Vec::new(),
      cache_to: Vec::new(),
      no_cache: false,
    }
  }

  /// The lambda base. Context and dockerfile come from the repository bake file.
  pub fn lambda_base(tag: String, outputs: Vec<String>, labels: BTreeMap<String, String>) -> Self {
    Self {
      tags: vec![tag],
      outputs,
      labels,
      ..Self::new("lambda-base", TargetKind::LambdaBase)
    }
  }

  /// An OS/language base that bakes in the root CA via a secret mount.
  pub fn ca_base(
    name: &str,
    common_dir: &Path,
    dockerfile_name: &str,
    tag: String,
    outputs: Vec<String>,
    root_ca: &RootCa,
  ) -> Self {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
    labels.insert(LABEL_CA_FINGERPRINT.to_string(), root_ca.fingerprint.clone());

    let mut args = BTreeMap::new();
    args.insert("ROOT_CA_FINGERPRINT".to_string(), root_ca.fingerprint.clone());
    args.insert("ROOT_CA_MOUNT_ID".to_string(), ROOT_CA_SECRET_ID.to_string());
    args.insert("ROOT_CA_CERT_FILENAME".to_string(), ROOT_CA_FILENAME.to_string());

    Self {
      context: Some(common_dir.to_path_buf()),
      dockerfile: Some(common_dir.join(dockerfile_name)),
      tags: vec![tag],
      outputs,
      labels,
      args,
      secrets: vec![format!("id={ROOT_CA_SECRET_ID},src={}", root_ca.path.display())],
      ..Self::new(name, TargetKind::CaBase)
    }
  }

  /// A function image built from the staged output tree.
  pub fn function(
    image_name: &str,
    output_dir: &Path,
    dockerfile: PathBuf,
    tag: String,
    outputs: Vec<String>,
    labels: BTreeMap<String, String>,
  ) -> Self {
    Self {
      context: Some(output_dir.to_path_buf()),
      dockerfile: Some(dockerfile),
      tags: vec![tag],
      outputs,
      labels,
      ..Self::new(format!("fn-{image_name}"), TargetKind::Function)
    }
  }

  /// Merge proxy build args. Explicit target args win.
  pub fn with_args(mut self, args: &BTreeMap<String, String>) -> Self {
    for (key, value) in args {
      self.args.entry(key.clone()).or_insert_with(|| value.clone());
    }
    self
  }

  pub fn with_no_cache(mut self, no_cache: bool) -> Self {
    self.no_cache = no_cache;
    self
  }

  /// Attach a local layer cache under `cache_root/scope`, creating the directory.
  pub fn with_local_cache(mut self, cache_root: &Path, scope: &str) -> Result<Self, BakeError> {
    let dir = cache_root.join(scope);
    std::fs::create_dir_all(&dir).map_err(|source| BakeError::CacheDir {
      path: dir.clone(),
      source,
    })?;
    self.cache_from = vec![format!("type=local,src={}", dir.display())];
    self.cache_to = vec![format!("type=local,dest={},mode=max", dir.display())];
    Ok(self)
  }
}

/// The root CA baked into OS/language bases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootCa {
  pub path: PathBuf,
  /// First 4 bytes of the certificate's SHA-256, hex encoded.
  pub fingerprint: String,
}

impl RootCa {
  pub fn load(path: Option<&Path>) -> Result<Self, BakeError> {
    let path = path.ok_or(BakeError::RootCaUnset)?;
    if !path.is_file() {
      return Err(BakeError::RootCaNotFound {
        path: path.to_path_buf(),
      });
    }
    let data = std::fs::read(path).map_err(|source| BakeError::RootCaRead {
      path: path.to_path_buf(),
      source,
    })?;
    Ok(Self {
      path: path.to_path_buf(),
      fingerprint: short_hex(&data, FINGERPRINT_BYTES),
    })
  }
}

/// Output sinks for a target.
///
/// Local docker output is kept when requested or when nothing is pushed.
/// Local registries are pushed to without TLS.
pub fn resolve_outputs(registry: &str, push: bool, include_docker: bool, force_insecure: bool) -> Vec<String> {
  let mut outputs = Vec::new();
  if include_docker || !push {
    outputs.push("type=docker".to_string());
  }
  if push && !registry.trim().is_empty() {
    let mut output = "type=registry".to_string();
    if force_insecure || is_local_registry_host(&registry_host(registry)) {
      output.push_str(",registry.insecure=true");
    }
    outputs.push(output);
  }
  outputs
}

/// Provenance mode from the `PROVENANCE` toggle.
///
/// Unset or truthy means `mode=max`, falsy disables attestation, anything
/// else is handed to buildx verbatim.
pub fn provenance_mode(value: Option<&str>) -> Option<String> {
  let value = value.map(str::trim).unwrap_or_default();
  if value.is_empty() {
    return Some("mode=max".to_string());
  }
  match value.to_ascii_lowercase().as_str() {
    "0" | "false" | "off" | "no" => None,
    "1" | "true" | "on" | "yes" => Some("mode=max".to_string()),
    _ => Some(value.to_string()),
  }
}

/// Filesystem entitlements for the targets: every absolute local path the
/// builder reads (contexts, secret sources, cache sources) and every cache
/// destination it writes.
pub fn allow_args(targets: &[BakeTarget]) -> Vec<String> {
  let mut read = BTreeSet::new();
  let mut write = BTreeSet::new();

  for target in targets {
    if let Some(context) = &target.context {
      add_local_path(&mut read, &context.to_string_lossy());
    }
    for context in target.contexts.values() {
      add_local_path(&mut read, context);
    }
    for secret in &target.secrets {
      if let Some(src) = key_value(secret, "src") {
        add_local_path(&mut read, src);
      }
    }
    for cache in &target.cache_from {
      if let Some(src) = key_value(cache, "src") {
        add_local_path(&mut read, src);
      }
    }
    for cache in &target.cache_to {
      if let Some(dest) = key_value(cache, "dest") {
        add_local_path(&mut write, dest);
      }
    }
  }

  read
    .into_iter()
    .map(|path| format!("--allow=fs.read={path}"))
    .chain(write.into_iter().map(|path| format!("--allow=fs.write={path}")))
    .collect()
}

fn add_local_path(paths: &mut BTreeSet<String>, value: &str) {
  let value = value.trim();
  if value.is_empty() || value.starts_with("target:") || value.contains("://") {
    return;
  }
  if !Path::new(value).is_absolute() {
    return;
  }
  paths.insert(value.to_string());
}

/// Value of `key` in a comma separated `k=v` spec.
fn key_value<'a>(spec: &'a str, key: &str) -> Option<&'a str> {
  spec
    .split(',')
    .filter_map(|part| part.trim().split_once('='))
    .find(|(k, _)| k.trim() == key)
    .map(|(_, v)| v.trim())
    .filter(|v| !v.is_empty())
}

/// Buildx JSON bake definition.
#[derive(Debug, Serialize)]
pub struct BakeDefinition {
  pub group: BTreeMap<String, BakeGroup>,
  pub target: BTreeMap<String, TargetDefinition>,
}

#[derive(Debug, Serialize)]
pub struct BakeGroup {
  pub targets: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct TargetDefinition {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub context: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub dockerfile: Option<String>,
  pub tags: Vec<String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub output: Vec<String>,
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub labels: BTreeMap<String, String>,
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub args: BTreeMap<String, String>,
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub contexts: BTreeMap<String, String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub secret: Vec<String>,
  #[serde(rename = "cache-from", skip_serializing_if = "Vec::is_empty")]
  pub cache_from: Vec<String>,
  #[serde(rename = "cache-to", skip_serializing_if = "Vec::is_empty")]
  pub cache_to: Vec<String>,
  #[serde(rename = "no-cache", skip_serializing_if = "std::ops::Not::not")]
  pub no_cache: bool,
}

impl BakeDefinition {
  pub fn new(group: &str, targets: &[BakeTarget]) -> Self {
    let names = targets.iter().map(|t| t.name.clone()).collect();
    let mut group_map = BTreeMap::new();
    group_map.insert(group.to_string(), BakeGroup { targets: names });

    let target = targets
      .iter()
      .map(|t| {
        let def = TargetDefinition {
          context: t.context.as_ref().map(|p| p.to_string_lossy().into_owned()),
          dockerfile: t.dockerfile.as_ref().map(|p| p.to_string_lossy().into_owned()),
          tags: t.tags.clone(),
          output: t.outputs.clone(),
          labels: t.labels.clone(),
          args: t.args.clone(),
          contexts: t.contexts.clone(),
          secret: t.secrets.clone(),
          cache_from: t.cache_from.clone(),
          cache_to: t.cache_to.clone(),
          no_cache: t.no_cache,
        };
        (t.name.clone(), def)
      })
      .collect();

    Self {
      group: group_map,
      target,
    }
  }
}
