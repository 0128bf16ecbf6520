//! Build fingerprints for rebuild-skip decisions.
//!
//! A fingerprint is an 8 hex character digest over everything that affects a
//! function image: the deployment cache key, the base image identity, the
//! staged output tree, and the resolved digests of externally sourced images.
//! It is stored as an image label and compared on the next run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::consts::{CONFIG_DIR, FINGERPRINT_BYTES, FUNCTIONS_FILE, ROUTING_FILE};
use crate::staging;
use crate::types::FunctionSpec;
use crate::util::hash::{HashError, hash_paths, short_hex};

#[derive(Debug, Error)]
pub enum FingerprintError {
  #[error("output dir is required")]
  OutputDirRequired,

  #[error("config not found: {0}")]
  ConfigNotFound(PathBuf),

  #[error(transparent)]
  Hash(#[from] HashError),
}

/// Compute the fingerprint labelled onto function images.
pub fn build_image_fingerprint(
  output_dir: &Path,
  project: &str,
  env: &str,
  base_image_id: &str,
  functions: &[FunctionSpec],
  source_digests: &BTreeMap<String, String>,
) -> Result<String, FingerprintError> {
  let output_hash = output_fingerprint(output_dir, functions)?;
  let source_hash = image_source_fingerprint(functions, source_digests);
  let seed = format!(
    "{}:{}:{}:{}",
    staging::cache_key(project, env),
    base_image_id.trim(),
    output_hash,
    source_hash
  );
  let fingerprint = short_hex(seed.as_bytes(), FINGERPRINT_BYTES);
  debug!(fingerprint = %fingerprint, output = %output_hash, sources = %source_hash, "computed build fingerprint");
  Ok(fingerprint)
}

/// Hash of the staged output: the config files (required) plus each
/// function's staged directory when present.
pub fn output_fingerprint(output_dir: &Path, functions: &[FunctionSpec]) -> Result<String, FingerprintError> {
  if output_dir.as_os_str().is_empty() {
    return Err(FingerprintError::OutputDirRequired);
  }

  let config_dir = output_dir.join(CONFIG_DIR);
  let mut paths = vec![config_dir.join(FUNCTIONS_FILE), config_dir.join(ROUTING_FILE)];
  for path in &paths {
    if !path.is_file() {
      return Err(FingerprintError::ConfigNotFound(path.clone()));
    }
  }

  for function in functions {
    let name = function.name.trim();
    if name.is_empty() {
      continue;
    }
    let dir = output_dir.join("functions").join(name);
    if dir.exists() {
      paths.push(dir);
    }
  }

  Ok(hash_paths(output_dir, &paths, FINGERPRINT_BYTES)?)
}

/// Digest over `name:source:digest` entries for externally sourced functions.
///
/// Empty when no function has an image source.
pub fn image_source_fingerprint(functions: &[FunctionSpec], source_digests: &BTreeMap<String, String>) -> String {
  let mut entries: Vec<String> = functions
    .iter()
    .filter(|f| f.has_image_source())
    .map(|f| {
      let source = f.image_source.trim();
      let digest = source_digests.get(source).map(|d| d.trim()).unwrap_or_default();
      format!("{}:{}:{}", f.name.trim(), source, digest)
    })
    .collect();
  if entries.is_empty() {
    return String::new();
  }
  entries.sort();
  short_hex(entries.join("\n").as_bytes(), FINGERPRINT_BYTES)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::TempDir;

  fn staged_output() -> TempDir {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("config");
    fs::create_dir_all(&config).unwrap();
    fs::write(config.join("functions.yml"), "functions:\n  hello: {}\n").unwrap();
    fs::write(config.join("routing.yml"), "routes: []\n").unwrap();
    let function = temp.path().join("functions/hello");
    fs::create_dir_all(&function).unwrap();
    fs::write(function.join("Dockerfile"), "FROM fnbox-lambda-base\n").unwrap();
    temp
  }

  fn function(name: &str, source: &str) -> FunctionSpec {
    FunctionSpec {
      name: name.to_string(),
      image_source: source.to_string(),
      ..Default::default()
    }
  }

  #[test]
  fn fingerprint_is_deterministic() {
    let out = staged_output();
    let functions = vec![function("hello", "")];
    let digests = BTreeMap::new();

    let first = build_image_fingerprint(out.path(), "demo", "dev", "sha256:base", &functions, &digests).unwrap();
    let second = build_image_fingerprint(out.path(), "demo", "dev", "sha256:base", &functions, &digests).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.len(), 8);
    assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
  }

  #[test]
  fn digest_change_changes_fingerprint() {
    let out = staged_output();
    let source = "public.ecr.aws/acme/worker:latest";
    let functions = vec![function("hello", ""), function("worker", source)];

    let mut digests = BTreeMap::new();
    digests.insert(source.to_string(), "public.ecr.aws/acme/worker@sha256:aaaa".to_string());
    let before = build_image_fingerprint(out.path(), "demo", "dev", "base", &functions, &digests).unwrap();

    digests.insert(source.to_string(), "public.ecr.aws/acme/worker@sha256:bbbb".to_string());
    let after = build_image_fingerprint(out.path(), "demo", "dev", "base", &functions, &digests).unwrap();

    assert_ne!(before, after);
  }

  #[test]
  fn each_input_participates() {
    let out = staged_output();
    let functions = vec![function("hello", "")];
    let digests = BTreeMap::new();
    let base = build_image_fingerprint(out.path(), "demo", "dev", "base", &functions, &digests).unwrap();

    assert_ne!(
      base,
      build_image_fingerprint(out.path(), "other", "dev", "base", &functions, &digests).unwrap()
    );
    assert_ne!(
      base,
      build_image_fingerprint(out.path(), "demo", "dev", "base2", &functions, &digests).unwrap()
    );

    fs::write(out.path().join("functions/hello/Dockerfile"), "FROM changed\n").unwrap();
    assert_ne!(
      base,
      build_image_fingerprint(out.path(), "demo", "dev", "base", &functions, &digests).unwrap()
    );
  }

  #[test]
  fn missing_config_is_an_error() {
    let out = staged_output();
    fs::remove_file(out.path().join("config/routing.yml")).unwrap();

    let err = output_fingerprint(out.path(), &[]).unwrap_err();
    assert!(matches!(err, FingerprintError::ConfigNotFound(p) if p.ends_with("routing.yml")));
  }

  #[test]
  fn empty_output_dir_is_rejected() {
    let err = output_fingerprint(Path::new(""), &[]).unwrap_err();
    assert!(matches!(err, FingerprintError::OutputDirRequired));
  }

  #[test]
  fn unstaged_function_dirs_are_skipped() {
    let out = staged_output();
    let with_missing = vec![function("hello", ""), function("not-staged", "")];
    let only_hello = vec![function("hello", "")];

    assert_eq!(
      output_fingerprint(out.path(), &with_missing).unwrap(),
      output_fingerprint(out.path(), &only_hello).unwrap()
    );
  }

  #[test]
  fn source_fingerprint_empty_without_sources() {
    assert_eq!(image_source_fingerprint(&[function("a", "")], &BTreeMap::new()), "");
  }

  #[test]
  fn source_fingerprint_ignores_function_order() {
    let a = function("a", "docker.io/library/alpine:3");
    let b = function("b", "ghcr.io/acme/tool:1");
    let digests = BTreeMap::new();
    assert_eq!(
      image_source_fingerprint(&[a.clone(), b.clone()], &digests),
      image_source_fingerprint(&[b, a], &digests)
    );
  }
}
