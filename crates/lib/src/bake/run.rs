//! `docker buildx bake` invocation.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::types::{BakeDefinition, BakeError, BakeTarget, allow_args, provenance_mode};
use crate::config::BuildEnv;
use crate::consts::{APP_NAME, BAKE_FILE, LOCK_BAKE};
use crate::exec::{CommandRunner, ExecError, cancellable};
use crate::lock::with_lock_async;

/// Invocation settings shared by every bake group in a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BakeOptions {
  pub builder: String,
  /// Resolved `--provenance` value; `None` disables attestation.
  pub provenance: Option<String>,
  /// Stream builder output with `--progress plain` instead of capturing it.
  pub verbose: bool,
}

impl BakeOptions {
  pub fn from_env(env: &BuildEnv, verbose: bool) -> Self {
    Self {
      builder: env.builder_name.clone(),
      provenance: provenance_mode(env.provenance.as_deref()),
      verbose,
    }
  }
}

/// Build and run one bake group under the `bake` lock.
///
/// The generated definition is layered after the repository's
/// `docker-bake.hcl` and removed once the invocation finishes.
pub async fn run_bake_group(
  runner: &dyn CommandRunner,
  repo_root: &Path,
  lock_root: &Path,
  group: &str,
  targets: &[BakeTarget],
  opts: &BakeOptions,
  cancel: &CancellationToken,
) -> Result<(), BakeError> {
  if repo_root.as_os_str().is_empty() {
    return Err(BakeError::RepoRootRequired);
  }
  if group.trim().is_empty() {
    return Err(BakeError::GroupRequired);
  }
  if targets.is_empty() {
    return Ok(());
  }

  let bake_file = repo_root.join(BAKE_FILE);
  if !bake_file.is_file() {
    return Err(BakeError::BakeFileNotFound { path: bake_file });
  }

  let definition = write_definition(group, targets)?;
  let args = bake_args(opts, &bake_file, definition.path(), targets, group);
  info!(group = %group, targets = targets.len(), "running buildx bake");

  let command = format!("{APP_NAME} {LOCK_BAKE} {group}");
  with_lock_async(
    lock_root,
    LOCK_BAKE,
    &command,
    cancel,
    cancellable(cancel, run_bake(runner, repo_root, group, &args, opts.verbose)),
  )
  .await
}

/// Serialize the group into a temporary JSON bake file.
pub fn write_definition(group: &str, targets: &[BakeTarget]) -> Result<NamedTempFile, BakeError> {
  let mut file = tempfile::Builder::new()
    .prefix("fnbox-bake-")
    .suffix(".json")
    .tempfile()
    .map_err(BakeError::WriteDefinition)?;
  serde_json::to_writer_pretty(&mut file, &BakeDefinition::new(group, targets))?;
  file.flush().map_err(BakeError::WriteDefinition)?;
  debug!(path = ?file.path(), "wrote bake definition");
  Ok(file)
}

pub fn bake_args(
  opts: &BakeOptions,
  bake_file: &Path,
  definition: &Path,
  targets: &[BakeTarget],
  group: &str,
) -> Vec<String> {
  let mut args = vec![
    "buildx".to_string(),
    "bake".to_string(),
    "--builder".to_string(),
    opts.builder.clone(),
  ];
  args.extend(allow_args(targets));
  if let Some(mode) = &opts.provenance {
    args.push(format!("--provenance={mode}"));
  }
  args.push("-f".to_string());
  args.push(bake_file.to_string_lossy().into_owned());
  args.push("-f".to_string());
  args.push(definition.to_string_lossy().into_owned());
  if opts.verbose {
    args.push("--progress".to_string());
    args.push("plain".to_string());
  }
  args.push(group.to_string());
  args
}

async fn run_bake(
  runner: &dyn CommandRunner,
  repo_root: &Path,
  group: &str,
  args: &[String],
  verbose: bool,
) -> Result<(), BakeError> {
  let result = if verbose {
    runner.run(repo_root, "docker", args).await
  } else {
    runner.run_output(repo_root, "docker", args).await.map(|_| ())
  };

  match result {
    Ok(()) => Ok(()),
    Err(ExecError::Cancelled) => Err(BakeError::Cancelled),
    Err(source) => {
      let output = source.output().unwrap_or_default().trim().to_string();
      let hint = buildx_hint(&output);
      Err(BakeError::Failed {
        group: group.to_string(),
        source,
        output,
        hint,
      })
    }
  }
}

/// Operator hint for known failure signatures in builder output.
pub fn buildx_hint(output: &str) -> Option<String> {
  let normalized = output.to_lowercase();
  if !normalized.contains("public.ecr.aws") {
    return None;
  }
  if ["403", "forbidden", "unauthorized"]
    .iter()
    .any(|needle| normalized.contains(needle))
  {
    return Some(
      "Hint: public.ecr.aws denied the request. Docker credentials may be stale. \
       Try 'docker logout public.ecr.aws' and retry, or run 'docker login public.ecr.aws'."
        .to_string(),
    );
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bake::types::resolve_outputs;
  use crate::util::testutil::FakeRunner;
  use std::collections::BTreeMap;
  use std::path::PathBuf;
  use tempfile::TempDir;

  fn options(verbose: bool) -> BakeOptions {
    BakeOptions {
      builder: "fnbox-buildx".to_string(),
      provenance: Some("mode=max".to_string()),
      verbose,
    }
  }

  fn repo() -> TempDir {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("docker-bake.hcl"), "group \"default\" {}\n").unwrap();
    temp
  }

  fn lambda_target() -> BakeTarget {
    BakeTarget::lambda_base(
      "registry:5010/fnbox-lambda-base:latest".to_string(),
      resolve_outputs("registry:5010/", true, true, false),
      BTreeMap::new(),
    )
  }

  fn definition_path(argv: &[String]) -> PathBuf {
    let last_f = argv.iter().rposition(|a| a == "-f").unwrap();
    PathBuf::from(&argv[last_f + 1])
  }

  #[test]
  fn args_order() {
    let args = bake_args(
      &options(true),
      Path::new("/repo/docker-bake.hcl"),
      Path::new("/tmp/def.json"),
      &[],
      "fnbox-base",
    );
    assert_eq!(
      args,
      vec![
        "buildx",
        "bake",
        "--builder",
        "fnbox-buildx",
        "--provenance=mode=max",
        "-f",
        "/repo/docker-bake.hcl",
        "-f",
        "/tmp/def.json",
        "--progress",
        "plain",
        "fnbox-base",
      ]
    );
  }

  #[test]
  fn provenance_can_be_disabled() {
    let opts = BakeOptions {
      provenance: None,
      ..options(false)
    };
    let args = bake_args(&opts, Path::new("a"), Path::new("b"), &[], "g");
    assert!(!args.iter().any(|a| a.starts_with("--provenance")));
    assert!(!args.iter().any(|a| a == "--progress"));
  }

  #[test]
  fn hint_only_for_public_ecr_denials() {
    assert!(buildx_hint("failed to fetch public.ecr.aws/lambda/python: 403 Forbidden").is_some());
    assert!(buildx_hint("public.ecr.aws: unauthorized").is_some());
    assert!(buildx_hint("ghcr.io: 403 Forbidden").is_none());
    assert!(buildx_hint("public.ecr.aws: manifest unknown").is_none());
  }

  #[tokio::test]
  async fn runs_group_and_removes_definition() {
    let repo = repo();
    let locks = TempDir::new().unwrap();
    let runner = FakeRunner::new();

    run_bake_group(
      &runner,
      repo.path(),
      locks.path(),
      "fnbox-base",
      &[lambda_target()],
      &options(false),
      &CancellationToken::new(),
    )
    .await
    .unwrap();

    let calls = runner.calls_matching(&["docker", "buildx", "bake"]);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].last().unwrap(), "fnbox-base");
    assert!(!definition_path(&calls[0]).exists());
    assert!(locks.path().join(".lock-bake").exists());
  }

  #[tokio::test]
  async fn failure_carries_output_and_hint() {
    let repo = repo();
    let locks = TempDir::new().unwrap();
    let runner = FakeRunner::new().fail(
      &["docker", "buildx", "bake"],
      "ERROR: public.ecr.aws/lambda/provided: 403 Forbidden\n",
    );

    let err = run_bake_group(
      &runner,
      repo.path(),
      locks.path(),
      "fnbox-functions",
      &[lambda_target()],
      &options(false),
      &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    let BakeError::Failed { group, output, hint, .. } = &err else {
      panic!("unexpected error: {err}");
    };
    assert_eq!(group, "fnbox-functions");
    assert_eq!(output, "ERROR: public.ecr.aws/lambda/provided: 403 Forbidden");
    assert!(hint.is_some());
    let message = err.to_string();
    assert!(message.starts_with("buildx bake failed:"));
    assert!(message.contains("docker logout public.ecr.aws"));
  }

  #[tokio::test]
  async fn missing_bake_file_is_an_error() {
    let repo = TempDir::new().unwrap();
    let runner = FakeRunner::new();

    let err = run_bake_group(
      &runner,
      repo.path(),
      repo.path(),
      "g",
      &[lambda_target()],
      &options(false),
      &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, BakeError::BakeFileNotFound { .. }));
    assert!(runner.calls().is_empty());
  }

  #[tokio::test]
  async fn empty_group_is_a_no_op() {
    let runner = FakeRunner::new();
    run_bake_group(
      &runner,
      Path::new("/nonexistent"),
      Path::new("/nonexistent"),
      "g",
      &[],
      &options(false),
      &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert!(runner.calls().is_empty());
  }

  #[tokio::test]
  async fn cancelled_before_lock_does_not_run() {
    let repo = repo();
    let runner = FakeRunner::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = run_bake_group(
      &runner,
      repo.path(),
      repo.path(),
      "g",
      &[lambda_target()],
      &options(false),
      &cancel,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, BakeError::Lock(_) | BakeError::Cancelled));
    assert!(!runner.called(&["docker", "buildx", "bake"]));
  }
}
