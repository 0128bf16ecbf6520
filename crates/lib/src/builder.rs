//! Buildx builder provisioning.
//!
//! The builder is a long-lived `docker-container` instance shared by every
//! invocation on the host. Its network mode and proxy environment are fixed at
//! creation, so drift from the desired configuration means recreating it.
//! All inspection and (re)creation happens under the `buildx` lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BuildEnv, PROXY_ENV_KEYS};
use crate::consts::{APP_NAME, LOCK_BUILDX};
use crate::exec::{CommandRunner, ExecError, args, cancellable};
use crate::lock::{LockError, with_lock_async};
use crate::registry::NetworkMode;

const EXPECTED_DRIVER: &str = "docker-container";

#[derive(Debug, Error)]
pub enum BuilderError {
  #[error("repo root is required")]
  RepoRootRequired,

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error(transparent)]
  Command(#[from] ExecError),

  #[error("buildx builder {builder} has no driver info")]
  NoDriverInfo { builder: String },

  #[error("buildx builder {builder} uses driver {driver} (expected docker-container)")]
  UnexpectedDriver { builder: String, driver: String },

  #[error("buildx builder {builder} uses network mode {actual} (expected {expected})")]
  NetworkModeMismatch {
    builder: String,
    actual: String,
    expected: String,
  },
}

/// Desired builder configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderOptions {
  pub name: String,
  pub network_mode: NetworkMode,
  pub config_path: Option<PathBuf>,
  /// Proxy variables passed to the builder container as driver options.
  pub proxy_env: BTreeMap<String, String>,
}

impl BuilderOptions {
  pub fn from_env(env: &BuildEnv, network_mode: NetworkMode) -> Self {
    Self {
      name: env.builder_name.clone(),
      network_mode,
      config_path: env.buildkitd_config.clone(),
      proxy_env: env.proxy_driver_env(),
    }
  }

  fn container_name(&self) -> String {
    format!("buildx_buildkit_{}0", self.name)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuilderInfo {
  pub name: String,
  pub driver: String,
  /// Whether this run created (or recreated) the instance.
  pub created: bool,
}

/// Make sure the named builder exists with the desired configuration and uses
/// the `docker-container` driver.
pub async fn ensure_builder(
  runner: &dyn CommandRunner,
  repo_root: &Path,
  lock_root: &Path,
  opts: &BuilderOptions,
  cancel: &CancellationToken,
) -> Result<BuilderInfo, BuilderError> {
  if repo_root.as_os_str().is_empty() {
    return Err(BuilderError::RepoRootRequired);
  }
  let command = format!("{APP_NAME} {LOCK_BUILDX}");
  with_lock_async(
    lock_root,
    LOCK_BUILDX,
    &command,
    cancel,
    cancellable(cancel, provision(runner, repo_root, opts)),
  )
  .await
}

async fn provision(
  runner: &dyn CommandRunner,
  root: &Path,
  opts: &BuilderOptions,
) -> Result<BuilderInfo, BuilderError> {
  let builder = opts.name.as_str();
  let inspect = runner
    .run_output(root, "docker", &args(["buildx", "inspect", "--builder", builder]))
    .await;

  let existing = match inspect {
    Ok(output) => {
      if needs_recreate(runner, root, opts).await {
        warn!(builder = %builder, "buildx builder configuration drifted, recreating");
        if let Err(err) = runner.run(root, "docker", &args(["buildx", "rm", builder])).await {
          debug!(builder = %builder, error = %err, "buildx rm failed");
        }
        None
      } else {
        debug!(builder = %builder, "reusing buildx builder");
        Some(output)
      }
    }
    Err(err) => {
      debug!(builder = %builder, error = %err, "buildx builder not found");
      None
    }
  };

  let created = existing.is_none();
  let output = match existing {
    Some(output) => output,
    None => {
      create(runner, root, opts).await?;
      runner
        .run_output(
          root,
          "docker",
          &args(["buildx", "inspect", "--builder", builder, "--bootstrap"]),
        )
        .await?
    }
  };

  let driver = parse_driver(&output).ok_or_else(|| BuilderError::NoDriverInfo {
    builder: builder.to_string(),
  })?;
  if !driver.eq_ignore_ascii_case(EXPECTED_DRIVER) {
    return Err(BuilderError::UnexpectedDriver {
      builder: builder.to_string(),
      driver,
    });
  }

  Ok(BuilderInfo {
    name: builder.to_string(),
    driver,
    created,
  })
}

async fn needs_recreate(runner: &dyn CommandRunner, root: &Path, opts: &BuilderOptions) -> bool {
  if opts.network_mode != NetworkMode::Default {
    match network_mode(runner, root, opts).await {
      Ok(mode) if mode == opts.network_mode.as_str() => {}
      Ok(mode) => {
        debug!(actual = %mode, expected = %opts.network_mode.as_str(), "builder network mode mismatch");
        return true;
      }
      Err(_) => return true,
    }
  }
  match proxy_env(runner, root, opts).await {
    Ok(existing) => proxy_mismatch(&existing, &opts.proxy_env),
    Err(_) => true,
  }
}

async fn create(runner: &dyn CommandRunner, root: &Path, opts: &BuilderOptions) -> Result<(), BuilderError> {
  let builder = opts.name.as_str();
  info!(builder = %builder, network = %opts.network_mode.as_str(), "creating buildx builder");

  match runner.run_output(root, "docker", &create_args(opts)).await {
    Ok(_) => Ok(()),
    Err(err) => {
      let lower = err.output().unwrap_or_default().to_lowercase();
      if !(lower.contains("existing instance") || lower.contains("already exists")) {
        return Err(err.into());
      }
      // Another invocation created it first; adopt it if compatible.
      debug!(builder = %builder, "builder created concurrently, selecting it");
      if opts.network_mode != NetworkMode::Default
        && let Ok(mode) = network_mode(runner, root, opts).await
        && mode != opts.network_mode.as_str()
      {
        return Err(BuilderError::NetworkModeMismatch {
          builder: builder.to_string(),
          actual: mode,
          expected: opts.network_mode.as_str().to_string(),
        });
      }
      runner.run(root, "docker", &args(["buildx", "use", builder])).await?;
      Ok(())
    }
  }
}

/// Arguments for `docker buildx create`.
pub fn create_args(opts: &BuilderOptions) -> Vec<String> {
  let mut argv = args([
    "buildx",
    "create",
    "--name",
    opts.name.as_str(),
    "--driver",
    EXPECTED_DRIVER,
    "--use",
    "--bootstrap",
  ]);
  if opts.network_mode != NetworkMode::Default {
    argv.push("--driver-opt".to_string());
    argv.push(format!("network={}", opts.network_mode.as_str()));
  }
  for (key, value) in &opts.proxy_env {
    argv.push("--driver-opt".to_string());
    argv.push(format!("env.{key}={value}"));
  }
  if let Some(path) = &opts.config_path
    && path.is_file()
  {
    argv.push("--buildkitd-config".to_string());
    argv.push(path.to_string_lossy().into_owned());
  }
  argv
}

async fn network_mode(runner: &dyn CommandRunner, root: &Path, opts: &BuilderOptions) -> Result<String, ExecError> {
  let output = runner
    .run_output(
      root,
      "docker",
      &args([
        "inspect".to_string(),
        "-f".to_string(),
        "{{.HostConfig.NetworkMode}}".to_string(),
        opts.container_name(),
      ]),
    )
    .await?;
  Ok(output.trim().to_string())
}

async fn proxy_env(
  runner: &dyn CommandRunner,
  root: &Path,
  opts: &BuilderOptions,
) -> Result<BTreeMap<String, String>, ExecError> {
  let output = runner
    .run_output(
      root,
      "docker",
      &args([
        "inspect".to_string(),
        "-f".to_string(),
        "{{range .Config.Env}}{{println .}}{{end}}".to_string(),
        opts.container_name(),
      ]),
    )
    .await?;
  Ok(parse_proxy_env(&output))
}

fn parse_proxy_env(output: &str) -> BTreeMap<String, String> {
  output
    .lines()
    .filter_map(|line| line.trim().split_once('='))
    .filter(|(key, _)| PROXY_ENV_KEYS.contains(key))
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn proxy_mismatch(existing: &BTreeMap<String, String>, desired: &BTreeMap<String, String>) -> bool {
  PROXY_ENV_KEYS.iter().any(|key| {
    let want = desired.get(*key).map(|v| v.trim()).unwrap_or_default();
    let have = existing.get(*key).map(|v| v.trim()).unwrap_or_default();
    want != have
  })
}

/// The value of the `Driver:` line in `docker buildx inspect` output.
pub fn parse_driver(output: &str) -> Option<String> {
  output
    .lines()
    .filter_map(|line| line.trim().strip_prefix("Driver:"))
    .map(|driver| driver.trim().to_string())
    .find(|driver| !driver.is_empty())
}
