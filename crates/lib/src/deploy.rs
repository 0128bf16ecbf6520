//! Deploy orchestration.
//!
//! One deploy runs strictly in sequence:
//!
//! 1. resolve the registry topology and wait for a local registry
//! 2. provision the buildx builder (`buildx` lock)
//! 3. map external image sources to internal refs and stage the import manifest
//! 4. resolve source digests, pulling mutable tags
//! 5. build the base group (`base-images` lock, then `bake`)
//! 6. fingerprint the staged output against the lambda base image
//! 7. build the function group (`bake` lock)
//! 8. merge the staged config into the store (deploy lock)

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bake::images::{
  GroupPlan, ImageBuildContext, build_base_images, build_function_images, image_labels, lambda_base_tag,
};
use crate::bake::run::BakeOptions;
use crate::bake::{BakeError, RootCa};
use crate::builder::{BuilderError, BuilderInfo, BuilderOptions, ensure_builder};
use crate::config::BuildEnv;
use crate::consts::{CONFIG_DIR, IMAGE_IMPORT_FILE};
use crate::exec::CommandRunner;
use crate::fingerprint::{FingerprintError, build_image_fingerprint};
use crate::image::{ImageError, image_id, resolve_image_imports, resolve_source_digests, write_image_import_manifest};
use crate::lock::DEPLOY_LOCK_TIMEOUT;
use crate::merge::{MergeError, MergeReport, merge_config_cancellable};
use crate::registry::{
  PortDiscoverer, ProbeOptions, RegistryError, RegistryTopology, ResolveContext, wait_for_registry,
};
use crate::staging;
use crate::types::FunctionSpec;

const DEFAULT_TAG: &str = "latest";
const CONTAINERD_MODE: &str = "containerd";

#[derive(Debug, Error)]
pub enum DeployError {
  #[error("repo root is required")]
  RepoRootRequired,

  #[error("output dir is required")]
  OutputDirRequired,

  #[error("lock root is not configured (set FNBOX_LOCK_DIR or HOME)")]
  LockRootRequired,

  #[error("config dir is not configured (set FNBOX_STAGING_DIR or pass one explicitly)")]
  ConfigDirRequired,

  #[error(transparent)]
  Registry(#[from] RegistryError),

  #[error(transparent)]
  Builder(#[from] BuilderError),

  #[error(transparent)]
  Image(#[from] ImageError),

  #[error(transparent)]
  Bake(#[from] BakeError),

  #[error(transparent)]
  Fingerprint(#[from] FingerprintError),

  #[error(transparent)]
  Merge(#[from] MergeError),
}

/// Everything a single deploy needs from the caller.
#[derive(Debug, Clone, Default)]
pub struct DeployRequest {
  /// Repository holding `docker-bake.hcl` and the shared base Dockerfiles.
  pub repo_root: PathBuf,
  /// Rendered output tree: `config/` plus `functions/<name>/Dockerfile`.
  pub output_dir: PathBuf,
  pub project: String,
  pub env: String,
  /// Runtime mode; `containerd` skips loading images into the docker store.
  pub mode: String,
  pub tag: String,
  pub functions: Vec<FunctionSpec>,
  pub no_cache: bool,
  pub verbose: bool,
  /// Merged config store; defaults to the staging layout for project and env.
  pub config_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
  pub topology: RegistryTopology,
  pub builder: BuilderInfo,
  pub fingerprint: String,
  pub image_imports: usize,
  pub base_images: GroupPlan,
  pub function_images: GroupPlan,
  pub merge: MergeReport,
}

pub struct Deployer<'a> {
  runner: &'a dyn CommandRunner,
  env: BuildEnv,
  discoverer: Option<&'a dyn PortDiscoverer>,
  probe: ProbeOptions,
}

impl<'a> Deployer<'a> {
  pub fn new(runner: &'a dyn CommandRunner, env: BuildEnv) -> Self {
    Self {
      runner,
      env,
      discoverer: None,
      probe: ProbeOptions::default(),
    }
  }

  pub fn with_discoverer(mut self, discoverer: &'a dyn PortDiscoverer) -> Self {
    self.discoverer = Some(discoverer);
    self
  }

  pub fn with_probe_options(mut self, probe: ProbeOptions) -> Self {
    self.probe = probe;
    self
  }

  pub async fn deploy(&self, request: &DeployRequest, cancel: &CancellationToken) -> Result<DeployReport, DeployError> {
    let repo_root = request.repo_root.as_path();
    let output_dir = request.output_dir.as_path();
    if repo_root.as_os_str().is_empty() {
      return Err(DeployError::RepoRootRequired);
    }
    if output_dir.as_os_str().is_empty() {
      return Err(DeployError::OutputDirRequired);
    }
    let lock_root = self.env.lock_root.clone().ok_or(DeployError::LockRootRequired)?;
    let config_dir = self.config_dir(request)?;
    let tag = match request.tag.trim() {
      "" => DEFAULT_TAG,
      tag => tag,
    };

    let topology = RegistryTopology::resolve(
      &self.env,
      self.discoverer,
      &ResolveContext {
        repo_root,
        project: &request.project,
        mode: &request.mode,
      },
    )
    .await?;
    info!(push = %topology.push, runtime = %topology.runtime, network = ?topology.network_mode, "resolved registry");
    if self.env.registry_wait
      && let Some(addr) = &topology.host_addr
    {
      wait_for_registry(addr, &self.probe, cancel).await?;
    }

    let builder_opts = BuilderOptions::from_env(&self.env, topology.network_mode);
    let builder = ensure_builder(self.runner, repo_root, &lock_root, &builder_opts, cancel).await?;

    let mut functions = request.functions.clone();
    let imports = resolve_image_imports(&mut functions, &topology.runtime)?;
    if !imports.is_empty() {
      let manifest = output_dir.join(CONFIG_DIR).join(IMAGE_IMPORT_FILE);
      write_image_import_manifest(&manifest, &imports, topology.push.trim_end_matches('/'))?;
    }
    let digests = resolve_source_digests(self.runner, repo_root, &functions, cancel).await?;

    let ctx = ImageBuildContext {
      push_registry: topology.push.clone(),
      tag: tag.to_string(),
      include_docker: request.mode.trim() != CONTAINERD_MODE,
      force_insecure: self.env.registry_insecure,
      proxy_args: self.env.proxy_env.clone(),
      labels: image_labels(&request.project, &request.env),
      no_cache: request.no_cache,
      output_dir: output_dir.to_path_buf(),
      bake: BakeOptions::from_env(&self.env, request.verbose),
    };

    let root_ca = RootCa::load(self.env.root_ca_path.as_deref())?;
    let base_images = build_base_images(self.runner, repo_root, &lock_root, &ctx, &root_ca, cancel).await?;

    let fingerprint = self.fingerprint(request, &ctx, &functions, &digests).await?;
    let function_images =
      build_function_images(self.runner, repo_root, &lock_root, &functions, &ctx, &fingerprint, cancel).await?;

    let merge = merge_config_cancellable(output_dir, &config_dir, DEPLOY_LOCK_TIMEOUT, cancel).await?;

    info!(
      fingerprint = %fingerprint,
      built = function_images.built.len(),
      skipped = function_images.skipped.len(),
      "deploy complete"
    );
    Ok(DeployReport {
      topology,
      builder,
      fingerprint,
      image_imports: imports.len(),
      base_images,
      function_images,
      merge,
    })
  }

  fn config_dir(&self, request: &DeployRequest) -> Result<PathBuf, DeployError> {
    if let Some(dir) = &request.config_dir {
      return Ok(dir.clone());
    }
    let root = self.env.staging_root.as_deref().ok_or(DeployError::ConfigDirRequired)?;
    Ok(staging::config_dir(root, &request.project, &request.env))
  }

  async fn fingerprint(
    &self,
    request: &DeployRequest,
    ctx: &ImageBuildContext,
    functions: &[FunctionSpec],
    digests: &BTreeMap<String, String>,
  ) -> Result<String, DeployError> {
    let base_tag = lambda_base_tag(&ctx.push_registry, &ctx.tag);
    let base_id = image_id(self.runner, &request.repo_root, &base_tag).await.unwrap_or_default();
    debug!(image = %base_tag, id = %base_id, "base image identity");
    Ok(build_image_fingerprint(
      &request.output_dir,
      &request.project,
      &request.env,
      &base_id,
      functions,
      digests,
    )?)
  }
}
