//! Base and function image groups.
//!
//! Each group is planned (targets assembled, up-to-date images skipped) and
//! then submitted as a single bake invocation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::run::{BakeOptions, run_bake_group};
use super::types::{BakeError, BakeTarget, RootCa, resolve_outputs};
use crate::consts::{
  APP_NAME, BAKE_CACHE_DIR, IMAGE_PREFIX, KIND_FUNCTION, LABEL_CA_FINGERPRINT, LABEL_ENV, LABEL_IMAGE_FINGERPRINT, LABEL_KIND,
  LABEL_MANAGED, LABEL_PROJECT, LOCK_BASE_IMAGES,
};
use crate::exec::CommandRunner;
use crate::image::image_has_label_value;
use crate::lock::with_lock_async;
use crate::types::FunctionSpec;

pub const BASE_GROUP: &str = "fnbox-base";
pub const FUNCTIONS_GROUP: &str = "fnbox-functions";

/// Settings shared by every target in a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageBuildContext {
  /// Registry the builder pushes to, ending in `/` or empty.
  pub push_registry: String,
  pub tag: String,
  /// Also load images into the local docker store.
  pub include_docker: bool,
  /// Push without TLS even to a non-local registry.
  pub force_insecure: bool,
  pub proxy_args: BTreeMap<String, String>,
  /// Management labels for the project and environment.
  pub labels: BTreeMap<String, String>,
  pub no_cache: bool,
  /// Staged output tree; function contexts and the local layer cache live here.
  pub output_dir: PathBuf,
  pub bake: BakeOptions,
}

impl ImageBuildContext {
  fn outputs(&self, push: bool) -> Vec<String> {
    resolve_outputs(&self.push_registry, push, self.include_docker, self.force_insecure)
  }

  fn cache_root(&self) -> PathBuf {
    self.output_dir.join(BAKE_CACHE_DIR)
  }
}

/// Labels stamped on every managed image.
pub fn image_labels(project: &str, env: &str) -> BTreeMap<String, String> {
  let mut labels = BTreeMap::new();
  labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
  if !project.trim().is_empty() {
    labels.insert(LABEL_PROJECT.to_string(), project.trim().to_string());
  }
  if !env.trim().is_empty() {
    labels.insert(LABEL_ENV.to_string(), env.trim().to_string());
  }
  labels
}

pub fn join_registry(registry: &str, image: &str) -> String {
  if registry.is_empty() {
    image.to_string()
  } else if registry.ends_with('/') {
    format!("{registry}{image}")
  } else {
    format!("{registry}/{image}")
  }
}

pub fn lambda_base_tag(registry: &str, tag: &str) -> String {
  join_registry(registry, &format!("{IMAGE_PREFIX}-lambda-base:{tag}"))
}

pub fn function_image_tag(registry: &str, image_name: &str, tag: &str) -> String {
  join_registry(registry, &format!("{IMAGE_PREFIX}-{image_name}:{tag}"))
}

/// Targets to build plus the names of images left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupPlan {
  #[serde(skip)]
  pub targets: Vec<BakeTarget>,
  pub built: Vec<String>,
  pub skipped: Vec<String>,
}

struct CaBaseImage {
  name: &'static str,
  dockerfile: &'static str,
}

const CA_BASES: [CaBaseImage; 2] = [
  CaBaseImage {
    name: "os-base",
    dockerfile: "Dockerfile.os-base",
  },
  CaBaseImage {
    name: "python-base",
    dockerfile: "Dockerfile.python-base",
  },
];

/// Plan the base group: the lambda base always, the CA bases unless an
/// existing image already carries the current CA fingerprint.
pub async fn plan_base_images(
  runner: &dyn CommandRunner,
  repo_root: &Path,
  ctx: &ImageBuildContext,
  root_ca: &RootCa,
) -> Result<GroupPlan, BakeError> {
  let mut plan = GroupPlan::default();

  let lambda = BakeTarget::lambda_base(
    lambda_base_tag(&ctx.push_registry, &ctx.tag),
    ctx.outputs(true),
    ctx.labels.clone(),
  )
  .with_args(&ctx.proxy_args)
  .with_no_cache(ctx.no_cache)
  .with_local_cache(&ctx.cache_root(), "base/lambda")?;
  plan.built.push(lambda.name.clone());
  plan.targets.push(lambda);

  let common_dir = repo_root.join("services").join("common");
  for base in &CA_BASES {
    let tag = format!("{IMAGE_PREFIX}-{}:latest", base.name);
    if !ctx.no_cache
      && image_has_label_value(runner, repo_root, &tag, LABEL_CA_FINGERPRINT, &root_ca.fingerprint).await
    {
      info!(image = %tag, "base image up to date, skipping");
      plan.skipped.push(base.name.to_string());
      continue;
    }
    let target = BakeTarget::ca_base(base.name, &common_dir, base.dockerfile, tag, ctx.outputs(false), root_ca)
      .with_args(&ctx.proxy_args)
      .with_no_cache(ctx.no_cache)
      .with_local_cache(&ctx.cache_root(), "base")?;
    plan.built.push(base.name.to_string());
    plan.targets.push(target);
  }

  Ok(plan)
}

/// Plan the function group. A function is skipped when its existing image
/// is labelled with `fingerprint`.
pub async fn plan_function_images(
  runner: &dyn CommandRunner,
  functions: &[FunctionSpec],
  ctx: &ImageBuildContext,
  fingerprint: &str,
) -> Result<GroupPlan, BakeError> {
  let output_dir = ctx.output_dir.as_path();
  let mut labels = ctx.labels.clone();
  if !fingerprint.is_empty() {
    labels.insert(LABEL_IMAGE_FINGERPRINT.to_string(), fingerprint.to_string());
  }
  labels.insert(LABEL_KIND.to_string(), KIND_FUNCTION.to_string());

  let mut plan = GroupPlan::default();
  for function in functions {
    let name = function.name.trim();
    if name.is_empty() {
      return Err(BakeError::FunctionNameRequired);
    }
    let image_name = function.image_name.trim();
    if image_name.is_empty() {
      return Err(BakeError::ImageNameRequired {
        function: name.to_string(),
      });
    }
    let dockerfile = output_dir.join("functions").join(name).join("Dockerfile");
    if !dockerfile.is_file() {
      return Err(BakeError::DockerfileNotFound { path: dockerfile });
    }

    let tag = function_image_tag(&ctx.push_registry, image_name, &ctx.tag);
    if !ctx.no_cache
      && !fingerprint.is_empty()
      && image_has_label_value(runner, output_dir, &tag, LABEL_IMAGE_FINGERPRINT, fingerprint).await
    {
      info!(function = %name, "function image up to date, skipping");
      plan.skipped.push(name.to_string());
      continue;
    }

    let target = BakeTarget::function(image_name, output_dir, dockerfile, tag, ctx.outputs(true), labels.clone())
      .with_args(&ctx.proxy_args)
      .with_no_cache(ctx.no_cache)
      .with_local_cache(&ctx.cache_root(), "functions")?;
    plan.built.push(name.to_string());
    plan.targets.push(target);
  }
  Ok(plan)
}

/// Plan and build the base group under the `base-images` lock.
pub async fn build_base_images(
  runner: &dyn CommandRunner,
  repo_root: &Path,
  lock_root: &Path,
  ctx: &ImageBuildContext,
  root_ca: &RootCa,
  cancel: &CancellationToken,
) -> Result<GroupPlan, BakeError> {
  let command = format!("{APP_NAME} {LOCK_BASE_IMAGES}");
  with_lock_async(lock_root, LOCK_BASE_IMAGES, &command, cancel, async {
    info!("building base images");
    let plan = plan_base_images(runner, repo_root, ctx, root_ca).await?;
    run_bake_group(runner, repo_root, lock_root, BASE_GROUP, &plan.targets, &ctx.bake, cancel).await?;
    Ok::<_, BakeError>(plan)
  })
  .await
}

/// Plan and build the function group.
pub async fn build_function_images(
  runner: &dyn CommandRunner,
  repo_root: &Path,
  lock_root: &Path,
  functions: &[FunctionSpec],
  ctx: &ImageBuildContext,
  fingerprint: &str,
  cancel: &CancellationToken,
) -> Result<GroupPlan, BakeError> {
  info!(functions = functions.len(), "building function images");
  let plan = plan_function_images(runner, functions, ctx, fingerprint).await?;
  run_bake_group(runner, repo_root, lock_root, FUNCTIONS_GROUP, &plan.targets, &ctx.bake, cancel).await?;
  Ok(plan)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bake::types::TargetKind;
  use crate::util::testutil::FakeRunner;
  use tempfile::TempDir;

  fn context(output_dir: &Path) -> ImageBuildContext {
    ImageBuildContext {
      push_registry: "127.0.0.1:5010/".to_string(),
      tag: "latest".to_string(),
      include_docker: true,
      labels: image_labels("demo", "dev"),
      output_dir: output_dir.to_path_buf(),
      bake: BakeOptions {
        builder: "fnbox-buildx".to_string(),
        provenance: None,
        verbose: false,
      },
      ..Default::default()
    }
  }

  fn root_ca() -> RootCa {
    RootCa {
      path: PathBuf::from("/certs/rootCA.crt"),
      fingerprint: "abcd1234".to_string(),
    }
  }

  fn staged(functions: &[&str]) -> TempDir {
    let temp = TempDir::new().unwrap();
    for name in functions {
      let dir = temp.path().join("functions").join(name);
      std::fs::create_dir_all(&dir).unwrap();
      std::fs::write(dir.join("Dockerfile"), "FROM fnbox-lambda-base\n").unwrap();
    }
    temp
  }

  fn function(name: &str) -> FunctionSpec {
    FunctionSpec {
      name: name.to_string(),
      image_name: format!("{name}-img"),
      ..Default::default()
    }
  }

  #[test]
  fn tags() {
    assert_eq!(lambda_base_tag("registry:5010/", "v1"), "registry:5010/fnbox-lambda-base:v1");
    assert_eq!(function_image_tag("registry:5010", "hello", "v1"), "registry:5010/fnbox-hello:v1");
    assert_eq!(function_image_tag("", "hello", "v1"), "fnbox-hello:v1");
  }

  #[test]
  fn labels_skip_blank_values() {
    let labels = image_labels("", " ");
    assert_eq!(labels.len(), 1);
    assert_eq!(labels["dev.fnbox.managed"], "true");
  }

  #[tokio::test]
  async fn base_plan_skips_bases_with_current_ca() {
    let repo = TempDir::new().unwrap();
    let runner = FakeRunner::new()
      .on(&["docker", "image", "ls", "-q", "fnbox-os-base:latest"], "sha256:1\n")
      .on(
        &["docker", "image", "inspect", "--format", "{{ index .Config.Labels \"dev.fnbox.ca_fingerprint\" }}", "fnbox-os-base:latest"],
        "abcd1234\n",
      );

    let plan = plan_base_images(&runner, repo.path(), &context(repo.path()), &root_ca())
      .await
      .unwrap();

    assert_eq!(plan.built, vec!["lambda-base", "python-base"]);
    assert_eq!(plan.skipped, vec!["os-base"]);
    assert_eq!(plan.targets[0].kind, TargetKind::LambdaBase);
    assert_eq!(plan.targets[0].outputs, vec!["type=docker", "type=registry,registry.insecure=true"]);
    assert_eq!(plan.targets[1].outputs, vec!["type=docker"]);
    assert!(repo.path().join(".bake-cache/base/lambda").is_dir());
  }

  #[tokio::test]
  async fn no_cache_rebuilds_everything() {
    let repo = TempDir::new().unwrap();
    let runner = FakeRunner::new().on(&["docker", "image"], "abcd1234\n");
    let ctx = ImageBuildContext {
      no_cache: true,
      ..context(repo.path())
    };

    let plan = plan_base_images(&runner, repo.path(), &ctx, &root_ca()).await.unwrap();

    assert_eq!(plan.built.len(), 3);
    assert!(plan.targets.iter().all(|t| t.no_cache));
    assert!(!runner.called(&["docker", "image"]));
  }

  #[tokio::test]
  async fn function_plan_skips_matching_fingerprint() {
    let out = staged(&["hello", "world"]);
    let runner = FakeRunner::new()
      .on(&["docker", "image", "ls", "-q", "127.0.0.1:5010/fnbox-hello-img:latest"], "sha256:1\n")
      .on(
        &[
          "docker",
          "image",
          "inspect",
          "--format",
          "{{ index .Config.Labels \"dev.fnbox.image_fingerprint\" }}",
          "127.0.0.1:5010/fnbox-hello-img:latest",
        ],
        "cafe0001\n",
      );

    let plan = plan_function_images(
      &runner,
      &[function("hello"), function("world")],
      &context(out.path()),
      "cafe0001",
    )
    .await
    .unwrap();

    assert_eq!(plan.skipped, vec!["hello"]);
    assert_eq!(plan.built, vec!["world"]);
    let target = &plan.targets[0];
    assert_eq!(target.name, "fn-world-img");
    assert_eq!(target.labels["dev.fnbox.image_fingerprint"], "cafe0001");
    assert_eq!(target.labels["dev.fnbox.kind"], "function");
    assert_eq!(target.context.as_deref(), Some(out.path()));
  }

  #[tokio::test]
  async fn function_without_dockerfile_is_an_error() {
    let out = staged(&[]);
    let err = plan_function_images(
      &FakeRunner::new(),
      &[function("hello")],
      &context(out.path()),
      "",
    )
    .await
    .unwrap_err();
    assert!(matches!(err, BakeError::DockerfileNotFound { .. }));
  }

  #[tokio::test]
  async fn function_without_image_name_is_an_error() {
    let out = staged(&["hello"]);
    let spec = FunctionSpec {
      name: "hello".to_string(),
      ..Default::default()
    };
    let err = plan_function_images(&FakeRunner::new(), &[spec], &context(out.path()), "")
      .await
      .unwrap_err();
    assert!(matches!(err, BakeError::ImageNameRequired { ref function } if function == "hello"));
  }

  #[tokio::test]
  async fn base_images_build_under_both_locks() {
    let repo = TempDir::new().unwrap();
    std::fs::write(repo.path().join("docker-bake.hcl"), "").unwrap();
    let locks = TempDir::new().unwrap();
    let runner = FakeRunner::new();

    let plan = build_base_images(
      &runner,
      repo.path(),
      locks.path(),
      &context(repo.path()),
      &root_ca(),
      &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(plan.built.len(), 3);
    let bake = runner.calls_matching(&["docker", "buildx", "bake"]);
    assert_eq!(bake.len(), 1);
    assert!(bake[0].contains(&"--allow=fs.read=/certs/rootCA.crt".to_string()));
    assert!(locks.path().join(".lock-base-images").exists());
    assert!(locks.path().join(".lock-bake").exists());
  }
}
