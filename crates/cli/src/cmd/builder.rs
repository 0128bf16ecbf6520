//! Implementation of the `fnbox builder` command.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use fnbox_lib::builder::{BuilderInfo, BuilderOptions, ensure_builder};
use fnbox_lib::config::BuildEnv;
use fnbox_lib::exec::ProcessRunner;
use fnbox_lib::registry::{NetworkMode, RegistryTopology, ResolveContext};

use super::ctrl_c_token;
use crate::output::{OutputFormat, print_json, print_stat, print_success};

#[derive(Serialize)]
struct BuilderOutput {
  #[serde(flatten)]
  builder: BuilderInfo,
  network_mode: NetworkMode,
}

pub fn cmd_builder(repo_root: &Path, format: OutputFormat) -> Result<()> {
  let env = BuildEnv::from_env();
  let lock_root = env
    .lock_root
    .clone()
    .context("No lock directory; set FNBOX_LOCK_DIR or HOME")?;

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let (builder, network_mode) = rt.block_on(async {
    let cancel = ctrl_c_token();
    let ctx = ResolveContext {
      repo_root,
      project: "",
      mode: "",
    };
    let topology = RegistryTopology::resolve(&env, None, &ctx).await?;
    let opts = BuilderOptions::from_env(&env, topology.network_mode);
    let info = ensure_builder(&ProcessRunner, repo_root, &lock_root, &opts, &cancel).await?;
    anyhow::Ok((info, topology.network_mode))
  })?;

  if format.is_json() {
    return print_json(&BuilderOutput { builder, network_mode });
  }
  let verb = if builder.created { "Created" } else { "Using" };
  print_success(&format!("{verb} builder {}", builder.name));
  print_stat("Driver", &builder.driver);
  print_stat(
    "Network",
    match network_mode {
      NetworkMode::Host => "host",
      NetworkMode::Default => "default",
    },
  );
  Ok(())
}
