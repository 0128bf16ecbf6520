//! Implementation of the `fnbox deploy` command.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};

use fnbox_lib::config::BuildEnv;
use fnbox_lib::deploy::{DeployReport, DeployRequest, Deployer};
use fnbox_lib::exec::ProcessRunner;

use super::{ctrl_c_token, load_functions};
use crate::output::{
  OutputFormat, format_duration, print_image_group, print_info, print_json, print_stat, print_success,
};

pub struct DeployArgs {
  pub functions: PathBuf,
  pub output_dir: PathBuf,
  pub repo_root: PathBuf,
  pub project: String,
  pub env: String,
  pub mode: String,
  pub tag: String,
  pub no_cache: bool,
  pub config_dir: Option<PathBuf>,
  pub verbose: bool,
}

pub fn cmd_deploy(args: DeployArgs, format: OutputFormat) -> Result<()> {
  let request = DeployRequest {
    functions: load_functions(&args.functions)?,
    repo_root: args.repo_root,
    output_dir: args.output_dir,
    project: args.project,
    env: args.env,
    mode: args.mode,
    tag: args.tag,
    no_cache: args.no_cache,
    verbose: args.verbose,
    config_dir: args.config_dir,
  };
  let env = BuildEnv::from_env();

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let start = Instant::now();
  let report = rt
    .block_on(async {
      let cancel = ctrl_c_token();
      Deployer::new(&ProcessRunner, env).deploy(&request, &cancel).await
    })
    .context("Deploy failed")?;

  if format.is_json() {
    return print_json(&report);
  }
  print_report(&report);
  print_success(&format!("Deploy complete in {}", format_duration(start.elapsed())));
  Ok(())
}

fn print_report(report: &DeployReport) {
  print_info(&format!("Registry {}", report.topology.push));
  print_stat("Builder", &report.builder.name);
  print_stat("Fingerprint", &report.fingerprint);
  if report.image_imports > 0 {
    print_stat("Image imports", &report.image_imports.to_string());
  }

  print_image_group("Base images", &report.base_images.built, &report.base_images.skipped);
  print_image_group("Functions", &report.function_images.built, &report.function_images.skipped);

  println!();
  print_stat("Config", &report.merge.config_dir.display().to_string());
  print_stat("Functions", &report.merge.functions.to_string());
  print_stat("Routes", &report.merge.routes.to_string());
}
