//! Implementation of the `fnbox merge` command.
//!
//! Merges a rendered `config/` directory into a config store without
//! building anything. Useful for config-only changes and for recovering a
//! store after a failed deploy.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use fnbox_lib::merge::merge_config;

use crate::output::{OutputFormat, print_json, print_stat, print_success};

pub fn cmd_merge(output_dir: &Path, config_dir: &Path, timeout: Duration, format: OutputFormat) -> Result<()> {
  let report = merge_config(output_dir, config_dir, timeout)
    .with_context(|| format!("Failed to merge into {}", config_dir.display()))?;

  if format.is_json() {
    return print_json(&report);
  }

  print_success(&format!("Merged config into {}", config_dir.display()));
  print_stat("Functions", &report.functions.to_string());
  print_stat("Routes", &report.routes.to_string());
  print_stat("Tables", &report.tables.to_string());
  print_stat("Buckets", &report.buckets.to_string());
  print_stat("Layers", &report.layers.to_string());
  if let Some(images) = report.images {
    print_stat("Image imports", &images.to_string());
  }
  Ok(())
}
