//! Implementation of the `fnbox image-ref` command.

use anyhow::{Context, Result};
use serde::Serialize;

use fnbox_lib::config::BuildEnv;
use fnbox_lib::image::{ImageImportEntry, build_image_import_entry};

use crate::output::{OutputFormat, print_json, print_stat};

#[derive(Serialize)]
struct ImageRefOutput {
  #[serde(flatten)]
  entry: ImageImportEntry,
  needs_import: bool,
}

pub fn cmd_image_ref(source: &str, registry: Option<&str>, function: &str, format: OutputFormat) -> Result<()> {
  let registry = match registry {
    Some(registry) => registry.to_string(),
    None => BuildEnv::from_env().registry,
  };
  let (entry, needs_import) = build_image_import_entry(function, source, &registry)
    .with_context(|| format!("Failed to resolve {source}"))?;

  if format.is_json() {
    return print_json(&ImageRefOutput { entry, needs_import });
  }
  println!("{}", entry.image_ref);
  print_stat("Import", if needs_import { "required" } else { "not required" });
  Ok(())
}
