//! Implementation of the `fnbox fingerprint` command.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Serialize;

use fnbox_lib::fingerprint::{build_image_fingerprint, image_source_fingerprint, output_fingerprint};

use super::load_functions;
use crate::output::{OutputFormat, print_json, print_stat};

#[derive(Serialize)]
struct FingerprintOutput {
  fingerprint: String,
  output: String,
  sources: String,
}

pub fn cmd_fingerprint(
  output_dir: &Path,
  functions: Option<&Path>,
  project: &str,
  env: &str,
  base_image_id: &str,
  digests: &[String],
  format: OutputFormat,
) -> Result<()> {
  let functions = match functions {
    Some(path) => load_functions(path)?,
    None => Vec::new(),
  };
  let digests = parse_digests(digests)?;

  let fingerprint = build_image_fingerprint(output_dir, project, env, base_image_id, &functions, &digests)
    .context("Failed to compute fingerprint")?;
  let result = FingerprintOutput {
    fingerprint,
    output: output_fingerprint(output_dir, &functions)?,
    sources: image_source_fingerprint(&functions, &digests),
  };

  if format.is_json() {
    return print_json(&result);
  }
  println!("{}", result.fingerprint);
  print_stat("Output", &result.output);
  if !result.sources.is_empty() {
    print_stat("Sources", &result.sources);
  }
  Ok(())
}

fn parse_digests(values: &[String]) -> Result<BTreeMap<String, String>> {
  let mut digests = BTreeMap::new();
  for value in values {
    // Digests never contain '='.
    let Some((source, digest)) = value.rsplit_once('=') else {
      bail!("Invalid --digest {value:?}, expected SOURCE=DIGEST");
    };
    digests.insert(source.trim().to_string(), digest.trim().to_string());
  }
  Ok(digests)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn digests_split_on_last_equals() {
    let parsed = parse_digests(&["repo/app:1=sha256:abc".to_string()]).unwrap();
    assert_eq!(parsed.get("repo/app:1").map(String::as_str), Some("sha256:abc"));
    assert!(parse_digests(&["nodigest".to_string()]).is_err());
  }
}
