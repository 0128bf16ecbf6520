//! Records consumed from the template parser.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One function as produced by the template parser.
///
/// Only `name` is required; everything else defaults so partial records from
/// the parser (or hand-written JSON) deserialize.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionSpec {
  pub name: String,
  pub image_name: String,
  pub code_uri: String,
  pub handler: String,
  pub runtime: String,
  pub timeout: u32,
  pub memory_size: u32,
  pub environment: BTreeMap<String, String>,
  pub layers: Vec<LayerSpec>,
  /// External image the function is backed by, if any.
  pub image_source: String,
  /// Internal reference the runtime pulls; filled in by image import resolution.
  pub image_ref: String,
}

impl FunctionSpec {
  pub fn has_image_source(&self) -> bool {
    !self.image_source.trim().is_empty()
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerSpec {
  pub name: String,
  pub content_uri: String,
}
