//! `image-import.json`: entries keyed by function name.

use std::collections::BTreeMap;

use crate::image::{ImageImportEntry, ImageImportManifest};

/// Function name, or `source|ref` when the name is blank.
pub fn image_import_key(entry: &ImageImportEntry) -> Option<String> {
  let name = entry.function_name.trim();
  if !name.is_empty() {
    return Some(name.to_string());
  }
  let source = entry.image_source.trim();
  let image_ref = entry.image_ref.trim();
  if source.is_empty() && image_ref.is_empty() {
    return None;
  }
  Some(format!("{source}|{image_ref}"))
}

/// Incoming entries replace existing ones with the same key; output is
/// ordered by key.
pub fn merge_image_import(existing: &ImageImportManifest, incoming: &ImageImportManifest) -> ImageImportManifest {
  let mut index = BTreeMap::new();
  for entry in existing.images.iter().chain(&incoming.images) {
    if let Some(key) = image_import_key(entry) {
      index.insert(key, entry.clone());
    }
  }

  ImageImportManifest {
    version: first_non_empty(&[incoming.version.as_str(), existing.version.as_str(), "1"]),
    push_target: first_non_empty(&[incoming.push_target.as_str(), existing.push_target.as_str()]),
    images: index.into_values().collect(),
  }
}

fn first_non_empty(values: &[&str]) -> String {
  values
    .iter()
    .map(|v| v.trim())
    .find(|v| !v.is_empty())
    .unwrap_or_default()
    .to_string()
}
