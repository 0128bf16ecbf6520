//! `resources.yml`: typed resource lists keyed by their natural name.

use std::collections::HashMap;

use serde_yaml::{Mapping, Value};

use super::functions::section;

/// Resource list and the field identifying an entry.
pub const RESOURCE_KEYS: [(&str, &str); 3] = [("dynamodb", "TableName"), ("s3", "BucketName"), ("layers", "Name")];

pub fn merge_resources(existing: &Mapping, incoming: &Mapping) -> Mapping {
  let mut resources = section(existing, "resources");
  let new_resources = section(incoming, "resources");

  for (kind, key_field) in RESOURCE_KEYS {
    let current = list(&resources, kind);
    let additions = list(&new_resources, kind);
    let merged = merge_resource_list(current, &additions, key_field);
    if !merged.is_empty() {
      resources.insert(Value::from(kind), Value::Sequence(merged));
    }
  }

  let mut doc = Mapping::new();
  doc.insert(Value::from("resources"), Value::Mapping(resources));
  doc
}

/// Same-key replace, new-key append. Entries without a key are kept as they
/// are in `existing` and dropped from `incoming`.
pub fn merge_resource_list(mut existing: Vec<Value>, incoming: &[Value], key_field: &str) -> Vec<Value> {
  let mut index: HashMap<String, usize> = existing
    .iter()
    .enumerate()
    .filter_map(|(i, item)| resource_key(item, key_field).map(|key| (key, i)))
    .collect();

  for item in incoming {
    let Some(key) = resource_key(item, key_field) else {
      continue;
    };
    match index.get(&key) {
      Some(&i) => existing[i] = item.clone(),
      None => {
        index.insert(key, existing.len());
        existing.push(item.clone());
      }
    }
  }
  existing
}

fn resource_key(item: &Value, key_field: &str) -> Option<String> {
  item
    .get(key_field)
    .and_then(Value::as_str)
    .filter(|k| !k.is_empty())
    .map(String::from)
}

fn list(resources: &Mapping, kind: &str) -> Vec<Value> {
  resources.get(kind).and_then(Value::as_sequence).cloned().unwrap_or_default()
}
