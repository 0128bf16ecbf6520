//! `functions.yml`: functions replace by name, defaults only fill gaps.

use serde_yaml::{Mapping, Value};

/// Default sections merged key by key rather than as a whole.
const NESTED_DEFAULTS: [&str; 2] = ["environment", "scaling"];

pub fn merge_functions(existing: &Mapping, incoming: &Mapping) -> Mapping {
  let mut functions = section(existing, "functions");
  for (name, function) in section(incoming, "functions") {
    functions.insert(name, function);
  }

  let mut defaults = section(existing, "defaults");
  let new_defaults = section(incoming, "defaults");
  for key in NESTED_DEFAULTS {
    merge_defaults_section(&mut defaults, &new_defaults, key);
  }
  for (key, value) in new_defaults {
    if key.as_str().is_some_and(|k| NESTED_DEFAULTS.contains(&k)) {
      continue;
    }
    if !defaults.contains_key(&key) {
      defaults.insert(key, value);
    }
  }

  let mut merged = Mapping::new();
  merged.insert(Value::from("functions"), Value::Mapping(functions));
  if !defaults.is_empty() {
    merged.insert(Value::from("defaults"), Value::Mapping(defaults));
  }
  merged
}

fn merge_defaults_section(defaults: &mut Mapping, new_defaults: &Mapping, key: &str) {
  let Some(incoming) = new_defaults.get(key).and_then(Value::as_mapping) else {
    return;
  };
  let mut current = section(defaults, key);
  for (item_key, item_value) in incoming {
    if !current.contains_key(item_key) {
      current.insert(item_key.clone(), item_value.clone());
    }
  }
  if !current.is_empty() {
    defaults.insert(Value::from(key), Value::Mapping(current));
  }
}

/// Clone of the mapping under `key`; anything else reads as empty.
pub(crate) fn section(doc: &Mapping, key: &str) -> Mapping {
  doc.get(key).and_then(Value::as_mapping).cloned().unwrap_or_default()
}
