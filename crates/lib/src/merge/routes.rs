//! `routing.yml`: routes keyed by path and method.

use std::collections::HashMap;

use serde_yaml::{Mapping, Value};

/// `path:METHOD`, with the method defaulting to `GET`. Routes without a path
/// have no key.
pub fn route_key(route: &Value) -> Option<String> {
  let path = route.get("path").and_then(Value::as_str).filter(|p| !p.is_empty())?;
  let method = route
    .get("method")
    .and_then(Value::as_str)
    .filter(|m| !m.is_empty())
    .unwrap_or("GET");
  Some(format!("{path}:{method}"))
}

/// Replace routes with the same key in place and append new ones. Nothing is removed.
pub fn merge_routes(existing: &Mapping, incoming: &Mapping) -> Mapping {
  let mut routes = sequence(existing, "routes");
  let mut index: HashMap<String, usize> = routes
    .iter()
    .enumerate()
    .filter_map(|(i, route)| route_key(route).map(|key| (key, i)))
    .collect();

  for route in sequence(incoming, "routes") {
    let Some(key) = route_key(&route) else {
      continue;
    };
    match index.get(&key) {
      Some(&i) => routes[i] = route,
      None => {
        index.insert(key, routes.len());
        routes.push(route);
      }
    }
  }

  let mut merged = Mapping::new();
  merged.insert(Value::from("routes"), Value::Sequence(routes));
  merged
}

pub(crate) fn sequence(doc: &Mapping, key: &str) -> Vec<Value> {
  doc.get(key).and_then(Value::as_sequence).cloned().unwrap_or_default()
}
