//! Build configuration resolved from the environment.
//!
//! [`BuildEnv`] is read once at the top of an invocation and passed down by
//! value. Nothing else in the crate reads environment variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::consts::{DEFAULT_BUILDER_NAME, DEFAULT_REGISTRY, DEFAULT_REGISTRY_PORT, ROOT_CA_FILENAME};
use crate::platform::paths;

/// Proxy variable pairs: (upper, lower, docker config.json key).
const PROXY_KEYS: [(&str, &str, &str); 3] = [
  ("HTTP_PROXY", "http_proxy", "httpProxy"),
  ("HTTPS_PROXY", "https_proxy", "httpsProxy"),
  ("NO_PROXY", "no_proxy", "noProxy"),
];

/// Every proxy variable name the builder container may carry.
pub const PROXY_ENV_KEYS: [&str; 6] = ["HTTP_PROXY", "http_proxy", "HTTPS_PROXY", "https_proxy", "NO_PROXY", "no_proxy"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEnv {
  /// Control-plane registry, always ending in `/`.
  pub registry: String,
  /// Runtime registry override (`CONTAINER_REGISTRY`), normalized with a trailing `/`.
  pub container_registry: Option<String>,
  pub registry_insecure: bool,
  /// Resolved proxy variables, both upper and lower case spellings.
  pub proxy_env: BTreeMap<String, String>,
  pub provenance: Option<String>,
  pub buildkitd_config: Option<PathBuf>,
  pub host_registry_addr: Option<String>,
  pub registry_port: u16,
  pub registry_wait: bool,
  pub builder_name: String,
  pub root_ca_path: Option<PathBuf>,
  pub lock_root: Option<PathBuf>,
  /// Root of the per-project staging tree holding merged config stores.
  pub staging_root: Option<PathBuf>,
}

impl Default for BuildEnv {
  fn default() -> Self {
    Self::from_lookup(|_| None)
  }
}

impl BuildEnv {
  /// Resolve configuration from the process environment.
  pub fn from_env() -> Self {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Resolve configuration from an arbitrary lookup function.
  pub fn from_lookup<F>(lookup: F) -> Self
  where
    F: Fn(&str) -> Option<String>,
  {
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let registry = with_trailing_slash(get("FNBOX_REGISTRY").unwrap_or_else(|| DEFAULT_REGISTRY.to_string()));
    let container_registry = get("CONTAINER_REGISTRY").map(with_trailing_slash);
    let registry_insecure = get("CONTAINER_REGISTRY_INSECURE")
      .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
      .unwrap_or(false);

    let docker_proxy = paths::docker_config_dir(&lookup)
      .map(|dir| read_docker_config_proxy(&dir.join("config.json")))
      .unwrap_or_default();
    let mut proxy_env = BTreeMap::new();
    for (upper, lower, config_key) in PROXY_KEYS {
      let value = get(upper)
        .or_else(|| get(lower))
        .or_else(|| docker_proxy.get(config_key).cloned());
      if let Some(value) = value {
        proxy_env.insert(upper.to_string(), value.clone());
        proxy_env.insert(lower.to_string(), value);
      }
    }

    let registry_port = match get("FNBOX_PORT_REGISTRY") {
      Some(raw) => raw.parse().unwrap_or_else(|_| {
        debug!(value = %raw, "ignoring unparsable registry port");
        DEFAULT_REGISTRY_PORT
      }),
      None => DEFAULT_REGISTRY_PORT,
    };

    let home = paths::home_dir(&lookup);
    let root_ca_path = get("FNBOX_CA_CERT_PATH")
      .map(|p| expand_home(&p, home.as_deref()))
      .or_else(|| get("FNBOX_CERT_DIR").map(|d| expand_home(&d, home.as_deref()).join(ROOT_CA_FILENAME)))
      .or_else(|| get("CAROOT").map(|d| expand_home(&d, home.as_deref()).join(ROOT_CA_FILENAME)))
      .or_else(|| home.as_ref().map(|h| h.join(".fnbox").join("certs").join(ROOT_CA_FILENAME)));

    BuildEnv {
      registry,
      container_registry,
      registry_insecure,
      proxy_env,
      provenance: get("PROVENANCE"),
      buildkitd_config: get("BUILDKITD_CONFIG").map(PathBuf::from),
      host_registry_addr: get("HOST_REGISTRY_ADDR"),
      registry_port,
      registry_wait: get("FNBOX_REGISTRY_WAIT").as_deref() != Some("0"),
      builder_name: get("FNBOX_BUILDX_BUILDER").unwrap_or_else(|| DEFAULT_BUILDER_NAME.to_string()),
      root_ca_path,
      lock_root: paths::lock_root(&lookup),
      staging_root: get("FNBOX_STAGING_DIR")
        .map(PathBuf::from)
        .or_else(|| paths::cache_dir(&lookup).map(|c| c.join("staging"))),
    }
  }

  /// Proxy variables suitable for builder driver options.
  ///
  /// `no_proxy` lists containing commas cannot be expressed as a driver option
  /// and are left out.
  pub fn proxy_driver_env(&self) -> BTreeMap<String, String> {
    self
      .proxy_env
      .iter()
      .filter(|(key, value)| !(key.eq_ignore_ascii_case("no_proxy") && value.contains(',')))
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect()
  }
}

fn with_trailing_slash(mut value: String) -> String {
  if !value.ends_with('/') {
    value.push('/');
  }
  value
}

fn expand_home(value: &str, home: Option<&Path>) -> PathBuf {
  if let Some(home) = home {
    if value == "~" {
      return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
      return home.join(rest);
    }
  }
  PathBuf::from(value)
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
  #[serde(default)]
  proxies: BTreeMap<String, DockerProxy>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerProxy {
  #[serde(default)]
  http_proxy: String,
  #[serde(default)]
  https_proxy: String,
  #[serde(default)]
  no_proxy: String,
}

/// Reads `proxies.default` from a docker CLI config. Missing or malformed files
/// yield no proxies.
fn read_docker_config_proxy(path: &Path) -> BTreeMap<&'static str, String> {
  let mut values = BTreeMap::new();
  let Ok(raw) = std::fs::read_to_string(path) else {
    return values;
  };
  let Ok(parsed) = serde_json::from_str::<DockerConfig>(&raw) else {
    debug!(path = %path.display(), "ignoring malformed docker config");
    return values;
  };
  let Some(defaults) = parsed.proxies.get("default") else {
    return values;
  };
  for (key, value) in [
    ("httpProxy", &defaults.http_proxy),
    ("httpsProxy", &defaults.https_proxy),
    ("noProxy", &defaults.no_proxy),
  ] {
    let value = value.trim();
    if !value.is_empty() {
      values.insert(key, value.to_string());
    }
  }
  values
}
