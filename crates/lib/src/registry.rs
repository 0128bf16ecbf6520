//! Registry topology resolution and readiness probing.
//!
//! The builder pushes to one address while running containers may pull from
//! another: a registry published on a host port is reachable from the
//! host-networked builder at `127.0.0.1:<port>` but from containers as
//! `registry:5010`.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::BuildEnv;
use crate::consts::REGISTRY_PORT_KEY;

pub type DiscoverError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum RegistryError {
  #[error("port discovery failed: {0}")]
  Discover(#[source] DiscoverError),

  #[error("failed to build registry client: {0}")]
  Client(#[source] reqwest::Error),

  #[error("registry not responding at {url}")]
  NotResponding { url: String },

  #[error("cancelled while waiting for registry at {url}")]
  Cancelled { url: String },
}

/// Reports which host ports a running environment has published.
#[async_trait]
pub trait PortDiscoverer: Send + Sync {
  async fn discover(&self, root: &Path, project: &str, mode: &str) -> Result<BTreeMap<String, u16>, DiscoverError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
  #[default]
  Default,
  Host,
}

impl NetworkMode {
  /// The value docker reports for `.HostConfig.NetworkMode`, empty for default.
  pub fn as_str(&self) -> &'static str {
    match self {
      NetworkMode::Default => "",
      NetworkMode::Host => "host",
    }
  }
}

/// Resolved registry addresses for one run. All registries end in `/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryTopology {
  /// Control-plane registry.
  pub service: String,
  /// What running containers pull from.
  pub runtime: String,
  /// What the builder pushes to.
  pub push: String,
  pub network_mode: NetworkMode,
  /// Host-side `host:port` of a local registry, used for readiness probing.
  pub host_addr: Option<String>,
}

/// Where the probe should look and what the discoverer needs to know.
pub struct ResolveContext<'a> {
  pub repo_root: &'a Path,
  pub project: &'a str,
  pub mode: &'a str,
}

impl RegistryTopology {
  pub async fn resolve(
    env: &BuildEnv,
    discoverer: Option<&dyn PortDiscoverer>,
    ctx: &ResolveContext<'_>,
  ) -> Result<Self, RegistryError> {
    let service = env.registry.clone();
    let runtime = env.container_registry.clone().unwrap_or_else(|| service.clone());
    let mut topology = RegistryTopology {
      push: service.clone(),
      service,
      runtime,
      network_mode: NetworkMode::Default,
      host_addr: None,
    };

    let host = registry_host(&topology.service);
    if !is_local_registry_host(&host) {
      return Ok(topology);
    }

    // The builder must share the host network to reach a host-mapped port.
    topology.network_mode = NetworkMode::Host;
    let (mut addr, explicit) = match &env.host_registry_addr {
      Some(value) => (strip_scheme(value), true),
      None => (format!("127.0.0.1:{}", env.registry_port), false),
    };
    let service_name = host.eq_ignore_ascii_case("registry");
    if service_name {
      topology.push = format!("{addr}/");
    }

    if !explicit && let Some(discoverer) = discoverer {
      let ports = discoverer
        .discover(ctx.repo_root, ctx.project, ctx.mode)
        .await
        .map_err(RegistryError::Discover)?;
      if let Some(&port) = ports.get(REGISTRY_PORT_KEY)
        && port > 0
      {
        debug!(port, "using discovered registry port");
        addr = format!("127.0.0.1:{port}");
        if service_name || host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" {
          topology.push = format!("{addr}/");
        }
      }
    }

    topology.host_addr = Some(addr);
    Ok(topology)
  }
}

fn strip_scheme(value: &str) -> String {
  let value = value.trim();
  let value = value
    .strip_prefix("http://")
    .or_else(|| value.strip_prefix("https://"))
    .unwrap_or(value);
  value.trim_end_matches('/').to_string()
}

/// Host part of a registry reference such as `registry:5010/`,
/// `http://localhost:5000/v2`, or `[::1]:5000`.
pub fn registry_host(registry: &str) -> String {
  let trimmed = registry.trim();
  if trimmed.is_empty() {
    return String::new();
  }
  if trimmed.contains("://")
    && let Ok(url) = reqwest::Url::parse(trimmed)
    && let Some(host) = url.host_str()
  {
    return host.trim_start_matches('[').trim_end_matches(']').to_string();
  }

  let authority = trimmed.trim_end_matches('/').split('/').next().unwrap_or_default().trim();
  if let Some(rest) = authority.strip_prefix('[') {
    return rest.split(']').next().unwrap_or_default().to_string();
  }
  if authority.parse::<IpAddr>().is_ok() {
    return authority.to_string();
  }
  authority.split(':').next().unwrap_or_default().to_string()
}

/// Whether a registry host lives on this machine: the registry service name,
/// `localhost`, a loopback address, or the docker host alias.
pub fn is_local_registry_host(host: &str) -> bool {
  let normalized = host.trim().to_ascii_lowercase();
  match normalized.as_str() {
    "" => false,
    "registry" | "localhost" | "host.docker.internal" => true,
    other => other.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false),
  }
}

/// Timing for [`wait_for_registry`].
#[derive(Debug, Clone, Copy)]
pub struct ProbeOptions {
  pub timeout: Duration,
  pub interval: Duration,
  pub request_timeout: Duration,
}

impl Default for ProbeOptions {
  fn default() -> Self {
    Self {
      timeout: Duration::from_secs(30),
      interval: Duration::from_millis(500),
      request_timeout: Duration::from_secs(2),
    }
  }
}

/// Poll `http://<address>/v2/` until it answers with a status below 500.
///
/// Local and loopback targets are probed directly; configured proxies are
/// only used for remote registries.
pub async fn wait_for_registry(
  address: &str,
  options: &ProbeOptions,
  cancel: &CancellationToken,
) -> Result<(), RegistryError> {
  let trimmed = address.trim().trim_end_matches('/');
  if trimmed.is_empty() {
    return Ok(());
  }
  let url = format!("http://{trimmed}/v2/");

  let mut builder = reqwest::Client::builder().timeout(options.request_timeout);
  if is_local_registry_host(&registry_host(trimmed)) {
    builder = builder.no_proxy();
  }
  let client = builder.build().map_err(RegistryError::Client)?;

  info!(url = %url, "waiting for registry");
  let deadline = Instant::now() + options.timeout;
  loop {
    match client.get(&url).send().await {
      Ok(resp) if resp.status().as_u16() >= 200 && resp.status().as_u16() < 500 => {
        debug!(status = %resp.status(), "registry ready");
        return Ok(());
      }
      Ok(resp) => debug!(status = %resp.status(), "registry not ready"),
      Err(err) => debug!(error = %err, "registry probe failed"),
    }

    if Instant::now() >= deadline {
      return Err(RegistryError::NotResponding { url });
    }
    tokio::select! {
      _ = cancel.cancelled() => return Err(RegistryError::Cancelled { url }),
      _ = tokio::time::sleep(options.interval) => {}
    }
  }
}
