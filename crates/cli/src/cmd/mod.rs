mod builder;
mod deploy;
mod fingerprint;
mod image_ref;
mod merge;

use std::path::Path;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fnbox_lib::types::FunctionSpec;

pub use builder::cmd_builder;
pub use deploy::{DeployArgs, cmd_deploy};
pub use fingerprint::cmd_fingerprint;
pub use image_ref::cmd_image_ref;
pub use merge::cmd_merge;

/// Read the function records produced by the template parser.
pub(crate) fn load_functions(path: &Path) -> Result<Vec<FunctionSpec>> {
  let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
  let functions: Vec<FunctionSpec> = serde_json::from_str(&text)
    .with_context(|| format!("Failed to parse function records in {}", path.display()))?;
  debug!(path = %path.display(), count = functions.len(), "loaded function records");
  Ok(functions)
}

/// A token cancelled on Ctrl-C. Must be called inside a runtime.
pub(crate) fn ctrl_c_token() -> CancellationToken {
  let token = CancellationToken::new();
  let child = token.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      child.cancel();
    }
  });
  token
}
