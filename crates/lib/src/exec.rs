//! Subprocess execution.
//!
//! Everything that shells out to `docker` goes through [`CommandRunner`] so
//! builder provisioning, image inspection, and bake invocations can be tested
//! against a scripted runner.

use std::future::Future;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ExecError {
  #[error("failed to spawn {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  #[error("{program} {args} exited with {}", code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
  Failed {
    program: String,
    args: String,
    code: Option<i32>,
    output: String,
  },

  #[error("operation cancelled")]
  Cancelled,
}

impl ExecError {
  /// Captured output of a command that ran but exited unsuccessfully.
  pub fn output(&self) -> Option<&str> {
    match self {
      ExecError::Failed { output, .. } => Some(output),
      _ => None,
    }
  }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
  /// Run a command with output streamed to the terminal.
  async fn run(&self, dir: &Path, program: &str, args: &[String]) -> Result<(), ExecError>;

  /// Run a command and capture its combined stdout and stderr.
  ///
  /// A non-zero exit is reported as [`ExecError::Failed`] carrying the output.
  async fn run_output(&self, dir: &Path, program: &str, args: &[String]) -> Result<String, ExecError>;
}

/// [`CommandRunner`] backed by real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
  async fn run(&self, dir: &Path, program: &str, args: &[String]) -> Result<(), ExecError> {
    debug!(program = %program, args = ?args, dir = ?dir, "running command");

    let status = command(dir, program, args)
      .stdin(Stdio::null())
      .stdout(Stdio::inherit())
      .stderr(Stdio::inherit())
      .status()
      .await
      .map_err(|source| ExecError::Spawn {
        program: program.to_string(),
        source,
      })?;

    if !status.success() {
      return Err(ExecError::Failed {
        program: program.to_string(),
        args: args.join(" "),
        code: status.code(),
        output: String::new(),
      });
    }
    Ok(())
  }

  async fn run_output(&self, dir: &Path, program: &str, args: &[String]) -> Result<String, ExecError> {
    debug!(program = %program, args = ?args, dir = ?dir, "running command");

    let output = command(dir, program, args)
      .stdin(Stdio::null())
      .output()
      .await
      .map_err(|source| ExecError::Spawn {
        program: program.to_string(),
        source,
      })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
      debug!(output = %combined.trim(), "command failed");
      return Err(ExecError::Failed {
        program: program.to_string(),
        args: args.join(" "),
        code: output.status.code(),
        output: combined,
      });
    }
    Ok(combined)
  }
}

fn command(dir: &Path, program: &str, args: &[String]) -> Command {
  let mut command = Command::new(program);
  command.args(args).kill_on_drop(true);
  if !dir.as_os_str().is_empty() {
    command.current_dir(dir);
  }
  command
}

/// Await `fut` unless `cancel` fires first. Dropping the future kills any
/// child process it spawned.
pub async fn cancellable<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T, E>
where
  F: Future<Output = Result<T, E>>,
  E: From<ExecError>,
{
  tokio::select! {
    biased;
    _ = cancel.cancelled() => Err(ExecError::Cancelled.into()),
    result = fut => result,
  }
}

/// Convenience for building owned argument vectors.
pub fn args<I, S>(items: I) -> Vec<String>
where
  I: IntoIterator<Item = S>,
  S: Into<String>,
{
  items.into_iter().map(Into::into).collect()
}
