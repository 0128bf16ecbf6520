//! Test utilities for fnbox-lib.
//!
//! Provides a scripted [`CommandRunner`] so docker interactions can be
//! exercised without a daemon, plus small cross-platform shell helpers.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::exec::{CommandRunner, ExecError};

/// Returns the shell command and args to execute a shell script.
#[cfg(unix)]
pub fn shell_cmd(script: &str) -> (&'static str, Vec<String>) {
  ("/bin/sh", vec!["-c".to_string(), script.to_string()])
}

#[cfg(windows)]
pub fn shell_cmd(script: &str) -> (&'static str, Vec<String>) {
  ("cmd.exe", vec!["/C".to_string(), script.to_string()])
}

struct Rule {
  prefix: Vec<String>,
  output: String,
  code: Option<i32>,
  once: bool,
}

/// A [`CommandRunner`] that answers from a script instead of spawning processes.
///
/// Each rule matches when the command line (program followed by args) starts
/// with the rule's prefix. Rules are checked in insertion order; `once` rules
/// are consumed on first match. Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct FakeRunner {
  rules: Mutex<Vec<Rule>>,
  calls: Mutex<Vec<Vec<String>>>,
}

impl FakeRunner {
  pub fn new() -> Self {
    Self::default()
  }

  /// Succeed with `output` whenever the prefix matches.
  pub fn on(self, prefix: &[&str], output: &str) -> Self {
    self.push(prefix, output, None, false)
  }

  /// Succeed with `output` for the next matching call only.
  pub fn once(self, prefix: &[&str], output: &str) -> Self {
    self.push(prefix, output, None, true)
  }

  /// Fail with exit code 1 and `output` whenever the prefix matches.
  pub fn fail(self, prefix: &[&str], output: &str) -> Self {
    self.push(prefix, output, Some(1), false)
  }

  /// Fail with exit code 1 and `output` for the next matching call only.
  pub fn fail_once(self, prefix: &[&str], output: &str) -> Self {
    self.push(prefix, output, Some(1), true)
  }

  fn push(self, prefix: &[&str], output: &str, code: Option<i32>, once: bool) -> Self {
    self.rules.lock().unwrap().push(Rule {
      prefix: prefix.iter().map(|s| s.to_string()).collect(),
      output: output.to_string(),
      code,
      once,
    });
    self
  }

  /// Every command line seen so far, program first.
  pub fn calls(&self) -> Vec<Vec<String>> {
    self.calls.lock().unwrap().clone()
  }

  /// Command lines that start with `prefix`.
  pub fn calls_matching(&self, prefix: &[&str]) -> Vec<Vec<String>> {
    self
      .calls()
      .into_iter()
      .filter(|argv| starts_with(argv, prefix))
      .collect()
  }

  pub fn called(&self, prefix: &[&str]) -> bool {
    !self.calls_matching(prefix).is_empty()
  }

  fn respond(&self, program: &str, args: &[String]) -> Result<String, ExecError> {
    let mut argv = vec![program.to_string()];
    argv.extend(args.iter().cloned());
    self.calls.lock().unwrap().push(argv.clone());

    let mut rules = self.rules.lock().unwrap();
    let Some(index) = rules.iter().position(|rule| {
      let prefix: Vec<&str> = rule.prefix.iter().map(String::as_str).collect();
      starts_with(&argv, &prefix)
    }) else {
      return Ok(String::new());
    };

    let (output, code) = (rules[index].output.clone(), rules[index].code);
    if rules[index].once {
      rules.remove(index);
    }
    match code {
      None => Ok(output),
      Some(code) => Err(ExecError::Failed {
        program: program.to_string(),
        args: args.join(" "),
        code: Some(code),
        output,
      }),
    }
  }
}

fn starts_with(argv: &[String], prefix: &[&str]) -> bool {
  argv.len() >= prefix.len() && argv.iter().zip(prefix).all(|(a, p)| a == p)
}

#[async_trait]
impl CommandRunner for FakeRunner {
  async fn run(&self, _dir: &Path, program: &str, args: &[String]) -> Result<(), ExecError> {
    self.respond(program, args).map(|_| ())
  }

  async fn run_output(&self, _dir: &Path, program: &str, args: &[String]) -> Result<String, ExecError> {
    self.respond(program, args)
  }
}
