//! Terminal output for fnbox commands.
//!
//! Text mode prints short status lines, colored only when the stream is a
//! terminal. `--output json` prints the command's report as pretty JSON and
//! nothing else on stdout.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    self == OutputFormat::Json
  }
}

mod marks {
  pub const OK: &str = "✓";
  pub const FAIL: &str = "✗";
  pub const NOTE: &str = "•";
  pub const BUILT: &str = "+";
  pub const CACHED: &str = "=";
}

/// Elapsed time with precision that shrinks as the duration grows.
pub fn format_duration(duration: Duration) -> String {
  match duration.as_millis() {
    ms @ 0..1_000 => format!("{ms}ms"),
    ms @ 1_000..60_000 => format!("{:.1}s", ms as f64 / 1_000.0),
    ms => {
      let secs = ms / 1_000;
      format!("{}m{:02}s", secs / 60, secs % 60)
    }
  }
}

pub fn print_success(message: &str) {
  println!("{} {message}", marks::OK.if_supports_color(Stream::Stdout, |s| s.green()));
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    marks::FAIL.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_info(message: &str) {
  println!("{} {message}", marks::NOTE.if_supports_color(Stream::Stdout, |s| s.cyan()));
}

pub fn print_stat(label: &str, value: &str) {
  println!("  {}: {value}", label.if_supports_color(Stream::Stdout, |s| s.dimmed()));
}

/// A titled list of images, built ones first, then those left as they were.
pub fn print_image_group(title: &str, built: &[String], skipped: &[String]) {
  println!();
  println!("{}", title.if_supports_color(Stream::Stdout, |s| s.bold()));
  if built.is_empty() && skipped.is_empty() {
    println!("  {}", "(none)".if_supports_color(Stream::Stdout, |s| s.dimmed()));
    return;
  }
  for name in built {
    println!("  {} {name}", marks::BUILT.if_supports_color(Stream::Stdout, |s| s.green()));
  }
  for name in skipped {
    println!(
      "  {} {name} {}",
      marks::CACHED.if_supports_color(Stream::Stdout, |s| s.dimmed()),
      "(fingerprint unchanged)".if_supports_color(Stream::Stdout, |s| s.dimmed())
    );
  }
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to encode output as JSON")?;
  println!("{json}");
  Ok(())
}
