mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::output::{OutputFormat, print_error};

/// fnbox - build and deploy orchestration for local serverless functions
#[derive(Parser)]
#[command(name = "fnbox")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
  output: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build function images and merge the rendered config into the store
  Deploy {
    /// JSON file with the parsed function records
    #[arg(long)]
    functions: PathBuf,

    /// Rendered output directory (config/ and functions/)
    #[arg(long)]
    output_dir: PathBuf,

    /// Repository holding docker-bake.hcl
    #[arg(long, default_value = ".")]
    repo_root: PathBuf,

    /// Compose project name
    #[arg(long, default_value = "")]
    project: String,

    /// Environment name
    #[arg(long, default_value = "")]
    env: String,

    /// Runtime mode (docker or containerd)
    #[arg(long, default_value = "docker")]
    mode: String,

    /// Image tag
    #[arg(long, default_value = "latest")]
    tag: String,

    /// Rebuild every image, ignoring fingerprints and the layer cache
    #[arg(long)]
    no_cache: bool,

    /// Merged config store (default: staging layout for project and env)
    #[arg(long)]
    config_dir: Option<PathBuf>,
  },

  /// Merge <OUTPUT_DIR>/config into a config store
  Merge {
    output_dir: PathBuf,
    config_dir: PathBuf,

    /// How long to wait for the deploy lock (e.g. 30s, 2m)
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    timeout: Duration,
  },

  /// Compute the build fingerprint of a rendered output directory
  Fingerprint {
    output_dir: PathBuf,

    /// JSON file with the parsed function records
    #[arg(long)]
    functions: Option<PathBuf>,

    #[arg(long, default_value = "")]
    project: String,

    #[arg(long, default_value = "")]
    env: String,

    /// Identity of the base image function images are built on
    #[arg(long, default_value = "")]
    base_image_id: String,

    /// Resolved digest of an image source, as SOURCE=DIGEST (repeatable)
    #[arg(long = "digest", value_name = "SOURCE=DIGEST")]
    digests: Vec<String>,
  },

  /// Show the internal reference an external image is imported as
  ImageRef {
    source: String,

    /// Internal registry (default: FNBOX_REGISTRY)
    #[arg(long)]
    registry: Option<String>,

    /// Function name recorded in the entry
    #[arg(long, default_value = "")]
    function: String,
  },

  /// Ensure the buildx builder exists with the expected configuration
  Builder {
    #[arg(long, default_value = ".")]
    repo_root: PathBuf,
  },
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_logging(cli.verbose);

  let format = cli.output;
  let result = match cli.command {
    Commands::Deploy {
      functions,
      output_dir,
      repo_root,
      project,
      env,
      mode,
      tag,
      no_cache,
      config_dir,
    } => cmd::cmd_deploy(
      cmd::DeployArgs {
        functions,
        output_dir,
        repo_root,
        project,
        env,
        mode,
        tag,
        no_cache,
        config_dir,
        verbose: cli.verbose,
      },
      format,
    ),
    Commands::Merge {
      output_dir,
      config_dir,
      timeout,
    } => cmd::cmd_merge(&output_dir, &config_dir, timeout, format),
    Commands::Fingerprint {
      output_dir,
      functions,
      project,
      env,
      base_image_id,
      digests,
    } => cmd::cmd_fingerprint(
      &output_dir,
      functions.as_deref(),
      &project,
      &env,
      &base_image_id,
      &digests,
      format,
    ),
    Commands::ImageRef {
      source,
      registry,
      function,
    } => cmd::cmd_image_ref(&source, registry.as_deref(), &function, format),
    Commands::Builder { repo_root } => cmd::cmd_builder(&repo_root, format),
  };

  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      print_error(&format!("{err:#}"));
      ExitCode::FAILURE
    }
  }
}

fn init_logging(verbose: bool) {
  let default = if verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}
