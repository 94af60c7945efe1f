//! wasmforge: build native-extension packages for WebAssembly.
//!
//! One binary, two faces. Invoked as `wasmforge`, it is the CLI. Invoked
//! through one of its shim symlinks (`cc`, `ar`, ...) from inside a build,
//! it becomes the compiler wrapper, dispatching on `argv[0]` before clap
//! ever sees the command line.

use std::path::Path;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmd;
mod output;

/// Cross-compile package recipes to WebAssembly
#[derive(Parser)]
#[command(name = "wasmforge")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build recipes and their dependency closure
  Build(cmd::BuildArgs),

  /// List recipes in a recipe directory
  List(cmd::ListArgs),
}

fn main() -> ExitCode {
  let mut args = std::env::args();
  let argv0 = args.next().unwrap_or_default();
  let invoked_as = Path::new(&argv0)
    .file_name()
    .map(|n| n.to_string_lossy().to_string())
    .unwrap_or_default();
  if wasmforge_lib::wrapper::is_shim_name(&invoked_as) {
    return run_shim(&invoked_as, args.collect());
  }

  let cli = Cli::parse();
  init_tracing(cli.verbose);

  let result = match cli.command {
    Commands::Build(args) => cmd::cmd_build(args),
    Commands::List(args) => cmd::cmd_list(args).map(|()| 0),
  };
  match result {
    Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
    Err(error) => {
      output::print_error(&format!("{error:#}"));
      ExitCode::FAILURE
    }
  }
}

fn run_shim(tool: &str, args: Vec<String>) -> ExitCode {
  match wasmforge_lib::wrapper::run(tool, &args) {
    Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
    Err(error) => {
      eprintln!("wasmforge shim: {:#}", anyhow::Error::new(error));
      ExitCode::FAILURE
    }
  }
}

fn init_tracing(verbose: bool) {
  let filter = if verbose {
    EnvFilter::new("wasmforge=debug,wasmforge_lib=debug")
  } else {
    EnvFilter::from_default_env()
  };
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .without_time()
    .init();
}
