//! Compiler wrapper shims.
//!
//! During a build, `cc`, `c++`, `ar` and friends on `PATH` are symlinks to
//! the wasmforge binary. Dispatch on `argv[0]` lands here: the invocation is
//! classified, rewritten for the wasm toolchain, executed, and recorded in
//! the recipe's invocation log. Context travels through one JSON-encoded
//! environment variable, so shims need no arguments of their own.

mod flags;
mod record;

pub use flags::{is_link_invocation, rewrite_args, Flag, RewriteContext};
pub use record::{Classification, InvocationLog, InvocationRecord, INVOCATION_LOG};

use std::path::PathBuf;
use std::process::Command;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::recipe::{Exports, ExportsPreset, Kind};

/// Tool names the orchestrator symlinks into the shim directory.
pub const SHIM_NAMES: &[&str] = &[
  "cc", "c++", "gcc", "g++", "ld", "lld", "ar", "ranlib", "strip",
];

/// JSON-encoded [`WrapperEnv`], set for every build script.
pub const WRAPPER_ENV_VAR: &str = "WASMFORGE_WRAPPER_ENV";

pub fn is_shim_name(name: &str) -> bool {
  SHIM_NAMES.contains(&name)
}

#[derive(Debug, Error)]
pub enum WrapperError {
  #[error("{WRAPPER_ENV_VAR} is not set; shims only work inside a build")]
  MissingEnv,
  #[error("malformed {WRAPPER_ENV_VAR}")]
  InvalidEnv(#[source] serde_json::Error),
  #[error("failed to run {tool:?}")]
  Spawn {
    tool: String,
    #[source]
    source: std::io::Error,
  },
  #[error("failed to append to invocation log {path}")]
  Record {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// Per-recipe wrapper context, assembled by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrapperEnv {
  pub recipe: String,
  pub kind: Kind,
  pub exports: Exports,
  /// Flags already merged from the cross config and the recipe.
  pub cflags: String,
  pub cxxflags: String,
  pub ldflags: String,
  pub target_install_dir: Option<PathBuf>,
  pub python_include: Option<PathBuf>,
  pub log_file: PathBuf,
  pub cc: String,
  pub cxx: String,
  pub ar: String,
  pub ranlib: String,
  pub strip: String,
  pub nm: String,
}

impl WrapperEnv {
  pub fn from_env() -> Result<Self, WrapperError> {
    let raw = std::env::var(WRAPPER_ENV_VAR).map_err(|_| WrapperError::MissingEnv)?;
    serde_json::from_str(&raw).map_err(WrapperError::InvalidEnv)
  }

  pub fn to_json(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string(self)
  }

  fn rewrite_context(&self) -> RewriteContext {
    RewriteContext {
      target_install_dir: self.target_install_dir.clone(),
      python_include: self.python_include.clone(),
    }
  }
}

/// What a shim invocation should do.
#[derive(Debug, PartialEq)]
pub enum Plan {
  /// Toolchain probe answered locally, no process spawned.
  Print(String),
  Exec {
    argv: Vec<String>,
    classification: Classification,
  },
}

/// Pure planning step: maps the original invocation to the command that
/// actually runs. Splitting this from execution keeps it testable without a
/// toolchain installed.
pub fn plan(tool: &str, args: &[String], env: &WrapperEnv) -> Plan {
  if args.iter().any(|a| a == "-print-multiarch") {
    return Plan::Print("wasm32-emscripten".into());
  }
  if args == ["-v"] {
    return Plan::Exec {
      argv: vec![env.cc.clone(), "-v".into()],
      classification: Classification::Other,
    };
  }

  let forward = |target: &str, classification| Plan::Exec {
    argv: std::iter::once(target.to_string())
      .chain(args.iter().cloned())
      .collect(),
    classification,
  };
  match tool {
    "ar" => return forward(&env.ar, Classification::Archive),
    "ranlib" => return forward(&env.ranlib, Classification::Other),
    "strip" => return forward(&env.strip, Classification::Other),
    "cc" | "gcc" | "g++" | "c++" | "ld" | "lld" => {}
    other => {
      // Permissive pass-through: an unknown tool runs unmodified rather
      // than failing the build.
      warn!(tool = other, "unrecognized shim name, forwarding unchanged");
      return forward(other, Classification::Other);
    }
  }

  let cxx = matches!(tool, "c++" | "g++")
    || args.iter().any(|a| a.ends_with(".cpp") || a.ends_with(".cc"));
  let compiler = if cxx { &env.cxx } else { &env.cc };

  let ctx = env.rewrite_context();
  let mut argv = vec![compiler.clone()];
  argv.extend(rewrite_args(args, &ctx));
  argv.extend([
    "-Werror=implicit-function-declaration".into(),
    "-Werror=mismatched-parameter-types".into(),
    "-Werror=return-type".into(),
  ]);

  let linking = is_link_invocation(args);
  let compiling = args.iter().any(|a| a == "-c");
  if linking {
    argv.push("-Wl,--fatal-warnings".into());
    argv.extend(env.ldflags.split_whitespace().map(String::from));
    if env.kind.is_shared_object() {
      argv.extend(side_module_flags(env, args));
    }
  }
  if compiling {
    argv.extend(env.cflags.split_whitespace().map(String::from));
    if cxx {
      argv.extend(env.cxxflags.split_whitespace().map(String::from));
    }
    if env.kind.is_shared_object() {
      argv.push("-fPIC".into());
    }
    if let Some(include) = &env.python_include {
      argv.push(format!("-I{}", include.display()));
    }
  }

  let classification = if linking {
    Classification::Link
  } else if compiling {
    Classification::Compile
  } else {
    Classification::Other
  };
  Plan::Exec {
    argv,
    classification,
  }
}

/// Side-module flags for a shared-object link: the module flag plus the
/// export list the recipe asked for.
fn side_module_flags(env: &WrapperEnv, args: &[String]) -> Vec<String> {
  let symbols = match &env.exports {
    Exports::Preset(ExportsPreset::WholeArchive) => return Vec::new(),
    Exports::Explicit(list) => Some(list.clone()),
    Exports::Preset(preset) => object_exports(env, args, *preset),
  };
  let mut out = vec!["-sSIDE_MODULE=2".to_string()];
  if let Some(symbols) = symbols {
    let prefixed: Vec<String> = symbols.iter().map(|s| format!("_{s}")).collect();
    out.push(format!("-sEXPORTED_FUNCTIONS={}", prefixed.join(",")));
  }
  out
}

/// Asks the toolchain's nm for exported symbols in the objects being
/// linked. `None` (nm missing or unhappy) leaves the export list to the
/// linker's defaults; dropping symbols would be worse.
fn object_exports(env: &WrapperEnv, args: &[String], preset: ExportsPreset) -> Option<Vec<String>> {
  let objects: Vec<&String> = args
    .iter()
    .filter(|a| a.ends_with(".o") || a.ends_with(".a"))
    .collect();
  if objects.is_empty() {
    return None;
  }
  let output = Command::new(&env.nm)
    .arg("-j")
    .arg("--export-symbols")
    .args(&objects)
    .output();
  let output = match output {
    Ok(output) if output.status.success() => output,
    Ok(output) => {
      warn!(nm = %env.nm, status = ?output.status.code(), "nm failed, leaving exports to the linker");
      return None;
    }
    Err(e) => {
      warn!(nm = %env.nm, error = %e, "nm unavailable, leaving exports to the linker");
      return None;
    }
  };
  let symbols: Vec<String> = String::from_utf8_lossy(&output.stdout)
    .lines()
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .filter(|s| preset != ExportsPreset::Pyinit || s.starts_with("PyInit"))
    .map(String::from)
    .collect();
  Some(symbols)
}

/// Shim entry point: plan, execute, record, and hand back the exit code.
pub fn run(tool: &str, args: &[String]) -> Result<i32, WrapperError> {
  let env = WrapperEnv::from_env()?;
  let planned = plan(tool, args, &env);

  let mut argv_original = vec![tool.to_string()];
  argv_original.extend(args.iter().cloned());

  let (exit_code, classification, rewritten) = match planned {
    Plan::Print(text) => {
      println!("{text}");
      (Some(0), Classification::Other, vec!["echo".into(), text])
    }
    Plan::Exec {
      argv,
      classification,
    } => {
      debug!(recipe = %env.recipe, original = ?argv_original, rewritten = ?argv, "shim exec");
      let status = Command::new(&argv[0])
        .args(&argv[1..])
        .status()
        .map_err(|source| WrapperError::Spawn {
          tool: argv[0].clone(),
          source,
        })?;
      (status.code(), classification, argv)
    }
  };

  let log = InvocationLog::at(&env.log_file);
  log
    .append(&InvocationRecord {
      argv: argv_original,
      classification,
      rewritten,
      exit_code,
    })
    .map_err(|source| WrapperError::Record {
      path: log.path().into(),
      source,
    })?;
  Ok(exit_code.unwrap_or(1))
}
