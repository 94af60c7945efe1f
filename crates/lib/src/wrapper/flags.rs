//! Flag classification and rewriting for compiler invocations.
//!
//! Each recognized argument shape is a [`Flag`] variant with its own rewrite
//! rule. Anything unrecognized passes through untouched: dropping a flag we
//! do not understand breaks more builds than forwarding it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Host arguments with no wasm equivalent, dropped outright.
const DROPPED_ARGUMENTS: &[&str] = &[
  "-pthread",
  "-ffixed-form",
  "-fallow-argument-mismatch",
  "-bundle",
  "-undefined",
  "dynamic_lookup",
  "-mpopcnt",
  "-Bsymbolic-functions",
  "-fno-second-underscore",
  "-fstack-protector",
  "-fno-strict-overflow",
  "-mno-sse2",
  "-mno-avx2",
  "-std=legacy",
];

/// Linker options wasm-ld rejects or mishandles.
const DROPPED_LINKER_OPTS: &[&str] = &[
  "-Bsymbolic-functions",
  "--strip-all",
  "-strip-all",
  "--sort-common",
  "--as-needed",
  "-headerpad_max_install_names",
  "-dead_strip_dylibs",
];

const DROPPED_LINKER_PREFIXES: &[&str] = &[
  "--sysroot=",
  "--version-script=",
  "-R/",
  "-R.",
  "--exclude-libs=",
];

/// One classified compiler argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flag {
  /// `-l<name>`
  Library(String),
  /// `-I<path>`
  IncludePath(String),
  /// `-L<path>`
  LibraryPath(String),
  /// `-Wl,<opt>,<opt>,...`
  LinkerOpts(Vec<String>),
  /// Deny-listed host argument.
  HostOnly(String),
  /// Everything else, forwarded as-is.
  PassThrough(String),
}

/// Paths the wrapper consults when rewriting include arguments.
#[derive(Debug, Default, Clone)]
pub struct RewriteContext {
  /// Prefix holding cross-compiled libraries and headers.
  pub target_install_dir: Option<PathBuf>,
  /// Target interpreter headers, substituted for any host interpreter
  /// include path.
  pub python_include: Option<PathBuf>,
}

impl Flag {
  pub fn classify(arg: &str) -> Flag {
    if DROPPED_ARGUMENTS.contains(&arg) || arg.starts_with("-J") {
      return Flag::HostOnly(arg.into());
    }
    if let Some(name) = arg.strip_prefix("-l") {
      return Flag::Library(name.into());
    }
    if let Some(path) = arg.strip_prefix("-I") {
      if !path.is_empty() {
        return Flag::IncludePath(path.into());
      }
    }
    if let Some(path) = arg.strip_prefix("-L") {
      if !path.is_empty() {
        return Flag::LibraryPath(path.into());
      }
    }
    if arg.starts_with("-Wl") {
      let opts = arg.split(',').skip(1).map(String::from).collect();
      return Flag::LinkerOpts(opts);
    }
    Flag::PassThrough(arg.into())
  }

  /// Produces the rewritten argument, or `None` to drop it. `used_libs`
  /// tracks `-l` arguments already emitted in this invocation; emcc rejects
  /// duplicate library flags.
  pub fn rewrite(self, ctx: &RewriteContext, used_libs: &mut HashSet<String>) -> Option<String> {
    match self {
      Flag::Library(name) => {
        if name == "ffi" || name == "gfortran" {
          return None;
        }
        if !used_libs.insert(name.clone()) {
          return None;
        }
        Some(format!("-l{name}"))
      }
      Flag::IncludePath(path) => rewrite_include(&path, ctx),
      Flag::LibraryPath(path) => {
        if path.starts_with("/usr") {
          None
        } else {
          Some(format!("-L{path}"))
        }
      }
      Flag::LinkerOpts(opts) => {
        let kept: Vec<&str> = opts
          .iter()
          .map(String::as_str)
          .filter(|opt| {
            !DROPPED_LINKER_OPTS.contains(opt)
              && !DROPPED_LINKER_PREFIXES.iter().any(|p| opt.starts_with(p))
          })
          .collect();
        if kept.is_empty() {
          return None;
        }
        Some(format!("-Wl,{}", kept.join(",")))
      }
      Flag::HostOnly(_) => None,
      Flag::PassThrough(arg) => Some(arg),
    }
  }
}

fn rewrite_include(path: &str, ctx: &RewriteContext) -> Option<String> {
  // Host system headers never match the target.
  if path.starts_with("/usr") {
    return None;
  }
  // Host interpreter headers get swapped for the target set.
  if let Some(python_include) = &ctx.python_include {
    let is_host_python = Path::new(path)
      .components()
      .any(|c| c.as_os_str().to_string_lossy().starts_with("python"))
      && path.contains("/include");
    if is_host_python && !starts_with_dir(path, ctx.target_install_dir.as_deref()) {
      return Some(format!("-I{}", python_include.display()));
    }
  }
  Some(format!("-I{path}"))
}

fn starts_with_dir(path: &str, dir: Option<&Path>) -> bool {
  match dir {
    Some(dir) => Path::new(path).starts_with(dir),
    None => false,
  }
}

/// Rewrites a full argument list, dedicating one `used_libs` set to the
/// whole invocation.
pub fn rewrite_args(args: &[String], ctx: &RewriteContext) -> Vec<String> {
  let mut used_libs = HashSet::new();
  args
    .iter()
    .filter_map(|arg| Flag::classify(arg).rewrite(ctx, &mut used_libs))
    .collect()
}

/// Whether this command line links a shared object, judged by its non-flag
/// arguments naming `.so` outputs (optionally versioned, like `.so.1.2`).
pub fn is_link_invocation(args: &[String]) -> bool {
  args.iter().any(|arg| {
    if arg.is_empty() || arg.starts_with('-') {
      return false;
    }
    if arg.ends_with(".so") {
      return true;
    }
    if let Some(pos) = arg.find(".so.") {
      let version = &arg[pos + 4..];
      return !version.is_empty()
        && version.chars().next().is_some_and(|c| c.is_ascii_digit())
        && version.chars().all(|c| c.is_ascii_digit() || c == '.');
    }
    false
  })
}
