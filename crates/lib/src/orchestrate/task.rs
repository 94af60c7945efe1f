//! Building one recipe: workdir setup, shim installation, script execution,
//! and artifact capture.
//!
//! Workdir layout under `<build_dir>/<name>/`:
//!
//! ```text
//! src/               unpacked sources, scripts run here
//! dist/              what the scripts leave behind for the store
//! shims/             cc, ar, ... symlinks to the wasmforge binary
//! build.log          combined script output
//! invocations.jsonl  wrapper invocation records
//! target.json        target description for build tooling
//! ```

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

use crate::artifact::{ArtifactError, ArtifactStore};
use crate::config::CrossConfig;
use crate::recipe::Recipe;
use crate::source::{prepare_source, FetchError};
use crate::wrapper::{InvocationLog, InvocationRecord, WrapperEnv, INVOCATION_LOG, SHIM_NAMES, WRAPPER_ENV_VAR};

pub const BUILD_LOG: &str = "build.log";
pub const TARGET_FILE: &str = "target.json";
/// Exported to build scripts alongside the wrapper env.
pub const SYSROOT_ENV_VAR: &str = "WASMFORGE_SYSROOT";
pub const TARGET_FILE_ENV_VAR: &str = "WASMFORGE_TARGET_FILE";

const LOG_TAIL_LINES: usize = 30;

#[derive(Debug, Error)]
pub enum TaskError {
  #[error(transparent)]
  Fetch(#[from] FetchError),
  #[error(transparent)]
  Artifact(#[from] ArtifactError),
  #[error("io error at {path}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("no previous workdir at {path}; a no-isolation build needs one")]
  MissingWorkdir { path: PathBuf },
  #[error("{phase} script exited with {}", code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()))]
  Script { phase: &'static str, code: Option<i32> },
  #[error("build produced no files in {path}")]
  NoArtifact { path: PathBuf },
  #[error("failed to encode wrapper environment")]
  Env(#[source] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> TaskError + '_ {
  move |source| TaskError::Io {
    path: path.into(),
    source,
  }
}

#[derive(Debug)]
pub struct TaskOutput {
  pub duration: Duration,
}

/// Failure bundle handed back to the scheduler: the error, the end of the
/// build log, and the wrapper invocations that went wrong.
#[derive(Debug)]
pub struct TaskFailure {
  pub error: TaskError,
  pub log_tail: Option<String>,
  pub failed_invocations: Vec<InvocationRecord>,
}

/// Builds one recipe through all its phases. `no_isolation` reuses the
/// previous workdir verbatim instead of refetching sources, for debugging a
/// failed build in place.
pub async fn build_recipe(
  recipe: &Recipe,
  recipe_dir: &Path,
  config: &CrossConfig,
  artifacts: &ArtifactStore,
  build_dir: &Path,
  no_isolation: bool,
) -> Result<TaskOutput, TaskFailure> {
  let started = Instant::now();
  let workdir = build_dir.join(recipe.name());
  match run_phases(recipe, recipe_dir, config, artifacts, build_dir, &workdir, no_isolation).await
  {
    Ok(()) => Ok(TaskOutput {
      duration: started.elapsed(),
    }),
    Err(error) => {
      let log_tail = read_log_tail(&workdir.join(BUILD_LOG));
      let failed_invocations = InvocationLog::at(workdir.join(INVOCATION_LOG))
        .failed()
        .unwrap_or_default();
      Err(TaskFailure {
        error,
        log_tail,
        failed_invocations,
      })
    }
  }
}

async fn run_phases(
  recipe: &Recipe,
  recipe_dir: &Path,
  config: &CrossConfig,
  artifacts: &ArtifactStore,
  build_dir: &Path,
  workdir: &Path,
  no_isolation: bool,
) -> Result<(), TaskError> {
  let srcdir = workdir.join("src");
  let distdir = workdir.join("dist");

  if no_isolation {
    if !srcdir.is_dir() {
      return Err(TaskError::MissingWorkdir {
        path: srcdir.clone(),
      });
    }
    debug!(recipe = recipe.name(), "reusing existing workdir");
  } else {
    if workdir.exists() {
      std::fs::remove_dir_all(workdir).map_err(io_err(workdir))?;
    }
    std::fs::create_dir_all(workdir).map_err(io_err(workdir))?;
    prepare_source(
      &recipe.source,
      recipe_dir,
      &build_dir.join("downloads"),
      &srcdir,
    )
    .await?;
  }
  std::fs::create_dir_all(&distdir).map_err(io_err(&distdir))?;

  // Diagnostics are per attempt; a reused workdir keeps its sources but not
  // the previous run's log or invocation records.
  for stale in [BUILD_LOG, INVOCATION_LOG] {
    let path = workdir.join(stale);
    if path.exists() {
      std::fs::remove_file(&path).map_err(io_err(&path))?;
    }
  }

  let shim_dir = install_shims(workdir)?;
  let target_file = workdir.join(TARGET_FILE);
  config
    .write_target_file(&target_file)
    .map_err(io_err(&target_file))?;

  let wrapper_env = WrapperEnv {
    recipe: recipe.name().into(),
    kind: recipe.kind(),
    exports: recipe.build.exports.clone(),
    cflags: merge_flags(&config.cflags, &recipe.build.cflags),
    cxxflags: merge_flags(&config.cxxflags, &recipe.build.cxxflags),
    ldflags: merge_flags(&config.ldflags, &recipe.build.ldflags),
    target_install_dir: config.target_install_dir.clone(),
    python_include: config.python_include.clone(),
    log_file: workdir.join(INVOCATION_LOG),
    cc: config.cc.clone(),
    cxx: config.cxx.clone(),
    ar: config.ar.clone(),
    ranlib: config.ranlib.clone(),
    strip: config.strip.clone(),
    nm: config.nm.clone(),
  };
  let env_json = wrapper_env.to_json().map_err(TaskError::Env)?;

  let mut env: Vec<(String, String)> = vec![
    (WRAPPER_ENV_VAR.into(), env_json),
    (TARGET_FILE_ENV_VAR.into(), target_file.display().to_string()),
    ("PKG_NAME".into(), recipe.name().into()),
    ("PKG_VERSION".into(), recipe.version().into()),
    ("DISTDIR".into(), distdir.display().to_string()),
  ];
  if let Some(sysroot) = &config.sysroot {
    env.push((SYSROOT_ENV_VAR.into(), sysroot.display().to_string()));
  }
  if let Some(dir) = &config.target_install_dir {
    env.push(("WASM_LIBRARY_DIR".into(), dir.display().to_string()));
  }
  // Shims first on PATH, and the usual toolchain variables rebound so build
  // systems that read $CC instead of running `cc` still go through them.
  let path = match std::env::var("PATH") {
    Ok(existing) => format!("{}:{existing}", shim_dir.display()),
    Err(_) => shim_dir.display().to_string(),
  };
  env.push(("PATH".into(), path));
  for (var, shim) in [
    ("CC", "cc"),
    ("CXX", "c++"),
    ("AR", "ar"),
    ("RANLIB", "ranlib"),
    ("STRIP", "strip"),
    ("LD", "ld"),
  ] {
    env.push((var.into(), shim_dir.join(shim).display().to_string()));
  }

  let log_path = workdir.join(BUILD_LOG);
  if let Some(script) = &recipe.build.script {
    run_script("build", script, &srcdir, &env, &log_path).await?;
  }
  if let Some(script) = &recipe.build.post {
    run_script("post", script, &srcdir, &env, &log_path).await?;
  }

  if recipe.kind().has_dist_artifact() && dir_is_empty(&distdir)? {
    return Err(TaskError::NoArtifact { path: distdir });
  }
  artifacts.put(recipe, &config.abi_version, &distdir)?;
  info!(recipe = recipe.name(), "build complete");
  Ok(())
}

/// Creates the shim directory with every wrapper tool name linked to the
/// running wasmforge binary.
fn install_shims(workdir: &Path) -> Result<PathBuf, TaskError> {
  let shim_dir = workdir.join("shims");
  std::fs::create_dir_all(&shim_dir).map_err(io_err(&shim_dir))?;
  let this_exe = std::env::current_exe().map_err(io_err(&shim_dir))?;
  for name in SHIM_NAMES {
    let link = shim_dir.join(name);
    if link.exists() {
      continue;
    }
    make_shim(&this_exe, &link).map_err(io_err(&link))?;
  }
  Ok(shim_dir)
}

#[cfg(unix)]
fn make_shim(target: &Path, link: &Path) -> std::io::Result<()> {
  std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_shim(target: &Path, link: &Path) -> std::io::Result<()> {
  std::fs::copy(target, link).map(|_| ())
}

async fn run_script(
  phase: &'static str,
  script: &str,
  cwd: &Path,
  env: &[(String, String)],
  log_path: &Path,
) -> Result<(), TaskError> {
  debug!(phase, cwd = %cwd.display(), "running script");
  let output = tokio::process::Command::new("sh")
    .arg("-c")
    .arg(script)
    .current_dir(cwd)
    .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    .output()
    .await
    .map_err(io_err(cwd))?;

  append_log(log_path, phase, &output.stdout, &output.stderr)?;
  if !output.status.success() {
    return Err(TaskError::Script {
      phase,
      code: output.status.code(),
    });
  }
  Ok(())
}

fn append_log(
  log_path: &Path,
  phase: &str,
  stdout: &[u8],
  stderr: &[u8],
) -> Result<(), TaskError> {
  use std::io::Write;
  let mut file = std::fs::OpenOptions::new()
    .create(true)
    .append(true)
    .open(log_path)
    .map_err(io_err(log_path))?;
  writeln!(file, "### {phase}").map_err(io_err(log_path))?;
  file.write_all(stdout).map_err(io_err(log_path))?;
  file.write_all(stderr).map_err(io_err(log_path))?;
  Ok(())
}

fn read_log_tail(log_path: &Path) -> Option<String> {
  let text = std::fs::read_to_string(log_path).ok()?;
  let lines: Vec<&str> = text.lines().collect();
  let start = lines.len().saturating_sub(LOG_TAIL_LINES);
  Some(lines[start..].join("\n"))
}

fn dir_is_empty(path: &Path) -> Result<bool, TaskError> {
  let mut entries = std::fs::read_dir(path).map_err(io_err(path))?;
  Ok(entries.next().is_none())
}

fn merge_flags(base: &str, extra: &str) -> String {
  match (base.is_empty(), extra.is_empty()) {
    (true, _) => extra.into(),
    (_, true) => base.into(),
    _ => format!("{base} {extra}"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn recipe(kind: &str, script: &str) -> Recipe {
    serde_yaml::from_str(&format!(
      r#"
package:
  name: demo
  version: "1.0"
build:
  type: {kind}
  script: |
    {script}
"#
    ))
    .unwrap()
  }

  struct Fixture {
    _tmp: tempfile::TempDir,
    recipe_dir: PathBuf,
    build_dir: PathBuf,
    store: ArtifactStore,
    config: CrossConfig,
  }

  fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let recipe_dir = tmp.path().join("recipes/demo");
    std::fs::create_dir_all(&recipe_dir).unwrap();
    let build_dir = tmp.path().join("build");
    let store = ArtifactStore::at(tmp.path().join("artifacts"));
    Fixture {
      _tmp: tmp,
      recipe_dir,
      build_dir,
      store,
      config: CrossConfig::default(),
    }
  }

  #[tokio::test]
  async fn successful_build_stores_an_artifact() {
    let f = fixture();
    let recipe = recipe("shared_package", r#"echo "payload" > "$DISTDIR/demo.so""#);
    let out = build_recipe(&recipe, &f.recipe_dir, &f.config, &f.store, &f.build_dir, false)
      .await
      .unwrap();
    assert!(out.duration >= Duration::ZERO);
    assert!(f.store.is_built(&recipe, &f.config.abi_version));
    assert!(f.build_dir.join("demo").join(BUILD_LOG).is_file());
    assert!(f.build_dir.join("demo/shims/cc").exists());
    assert!(f.build_dir.join("demo").join(TARGET_FILE).is_file());
  }

  #[tokio::test]
  async fn script_failure_reports_log_tail() {
    let f = fixture();
    let recipe = recipe(
      "shared_package",
      r#"echo "configuring"; echo "fatal: no emscripten" >&2; exit 3"#,
    );
    let failure = build_recipe(&recipe, &f.recipe_dir, &f.config, &f.store, &f.build_dir, false)
      .await
      .unwrap_err();
    assert!(matches!(
      failure.error,
      TaskError::Script {
        phase: "build",
        code: Some(3)
      }
    ));
    let tail = failure.log_tail.unwrap();
    assert!(tail.contains("fatal: no emscripten"));
    assert!(!f.store.is_built(&recipe, &f.config.abi_version));
  }

  #[tokio::test]
  async fn missing_dist_output_is_a_failure() {
    let f = fixture();
    let recipe = recipe("shared_package", "true");
    let failure = build_recipe(&recipe, &f.recipe_dir, &f.config, &f.store, &f.build_dir, false)
      .await
      .unwrap_err();
    assert!(matches!(failure.error, TaskError::NoArtifact { .. }));
  }

  #[tokio::test]
  async fn static_library_needs_no_dist_output() {
    let f = fixture();
    let recipe = recipe("static_library", "true");
    build_recipe(&recipe, &f.recipe_dir, &f.config, &f.store, &f.build_dir, false)
      .await
      .unwrap();
    assert!(f.store.is_built(&recipe, &f.config.abi_version));
  }

  #[tokio::test]
  async fn post_script_runs_after_build() {
    let f = fixture();
    let recipe: Recipe = serde_yaml::from_str(
      r#"
package:
  name: demo
  version: "1.0"
build:
  type: shared_package
  script: echo "one" > "$DISTDIR/a.so"
  post: echo "two" >> "$DISTDIR/a.so"
"#,
    )
    .unwrap();
    build_recipe(&recipe, &f.recipe_dir, &f.config, &f.store, &f.build_dir, false)
      .await
      .unwrap();
    let stored = f.store.root().join("demo/a.so");
    let contents = std::fs::read_to_string(stored).unwrap();
    assert_eq!(contents, "one\ntwo\n");
  }

  #[tokio::test]
  async fn no_isolation_requires_a_previous_workdir() {
    let f = fixture();
    let recipe = recipe("shared_package", "true");
    let failure = build_recipe(&recipe, &f.recipe_dir, &f.config, &f.store, &f.build_dir, true)
      .await
      .unwrap_err();
    assert!(matches!(failure.error, TaskError::MissingWorkdir { .. }));
  }

  #[tokio::test]
  async fn no_isolation_reuses_sources_in_place() {
    let f = fixture();
    // First pass drops a marker in the source tree.
    let first = recipe("shared_package", r#"echo "x" > marker; echo "y" > "$DISTDIR/a.so""#);
    build_recipe(&first, &f.recipe_dir, &f.config, &f.store, &f.build_dir, false)
      .await
      .unwrap();
    // Replay sees the marker because nothing was recreated.
    let replay = recipe(
      "shared_package",
      r#"test -f marker && echo "z" > "$DISTDIR/a.so""#,
    );
    build_recipe(&replay, &f.recipe_dir, &f.config, &f.store, &f.build_dir, true)
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn replay_does_not_carry_stale_diagnostics() {
    let f = fixture();
    let first = recipe("shared_package", r#"echo "alpha broke" >&2; exit 1"#);
    let failure = build_recipe(&first, &f.recipe_dir, &f.config, &f.store, &f.build_dir, false)
      .await
      .unwrap_err();
    assert!(failure.log_tail.unwrap().contains("alpha broke"));

    let replay = recipe("shared_package", r#"echo "beta broke" >&2; exit 1"#);
    let failure = build_recipe(&replay, &f.recipe_dir, &f.config, &f.store, &f.build_dir, true)
      .await
      .unwrap_err();
    let tail = failure.log_tail.unwrap();
    assert!(tail.contains("beta broke"));
    assert!(!tail.contains("alpha broke"));
  }

  #[tokio::test]
  async fn scripts_see_package_metadata() {
    let f = fixture();
    let recipe = recipe(
      "shared_package",
      r#"echo "$PKG_NAME-$PKG_VERSION" > "$DISTDIR/meta.so""#,
    );
    build_recipe(&recipe, &f.recipe_dir, &f.config, &f.store, &f.build_dir, false)
      .await
      .unwrap();
    let stored = f.store.root().join("demo/meta.so");
    assert_eq!(std::fs::read_to_string(stored).unwrap(), "demo-1.0\n");
  }
}
