//! Implementation of the `wasmforge build` command.
//!
//! Resolves the target selection against the recipe directory, runs the
//! orchestrator over the resulting dependency graph, prints a per-recipe
//! summary, and optionally installs the runtime closure with a lockfile.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{debug, info};

use wasmforge_lib::artifact::ArtifactStore;
use wasmforge_lib::config::CrossConfig;
use wasmforge_lib::graph::DependencyGraph;
use wasmforge_lib::orchestrate::{BuildPolicy, BuildReport, BuildState, Orchestrator, SkipReason};
use wasmforge_lib::recipe::{RecipeStore, TargetSelection};

use crate::output::{self, format_duration, symbols};

pub const LOCKFILE_NAME: &str = "wasmforge-lock.json";

#[derive(Args)]
pub struct BuildArgs {
  /// Recipes to build: names, `*` for everything, `!name` to deny
  #[arg(default_value = "*")]
  targets: String,

  /// Directory containing the recipes
  #[arg(long, default_value = "recipes")]
  recipe_dir: PathBuf,

  /// Working directory for fetches, builds, and logs
  #[arg(long, default_value = "build")]
  build_dir: PathBuf,

  /// Cross-compilation config file (default: ./wasmforge.yaml if present)
  #[arg(long)]
  config: Option<PathBuf>,

  /// Maximum concurrent builds (default: available CPUs)
  #[arg(short, long)]
  jobs: Option<usize>,

  /// Rebuild even when the artifact store is already satisfied
  #[arg(long)]
  force_rebuild: bool,

  /// Keep building recipes unaffected by failures instead of halting
  #[arg(long)]
  continue_on_fail: bool,

  /// Reuse existing workdirs without refetching sources
  #[arg(long)]
  no_isolation: bool,

  /// Install the runtime closure into this directory and write a lockfile
  #[arg(long)]
  install: Option<PathBuf>,
}

pub fn cmd_build(args: BuildArgs) -> Result<i32> {
  let selection =
    TargetSelection::parse(&args.targets).context("invalid target selection")?;
  let store = RecipeStore::load(&args.recipe_dir)?;
  let config = CrossConfig::resolve(args.config.as_deref())?;
  let graph = DependencyGraph::resolve(&store, &selection)?;
  debug!(
    recipes = graph.len(),
    host_tools = graph.host_tools().len(),
    "resolved dependency graph"
  );

  output::print_info(&format!(
    "building {} recipe(s) for {}",
    graph.len(),
    config.target_triple
  ));

  let mut policy = BuildPolicy {
    force_rebuild: args.force_rebuild,
    fail_fast: !args.continue_on_fail,
    no_isolation: args.no_isolation,
    ..BuildPolicy::default()
  };
  if let Some(jobs) = args.jobs {
    policy.jobs = jobs.max(1);
  }

  let artifacts = ArtifactStore::at(ArtifactStore::resolve_root(&args.build_dir));
  let orchestrator = Orchestrator::new(store, config, artifacts, &args.build_dir, policy);

  let rt = tokio::runtime::Runtime::new().context("failed to create async runtime")?;
  let report = rt.block_on(orchestrator.run(&graph));

  print_report(&report);
  if report.is_success() {
    if let Some(dest) = &args.install {
      install_closure(&orchestrator, &graph, dest)?;
    }
  }
  Ok(report.exit_code())
}

fn print_report(report: &BuildReport) {
  println!();
  for (name, recipe) in &report.recipes {
    match &recipe.state {
      BuildState::Built { cached: false } => {
        let duration = recipe
          .duration
          .map(format_duration)
          .unwrap_or_default();
        output::print_success(&format!("{name} ({duration})"));
      }
      BuildState::Built { cached: true } => {
        output::print_success(&format!("{name} (cached)"));
      }
      BuildState::Failed => {
        output::print_error(&format!("{name} failed"));
        for invocation in &recipe.failed_invocations {
          output::print_stat(
            "failed command",
            &format!(
              "{} {} {}",
              invocation.argv.join(" "),
              symbols::ARROW,
              invocation.rewritten.join(" ")
            ),
          );
        }
        if let Some(tail) = &recipe.log_tail {
          eprintln!("{tail}");
        }
      }
      BuildState::Skipped(SkipReason::DependencyFailed { dependency }) => {
        output::print_warning(&format!("{name} skipped: {dependency} failed"));
      }
      BuildState::Skipped(SkipReason::Aborted) => {
        output::print_warning(&format!("{name} skipped: build aborted"));
      }
      // Terminal by the time the report exists.
      BuildState::Pending | BuildState::Building => {}
    }
  }
  println!();
  output::print_stat("built", &report.built().count().to_string());
  output::print_stat("failed", &report.failed().count().to_string());
  output::print_stat("skipped", &report.skipped().count().to_string());
  output::print_stat("peak parallelism", &report.peak_parallelism.to_string());
  output::print_stat(
    "elapsed",
    &humantime::format_duration(std::time::Duration::from_secs(report.elapsed.as_secs()))
      .to_string(),
  );
}

/// Copies every runtime recipe's artifact into `dest` and writes the
/// lockfile next to them. Host-only graph members stay out.
fn install_closure(
  orchestrator: &Orchestrator,
  graph: &DependencyGraph,
  dest: &std::path::Path,
) -> Result<()> {
  let runtime: Vec<&str> = graph
    .members()
    .filter(|name| graph.in_run_closure(name))
    .collect();
  let mut installed = 0usize;
  for name in &runtime {
    let recipe = orchestrator
      .store()
      .get(name)
      .with_context(|| format!("recipe {name} missing from store"))?;
    if !recipe.kind().has_dist_artifact() {
      continue;
    }
    orchestrator
      .artifacts()
      .install(name, dest)
      .with_context(|| format!("failed to install {name}"))?;
    installed += 1;
  }

  let lockfile = dest.join(LOCKFILE_NAME);
  let recipes = runtime.iter().filter_map(|name| orchestrator.store().get(name));
  orchestrator
    .artifacts()
    .write_lockfile(orchestrator.config(), recipes, &lockfile)
    .context("failed to write lockfile")?;
  info!(path = %lockfile.display(), "lockfile written");
  output::print_success(&format!(
    "installed {installed} package(s) {} {}",
    symbols::ARROW,
    dest.display()
  ));
  Ok(())
}
