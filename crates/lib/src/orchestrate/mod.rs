//! Parallel build orchestration.
//!
//! The scheduler keeps a ready set of recipes whose dependencies are all
//! satisfied and dispatches from it whenever a worker slot frees up, so a
//! slow build never holds back unrelated ready work. Failures mark every
//! transitive dependent skipped; in fail-fast mode they additionally stop
//! dispatch while in-flight builds drain to completion.

mod report;
mod task;

pub use report::{BuildReport, BuildState, RecipeReport, SkipReason};
pub use task::{
  build_recipe, TaskError, TaskFailure, TaskOutput, BUILD_LOG, SYSROOT_ENV_VAR, TARGET_FILE,
  TARGET_FILE_ENV_VAR,
};

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::artifact::ArtifactStore;
use crate::config::CrossConfig;
use crate::graph::DependencyGraph;
use crate::recipe::RecipeStore;

#[derive(Debug, Clone)]
pub struct BuildPolicy {
  /// Rebuild even when the artifact store already satisfies a recipe.
  pub force_rebuild: bool,
  /// Worker slots; dispatch never exceeds this many concurrent builds.
  pub jobs: usize,
  /// Stop dispatching new builds after the first failure. When off, every
  /// recipe not downstream of a failure still builds.
  pub fail_fast: bool,
  /// Reuse existing workdirs instead of refetching sources.
  pub no_isolation: bool,
}

impl Default for BuildPolicy {
  fn default() -> Self {
    BuildPolicy {
      force_rebuild: false,
      jobs: std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4),
      fail_fast: true,
      no_isolation: false,
    }
  }
}

pub struct Orchestrator {
  store: Arc<RecipeStore>,
  config: Arc<CrossConfig>,
  artifacts: Arc<ArtifactStore>,
  build_dir: PathBuf,
  policy: BuildPolicy,
}

impl Orchestrator {
  pub fn new(
    store: RecipeStore,
    config: CrossConfig,
    artifacts: ArtifactStore,
    build_dir: impl Into<PathBuf>,
    policy: BuildPolicy,
  ) -> Self {
    Orchestrator {
      store: Arc::new(store),
      config: Arc::new(config),
      artifacts: Arc::new(artifacts),
      build_dir: build_dir.into(),
      policy,
    }
  }

  pub fn store(&self) -> &RecipeStore {
    &self.store
  }

  pub fn artifacts(&self) -> &ArtifactStore {
    &self.artifacts
  }

  pub fn config(&self) -> &CrossConfig {
    &self.config
  }

  /// Runs every member of `graph` to a terminal state and reports.
  pub async fn run(&self, graph: &DependencyGraph) -> BuildReport {
    let started = Instant::now();
    let mut states: BTreeMap<String, BuildState> = graph
      .members()
      .map(|n| (n.to_string(), BuildState::Pending))
      .collect();
    let mut reports: BTreeMap<String, RecipeReport> = BTreeMap::new();
    let mut remaining: HashMap<String, usize> = graph
      .members()
      .map(|n| (n.to_string(), graph.dependencies(n).len()))
      .collect();
    let mut ready: VecDeque<String> = graph
      .build_order()
      .iter()
      .filter(|n| remaining[*n] == 0)
      .cloned()
      .collect();

    let semaphore = Arc::new(Semaphore::new(self.policy.jobs.max(1)));
    let mut join_set: JoinSet<(String, Result<TaskOutput, TaskFailure>)> = JoinSet::new();
    // Concurrency is counted inside each task while its permit is held;
    // dispatch and join bookkeeping lag behind the permit.
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut aborted = false;

    info!(
      recipes = states.len(),
      jobs = self.policy.jobs,
      "starting build session"
    );
    loop {
      while !aborted {
        let Some(name) = ready.pop_front() else {
          break;
        };
        if states[&name] != BuildState::Pending {
          continue;
        }
        let Some(recipe) = self.store.get(&name) else {
          // Graph members always come from the store; a miss here is a bug.
          error!(recipe = %name, "graph member vanished from the recipe store");
          states.insert(name.clone(), BuildState::Failed);
          reports.insert(name.clone(), RecipeReport::new(BuildState::Failed));
          continue;
        };

        if !self.policy.force_rebuild
          && self.artifacts.is_built(recipe, &self.config.abi_version)
        {
          info!(recipe = %name, "already satisfied, skipping build");
          finish(&mut states, &mut reports, &name, BuildState::Built { cached: true });
          release_dependents(graph, &name, &mut remaining, &states, &mut ready);
          continue;
        }

        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
          ready.push_front(name);
          break;
        };
        states.insert(name.clone(), BuildState::Building);

        let recipe = recipe.clone();
        let recipe_dir = self.store.recipe_dir(&name);
        let config = Arc::clone(&self.config);
        let artifacts = Arc::clone(&self.artifacts);
        let build_dir = self.build_dir.clone();
        let no_isolation = self.policy.no_isolation;
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        join_set.spawn(async move {
          let now = running.fetch_add(1, Ordering::SeqCst) + 1;
          peak.fetch_max(now, Ordering::SeqCst);
          let result = build_recipe(
            &recipe,
            &recipe_dir,
            &config,
            &artifacts,
            &build_dir,
            no_isolation,
          )
          .await;
          running.fetch_sub(1, Ordering::SeqCst);
          drop(permit);
          (recipe.name().to_string(), result)
        });
      }

      let Some(joined) = join_set.join_next().await else {
        break;
      };
      match joined {
        Ok((name, Ok(output))) => {
          let mut report = RecipeReport::new(BuildState::Built { cached: false });
          report.duration = Some(output.duration);
          states.insert(name.clone(), report.state.clone());
          reports.insert(name.clone(), report);
          release_dependents(graph, &name, &mut remaining, &states, &mut ready);
        }
        Ok((name, Err(failure))) => {
          error!(recipe = %name, error = %failure.error, "build failed");
          let mut report = RecipeReport::new(BuildState::Failed);
          report.log_tail = failure.log_tail;
          report.failed_invocations = failure.failed_invocations;
          states.insert(name.clone(), BuildState::Failed);
          reports.insert(name.clone(), report);
          skip_dependents(graph, &name, &mut states, &mut reports);
          if self.policy.fail_fast && !aborted {
            warn!("halting dispatch, draining builds in flight");
            aborted = true;
          }
        }
        Err(join_error) => {
          error!(error = %join_error, "build task panicked");
          if self.policy.fail_fast {
            aborted = true;
          }
        }
      }
    }

    // Whatever never reached a terminal state was starved by the abort.
    for (name, state) in states.iter_mut() {
      if !state.is_terminal() {
        if !aborted {
          warn!(recipe = %name, "left pending without an abort");
        }
        *state = BuildState::Skipped(SkipReason::Aborted);
        reports.insert(name.clone(), RecipeReport::new(state.clone()));
      }
    }

    let report = BuildReport {
      recipes: reports,
      peak_parallelism: peak.load(Ordering::SeqCst),
      elapsed: started.elapsed(),
    };
    info!(
      built = report.built().count(),
      failed = report.failed().count(),
      skipped = report.skipped().count(),
      "build session finished"
    );
    report
  }
}

fn finish(
  states: &mut BTreeMap<String, BuildState>,
  reports: &mut BTreeMap<String, RecipeReport>,
  name: &str,
  state: BuildState,
) {
  states.insert(name.to_string(), state.clone());
  reports.insert(name.to_string(), RecipeReport::new(state));
}

/// Decrements dependency counts below `name` and queues anything that became
/// ready.
fn release_dependents(
  graph: &DependencyGraph,
  name: &str,
  remaining: &mut HashMap<String, usize>,
  states: &BTreeMap<String, BuildState>,
  ready: &mut VecDeque<String>,
) {
  for dependent in graph.dependents(name) {
    if let Some(count) = remaining.get_mut(dependent) {
      *count = count.saturating_sub(1);
      if *count == 0 && states[dependent] == BuildState::Pending {
        ready.push_back(dependent.to_string());
      }
    }
  }
}

/// Marks every transitive dependent of a failed recipe skipped, each naming
/// the dependency that sank it.
fn skip_dependents(
  graph: &DependencyGraph,
  failed: &str,
  states: &mut BTreeMap<String, BuildState>,
  reports: &mut BTreeMap<String, RecipeReport>,
) {
  let mut queue: VecDeque<String> = VecDeque::new();
  queue.push_back(failed.to_string());
  while let Some(name) = queue.pop_front() {
    for dependent in graph.dependents(&name) {
      if states[dependent] != BuildState::Pending {
        continue;
      }
      warn!(recipe = %dependent, dependency = %name, "skipped: dependency failed");
      let state = BuildState::Skipped(SkipReason::DependencyFailed {
        dependency: name.clone(),
      });
      finish(states, reports, dependent, state);
      queue.push_back(dependent.to_string());
    }
  }
}
