//! Build states and the final report.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wrapper::InvocationRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
  /// A transitive dependency failed, so this build never ran.
  DependencyFailed { dependency: String },
  /// Dispatch halted after an earlier failure in fail-fast mode.
  Aborted,
}

/// Lifecycle of one recipe in a session. `Pending` and `Building` are
/// transient; the rest are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
  Pending,
  Building,
  /// `cached` marks a build skipped because the artifact store already had
  /// a matching entry.
  Built { cached: bool },
  Failed,
  Skipped(SkipReason),
}

impl BuildState {
  pub fn is_terminal(&self) -> bool {
    !matches!(self, BuildState::Pending | BuildState::Building)
  }

  /// Whether this state should make the session exit nonzero: a failure, or
  /// a skip caused by one.
  pub fn taints_session(&self) -> bool {
    matches!(
      self,
      BuildState::Failed | BuildState::Skipped(SkipReason::DependencyFailed { .. })
    )
  }
}

#[derive(Debug, Clone)]
pub struct RecipeReport {
  pub state: BuildState,
  pub duration: Option<Duration>,
  /// Last lines of `build.log`, populated on failure.
  pub log_tail: Option<String>,
  /// Wrapper invocations that exited nonzero, populated on failure.
  pub failed_invocations: Vec<InvocationRecord>,
}

impl RecipeReport {
  pub fn new(state: BuildState) -> Self {
    RecipeReport {
      state,
      duration: None,
      log_tail: None,
      failed_invocations: Vec::new(),
    }
  }
}

/// Outcome of a whole session, one entry per graph member.
#[derive(Debug, Default)]
pub struct BuildReport {
  pub recipes: BTreeMap<String, RecipeReport>,
  /// Highest number of builds observed running at once.
  pub peak_parallelism: usize,
  pub elapsed: Duration,
}

impl BuildReport {
  pub fn is_success(&self) -> bool {
    !self.recipes.values().any(|r| r.state.taints_session())
  }

  /// Process exit code for the session: zero only when nothing failed and
  /// nothing was skipped because of a failure. Aborted-but-untouched
  /// recipes do not taint the result on their own.
  pub fn exit_code(&self) -> i32 {
    if self.is_success() { 0 } else { 1 }
  }

  pub fn with_state<'a>(
    &'a self,
    pred: impl Fn(&BuildState) -> bool + 'a,
  ) -> impl Iterator<Item = &'a str> {
    self
      .recipes
      .iter()
      .filter(move |(_, r)| pred(&r.state))
      .map(|(name, _)| name.as_str())
  }

  pub fn built(&self) -> impl Iterator<Item = &str> {
    self.with_state(|s| matches!(s, BuildState::Built { .. }))
  }

  pub fn failed(&self) -> impl Iterator<Item = &str> {
    self.with_state(|s| matches!(s, BuildState::Failed))
  }

  pub fn skipped(&self) -> impl Iterator<Item = &str> {
    self.with_state(|s| matches!(s, BuildState::Skipped(_)))
  }
}
