//! Dependency graph over a recipe set.
//!
//! Edges point from dependency to dependent. Run-edges come from
//! `requirements.run` and define the run-closure (what gets installed);
//! host-edges come from `requirements.host` entries naming another recipe
//! and only constrain build order. Host entries that name no recipe must
//! resolve to an executable on `PATH`.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use thiserror::Error;
use tracing::{debug, warn};

use crate::recipe::{resolve_host_tool, Kind, RecipeStore, TargetSelection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
  Run,
  Host,
}

#[derive(Debug, Error)]
pub enum GraphError {
  #[error("unknown recipe {name:?} required by {required_by:?}")]
  UnknownDependency { name: String, required_by: String },
  #[error("requested recipe {name:?} does not exist")]
  UnknownTarget { name: String },
  #[error("run dependency cycle: {}", members.join(" -> "))]
  RunCycle { members: Vec<String> },
  #[error("host dependency cycle: {}", members.join(" -> "))]
  HostCycle { members: Vec<String> },
  #[error(
    "recipe {required_by:?} lists static library {name:?} as a run dependency; static libraries \
     have no runtime artifact and belong in requirements.host"
  )]
  StaticRunDependency { name: String, required_by: String },
  #[error("host tool {tool:?} required by {required_by:?} not found on PATH")]
  MissingHostTool { tool: String, required_by: String },
  #[error("executable {name:?} required by {required_by:?} not found on PATH")]
  MissingExecutable { name: String, required_by: String },
  #[error("selection matched no recipes")]
  EmptySelection,
}

/// The resolved build set: every recipe that must be built, ordered edges
/// between them, and the external host tools they need.
#[derive(Debug)]
pub struct DependencyGraph {
  graph: DiGraph<String, EdgeKind>,
  nodes: HashMap<String, NodeIndex>,
  order: Vec<String>,
  run_closure: BTreeSet<String>,
  host_tools: BTreeMap<String, PathBuf>,
}

impl DependencyGraph {
  /// Resolves `selection` against `store` into the transitive build set and
  /// validates it: every dependency exists, host tools resolve, and the
  /// run-subgraph is acyclic.
  pub fn resolve(
    store: &RecipeStore,
    selection: &TargetSelection,
  ) -> Result<Self, GraphError> {
    for name in selection.requested() {
      if !store.contains(name) {
        return Err(GraphError::UnknownTarget { name: name.into() });
      }
    }

    let seeds: Vec<String> = store
      .names()
      .filter(|n| selection.matches(n))
      .map(String::from)
      .collect();
    if seeds.is_empty() {
      return Err(GraphError::EmptySelection);
    }

    // Expand the closure over both edge kinds: a host dependency that is
    // itself a recipe must be built, along with its own dependencies.
    let mut members: BTreeSet<String> = BTreeSet::new();
    let mut host_tools: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut queue: VecDeque<String> = seeds.iter().cloned().collect();
    while let Some(name) = queue.pop_front() {
      if !members.insert(name.clone()) {
        continue;
      }
      let recipe = store
        .get(&name)
        .ok_or_else(|| GraphError::UnknownTarget { name: name.clone() })?;
      for dep in &recipe.requirements.run {
        let dep_recipe = store.get(dep).ok_or_else(|| GraphError::UnknownDependency {
          name: dep.clone(),
          required_by: name.clone(),
        })?;
        if dep_recipe.kind() == Kind::StaticLibrary {
          return Err(GraphError::StaticRunDependency {
            name: dep.clone(),
            required_by: name.clone(),
          });
        }
        queue.push_back(dep.clone());
      }
      for dep in &recipe.requirements.host {
        if store.contains(dep) {
          queue.push_back(dep.clone());
        } else {
          let path = resolve_host_tool(dep).ok_or_else(|| GraphError::MissingHostTool {
            tool: dep.clone(),
            required_by: name.clone(),
          })?;
          host_tools.insert(dep.clone(), path);
        }
      }
      for exe in &recipe.requirements.executable {
        if resolve_host_tool(exe).is_none() {
          return Err(GraphError::MissingExecutable {
            name: exe.clone(),
            required_by: name.clone(),
          });
        }
      }
    }

    prune_denied(store, selection, &mut members);
    if members.is_empty() {
      return Err(GraphError::EmptySelection);
    }

    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();
    for name in &members {
      let idx = graph.add_node(name.clone());
      nodes.insert(name.clone(), idx);
    }
    for name in &members {
      let Some(recipe) = store.get(name) else {
        continue;
      };
      let to = nodes[name];
      for dep in &recipe.requirements.run {
        if let Some(&from) = nodes.get(dep) {
          graph.update_edge(from, to, EdgeKind::Run);
        }
      }
      for dep in &recipe.requirements.host {
        if let Some(&from) = nodes.get(dep) {
          // A run-edge already orders the pair and marks it runtime-reachable.
          if graph.find_edge(from, to).is_none() {
            graph.update_edge(from, to, EdgeKind::Host);
          }
        }
      }
    }

    if let Some(members) = find_cycle(&graph, |kind| kind == EdgeKind::Run) {
      return Err(GraphError::RunCycle { members });
    }
    let sorted = match toposort(&graph, None) {
      Ok(sorted) => sorted,
      Err(_) => {
        let members = find_cycle(&graph, |_| true).unwrap_or_default();
        return Err(GraphError::HostCycle { members });
      }
    };
    let order: Vec<String> = sorted.into_iter().map(|i| graph[i].clone()).collect();

    // Runtime reachability: seeds plus everything below them by run-edge.
    let mut run_closure: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<&str> = seeds
      .iter()
      .map(String::as_str)
      .filter(|s| members.contains(*s))
      .collect();
    while let Some(name) = queue.pop_front() {
      if !run_closure.insert(name.to_string()) {
        continue;
      }
      let Some(recipe) = store.get(name) else {
        continue;
      };
      for dep in &recipe.requirements.run {
        queue.push_back(dep);
      }
    }

    debug!(
      recipes = members.len(),
      runtime = run_closure.len(),
      tools = host_tools.len(),
      "resolved dependency graph"
    );
    Ok(DependencyGraph {
      graph,
      nodes,
      order,
      run_closure,
      host_tools,
    })
  }

  pub fn len(&self) -> usize {
    self.graph.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.graph.node_count() == 0
  }

  pub fn contains(&self, name: &str) -> bool {
    self.nodes.contains_key(name)
  }

  /// Topological order; every dependency precedes its dependents.
  pub fn build_order(&self) -> &[String] {
    &self.order
  }

  pub fn members(&self) -> impl Iterator<Item = &str> {
    self.order.iter().map(String::as_str)
  }

  /// Whether the recipe's artifact is part of the runtime install set, as
  /// opposed to being built only as a host tool.
  pub fn in_run_closure(&self, name: &str) -> bool {
    self.run_closure.contains(name)
  }

  /// In-graph dependencies of `name`, both edge kinds.
  pub fn dependencies(&self, name: &str) -> Vec<&str> {
    self.neighbors(name, Direction::Incoming)
  }

  /// Direct dependents of `name`, both edge kinds.
  pub fn dependents(&self, name: &str) -> Vec<&str> {
    self.neighbors(name, Direction::Outgoing)
  }

  /// Direct run-edge dependents only.
  pub fn run_dependents(&self, name: &str) -> Vec<&str> {
    let Some(&idx) = self.nodes.get(name) else {
      return Vec::new();
    };
    self
      .graph
      .edges_directed(idx, Direction::Outgoing)
      .filter(|e| *e.weight() == EdgeKind::Run)
      .map(|e| self.graph[e.target()].as_str())
      .collect()
  }

  /// External host tools the build set needs, resolved to absolute paths.
  pub fn host_tools(&self) -> &BTreeMap<String, PathBuf> {
    &self.host_tools
  }

  fn neighbors(&self, name: &str, dir: Direction) -> Vec<&str> {
    let Some(&idx) = self.nodes.get(name) else {
      return Vec::new();
    };
    self
      .graph
      .neighbors_directed(idx, dir)
      .map(|i| self.graph[i].as_str())
      .collect()
  }
}

/// Removes denied recipes and, transitively, every member that can no longer
/// build because a pruned dependency was its requirement.
fn prune_denied(
  store: &RecipeStore,
  selection: &TargetSelection,
  members: &mut BTreeSet<String>,
) {
  let mut pruned: BTreeSet<String> = members
    .iter()
    .filter(|n| selection.is_denied(n))
    .cloned()
    .collect();
  if pruned.is_empty() {
    return;
  }
  loop {
    let mut next: Vec<String> = Vec::new();
    for name in members.iter() {
      if pruned.contains(name) {
        continue;
      }
      let Some(recipe) = store.get(name) else {
        continue;
      };
      let blocked = recipe
        .requirements
        .run
        .iter()
        .chain(recipe.requirements.host.iter())
        .any(|dep| pruned.contains(dep));
      if blocked {
        next.push(name.clone());
      }
    }
    if next.is_empty() {
      break;
    }
    for name in next {
      warn!(recipe = %name, "excluded: depends on a denied recipe");
      pruned.insert(name);
    }
  }
  for name in &pruned {
    members.remove(name);
  }
}

/// DFS cycle search over edges matching `keep`; returns the cycle's node
/// names in traversal order.
fn find_cycle<F>(graph: &DiGraph<String, EdgeKind>, keep: F) -> Option<Vec<String>>
where
  F: Fn(EdgeKind) -> bool,
{
  #[derive(Clone, Copy, PartialEq)]
  enum Mark {
    White,
    Gray,
    Black,
  }
  let mut marks = vec![Mark::White; graph.node_count()];
  let mut stack: Vec<NodeIndex> = Vec::new();

  fn visit<F: Fn(EdgeKind) -> bool>(
    graph: &DiGraph<String, EdgeKind>,
    node: NodeIndex,
    keep: &F,
    marks: &mut [Mark],
    stack: &mut Vec<NodeIndex>,
  ) -> Option<Vec<String>> {
    marks[node.index()] = Mark::Gray;
    stack.push(node);
    for edge in graph.edges_directed(node, Direction::Outgoing) {
      if !keep(*edge.weight()) {
        continue;
      }
      let next = edge.target();
      match marks[next.index()] {
        Mark::Gray => {
          let start = stack.iter().position(|&n| n == next).unwrap_or(0);
          return Some(stack[start..].iter().map(|&n| graph[n].clone()).collect());
        }
        Mark::White => {
          if let Some(cycle) = visit(graph, next, keep, marks, stack) {
            return Some(cycle);
          }
        }
        Mark::Black => {}
      }
    }
    stack.pop();
    marks[node.index()] = Mark::Black;
    None
  }

  for node in graph.node_indices() {
    if marks[node.index()] == Mark::White {
      if let Some(cycle) = visit(graph, node, &keep, &mut marks, &mut stack) {
        return Some(cycle);
      }
    }
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::recipe::RECIPE_FILE;

  fn recipe(name: &str, kind: &str, run: &[&str], host: &[&str]) -> String {
    format!(
      r#"
package:
  name: {name}
  version: "1.0"
build:
  type: {kind}
requirements:
  run: [{}]
  host: [{}]
"#,
      run.join(", "),
      host.join(", ")
    )
  }

  fn store_with(recipes: &[(&str, String)]) -> (tempfile::TempDir, RecipeStore) {
    let tmp = tempfile::tempdir().unwrap();
    for (name, body) in recipes {
      let dir = tmp.path().join(name);
      std::fs::create_dir_all(&dir).unwrap();
      std::fs::write(dir.join(RECIPE_FILE), body).unwrap();
    }
    let store = RecipeStore::load(tmp.path()).unwrap();
    (tmp, store)
  }

  fn resolve_all(store: &RecipeStore) -> DependencyGraph {
    DependencyGraph::resolve(store, &TargetSelection::parse("*").unwrap()).unwrap()
  }

  fn assert_before(order: &[String], first: &str, second: &str) {
    let a = order.iter().position(|n| n == first).unwrap();
    let b = order.iter().position(|n| n == second).unwrap();
    assert!(a < b, "{first} should come before {second} in {order:?}");
  }

  #[test]
  fn build_order_respects_dependencies() {
    let (_tmp, store) = store_with(&[
      ("core", recipe("core", "shared_library", &[], &[])),
      ("mid", recipe("mid", "shared_package", &["core"], &[])),
      ("app", recipe("app", "cpython_module", &["mid", "core"], &[])),
    ]);
    let graph = resolve_all(&store);
    assert_eq!(graph.len(), 3);
    let order = graph.build_order();
    assert_before(order, "core", "mid");
    assert_before(order, "mid", "app");
  }

  #[test]
  fn selection_pulls_transitive_closure() {
    let (_tmp, store) = store_with(&[
      ("core", recipe("core", "shared_library", &[], &[])),
      ("app", recipe("app", "cpython_module", &["core"], &[])),
      ("other", recipe("other", "cpython_module", &[], &[])),
    ]);
    let graph =
      DependencyGraph::resolve(&store, &TargetSelection::parse("app").unwrap()).unwrap();
    assert!(graph.contains("core"));
    assert!(graph.contains("app"));
    assert!(!graph.contains("other"));
  }

  #[test]
  fn host_recipe_is_built_but_not_runtime() {
    let (_tmp, store) = store_with(&[
      ("tool", recipe("tool", "interpreter_package", &[], &[])),
      ("app", recipe("app", "cpython_module", &[], &["tool"])),
    ]);
    let graph =
      DependencyGraph::resolve(&store, &TargetSelection::parse("app").unwrap()).unwrap();
    assert!(graph.contains("tool"));
    assert!(!graph.in_run_closure("tool"));
    assert!(graph.in_run_closure("app"));
    assert_before(graph.build_order(), "tool", "app");
  }

  #[test]
  fn run_cycle_is_fatal_and_names_members() {
    let (_tmp, store) = store_with(&[
      ("a", recipe("a", "shared_library", &["b"], &[])),
      ("b", recipe("b", "shared_library", &["c"], &[])),
      ("c", recipe("c", "shared_library", &["a"], &[])),
    ]);
    let err = DependencyGraph::resolve(&store, &TargetSelection::parse("*").unwrap())
      .unwrap_err();
    match err {
      GraphError::RunCycle { members } => {
        assert_eq!(members.len(), 3);
        for name in ["a", "b", "c"] {
          assert!(members.contains(&name.to_string()), "{name} in {members:?}");
        }
      }
      other => panic!("expected RunCycle, got {other:?}"),
    }
  }

  #[test]
  fn host_edges_may_not_close_a_cycle() {
    let (_tmp, store) = store_with(&[
      ("a", recipe("a", "shared_library", &["b"], &[])),
      ("b", recipe("b", "shared_library", &[], &["a"])),
    ]);
    let err = DependencyGraph::resolve(&store, &TargetSelection::parse("*").unwrap())
      .unwrap_err();
    assert!(matches!(err, GraphError::HostCycle { .. }));
  }

  #[test]
  fn static_library_rejected_as_run_dependency() {
    let (_tmp, store) = store_with(&[
      ("lib", recipe("lib", "static_library", &[], &[])),
      ("app", recipe("app", "cpython_module", &["lib"], &[])),
    ]);
    let err = DependencyGraph::resolve(&store, &TargetSelection::parse("*").unwrap())
      .unwrap_err();
    assert!(matches!(err, GraphError::StaticRunDependency { .. }));
  }

  #[test]
  fn static_library_allowed_as_host_dependency() {
    let (_tmp, store) = store_with(&[
      ("lib", recipe("lib", "static_library", &[], &[])),
      ("app", recipe("app", "cpython_module", &[], &["lib"])),
    ]);
    let graph = resolve_all(&store);
    assert!(graph.contains("lib"));
    assert_before(graph.build_order(), "lib", "app");
  }

  #[test]
  fn unknown_dependency_names_the_dependent() {
    let (_tmp, store) = store_with(&[(
      "app",
      recipe("app", "cpython_module", &["ghost"], &[]),
    )]);
    let err = DependencyGraph::resolve(&store, &TargetSelection::parse("*").unwrap())
      .unwrap_err();
    match err {
      GraphError::UnknownDependency { name, required_by } => {
        assert_eq!(name, "ghost");
        assert_eq!(required_by, "app");
      }
      other => panic!("expected UnknownDependency, got {other:?}"),
    }
  }

  #[test]
  fn unknown_target_is_an_error() {
    let (_tmp, store) = store_with(&[(
      "app",
      recipe("app", "cpython_module", &[], &[]),
    )]);
    let err =
      DependencyGraph::resolve(&store, &TargetSelection::parse("ghost").unwrap())
        .unwrap_err();
    assert!(matches!(err, GraphError::UnknownTarget { .. }));
  }

  #[test]
  fn denied_recipe_prunes_its_dependents() {
    let (_tmp, store) = store_with(&[
      ("core", recipe("core", "shared_library", &[], &[])),
      ("app", recipe("app", "cpython_module", &["core"], &[])),
      ("solo", recipe("solo", "cpython_module", &[], &[])),
    ]);
    let graph = DependencyGraph::resolve(
      &store,
      &TargetSelection::parse("*, !core").unwrap(),
    )
    .unwrap();
    assert!(!graph.contains("core"));
    assert!(!graph.contains("app"));
    assert!(graph.contains("solo"));
  }

  #[test]
  fn missing_host_tool_is_an_error() {
    let (_tmp, store) = store_with(&[(
      "app",
      recipe(
        "app",
        "cpython_module",
        &[],
        &["no-such-tool-anywhere-zz"],
      ),
    )]);
    let err = DependencyGraph::resolve(&store, &TargetSelection::parse("*").unwrap())
      .unwrap_err();
    assert!(matches!(err, GraphError::MissingHostTool { .. }));
  }

  #[test]
  fn external_host_tools_resolve_to_paths() {
    let (_tmp, store) = store_with(&[(
      "app",
      recipe("app", "cpython_module", &[], &["sh"]),
    )]);
    let graph = resolve_all(&store);
    let path = graph.host_tools().get("sh").unwrap();
    assert!(path.is_absolute());
  }

  #[test]
  fn run_dependents_ignore_host_edges() {
    let (_tmp, store) = store_with(&[
      ("core", recipe("core", "shared_library", &[], &[])),
      ("user", recipe("user", "cpython_module", &["core"], &[])),
      ("tool", recipe("tool", "cpython_module", &[], &["core"])),
    ]);
    let graph = resolve_all(&store);
    let deps = graph.run_dependents("core");
    assert_eq!(deps, vec!["user"]);
    let mut all = graph.dependents("core");
    all.sort();
    assert_eq!(all, vec!["tool", "user"]);
  }

  fn _assert_send_sync<T: Send + Sync>() {}

  #[test]
  fn graph_is_send_and_sync() {
    _assert_send_sync::<DependencyGraph>();
  }
}
