//! Recipe model and loading.
//!
//! A recipe is a directory containing a `meta.yaml` describing one package:
//! what to fetch, how to build it, what it depends on, and what kind of
//! output it produces.

mod select;
mod store;
mod types;

pub use select::{SelectError, TargetSelection};
pub use store::{resolve_host_tool, RecipeError, RecipeStore, RECIPE_FILE};
pub use types::{
  BuildSpec, Exports, ExportsPreset, Kind, PackageSpec, Recipe, Requirements, SourceSpec,
};
