//! Loading a directory of recipes.
//!
//! Layout is one subdirectory per package, each holding a `meta.yaml`:
//!
//! ```text
//! recipes/
//!   zlib/meta.yaml
//!   numpy/meta.yaml
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::recipe::Recipe;

pub const RECIPE_FILE: &str = "meta.yaml";

#[derive(Debug, Error)]
pub enum RecipeError {
  #[error("recipe directory {path} not found")]
  MissingRoot { path: PathBuf },
  #[error("failed to read {path}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("failed to parse {path}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },
  #[error("recipe {path} declares name {declared:?} but lives in directory {dir:?}")]
  NameMismatch {
    path: PathBuf,
    declared: String,
    dir: String,
  },
  #[error("recipe {name} has a url source without a sha256 checksum")]
  MissingChecksum { name: String },
  #[error("recipe {name} declares both url and path sources")]
  AmbiguousSource { name: String },
}

#[derive(Debug, Clone)]
pub struct RecipeStore {
  root: PathBuf,
  recipes: BTreeMap<String, Recipe>,
}

impl RecipeStore {
  /// Loads every `meta.yaml` under `root`. Subdirectories without one are
  /// ignored; malformed recipes are errors.
  pub fn load(root: &Path) -> Result<Self, RecipeError> {
    if !root.is_dir() {
      return Err(RecipeError::MissingRoot { path: root.into() });
    }
    let mut recipes = BTreeMap::new();
    let entries = std::fs::read_dir(root).map_err(|source| RecipeError::Io {
      path: root.into(),
      source,
    })?;
    for entry in entries {
      let entry = entry.map_err(|source| RecipeError::Io {
        path: root.into(),
        source,
      })?;
      let meta = entry.path().join(RECIPE_FILE);
      if !meta.is_file() {
        continue;
      }
      let recipe = Self::load_one(&meta)?;
      let dir = entry.file_name().to_string_lossy().to_lowercase();
      if recipe.name() != dir {
        return Err(RecipeError::NameMismatch {
          path: meta,
          declared: recipe.name().into(),
          dir,
        });
      }
      recipes.insert(recipe.name().to_string(), recipe);
    }
    debug!(root = %root.display(), count = recipes.len(), "loaded recipes");
    Ok(RecipeStore {
      root: root.into(),
      recipes,
    })
  }

  fn load_one(path: &Path) -> Result<Recipe, RecipeError> {
    let text = std::fs::read_to_string(path).map_err(|source| RecipeError::Io {
      path: path.into(),
      source,
    })?;
    let mut recipe: Recipe =
      serde_yaml::from_str(&text).map_err(|source| RecipeError::Parse {
        path: path.into(),
        source,
      })?;
    recipe.package.name = recipe.package.name.to_lowercase();
    recipe.requirements.run = lowercase(&recipe.requirements.run);
    recipe.requirements.host = lowercase(&recipe.requirements.host);
    if recipe.source.url.is_some() && recipe.source.path.is_some() {
      return Err(RecipeError::AmbiguousSource {
        name: recipe.name().into(),
      });
    }
    if recipe.source.url.is_some() && recipe.source.sha256.is_none() {
      return Err(RecipeError::MissingChecksum {
        name: recipe.name().into(),
      });
    }
    Ok(recipe)
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn get(&self, name: &str) -> Option<&Recipe> {
    self.recipes.get(name)
  }

  pub fn contains(&self, name: &str) -> bool {
    self.recipes.contains_key(name)
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.recipes.keys().map(String::as_str)
  }

  pub fn recipes(&self) -> impl Iterator<Item = &Recipe> {
    self.recipes.values()
  }

  pub fn len(&self) -> usize {
    self.recipes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.recipes.is_empty()
  }

  /// Directory the recipe was loaded from; source `path` entries and patch
  /// files are relative to this.
  pub fn recipe_dir(&self, name: &str) -> PathBuf {
    self.root.join(name)
  }
}

fn lowercase(names: &[String]) -> Vec<String> {
  names.iter().map(|n| n.to_lowercase()).collect()
}

/// Searches `PATH` for an executable, the way a shell would.
pub fn resolve_host_tool(name: &str) -> Option<PathBuf> {
  let path = std::env::var_os("PATH")?;
  for dir in std::env::split_paths(&path) {
    let candidate = dir.join(name);
    if is_executable(&candidate) {
      return Some(candidate);
    }
  }
  None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
  use std::os::unix::fs::PermissionsExt;
  path
    .metadata()
    .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
    .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
  path.is_file()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn write_recipe(root: &Path, name: &str, body: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(RECIPE_FILE), body).unwrap();
  }

  #[test]
  fn loads_recipes_and_normalizes_names() {
    let tmp = tempfile::tempdir().unwrap();
    write_recipe(
      tmp.path(),
      "zlib",
      r#"
package:
  name: ZLib
  version: "1.3.1"
source:
  url: https://example.invalid/z.tar.gz
  sha256: aa
build:
  type: static_library
requirements:
  run: [OpenSSL]
"#,
    );
    write_recipe(
      tmp.path(),
      "openssl",
      r#"
package:
  name: openssl
  version: "3.0"
build:
  type: static_library
"#,
    );
    let store = RecipeStore::load(tmp.path()).unwrap();
    assert_eq!(store.len(), 2);
    let zlib = store.get("zlib").unwrap();
    assert_eq!(zlib.requirements.run, vec!["openssl"]);
  }

  #[test]
  fn skips_directories_without_meta() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir(tmp.path().join("notes")).unwrap();
    let store = RecipeStore::load(tmp.path()).unwrap();
    assert!(store.is_empty());
  }

  #[test]
  fn url_source_requires_checksum() {
    let tmp = tempfile::tempdir().unwrap();
    write_recipe(
      tmp.path(),
      "bad",
      r#"
package:
  name: bad
  version: "1"
source:
  url: https://example.invalid/bad.tar.gz
build:
  type: shared_library
"#,
    );
    assert!(matches!(
      RecipeStore::load(tmp.path()),
      Err(RecipeError::MissingChecksum { .. })
    ));
  }

  #[test]
  fn directory_name_must_match_package_name() {
    let tmp = tempfile::tempdir().unwrap();
    write_recipe(
      tmp.path(),
      "alpha",
      r#"
package:
  name: beta
  version: "1"
build:
  type: shared_library
"#,
    );
    assert!(matches!(
      RecipeStore::load(tmp.path()),
      Err(RecipeError::NameMismatch { .. })
    ));
  }

  #[test]
  fn resolves_tools_on_path() {
    assert!(resolve_host_tool("sh").is_some());
    assert!(resolve_host_tool("definitely-not-a-real-tool-xyz").is_none());
  }
}
