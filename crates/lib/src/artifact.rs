//! Artifact store: where finished builds land and how we know a recipe is
//! already satisfied.
//!
//! Each built recipe gets a directory under the store root holding its dist
//! files plus an `artifact.json` marker with name, version, kind, ABI tag,
//! and per-file checksums. A marker that matches the recipe means the build
//! can be skipped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::CrossConfig;
use crate::recipe::{Kind, Recipe};

pub const ARTIFACT_MARKER: &str = "artifact.json";
/// Overrides the artifact store location.
pub const STORE_ENV_VAR: &str = "WASMFORGE_STORE";

#[derive(Debug, Error)]
pub enum ArtifactError {
  #[error("io error at {path}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("corrupt artifact marker {path}")]
  Corrupt {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
  #[error("no artifact recorded for {name}")]
  NotBuilt { name: String },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArtifactError + '_ {
  move |source| ArtifactError::Io {
    path: path.into(),
    source,
  }
}

/// Marker describing one stored build output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
  pub name: String,
  pub version: String,
  pub kind: Kind,
  pub abi: String,
  /// Store-relative file names with their checksums. Empty for kinds with
  /// no dist output.
  pub files: BTreeMap<String, String>,
  /// Run dependencies at build time, for the lockfile.
  pub depends: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
  root: PathBuf,
}

impl ArtifactStore {
  pub fn at(root: impl Into<PathBuf>) -> Self {
    ArtifactStore { root: root.into() }
  }

  /// Default store location: `WASMFORGE_STORE` if set, otherwise
  /// `artifacts/` next to the build tree.
  pub fn resolve_root(build_dir: &Path) -> PathBuf {
    match std::env::var_os(STORE_ENV_VAR) {
      Some(root) => PathBuf::from(root),
      None => build_dir.join("artifacts"),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn entry_dir(&self, name: &str) -> PathBuf {
    self.root.join(name)
  }

  pub fn get(&self, name: &str) -> Result<Option<ArtifactRecord>, ArtifactError> {
    let marker = self.entry_dir(name).join(ARTIFACT_MARKER);
    if !marker.is_file() {
      return Ok(None);
    }
    let text = std::fs::read_to_string(&marker).map_err(io_err(&marker))?;
    let record = serde_json::from_str(&text).map_err(|source| ArtifactError::Corrupt {
      path: marker,
      source,
    })?;
    Ok(Some(record))
  }

  /// Whether the store already holds this recipe at this version, kind, and
  /// ABI. A marker for anything else means stale and does not count.
  pub fn is_built(&self, recipe: &Recipe, abi: &str) -> bool {
    match self.get(recipe.name()) {
      Ok(Some(record)) => {
        record.version == recipe.version()
          && record.kind == recipe.kind()
          && record.abi == abi
      }
      Ok(None) => false,
      Err(_) => false,
    }
  }

  /// Records a finished build, replacing any previous entry. Dist files are
  /// copied in from `dist_dir` when the kind produces them.
  pub fn put(
    &self,
    recipe: &Recipe,
    abi: &str,
    dist_dir: &Path,
  ) -> Result<ArtifactRecord, ArtifactError> {
    let entry = self.entry_dir(recipe.name());
    if entry.exists() {
      std::fs::remove_dir_all(&entry).map_err(io_err(&entry))?;
    }
    std::fs::create_dir_all(&entry).map_err(io_err(&entry))?;

    let mut files = BTreeMap::new();
    if recipe.kind().has_dist_artifact() && dist_dir.is_dir() {
      for dir_entry in walkdir::WalkDir::new(dist_dir) {
        let dir_entry = dir_entry.map_err(|e| ArtifactError::Io {
          path: dist_dir.into(),
          source: e.into(),
        })?;
        if !dir_entry.file_type().is_file() {
          continue;
        }
        let Ok(rel) = dir_entry.path().strip_prefix(dist_dir) else {
          continue;
        };
        let rel = rel.to_string_lossy().to_string();
        let target = entry.join(&rel);
        if let Some(parent) = target.parent() {
          std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        std::fs::copy(dir_entry.path(), &target).map_err(io_err(&target))?;
        files.insert(rel, sha256_file(&target)?);
      }
    }

    let record = ArtifactRecord {
      name: recipe.name().into(),
      version: recipe.version().into(),
      kind: recipe.kind(),
      abi: abi.into(),
      files,
      depends: recipe.requirements.run.clone(),
    };
    let marker = entry.join(ARTIFACT_MARKER);
    let text = serde_json::to_string_pretty(&record).map_err(|source| {
      ArtifactError::Corrupt {
        path: marker.clone(),
        source,
      }
    })?;
    std::fs::write(&marker, text).map_err(io_err(&marker))?;
    debug!(recipe = recipe.name(), files = record.files.len(), "stored artifact");
    Ok(record)
  }

  /// Copies a stored artifact's files into `dest/<kind install dir>/`.
  pub fn install(&self, name: &str, dest: &Path) -> Result<Vec<PathBuf>, ArtifactError> {
    let record = self
      .get(name)?
      .ok_or_else(|| ArtifactError::NotBuilt { name: name.into() })?;
    let entry = self.entry_dir(name);
    let target_root = dest.join(record.kind.install_dir());
    let mut installed = Vec::new();
    for rel in record.files.keys() {
      let target = target_root.join(rel);
      if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
      }
      let src = entry.join(rel);
      std::fs::copy(&src, &target).map_err(io_err(&target))?;
      installed.push(target);
    }
    info!(name, count = installed.len(), dest = %target_root.display(), "installed");
    Ok(installed)
  }

  /// Writes a lockfile listing every runtime recipe's stored artifact.
  /// Recipes without dist output (static libraries) are omitted.
  pub fn write_lockfile<'a>(
    &self,
    config: &CrossConfig,
    recipes: impl Iterator<Item = &'a Recipe>,
    path: &Path,
  ) -> Result<(), ArtifactError> {
    let mut packages = BTreeMap::new();
    for recipe in recipes {
      if !recipe.kind().has_dist_artifact() {
        continue;
      }
      let record = self
        .get(recipe.name())?
        .ok_or_else(|| ArtifactError::NotBuilt {
          name: recipe.name().into(),
        })?;
      packages.insert(
        record.name.clone(),
        LockEntry {
          version: record.version,
          kind: record.kind,
          install_dir: record.kind.install_dir().into(),
          files: record.files,
          depends: record.depends,
        },
      );
    }
    let lockfile = Lockfile {
      info: LockInfo {
        target: config.target_triple.clone(),
        abi: config.abi_version.clone(),
      },
      packages,
    };
    let text = serde_json::to_string_pretty(&lockfile).map_err(|source| {
      ArtifactError::Corrupt {
        path: path.into(),
        source,
      }
    })?;
    std::fs::write(path, text).map_err(io_err(path))?;
    Ok(())
  }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Lockfile {
  pub info: LockInfo,
  pub packages: BTreeMap<String, LockEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockInfo {
  pub target: String,
  pub abi: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockEntry {
  pub version: String,
  pub kind: Kind,
  pub install_dir: String,
  pub files: BTreeMap<String, String>,
  pub depends: Vec<String>,
}

fn sha256_file(path: &Path) -> Result<String, ArtifactError> {
  let bytes = std::fs::read(path).map_err(io_err(path))?;
  Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  fn sample_recipe(kind: &str) -> Recipe {
    serde_yaml::from_str(&format!(
      r#"
package:
  name: demo
  version: "2.1"
build:
  type: {kind}
requirements:
  run: [zlib]
"#
    ))
    .unwrap()
  }

  fn dist_with(files: &[(&str, &str)]) -> tempfile::TempDir {
    let tmp = tempfile::tempdir().unwrap();
    for (name, contents) in files {
      let path = tmp.path().join(name);
      std::fs::create_dir_all(path.parent().unwrap()).unwrap();
      std::fs::write(path, contents).unwrap();
    }
    tmp
  }

  #[test]
  fn put_then_is_built_round_trip() {
    let store_dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::at(store_dir.path());
    let recipe = sample_recipe("shared_package");
    let dist = dist_with(&[("demo.so", "wasm bytes")]);

    assert!(!store.is_built(&recipe, "2026_0"));
    let record = store.put(&recipe, "2026_0", dist.path()).unwrap();
    assert_eq!(record.files.len(), 1);
    assert!(store.is_built(&recipe, "2026_0"));
    // Different ABI means a rebuild.
    assert!(!store.is_built(&recipe, "2027_0"));
  }

  #[test]
  fn version_change_invalidates_marker() {
    let store_dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::at(store_dir.path());
    let recipe = sample_recipe("shared_package");
    let dist = dist_with(&[("demo.so", "v1")]);
    store.put(&recipe, "2026_0", dist.path()).unwrap();

    let mut newer = recipe.clone();
    newer.package.version = "2.2".into();
    assert!(!store.is_built(&newer, "2026_0"));
  }

  #[test]
  fn static_library_marker_has_no_files() {
    let store_dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::at(store_dir.path());
    let recipe = sample_recipe("static_library");
    let dist = dist_with(&[("ignored.a", "archive")]);
    let record = store.put(&recipe, "2026_0", dist.path()).unwrap();
    assert!(record.files.is_empty());
    assert!(store.is_built(&recipe, "2026_0"));
  }

  #[test]
  fn install_copies_into_kind_directory() {
    let store_dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::at(store_dir.path());
    let recipe = sample_recipe("cpython_module");
    let dist = dist_with(&[("demo.so", "bytes"), ("data/table.bin", "t")]);
    store.put(&recipe, "2026_0", dist.path()).unwrap();

    let dest = tempfile::tempdir().unwrap();
    let installed = store.install("demo", dest.path()).unwrap();
    assert_eq!(installed.len(), 2);
    assert!(dest.path().join("site/demo.so").is_file());
    assert!(dest.path().join("site/data/table.bin").is_file());
  }

  #[test]
  fn lockfile_lists_runtime_artifacts() {
    let store_dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::at(store_dir.path());
    let recipe = sample_recipe("shared_package");
    let dist = dist_with(&[("demo.so", "bytes")]);
    store.put(&recipe, "2026_0", dist.path()).unwrap();

    let config = CrossConfig::default();
    let path = store_dir.path().join("lock.json");
    store
      .write_lockfile(&config, [&recipe].into_iter(), &path)
      .unwrap();
    let lockfile: Lockfile =
      serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(lockfile.info.target, "wasm32-unknown-emscripten");
    let entry = lockfile.packages.get("demo").unwrap();
    assert_eq!(entry.version, "2.1");
    assert_eq!(entry.depends, vec!["zlib"]);
    assert_eq!(entry.install_dir, "site");
  }

  #[test]
  #[serial]
  fn store_root_env_override() {
    temp_env::with_var(STORE_ENV_VAR, Some("/custom/store"), || {
      let root = ArtifactStore::resolve_root(Path::new("/build"));
      assert_eq!(root, PathBuf::from("/custom/store"));
    });
    temp_env::with_var(STORE_ENV_VAR, None::<&str>, || {
      let root = ArtifactStore::resolve_root(Path::new("/build"));
      assert_eq!(root, PathBuf::from("/build/artifacts"));
    });
  }
}
