//! Recipe schema as deserialized from `meta.yaml`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One package recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
  pub package: PackageSpec,
  #[serde(default)]
  pub source: SourceSpec,
  pub build: BuildSpec,
  #[serde(default)]
  pub requirements: Requirements,
  #[serde(default)]
  pub tags: Vec<String>,
}

impl Recipe {
  pub fn name(&self) -> &str {
    &self.package.name
  }

  pub fn version(&self) -> &str {
    &self.package.version
  }

  pub fn kind(&self) -> Kind {
    self.build.kind
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageSpec {
  pub name: String,
  pub version: String,
}

/// Where the package sources come from. Exactly one of `url` or `path` must
/// be set; `sha256` is required alongside `url`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSpec {
  #[serde(default)]
  pub url: Option<String>,
  #[serde(default)]
  pub sha256: Option<String>,
  /// Name of the top-level directory inside the archive, when it differs
  /// from the single-directory convention.
  #[serde(default)]
  pub extract_dir: Option<String>,
  /// Local source tree, relative to the recipe directory.
  #[serde(default)]
  pub path: Option<PathBuf>,
  /// Patch files relative to the recipe directory. Recorded for provenance;
  /// application happens in the build script.
  #[serde(default)]
  pub patches: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildSpec {
  #[serde(rename = "type")]
  pub kind: Kind,
  /// Shell script run in the unpacked source directory.
  #[serde(default)]
  pub script: Option<String>,
  /// Shell script run after the main script, in the same directory.
  #[serde(default)]
  pub post: Option<String>,
  #[serde(default)]
  pub exports: Exports,
  #[serde(default)]
  pub cflags: String,
  #[serde(default)]
  pub cxxflags: String,
  #[serde(default)]
  pub ldflags: String,
}

/// What a recipe produces, which controls both wrapper flag injection and
/// how the output is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
  /// Archive linked into dependents at build time; no installable output.
  StaticLibrary,
  /// Dynamic library loaded at runtime by other packages.
  SharedLibrary,
  /// Package shipping one or more shared objects but no Python extension.
  SharedPackage,
  /// Python extension module linked against the interpreter ABI.
  CpythonModule,
  /// The interpreter itself, or a package installed into its prefix.
  InterpreterPackage,
}

impl Kind {
  /// Kinds whose compile steps need position-independent code and whose
  /// link steps produce a wasm side module.
  pub fn is_shared_object(self) -> bool {
    matches!(
      self,
      Kind::SharedLibrary | Kind::SharedPackage | Kind::CpythonModule
    )
  }

  /// Kinds that leave installable files in the dist directory.
  pub fn has_dist_artifact(self) -> bool {
    !matches!(self, Kind::StaticLibrary)
  }

  pub fn install_dir(self) -> &'static str {
    match self {
      Kind::StaticLibrary => "lib",
      Kind::SharedLibrary => "dynlib",
      Kind::SharedPackage | Kind::CpythonModule | Kind::InterpreterPackage => "site",
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Kind::StaticLibrary => "static_library",
      Kind::SharedLibrary => "shared_library",
      Kind::SharedPackage => "shared_package",
      Kind::CpythonModule => "cpython_module",
      Kind::InterpreterPackage => "interpreter_package",
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Requirements {
  /// Recipes whose artifacts must be present at runtime. These define the
  /// run-closure and must form a DAG.
  #[serde(default)]
  pub run: Vec<String>,
  /// Tools needed on the build host. A name matching a recipe orders that
  /// recipe before this one; anything else must resolve on `PATH`.
  #[serde(default)]
  pub host: Vec<String>,
  /// Host executables checked for existence before the build starts.
  #[serde(default)]
  pub executable: Vec<String>,
}

/// Which symbols a linked side module exports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Exports {
  Preset(ExportsPreset),
  /// Explicit symbol names, exported as-is.
  Explicit(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportsPreset {
  /// Only `PyInit_*` entry points (the default for extension modules).
  Pyinit,
  /// Symbols marked for export in the objects being linked.
  Requested,
  /// Everything; the side-module flag is omitted and the linker keeps all
  /// symbols.
  WholeArchive,
}

impl Default for Exports {
  fn default() -> Self {
    Exports::Preset(ExportsPreset::Pyinit)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_minimal_recipe() {
    let recipe: Recipe = serde_yaml::from_str(
      r#"
package:
  name: zlib
  version: "1.3.1"
source:
  url: https://example.invalid/zlib-1.3.1.tar.gz
  sha256: abc123
build:
  type: static_library
  script: |
    emconfigure ./configure
    emmake make
"#,
    )
    .unwrap();
    assert_eq!(recipe.name(), "zlib");
    assert_eq!(recipe.kind(), Kind::StaticLibrary);
    assert_eq!(recipe.build.exports, Exports::default());
    assert!(recipe.requirements.run.is_empty());
  }

  #[test]
  fn parses_exports_variants() {
    let spec: BuildSpec = serde_yaml::from_str(
      "type: cpython_module\nexports: whole_archive\n",
    )
    .unwrap();
    assert_eq!(spec.exports, Exports::Preset(ExportsPreset::WholeArchive));

    let spec: BuildSpec = serde_yaml::from_str(
      "type: cpython_module\nexports: [\"foo\", \"bar\"]\n",
    )
    .unwrap();
    assert_eq!(
      spec.exports,
      Exports::Explicit(vec!["foo".into(), "bar".into()])
    );
  }

  #[test]
  fn rejects_unknown_fields() {
    let err = serde_yaml::from_str::<Recipe>(
      r#"
package:
  name: x
  version: "1"
build:
  type: shared_library
bogus: true
"#,
    );
    assert!(err.is_err());
  }

  #[test]
  fn kind_classification() {
    assert!(Kind::CpythonModule.is_shared_object());
    assert!(Kind::SharedLibrary.is_shared_object());
    assert!(!Kind::StaticLibrary.is_shared_object());
    assert!(!Kind::InterpreterPackage.is_shared_object());
    assert!(!Kind::StaticLibrary.has_dist_artifact());
    assert!(Kind::SharedPackage.has_dist_artifact());
  }
}
