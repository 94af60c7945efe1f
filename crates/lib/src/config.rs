//! Cross-compilation configuration.
//!
//! Settings layer in a fixed order: built-in defaults, then an optional
//! `wasmforge.yaml`, then `WASMFORGE_*` environment variables. Tool names
//! and paths are overridden outright; flag strings from the environment are
//! appended so a file-level baseline survives.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CONFIG_FILE: &str = "wasmforge.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config {path}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("failed to parse config {path}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CrossConfig {
  pub target_triple: String,
  /// ABI tag recorded in lockfiles and the target description.
  pub abi_version: String,
  pub cc: String,
  pub cxx: String,
  pub ar: String,
  pub ranlib: String,
  pub strip: String,
  /// Symbol lister used to compute export lists for side modules.
  pub nm: String,
  pub cflags: String,
  pub cxxflags: String,
  pub ldflags: String,
  /// Root of the target sysroot, exported to build scripts.
  pub sysroot: Option<PathBuf>,
  /// Prefix where target libraries and headers accumulate; host include
  /// paths under it are left alone by the wrapper.
  pub target_install_dir: Option<PathBuf>,
  /// Target interpreter headers, substituted for host interpreter headers.
  pub python_include: Option<PathBuf>,
}

impl Default for CrossConfig {
  fn default() -> Self {
    CrossConfig {
      target_triple: "wasm32-unknown-emscripten".into(),
      abi_version: "2026_0".into(),
      cc: "emcc".into(),
      cxx: "em++".into(),
      ar: "emar".into(),
      ranlib: "emranlib".into(),
      strip: "emstrip".into(),
      nm: "emnm".into(),
      cflags: String::new(),
      cxxflags: String::new(),
      ldflags: String::new(),
      sysroot: None,
      target_install_dir: None,
      python_include: None,
    }
  }
}

impl CrossConfig {
  /// Loads the layered configuration. `file` falls back to `wasmforge.yaml`
  /// in the current directory when unset; a missing default file is fine,
  /// an explicitly named missing file is not.
  pub fn resolve(file: Option<&Path>) -> Result<Self, ConfigError> {
    let mut config = match file {
      Some(path) => Self::from_file(path)?,
      None => {
        let default = Path::new(CONFIG_FILE);
        if default.is_file() {
          Self::from_file(default)?
        } else {
          CrossConfig::default()
        }
      }
    };
    config.apply_env();
    debug!(target = %config.target_triple, cc = %config.cc, "resolved cross config");
    Ok(config)
  }

  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.into(),
      source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
      path: path.into(),
      source,
    })
  }

  fn apply_env(&mut self) {
    for (var, slot) in [
      ("WASMFORGE_CC", &mut self.cc),
      ("WASMFORGE_CXX", &mut self.cxx),
      ("WASMFORGE_AR", &mut self.ar),
      ("WASMFORGE_RANLIB", &mut self.ranlib),
      ("WASMFORGE_STRIP", &mut self.strip),
      ("WASMFORGE_NM", &mut self.nm),
      ("WASMFORGE_TARGET", &mut self.target_triple),
    ] {
      if let Ok(value) = std::env::var(var) {
        *slot = value;
      }
    }
    for (var, slot) in [
      ("WASMFORGE_CFLAGS", &mut self.cflags),
      ("WASMFORGE_CXXFLAGS", &mut self.cxxflags),
      ("WASMFORGE_LDFLAGS", &mut self.ldflags),
    ] {
      if let Ok(value) = std::env::var(var) {
        if slot.is_empty() {
          *slot = value;
        } else {
          slot.push(' ');
          slot.push_str(&value);
        }
      }
    }
    for (var, slot) in [
      ("WASMFORGE_SYSROOT", &mut self.sysroot),
      ("WASMFORGE_TARGET_INSTALL_DIR", &mut self.target_install_dir),
      ("WASMFORGE_PYTHON_INCLUDE", &mut self.python_include),
    ] {
      if let Ok(value) = std::env::var(var) {
        *slot = Some(PathBuf::from(value));
      }
    }
  }

  /// Machine-readable summary written next to each build for tooling that
  /// wants to know what the scripts were targeting.
  pub fn target_description(&self) -> serde_json::Value {
    serde_json::json!({
      "triple": self.target_triple,
      "abi": self.abi_version,
      "cc": self.cc,
      "cxx": self.cxx,
      "ar": self.ar,
    })
  }

  pub fn write_target_file(&self, path: &Path) -> std::io::Result<()> {
    let text = serde_json::to_string_pretty(&self.target_description())?;
    std::fs::write(path, text)
  }
}
