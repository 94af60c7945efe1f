//! Append-only invocation log.
//!
//! Every wrapper invocation for a recipe appends one JSON line to
//! `invocations.jsonl` in the recipe's work directory. The log is what
//! failure diagnostics and no-isolation replays read back.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const INVOCATION_LOG: &str = "invocations.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
  Compile,
  Link,
  Archive,
  Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
  /// Original command line as the build system issued it, tool name first.
  pub argv: Vec<String>,
  pub classification: Classification,
  /// Command actually executed after rewriting.
  pub rewritten: Vec<String>,
  /// `None` when the process died to a signal.
  pub exit_code: Option<i32>,
}

impl InvocationRecord {
  pub fn succeeded(&self) -> bool {
    self.exit_code == Some(0)
  }
}

#[derive(Debug, Clone)]
pub struct InvocationLog {
  path: PathBuf,
}

impl InvocationLog {
  pub fn at(path: impl Into<PathBuf>) -> Self {
    InvocationLog { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn append(&self, record: &InvocationRecord) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.path)?;
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    file.write_all(line.as_bytes())
  }

  /// Reads every record; an absent log is just empty.
  pub fn load(&self) -> std::io::Result<Vec<InvocationRecord>> {
    let file = match std::fs::File::open(&self.path) {
      Ok(file) => file,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(e),
    };
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
      let line = line?;
      if line.trim().is_empty() {
        continue;
      }
      let record = serde_json::from_str(&line)?;
      records.push(record);
    }
    Ok(records)
  }

  pub fn failed(&self) -> std::io::Result<Vec<InvocationRecord>> {
    Ok(self.load()?.into_iter().filter(|r| !r.succeeded()).collect())
  }
}
