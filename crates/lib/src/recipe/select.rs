//! Target selection queries.
//!
//! A query is a comma- or whitespace-separated list of recipe names. `*`
//! selects every recipe, and a `!` prefix denies a name. Deny always wins,
//! whatever order the terms appear in.

use std::collections::BTreeSet;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SelectError {
  #[error("empty target query")]
  Empty,
  #[error("malformed target pattern {pattern:?}")]
  MalformedPattern { pattern: String },
}

#[derive(Debug, Clone, Default)]
pub struct TargetSelection {
  all: bool,
  requested: BTreeSet<String>,
  denied: BTreeSet<String>,
}

impl TargetSelection {
  pub fn parse(query: &str) -> Result<Self, SelectError> {
    let mut selection = TargetSelection::default();
    let terms: Vec<&str> = query
      .split(|c: char| c == ',' || c.is_whitespace())
      .filter(|t| !t.is_empty())
      .collect();
    if terms.is_empty() {
      return Err(SelectError::Empty);
    }
    for term in terms {
      match term {
        "*" => selection.all = true,
        t if t.starts_with('!') => {
          let name = &t[1..];
          if name.is_empty() || name.contains('!') || name == "*" {
            return Err(SelectError::MalformedPattern { pattern: t.into() });
          }
          selection.denied.insert(name.to_lowercase());
        }
        t => {
          if t.contains('!') {
            return Err(SelectError::MalformedPattern { pattern: t.into() });
          }
          selection.requested.insert(t.to_lowercase());
        }
      }
    }
    Ok(selection)
  }

  /// Whether `name` should seed the build closure.
  pub fn matches(&self, name: &str) -> bool {
    if self.denied.contains(name) {
      return false;
    }
    self.all || self.requested.contains(name)
  }

  pub fn is_denied(&self, name: &str) -> bool {
    self.denied.contains(name)
  }

  pub fn selects_all(&self) -> bool {
    self.all
  }

  /// Names the query asked for explicitly (not via `*`).
  pub fn requested(&self) -> impl Iterator<Item = &str> {
    self.requested.iter().map(String::as_str)
  }
}
