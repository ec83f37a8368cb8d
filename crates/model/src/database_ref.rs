use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Error;

static NAME_RE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[A-Za-z0-9 ._-]{1,256}$").expect("valid regex"));

/// SQL identifier allow-list used once a table/column name has cleared
/// `sqlite_master`/`PRAGMA table_info` introspection. Applied before
/// interpolating an identifier into a statement string; every value is
/// still bound as a placeholder.
pub static IDENTIFIER_RE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,63}$").expect("valid regex"));

pub fn validate_identifier(ident: &str) -> Result<(), Error> {
  if IDENTIFIER_RE.is_match(ident) {
    Ok(())
  } else {
    Err(Error::Validation(format!("invalid identifier: {ident:?}")))
  }
}

/// (owner, name) tuple identifying a database, live or snapshot.
///
/// `owner` is case-folded on construction. `name` is validated but the
/// `.sqlite` suffix convention is not enforced, matching upstream
/// behaviour: plenty of existing databases predate the convention.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseRef {
  pub owner: String,
  pub name: String,
}

impl DatabaseRef {
  pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Result<Self, Error> {
    let owner = owner.into().to_lowercase();
    let name = name.into();

    if owner.is_empty() {
      return Err(Error::Validation("owner must not be empty".into()));
    }
    if !NAME_RE.is_match(&name) {
      return Err(Error::Validation(format!(
        "invalid database name: {name:?}"
      )));
    }

    Ok(Self { owner, name })
  }

  /// `true` if `name` follows the `.sqlite` naming convention. Advisory
  /// only: callers must not reject requests on this basis alone.
  pub fn follows_naming_convention(&self) -> bool {
    self.name.ends_with(".sqlite")
  }

  /// Path, relative to a live node's `storage_dir`, at which the live
  /// copy of this database is materialised: `<owner>/<name>/live.sqlite`.
  /// Shared by placement, materialization and the worker so none of them
  /// reformat this layout independently.
  pub fn storage_subpath(&self) -> std::path::PathBuf {
    std::path::Path::new(&self.owner)
      .join(&self.name)
      .join("live.sqlite")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn case_folds_owner() {
    let r = DatabaseRef::new("Alice", "db.sqlite").unwrap();
    assert_eq!(r.owner, "alice");
  }

  #[test]
  fn rejects_bad_name() {
    assert!(DatabaseRef::new("alice", "../etc/passwd").is_err());
    assert!(DatabaseRef::new("alice", "").is_err());
  }

  #[test]
  fn storage_subpath_layout() {
    let r = DatabaseRef::new("alice", "scores.sqlite").unwrap();
    assert_eq!(
      r.storage_subpath(),
      std::path::Path::new("alice/scores.sqlite/live.sqlite")
    );
  }

  #[test]
  fn identifier_validation() {
    assert!(validate_identifier("Candidate_Information").is_ok());
    assert!(validate_identifier("valid.name-1").is_ok());
    assert!(validate_identifier("bad name").is_err());
    assert!(validate_identifier("").is_err());
    assert!(validate_identifier(&"x".repeat(65)).is_err());
  }
}
