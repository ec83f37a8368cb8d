use serde::{Deserialize, Serialize};

/// Permission set a [`Principal`] carries, ordered weakest-to-strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
  ReadOnly,
  ReadWrite,
  Admin,
}

impl Permission {
  pub fn satisfies(self, required: Permission) -> bool {
    self >= required
  }
}

/// An authenticated caller identity, resolved upstream from a client
/// certificate's common-name or an API key. The dispatch subsystem never
/// performs authentication itself; it only consumes the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
  pub username: String,
  pub permission: Permission,
  /// Present when the caller authenticated via API key; used to key the
  /// rate-limit bucket. `None` for callers that bypass rate limiting
  /// (e.g. trusted internal front-ends).
  pub api_key_id: Option<String>,
}

impl Principal {
  pub fn require(&self, required: Permission) -> Result<(), crate::error::Error> {
    if self.permission.satisfies(required) {
      Ok(())
    } else {
      Err(crate::error::Error::Unauthorized(format!(
        "{} requires {required:?}, {} has {:?}",
        "operation", self.username, self.permission
      )))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn permission_ordering() {
    assert!(Permission::Admin.satisfies(Permission::ReadWrite));
    assert!(Permission::ReadWrite.satisfies(Permission::ReadOnly));
    assert!(!Permission::ReadOnly.satisfies(Permission::ReadWrite));
  }

  #[test]
  fn require_rejects_insufficient_permission() {
    let p = Principal {
      username: "alice".into(),
      permission: Permission::ReadOnly,
      api_key_id: None,
    };
    assert!(p.require(Permission::ReadWrite).is_err());
    assert!(p.require(Permission::ReadOnly).is_ok());
  }
}
