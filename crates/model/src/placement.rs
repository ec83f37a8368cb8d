use serde::{Deserialize, Serialize};

use crate::database_ref::DatabaseRef;

/// (owner, name) -> node mapping. Set at creation, immutable until the
/// database is deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Placement {
  pub database: DatabaseRef,
  pub node_name: String,
  pub live: bool,
}
