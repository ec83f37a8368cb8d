use livedb_model::{DatabaseRef, Error, Placement};
use sqlx::{PgExecutor, Row};

/// Picks the node for a newly-created live database: the database's
/// previously-recorded node if it's still healthy (stable preference on
/// re-creation), otherwise the next node in round-robin order.
///
/// Callers run this inside the same transaction that inserts the
/// caller's database metadata row, per spec.md §4.3.
pub async fn assign<'e, E>(
  executor: E,
  database: &DatabaseRef,
  healthy_nodes: &[String],
) -> Result<Placement, Error>
where
  E: PgExecutor<'e> + Copy,
{
  if healthy_nodes.is_empty() {
    return Err(Error::Internal("no healthy nodes available for placement".into()));
  }

  if lookup(executor, database).await?.is_some() {
    return Err(Error::Conflict(format!(
      "{}/{} is already live",
      database.owner, database.name
    )));
  }

  let preferred = sqlx::query("SELECT node_name FROM placement_last_node WHERE owner = $1 AND name = $2")
    .bind(&database.owner)
    .bind(&database.name)
    .fetch_optional(executor)
    .await
    .map_err(|e| Error::Internal(e.into()))?
    .map(|row| row.try_get::<String, _>("node_name"))
    .transpose()
    .map_err(|e| Error::Internal(e.into()))?;

  let node_name = match preferred {
    Some(node) if healthy_nodes.iter().any(|n| n == &node) => node,
    _ => next_round_robin_node(executor, healthy_nodes).await?,
  };

  sqlx::query(
    "INSERT INTO placement (owner, name, node_name, live) VALUES ($1, $2, $3, TRUE)",
  )
  .bind(&database.owner)
  .bind(&database.name)
  .bind(&node_name)
  .execute(executor)
  .await
  .map_err(|e| Error::Internal(e.into()))?;

  sqlx::query(
    r#"
    INSERT INTO placement_last_node (owner, name, node_name, updated_at)
    VALUES ($1, $2, $3, NOW())
    ON CONFLICT (owner, name) DO UPDATE SET node_name = EXCLUDED.node_name, updated_at = NOW()
    "#,
  )
  .bind(&database.owner)
  .bind(&database.name)
  .bind(&node_name)
  .execute(executor)
  .await
  .map_err(|e| Error::Internal(e.into()))?;

  Ok(Placement {
    database: database.clone(),
    node_name,
    live: true,
  })
}

async fn next_round_robin_node<'e, E>(executor: E, healthy_nodes: &[String]) -> Result<String, Error>
where
  E: PgExecutor<'e>,
{
  let row = sqlx::query(
    r#"
    UPDATE placement_round_robin_counter
    SET next_index = next_index + 1
    WHERE id = 1
    RETURNING next_index
    "#,
  )
  .fetch_one(executor)
  .await
  .map_err(|e| Error::Internal(e.into()))?;

  let index: i64 = row.try_get("next_index").map_err(|e| Error::Internal(e.into()))?;
  let position = (index as usize) % healthy_nodes.len();
  Ok(healthy_nodes[position].clone())
}

/// Reads the current placement for a database, if any. Callers fail
/// with `NotLive` when this returns `None` and the requested op needs a
/// live database.
pub async fn lookup<'e, E>(executor: E, database: &DatabaseRef) -> Result<Option<Placement>, Error>
where
  E: PgExecutor<'e>,
{
  let row = sqlx::query("SELECT node_name, live FROM placement WHERE owner = $1 AND name = $2")
    .bind(&database.owner)
    .bind(&database.name)
    .fetch_optional(executor)
    .await
    .map_err(|e| Error::Internal(e.into()))?;

  let Some(row) = row else {
    return Ok(None);
  };

  Ok(Some(Placement {
    database: database.clone(),
    node_name: row.try_get("node_name").map_err(|e| Error::Internal(e.into()))?,
    live: row.try_get("live").map_err(|e| Error::Internal(e.into()))?,
  }))
}

/// Removes the placement row for a deleted live database. Leaves
/// `placement_last_node` intact so a future `create` prefers this node.
pub async fn remove<'e, E>(executor: E, database: &DatabaseRef) -> Result<(), Error>
where
  E: PgExecutor<'e>,
{
  sqlx::query("DELETE FROM placement WHERE owner = $1 AND name = $2")
    .bind(&database.owner)
    .bind(&database.name)
    .execute(executor)
    .await
    .map_err(|e| Error::Internal(e.into()))?;
  Ok(())
}

/// Requires that `database` is placed on `node_name` -- a defensive
/// check layered on top of the queue's `target_node` filter (spec.md
/// §4.3: "workers never answer for databases not assigned to them").
pub async fn require_placed_on<'e, E>(
  executor: E,
  database: &DatabaseRef,
  node_name: &str,
) -> Result<(), Error>
where
  E: PgExecutor<'e>,
{
  match lookup(executor, database).await? {
    Some(p) if p.live && p.node_name == node_name => Ok(()),
    Some(_) | None => Err(Error::NotLive(database.owner.clone(), database.name.clone())),
  }
}
