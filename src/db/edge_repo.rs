use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::task_repo::parse_timestamp;
use crate::error::{GraphError, Result};
use crate::id::{EdgeId, OwnerId, TaskId};
use crate::types::DependencyEdge;

fn row_to_edge(row: &Row) -> rusqlite::Result<DependencyEdge> {
    Ok(DependencyEdge {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        dependent_id: row.get("dependent_id")?,
        prerequisite_id: row.get("prerequisite_id")?,
        kind: row.get("kind")?,
        active: row.get::<_, i32>("active")? != 0,
        created_at: parse_timestamp(row.get("created_at")?).unwrap_or_else(chrono::Utc::now),
    })
}

pub fn insert_edge(conn: &Connection, edge: &DependencyEdge) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO task_dependencies (id, owner_id, dependent_id, prerequisite_id, kind, active, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            &edge.id,
            &edge.owner_id,
            &edge.dependent_id,
            &edge.prerequisite_id,
            edge.kind,
            edge.active as i32,
            edge.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get_edge(conn: &Connection, id: &EdgeId) -> Result<Option<DependencyEdge>> {
    let edge = conn
        .query_row(
            "SELECT * FROM task_dependencies WHERE id = ?1",
            params![id],
            row_to_edge,
        )
        .optional()?;
    Ok(edge)
}

/// Prerequisite edges of `task_id`.
pub fn active_edges_where_dependent(
    conn: &Connection,
    task_id: &TaskId,
) -> Result<Vec<DependencyEdge>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM task_dependencies WHERE dependent_id = ?1 AND active = 1 ORDER BY created_at ASC, id ASC",
    )?;
    let edges = stmt
        .query_map(params![task_id], row_to_edge)?
        .collect::<rusqlite::Result<Vec<DependencyEdge>>>()?;
    Ok(edges)
}

/// Dependent edges of `task_id`.
pub fn active_edges_where_prerequisite(
    conn: &Connection,
    task_id: &TaskId,
) -> Result<Vec<DependencyEdge>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM task_dependencies WHERE prerequisite_id = ?1 AND active = 1 ORDER BY created_at ASC, id ASC",
    )?;
    let edges = stmt
        .query_map(params![task_id], row_to_edge)?
        .collect::<rusqlite::Result<Vec<DependencyEdge>>>()?;
    Ok(edges)
}

pub fn list_edges(conn: &Connection, owner: &OwnerId) -> Result<Vec<DependencyEdge>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM task_dependencies WHERE owner_id = ?1 ORDER BY created_at ASC, id ASC",
    )?;
    let edges = stmt
        .query_map(params![owner], row_to_edge)?
        .collect::<rusqlite::Result<Vec<DependencyEdge>>>()?;
    Ok(edges)
}

pub fn set_edge_active(conn: &Connection, id: &EdgeId, active: bool) -> Result<()> {
    let changed = conn.execute(
        "UPDATE task_dependencies SET active = ?1 WHERE id = ?2",
        params![active as i32, id],
    )?;
    if changed == 0 {
        return Err(GraphError::EdgeNotFound(id.clone()));
    }
    Ok(())
}
