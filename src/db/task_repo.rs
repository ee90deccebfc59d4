use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{GraphError, Result};
use crate::id::{OwnerId, TaskId};
use crate::types::TaskNode;

fn now() -> DateTime<Utc> {
    Utc::now()
}

pub(crate) fn parse_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn row_to_node(row: &Row) -> rusqlite::Result<TaskNode> {
    Ok(TaskNode {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        parent_id: row.get("parent_id")?,
        title: row.get("title")?,
        completed: row.get::<_, i32>("completed")? != 0,
        completed_at: parse_timestamp(row.get("completed_at")?),
        completion_percentage: row.get("completion_percentage")?,
        active: row.get::<_, i32>("active")? != 0,
        created_at: parse_timestamp(row.get("created_at")?).unwrap_or_else(now),
        updated_at: parse_timestamp(row.get("updated_at")?).unwrap_or_else(now),
    })
}

/// Fails with `TaskNotFound` when an UPDATE touched no row.
fn expect_one(changed: usize, id: &TaskId) -> Result<()> {
    if changed == 0 {
        return Err(GraphError::TaskNotFound(id.clone()));
    }
    Ok(())
}

pub fn insert_node(conn: &Connection, node: &TaskNode) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO tasks (id, owner_id, parent_id, title, completed, completed_at,
                           completion_percentage, active, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            &node.id,
            &node.owner_id,
            node.parent_id.as_ref(),
            node.title,
            node.completed as i32,
            node.completed_at.map(|dt| dt.to_rfc3339()),
            node.completion_percentage,
            node.active as i32,
            node.created_at.to_rfc3339(),
            node.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get_node(conn: &Connection, id: &TaskId) -> Result<Option<TaskNode>> {
    let node = conn
        .query_row("SELECT * FROM tasks WHERE id = ?1", params![id], row_to_node)
        .optional()?;
    Ok(node)
}

pub fn get_children(conn: &Connection, parent_id: &TaskId) -> Result<Vec<TaskNode>> {
    let mut stmt =
        conn.prepare("SELECT * FROM tasks WHERE parent_id = ?1 ORDER BY created_at ASC, id ASC")?;
    let nodes = stmt
        .query_map(params![parent_id], row_to_node)?
        .collect::<rusqlite::Result<Vec<TaskNode>>>()?;
    Ok(nodes)
}

pub fn list_nodes(conn: &Connection, owner: &OwnerId) -> Result<Vec<TaskNode>> {
    let mut stmt =
        conn.prepare("SELECT * FROM tasks WHERE owner_id = ?1 ORDER BY created_at ASC, id ASC")?;
    let nodes = stmt
        .query_map(params![owner], row_to_node)?
        .collect::<rusqlite::Result<Vec<TaskNode>>>()?;
    Ok(nodes)
}

pub fn update_parent(conn: &Connection, id: &TaskId, parent_id: Option<&TaskId>) -> Result<()> {
    let changed = conn.execute(
        "UPDATE tasks SET parent_id = ?1, updated_at = ?2 WHERE id = ?3",
        params![parent_id, now().to_rfc3339(), id],
    )?;
    expect_one(changed, id)
}

pub fn set_completed(conn: &Connection, id: &TaskId, completed: bool) -> Result<()> {
    let now_str = now().to_rfc3339();
    let completed_at = completed.then(|| now_str.clone());
    let changed = conn.execute(
        "UPDATE tasks SET completed = ?1, completed_at = ?2, updated_at = ?3 WHERE id = ?4",
        params![completed as i32, completed_at, now_str, id],
    )?;
    expect_one(changed, id)
}

pub fn set_completion_percentage(conn: &Connection, id: &TaskId, percentage: u8) -> Result<()> {
    let changed = conn.execute(
        "UPDATE tasks SET completion_percentage = ?1, updated_at = ?2 WHERE id = ?3",
        params![percentage, now().to_rfc3339(), id],
    )?;
    expect_one(changed, id)
}

pub fn set_node_active(conn: &Connection, id: &TaskId, active: bool) -> Result<()> {
    let changed = conn.execute(
        "UPDATE tasks SET active = ?1, updated_at = ?2 WHERE id = ?3",
        params![active as i32, now().to_rfc3339(), id],
    )?;
    expect_one(changed, id)
}

pub fn graph_version(conn: &Connection, owner: &OwnerId) -> Result<i64> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM owner_graphs WHERE owner_id = ?1",
            params![owner],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.unwrap_or(0))
}

pub fn advance_graph_version(conn: &Connection, owner: &OwnerId, expected: i64) -> Result<i64> {
    conn.execute(
        "INSERT INTO owner_graphs (owner_id, version) VALUES (?1, 0) ON CONFLICT(owner_id) DO NOTHING",
        params![owner],
    )?;
    let changed = conn.execute(
        "UPDATE owner_graphs SET version = version + 1 WHERE owner_id = ?1 AND version = ?2",
        params![owner, expected],
    )?;
    if changed == 0 {
        return Err(GraphError::Conflict {
            owner_id: owner.clone(),
        });
    }
    Ok(expected + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        schema::init_schema(&conn).unwrap();
        conn
    }

    fn owner() -> OwnerId {
        "alice".parse().unwrap()
    }

    #[test]
    fn insert_and_get_round_trips_fields() {
        let conn = setup_db();
        let mut node = TaskNode::new(owner(), "Write report");
        node.completion_percentage = 40;
        insert_node(&conn, &node).unwrap();

        let loaded = get_node(&conn, &node.id).unwrap().unwrap();
        assert_eq!(loaded.title, "Write report");
        assert_eq!(loaded.owner_id, owner());
        assert_eq!(loaded.completion_percentage, 40);
        assert!(loaded.active);
        assert!(!loaded.completed);
        assert_eq!(loaded.parent_id, None);
    }

    #[test]
    fn children_follow_parent_index() {
        let conn = setup_db();
        let parent = TaskNode::new(owner(), "Parent");
        insert_node(&conn, &parent).unwrap();
        let child = TaskNode::new(owner(), "Child");
        insert_node(&conn, &child).unwrap();

        assert!(get_children(&conn, &parent.id).unwrap().is_empty());
        update_parent(&conn, &child.id, Some(&parent.id)).unwrap();
        let children = get_children(&conn, &parent.id).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, child.id);
    }

    #[test]
    fn completion_sets_and_clears_timestamp() {
        let conn = setup_db();
        let node = TaskNode::new(owner(), "Task");
        insert_node(&conn, &node).unwrap();

        set_completed(&conn, &node.id, true).unwrap();
        let done = get_node(&conn, &node.id).unwrap().unwrap();
        assert!(done.completed);
        assert!(done.completed_at.is_some());

        set_completed(&conn, &node.id, false).unwrap();
        let reopened = get_node(&conn, &node.id).unwrap().unwrap();
        assert!(!reopened.completed);
        assert!(reopened.completed_at.is_none());
    }

    #[test]
    fn update_missing_task_is_not_found() {
        let conn = setup_db();
        let result = set_node_active(&conn, &TaskId::new(), false);
        assert!(matches!(result, Err(GraphError::TaskNotFound(_))));
    }

    #[test]
    fn graph_version_compare_and_increment() {
        let conn = setup_db();
        assert_eq!(graph_version(&conn, &owner()).unwrap(), 0);
        assert_eq!(advance_graph_version(&conn, &owner(), 0).unwrap(), 1);
        assert_eq!(graph_version(&conn, &owner()).unwrap(), 1);

        let stale = advance_graph_version(&conn, &owner(), 0);
        assert!(matches!(stale, Err(GraphError::Conflict { .. })));
        assert_eq!(graph_version(&conn, &owner()).unwrap(), 1);
    }
}
