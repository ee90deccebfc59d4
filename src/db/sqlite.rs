use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, TransactionBehavior};

use crate::db::{edge_repo, schema, task_repo, NodeReader, NodeRepository, NodeWriter};
use crate::error::Result;
use crate::id::{EdgeId, OwnerId, TaskId};
use crate::types::{DependencyEdge, TaskNode};

/// SQLite-backed repository. One connection, serialized behind a mutex;
/// writes run in `BEGIN IMMEDIATE` transactions so a second process writing
/// the same file surfaces as busy (and from there as a conflict).
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_connection(schema::open_db(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::configure(&conn)?;
        schema::init_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    /// Wrap an already initialised connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    // A panic mid-statement leaves no open transaction behind (rusqlite rolls
    // back on drop), so a poisoned connection is still usable.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reads and writes over one borrowed connection (plain or transactional).
struct ConnHandle<'c> {
    conn: &'c Connection,
}

impl NodeReader for ConnHandle<'_> {
    fn get_node(&self, id: &TaskId) -> Result<Option<TaskNode>> {
        task_repo::get_node(self.conn, id)
    }

    fn get_children(&self, parent_id: &TaskId) -> Result<Vec<TaskNode>> {
        task_repo::get_children(self.conn, parent_id)
    }

    fn get_edge(&self, id: &EdgeId) -> Result<Option<DependencyEdge>> {
        edge_repo::get_edge(self.conn, id)
    }

    fn get_active_edges_where_dependent(&self, task_id: &TaskId) -> Result<Vec<DependencyEdge>> {
        edge_repo::active_edges_where_dependent(self.conn, task_id)
    }

    fn get_active_edges_where_prerequisite(
        &self,
        task_id: &TaskId,
    ) -> Result<Vec<DependencyEdge>> {
        edge_repo::active_edges_where_prerequisite(self.conn, task_id)
    }

    fn list_nodes(&self, owner: &OwnerId) -> Result<Vec<TaskNode>> {
        task_repo::list_nodes(self.conn, owner)
    }

    fn list_edges(&self, owner: &OwnerId) -> Result<Vec<DependencyEdge>> {
        edge_repo::list_edges(self.conn, owner)
    }

    fn graph_version(&self, owner: &OwnerId) -> Result<i64> {
        task_repo::graph_version(self.conn, owner)
    }
}

impl NodeWriter for ConnHandle<'_> {
    fn insert_node(&self, node: &TaskNode) -> Result<()> {
        task_repo::insert_node(self.conn, node)
    }

    fn update_parent(&self, id: &TaskId, parent_id: Option<&TaskId>) -> Result<()> {
        task_repo::update_parent(self.conn, id, parent_id)
    }

    fn set_completed(&self, id: &TaskId, completed: bool) -> Result<()> {
        task_repo::set_completed(self.conn, id, completed)
    }

    fn set_completion_percentage(&self, id: &TaskId, percentage: u8) -> Result<()> {
        task_repo::set_completion_percentage(self.conn, id, percentage)
    }

    fn set_node_active(&self, id: &TaskId, active: bool) -> Result<()> {
        task_repo::set_node_active(self.conn, id, active)
    }

    fn insert_edge(&self, edge: &DependencyEdge) -> Result<()> {
        edge_repo::insert_edge(self.conn, edge)
    }

    fn set_edge_active(&self, id: &EdgeId, active: bool) -> Result<()> {
        edge_repo::set_edge_active(self.conn, id, active)
    }

    fn advance_graph_version(&self, owner: &OwnerId, expected: i64) -> Result<i64> {
        task_repo::advance_graph_version(self.conn, owner, expected)
    }
}

impl NodeReader for SqliteRepository {
    fn get_node(&self, id: &TaskId) -> Result<Option<TaskNode>> {
        task_repo::get_node(&self.conn(), id)
    }

    fn get_children(&self, parent_id: &TaskId) -> Result<Vec<TaskNode>> {
        task_repo::get_children(&self.conn(), parent_id)
    }

    fn get_edge(&self, id: &EdgeId) -> Result<Option<DependencyEdge>> {
        edge_repo::get_edge(&self.conn(), id)
    }

    fn get_active_edges_where_dependent(&self, task_id: &TaskId) -> Result<Vec<DependencyEdge>> {
        edge_repo::active_edges_where_dependent(&self.conn(), task_id)
    }

    fn get_active_edges_where_prerequisite(
        &self,
        task_id: &TaskId,
    ) -> Result<Vec<DependencyEdge>> {
        edge_repo::active_edges_where_prerequisite(&self.conn(), task_id)
    }

    fn list_nodes(&self, owner: &OwnerId) -> Result<Vec<TaskNode>> {
        task_repo::list_nodes(&self.conn(), owner)
    }

    fn list_edges(&self, owner: &OwnerId) -> Result<Vec<DependencyEdge>> {
        edge_repo::list_edges(&self.conn(), owner)
    }

    fn graph_version(&self, owner: &OwnerId) -> Result<i64> {
        task_repo::graph_version(&self.conn(), owner)
    }
}

impl NodeRepository for SqliteRepository {
    fn run_in_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn NodeWriter) -> Result<T>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&ConnHandle { conn: &tx })?;
        tx.commit()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;

    fn owner() -> OwnerId {
        "alice".parse().unwrap()
    }

    #[test]
    fn failed_transaction_rolls_back_every_write() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let node = TaskNode::new(owner(), "Kept out");

        let result: Result<()> = repo.run_in_transaction(|tx| {
            tx.insert_node(&node)?;
            tx.advance_graph_version(&owner(), 0)?;
            Err(GraphError::TaskNotFound(TaskId::new()))
        });

        assert!(result.is_err());
        assert!(repo.get_node(&node.id).unwrap().is_none());
        assert_eq!(repo.graph_version(&owner()).unwrap(), 0);
    }

    #[test]
    fn transaction_reads_its_own_writes() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let parent = TaskNode::new(owner(), "Parent");
        let child = TaskNode::new(owner(), "Child");

        let seen = repo
            .run_in_transaction(|tx| {
                tx.insert_node(&parent)?;
                tx.insert_node(&child)?;
                tx.update_parent(&child.id, Some(&parent.id))?;
                Ok(tx.get_children(&parent.id)?.len())
            })
            .unwrap();

        assert_eq!(seen, 1);
        assert_eq!(repo.list_nodes(&owner()).unwrap().len(), 2);
    }

    #[test]
    fn file_backed_repository_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let node = TaskNode::new(owner(), "Durable");
        {
            let repo = SqliteRepository::open(&path).unwrap();
            repo.run_in_transaction(|tx| tx.insert_node(&node)).unwrap();
        }
        let reopened = SqliteRepository::open(&path).unwrap();
        assert_eq!(reopened.get_node(&node.id).unwrap().unwrap().title, "Durable");
    }
}
