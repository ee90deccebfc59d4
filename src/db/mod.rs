//! Storage seam of the graph core.
//!
//! The core never talks to a database directly: it reads through
//! [`NodeReader`] and writes only inside [`NodeRepository::run_in_transaction`].

pub mod edge_repo;
pub mod memory;
pub mod schema;
pub mod sqlite;
pub mod task_repo;

pub use memory::MemoryRepository;
pub use schema::open_db;
pub use sqlite::SqliteRepository;

use crate::error::Result;
use crate::id::{EdgeId, OwnerId, TaskId};
use crate::types::{DependencyEdge, TaskNode};

/// Read access to committed graph state.
///
/// Implementations return records regardless of their `active` flag; the
/// core filters. Only `get_active_edges_*` pre-filter, since inactive edges
/// are never traversed.
pub trait NodeReader {
    fn get_node(&self, id: &TaskId) -> Result<Option<TaskNode>>;

    /// Direct children of `parent_id`, active or not.
    fn get_children(&self, parent_id: &TaskId) -> Result<Vec<TaskNode>>;

    fn get_edge(&self, id: &EdgeId) -> Result<Option<DependencyEdge>>;

    /// Active edges where `task_id` is the dependent (its prerequisites).
    fn get_active_edges_where_dependent(&self, task_id: &TaskId) -> Result<Vec<DependencyEdge>>;

    /// Active edges where `task_id` is the prerequisite (its dependents).
    fn get_active_edges_where_prerequisite(
        &self,
        task_id: &TaskId,
    ) -> Result<Vec<DependencyEdge>>;

    fn list_nodes(&self, owner: &OwnerId) -> Result<Vec<TaskNode>>;

    fn list_edges(&self, owner: &OwnerId) -> Result<Vec<DependencyEdge>>;

    /// Counter advanced by every committed structural write of `owner`.
    fn graph_version(&self, owner: &OwnerId) -> Result<i64>;
}

/// Writes available inside a transaction. Reads through the same handle see
/// the transaction's own uncommitted writes.
pub trait NodeWriter: NodeReader {
    fn insert_node(&self, node: &TaskNode) -> Result<()>;

    fn update_parent(&self, id: &TaskId, parent_id: Option<&TaskId>) -> Result<()>;

    fn set_completed(&self, id: &TaskId, completed: bool) -> Result<()>;

    fn set_completion_percentage(&self, id: &TaskId, percentage: u8) -> Result<()>;

    fn set_node_active(&self, id: &TaskId, active: bool) -> Result<()>;

    fn insert_edge(&self, edge: &DependencyEdge) -> Result<()>;

    fn set_edge_active(&self, id: &EdgeId, active: bool) -> Result<()>;

    /// Compare-and-increment of the owner's graph version. Fails with
    /// `GraphError::Conflict` when the stored version is not `expected`.
    fn advance_graph_version(&self, owner: &OwnerId, expected: i64) -> Result<i64>;
}

pub trait NodeRepository: NodeReader + Send + Sync {
    /// Run `f` atomically: either every write it made commits, or none does.
    fn run_in_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn NodeWriter) -> Result<T>;
}
