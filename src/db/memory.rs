//! In-process repository.
//!
//! Keeps the hierarchy as an adjacency structure: each node stores its
//! `parent_id`, and a separate parent -> children index answers child
//! lookups. Edges are indexed by both endpoints.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use chrono::Utc;

use crate::db::{NodeReader, NodeRepository, NodeWriter};
use crate::error::{GraphError, Result};
use crate::id::{EdgeId, OwnerId, TaskId};
use crate::types::{DependencyEdge, TaskNode};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    nodes: HashMap<TaskId, TaskNode>,
    children: HashMap<TaskId, BTreeSet<TaskId>>,
    edges: HashMap<EdgeId, DependencyEdge>,
    by_dependent: HashMap<TaskId, BTreeSet<EdgeId>>,
    by_prerequisite: HashMap<TaskId, BTreeSet<EdgeId>>,
    versions: HashMap<OwnerId, i64>,
}

fn sorted_nodes(mut nodes: Vec<TaskNode>) -> Vec<TaskNode> {
    nodes.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
    nodes
}

fn sorted_edges(mut edges: Vec<DependencyEdge>) -> Vec<DependencyEdge> {
    edges.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
    edges
}

impl MemoryState {
    fn node_mut(&mut self, id: &TaskId) -> Result<&mut TaskNode> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::TaskNotFound(id.clone()))
    }

    fn require_node(&self, id: &TaskId) -> Result<()> {
        if !self.nodes.contains_key(id) {
            return Err(GraphError::Integrity(format!("unknown task {id}")));
        }
        Ok(())
    }

    fn active_edges(&self, index: &HashMap<TaskId, BTreeSet<EdgeId>>, task_id: &TaskId) -> Vec<DependencyEdge> {
        let edges = index
            .get(task_id)
            .into_iter()
            .flatten()
            .filter_map(|edge_id| self.edges.get(edge_id))
            .filter(|edge| edge.active)
            .cloned()
            .collect();
        sorted_edges(edges)
    }

    fn get_children(&self, parent_id: &TaskId) -> Vec<TaskNode> {
        let nodes = self
            .children
            .get(parent_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.nodes.get(id))
            .cloned()
            .collect();
        sorted_nodes(nodes)
    }

    fn list_nodes(&self, owner: &OwnerId) -> Vec<TaskNode> {
        let nodes = self
            .nodes
            .values()
            .filter(|n| &n.owner_id == owner)
            .cloned()
            .collect();
        sorted_nodes(nodes)
    }

    fn list_edges(&self, owner: &OwnerId) -> Vec<DependencyEdge> {
        let edges = self
            .edges
            .values()
            .filter(|e| &e.owner_id == owner)
            .cloned()
            .collect();
        sorted_edges(edges)
    }

    fn insert_node(&mut self, node: &TaskNode) -> Result<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(GraphError::Integrity(format!("duplicate task {}", node.id)));
        }
        if let Some(ref parent_id) = node.parent_id {
            self.require_node(parent_id)?;
            self.children
                .entry(parent_id.clone())
                .or_default()
                .insert(node.id.clone());
        }
        self.nodes.insert(node.id.clone(), node.clone());
        Ok(())
    }

    fn update_parent(&mut self, id: &TaskId, parent_id: Option<&TaskId>) -> Result<()> {
        if let Some(parent_id) = parent_id {
            self.require_node(parent_id)?;
        }
        let node = self.node_mut(id)?;
        let old_parent = std::mem::replace(&mut node.parent_id, parent_id.cloned());
        node.updated_at = Utc::now();

        if let Some(old) = old_parent {
            if let Some(siblings) = self.children.get_mut(&old) {
                siblings.remove(id);
            }
        }
        if let Some(new) = parent_id {
            self.children
                .entry(new.clone())
                .or_default()
                .insert(id.clone());
        }
        Ok(())
    }

    fn insert_edge(&mut self, edge: &DependencyEdge) -> Result<()> {
        self.require_node(&edge.dependent_id)?;
        self.require_node(&edge.prerequisite_id)?;
        if edge.dependent_id == edge.prerequisite_id {
            return Err(GraphError::Integrity(format!(
                "self edge on {}",
                edge.dependent_id
            )));
        }
        if edge.active {
            let duplicate = self
                .active_edges(&self.by_dependent, &edge.dependent_id)
                .iter()
                .any(|e| e.prerequisite_id == edge.prerequisite_id);
            if duplicate {
                return Err(GraphError::Integrity(format!(
                    "duplicate active dependency {} -> {}",
                    edge.dependent_id, edge.prerequisite_id
                )));
            }
        }
        self.by_dependent
            .entry(edge.dependent_id.clone())
            .or_default()
            .insert(edge.id.clone());
        self.by_prerequisite
            .entry(edge.prerequisite_id.clone())
            .or_default()
            .insert(edge.id.clone());
        self.edges.insert(edge.id.clone(), edge.clone());
        Ok(())
    }

    fn advance_graph_version(&mut self, owner: &OwnerId, expected: i64) -> Result<i64> {
        let version = self.versions.entry(owner.clone()).or_insert(0);
        if *version != expected {
            return Err(GraphError::Conflict {
                owner_id: owner.clone(),
            });
        }
        *version += 1;
        Ok(*version)
    }
}

/// Thread-safe in-memory repository. Transactions run against a private copy
/// of the state that replaces the shared state only on success.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: RwLock<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&MemoryState) -> T) -> T {
        let guard = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }
}

impl NodeReader for MemoryRepository {
    fn get_node(&self, id: &TaskId) -> Result<Option<TaskNode>> {
        Ok(self.read(|s| s.nodes.get(id).cloned()))
    }

    fn get_children(&self, parent_id: &TaskId) -> Result<Vec<TaskNode>> {
        Ok(self.read(|s| s.get_children(parent_id)))
    }

    fn get_edge(&self, id: &EdgeId) -> Result<Option<DependencyEdge>> {
        Ok(self.read(|s| s.edges.get(id).cloned()))
    }

    fn get_active_edges_where_dependent(&self, task_id: &TaskId) -> Result<Vec<DependencyEdge>> {
        Ok(self.read(|s| s.active_edges(&s.by_dependent, task_id)))
    }

    fn get_active_edges_where_prerequisite(
        &self,
        task_id: &TaskId,
    ) -> Result<Vec<DependencyEdge>> {
        Ok(self.read(|s| s.active_edges(&s.by_prerequisite, task_id)))
    }

    fn list_nodes(&self, owner: &OwnerId) -> Result<Vec<TaskNode>> {
        Ok(self.read(|s| s.list_nodes(owner)))
    }

    fn list_edges(&self, owner: &OwnerId) -> Result<Vec<DependencyEdge>> {
        Ok(self.read(|s| s.list_edges(owner)))
    }

    fn graph_version(&self, owner: &OwnerId) -> Result<i64> {
        Ok(self.read(|s| s.versions.get(owner).copied().unwrap_or(0)))
    }
}

struct StagedState {
    state: RefCell<MemoryState>,
}

impl NodeReader for StagedState {
    fn get_node(&self, id: &TaskId) -> Result<Option<TaskNode>> {
        Ok(self.state.borrow().nodes.get(id).cloned())
    }

    fn get_children(&self, parent_id: &TaskId) -> Result<Vec<TaskNode>> {
        Ok(self.state.borrow().get_children(parent_id))
    }

    fn get_edge(&self, id: &EdgeId) -> Result<Option<DependencyEdge>> {
        Ok(self.state.borrow().edges.get(id).cloned())
    }

    fn get_active_edges_where_dependent(&self, task_id: &TaskId) -> Result<Vec<DependencyEdge>> {
        let state = self.state.borrow();
        Ok(state.active_edges(&state.by_dependent, task_id))
    }

    fn get_active_edges_where_prerequisite(
        &self,
        task_id: &TaskId,
    ) -> Result<Vec<DependencyEdge>> {
        let state = self.state.borrow();
        Ok(state.active_edges(&state.by_prerequisite, task_id))
    }

    fn list_nodes(&self, owner: &OwnerId) -> Result<Vec<TaskNode>> {
        Ok(self.state.borrow().list_nodes(owner))
    }

    fn list_edges(&self, owner: &OwnerId) -> Result<Vec<DependencyEdge>> {
        Ok(self.state.borrow().list_edges(owner))
    }

    fn graph_version(&self, owner: &OwnerId) -> Result<i64> {
        Ok(self.state.borrow().versions.get(owner).copied().unwrap_or(0))
    }
}

impl NodeWriter for StagedState {
    fn insert_node(&self, node: &TaskNode) -> Result<()> {
        self.state.borrow_mut().insert_node(node)
    }

    fn update_parent(&self, id: &TaskId, parent_id: Option<&TaskId>) -> Result<()> {
        self.state.borrow_mut().update_parent(id, parent_id)
    }

    fn set_completed(&self, id: &TaskId, completed: bool) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let node = state.node_mut(id)?;
        let now = Utc::now();
        node.completed = completed;
        node.completed_at = completed.then_some(now);
        node.updated_at = now;
        Ok(())
    }

    fn set_completion_percentage(&self, id: &TaskId, percentage: u8) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let node = state.node_mut(id)?;
        node.completion_percentage = percentage;
        node.updated_at = Utc::now();
        Ok(())
    }

    fn set_node_active(&self, id: &TaskId, active: bool) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let node = state.node_mut(id)?;
        node.active = active;
        node.updated_at = Utc::now();
        Ok(())
    }

    fn insert_edge(&self, edge: &DependencyEdge) -> Result<()> {
        self.state.borrow_mut().insert_edge(edge)
    }

    fn set_edge_active(&self, id: &EdgeId, active: bool) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let edge = state
            .edges
            .get_mut(id)
            .ok_or_else(|| GraphError::EdgeNotFound(id.clone()))?;
        edge.active = active;
        Ok(())
    }

    fn advance_graph_version(&self, owner: &OwnerId, expected: i64) -> Result<i64> {
        self.state.borrow_mut().advance_graph_version(owner, expected)
    }
}

impl NodeRepository for MemoryRepository {
    fn run_in_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn NodeWriter) -> Result<T>,
    {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let staged = StagedState {
            state: RefCell::new(guard.clone()),
        };
        let out = f(&staged)?;
        *guard = staged.state.into_inner();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DependencyType;

    fn owner() -> OwnerId {
        "alice".parse().unwrap()
    }

    #[test]
    fn reparent_moves_child_between_index_entries() {
        let repo = MemoryRepository::new();
        let a = TaskNode::new(owner(), "A");
        let b = TaskNode::new(owner(), "B");
        let c = TaskNode::new(owner(), "C");
        repo.run_in_transaction(|tx| {
            tx.insert_node(&a)?;
            tx.insert_node(&b)?;
            tx.insert_node(&c)?;
            tx.update_parent(&c.id, Some(&a.id))
        })
        .unwrap();
        assert_eq!(repo.get_children(&a.id).unwrap().len(), 1);

        repo.run_in_transaction(|tx| tx.update_parent(&c.id, Some(&b.id)))
            .unwrap();
        assert!(repo.get_children(&a.id).unwrap().is_empty());
        assert_eq!(repo.get_children(&b.id).unwrap()[0].id, c.id);
        assert_eq!(repo.get_node(&c.id).unwrap().unwrap().parent_id, Some(b.id));
    }

    #[test]
    fn failed_transaction_leaves_state_untouched() {
        let repo = MemoryRepository::new();
        let a = TaskNode::new(owner(), "A");
        let result: Result<()> = repo.run_in_transaction(|tx| {
            tx.insert_node(&a)?;
            tx.advance_graph_version(&owner(), 0)?;
            Err(GraphError::Integrity("boom".to_string()))
        });
        assert!(result.is_err());
        assert!(repo.get_node(&a.id).unwrap().is_none());
        assert_eq!(repo.graph_version(&owner()).unwrap(), 0);
    }

    #[test]
    fn edge_constraints_mirror_sql_store() {
        let repo = MemoryRepository::new();
        let a = TaskNode::new(owner(), "A");
        let b = TaskNode::new(owner(), "B");
        repo.run_in_transaction(|tx| {
            tx.insert_node(&a)?;
            tx.insert_node(&b)
        })
        .unwrap();

        let edge = DependencyEdge::new(owner(), b.id.clone(), a.id.clone(), DependencyType::FinishToStart);
        repo.run_in_transaction(|tx| tx.insert_edge(&edge)).unwrap();

        let dup = DependencyEdge::new(owner(), b.id.clone(), a.id.clone(), DependencyType::FinishToStart);
        assert!(matches!(
            repo.run_in_transaction(|tx| tx.insert_edge(&dup)),
            Err(GraphError::Integrity(_))
        ));

        let self_edge = DependencyEdge::new(owner(), a.id.clone(), a.id.clone(), DependencyType::FinishToStart);
        assert!(repo.run_in_transaction(|tx| tx.insert_edge(&self_edge)).is_err());

        repo.run_in_transaction(|tx| tx.set_edge_active(&edge.id, false))
            .unwrap();
        assert!(repo.get_active_edges_where_dependent(&b.id).unwrap().is_empty());
        assert!(repo.get_active_edges_where_prerequisite(&a.id).unwrap().is_empty());
        assert!(!repo.get_edge(&edge.id).unwrap().unwrap().active);
    }

    #[test]
    fn stale_version_conflicts() {
        let repo = MemoryRepository::new();
        repo.run_in_transaction(|tx| tx.advance_graph_version(&owner(), 0))
            .unwrap();
        let stale = repo.run_in_transaction(|tx| tx.advance_graph_version(&owner(), 0));
        assert!(matches!(stale, Err(GraphError::Conflict { .. })));
        assert_eq!(repo.graph_version(&owner()).unwrap(), 1);
    }
}
