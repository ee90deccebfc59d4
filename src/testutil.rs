//! Fixtures that write graph state straight into a repository.
//!
//! They bypass the validators, so tests can also build states the core would
//! refuse to create (cycles, over-deep chains).

use crate::db::NodeRepository;
use crate::id::{OwnerId, TaskId};
use crate::types::{DependencyEdge, DependencyType, TaskNode};

pub fn owner() -> OwnerId {
    "alice".parse().unwrap()
}

pub fn other_owner() -> OwnerId {
    "bob".parse().unwrap()
}

/// Seeding helpers available on every repository.
pub trait GraphFixture: NodeRepository {
    /// Inserts an active task of `owner`, optionally under `parent`.
    fn seed_task(&self, owner: &OwnerId, title: &str, parent: Option<&TaskId>) -> TaskNode {
        let mut node = TaskNode::new(owner.clone(), title);
        node.parent_id = parent.cloned();
        self.run_in_transaction(|tx| tx.insert_node(&node)).unwrap();
        node
    }

    /// Builds root -> c1 -> ... and returns the nodes root first.
    fn seed_chain(&self, owner: &OwnerId, len: usize) -> Vec<TaskNode> {
        let mut chain: Vec<TaskNode> = Vec::with_capacity(len);
        for i in 0..len {
            let parent = chain.last().map(|n| n.id.clone());
            chain.push(self.seed_task(owner, &format!("level {i}"), parent.as_ref()));
        }
        chain
    }

    /// Records "`dependent` waits for `prerequisite`" (finish-to-start).
    fn seed_edge(&self, dependent: &TaskNode, prerequisite: &TaskNode) -> DependencyEdge {
        self.seed_edge_of_kind(dependent, prerequisite, DependencyType::FinishToStart)
    }

    fn seed_edge_of_kind(
        &self,
        dependent: &TaskNode,
        prerequisite: &TaskNode,
        kind: DependencyType,
    ) -> DependencyEdge {
        let edge = DependencyEdge::new(
            dependent.owner_id.clone(),
            dependent.id.clone(),
            prerequisite.id.clone(),
            kind,
        );
        self.run_in_transaction(|tx| tx.insert_edge(&edge)).unwrap();
        edge
    }

    fn complete(&self, task: &TaskNode) {
        self.run_in_transaction(|tx| tx.set_completed(&task.id, true))
            .unwrap();
    }

    fn deactivate(&self, task: &TaskNode) {
        self.run_in_transaction(|tx| tx.set_node_active(&task.id, false))
            .unwrap();
    }
}

impl<R: NodeRepository> GraphFixture for R {}
