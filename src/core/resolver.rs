//! Read-time derivation of blocked state and effective completion.
//!
//! Nothing here is stored: completing a prerequisite unblocks its dependents
//! simply because the next read sees it completed.

use crate::db::NodeReader;
use crate::error::{GraphError, Result};
use crate::id::{OwnerId, TaskId};
use crate::types::TaskNode;

pub struct CompletionResolver<'a, R: NodeReader + ?Sized> {
    repo: &'a R,
    owner: &'a OwnerId,
}

impl<'a, R: NodeReader + ?Sized> CompletionResolver<'a, R> {
    pub fn new(repo: &'a R, owner: &'a OwnerId) -> Self {
        Self { repo, owner }
    }

    fn resolve(&self, id: &TaskId) -> Result<TaskNode> {
        self.repo
            .get_node(id)?
            .filter(|node| node.is_visible_to(self.owner))
            .ok_or_else(|| GraphError::TaskNotFound(id.clone()))
    }

    /// Incomplete finish-to-start prerequisites of `task_id`.
    pub fn blocking_prerequisites(&self, task_id: &TaskId) -> Result<Vec<TaskId>> {
        self.resolve(task_id)?;
        let mut blocking = Vec::new();
        for edge in self.repo.get_active_edges_where_dependent(task_id)? {
            if !edge.kind.gates_start() || &edge.owner_id != self.owner {
                continue;
            }
            let Some(prerequisite) = self.repo.get_node(&edge.prerequisite_id)? else {
                continue;
            };
            if prerequisite.is_visible_to(self.owner) && !prerequisite.completed {
                blocking.push(prerequisite.id);
            }
        }
        Ok(blocking)
    }

    pub fn is_blocked(&self, task_id: &TaskId) -> Result<bool> {
        Ok(!self.blocking_prerequisites(task_id)?.is_empty())
    }

    pub fn can_start(&self, task_id: &TaskId) -> Result<bool> {
        Ok(!self.is_blocked(task_id)?)
    }

    /// Active dependents of `task_id`, whatever the edge kind.
    pub fn dependents(&self, task_id: &TaskId) -> Result<Vec<TaskId>> {
        let mut out = Vec::new();
        for edge in self.repo.get_active_edges_where_prerequisite(task_id)? {
            if &edge.owner_id != self.owner {
                continue;
            }
            if let Some(dependent) = self.repo.get_node(&edge.dependent_id)? {
                if dependent.is_visible_to(self.owner) {
                    out.push(dependent.id);
                }
            }
        }
        Ok(out)
    }

    /// Share of completed active children, truncated; a task without active
    /// children reports its own stored percentage.
    pub fn effective_completion_percentage(&self, task_id: &TaskId) -> Result<u8> {
        let node = self.resolve(task_id)?;
        let children: Vec<TaskNode> = self
            .repo
            .get_children(task_id)?
            .into_iter()
            .filter(|child| child.is_visible_to(self.owner))
            .collect();
        if children.is_empty() {
            return Ok(node.completion_percentage);
        }
        let completed = children.iter().filter(|child| child.completed).count();
        Ok((completed * 100 / children.len()) as u8)
    }

    /// Active, incomplete tasks with nothing left to wait for.
    pub fn ready_tasks(&self) -> Result<Vec<TaskNode>> {
        let mut ready = Vec::new();
        for node in self.repo.list_nodes(self.owner)? {
            if !node.active || node.completed {
                continue;
            }
            if !self.is_blocked(&node.id)? {
                ready.push(node);
            }
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NodeRepository, SqliteRepository};
    use crate::testutil::{owner, GraphFixture};
    use crate::types::DependencyType;

    fn setup_repo() -> SqliteRepository {
        SqliteRepository::open_in_memory().unwrap()
    }

    #[test]
    fn test_blocked_until_prerequisite_completes() {
        let repo = setup_repo();
        let owner = owner();
        let x = repo.seed_task(&owner, "X", None);
        let y = repo.seed_task(&owner, "Y", None);
        repo.seed_edge(&x, &y);
        let resolver = CompletionResolver::new(&repo, &owner);

        assert!(resolver.is_blocked(&x.id).unwrap());
        assert!(!resolver.can_start(&x.id).unwrap());
        assert_eq!(resolver.blocking_prerequisites(&x.id).unwrap(), vec![y.id.clone()]);

        repo.complete(&y);
        assert!(!resolver.is_blocked(&x.id).unwrap());

        // Reopening re-blocks immediately
        repo.run_in_transaction(|tx| tx.set_completed(&y.id, false))
            .unwrap();
        assert!(resolver.is_blocked(&x.id).unwrap());
    }

    #[test]
    fn test_only_finish_to_start_gates() {
        let repo = setup_repo();
        let owner = owner();
        let x = repo.seed_task(&owner, "X", None);
        for kind in [
            DependencyType::StartToStart,
            DependencyType::FinishToFinish,
            DependencyType::StartToFinish,
        ] {
            let y = repo.seed_task(&owner, "Y", None);
            repo.seed_edge_of_kind(&x, &y, kind);
        }
        let resolver = CompletionResolver::new(&repo, &owner);

        assert!(!resolver.is_blocked(&x.id).unwrap());
        assert_eq!(resolver.ready_tasks().unwrap().len(), 4);
    }

    #[test]
    fn test_inactive_prerequisite_does_not_block() {
        let repo = setup_repo();
        let owner = owner();
        let x = repo.seed_task(&owner, "X", None);
        let y = repo.seed_task(&owner, "Y", None);
        repo.seed_edge(&x, &y);
        repo.deactivate(&y);
        let resolver = CompletionResolver::new(&repo, &owner);

        assert!(!resolver.is_blocked(&x.id).unwrap());
    }

    #[test]
    fn test_effective_completion_from_children() {
        let repo = setup_repo();
        let owner = owner();
        let parent = repo.seed_task(&owner, "Parent", None);
        let children: Vec<_> = (0..4)
            .map(|i| repo.seed_task(&owner, &format!("Child {i}"), Some(&parent.id)))
            .collect();
        for child in &children[..3] {
            repo.complete(child);
        }
        let resolver = CompletionResolver::new(&repo, &owner);
        assert_eq!(resolver.effective_completion_percentage(&parent.id).unwrap(), 75);

        // Inactive children drop out of the denominator: 2 of 3 -> 66
        repo.deactivate(&children[0]);
        assert_eq!(resolver.effective_completion_percentage(&parent.id).unwrap(), 66);
    }

    #[test]
    fn test_leaf_reports_stored_percentage() {
        let repo = setup_repo();
        let owner = owner();
        let leaf = repo.seed_task(&owner, "Leaf", None);
        repo.run_in_transaction(|tx| tx.set_completion_percentage(&leaf.id, 40))
            .unwrap();
        let resolver = CompletionResolver::new(&repo, &owner);

        assert_eq!(resolver.effective_completion_percentage(&leaf.id).unwrap(), 40);
    }

    #[test]
    fn test_ready_tasks_skip_blocked_and_completed() {
        let repo = setup_repo();
        let owner = owner();
        let done = repo.seed_task(&owner, "Done", None);
        repo.complete(&done);
        let waiting = repo.seed_task(&owner, "Waiting", None);
        let first = repo.seed_task(&owner, "First", None);
        repo.seed_edge(&waiting, &first);
        let resolver = CompletionResolver::new(&repo, &owner);

        let ready: Vec<_> = resolver.ready_tasks().unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(ready, vec![first.id.clone()]);
        assert_eq!(resolver.dependents(&first.id).unwrap(), vec![waiting.id]);
    }
}
