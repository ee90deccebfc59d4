//! Prerequisite edge rules: no self-dependency, no cycles, bounded chains.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::core::hierarchy::verdict;
use crate::db::NodeReader;
use crate::error::{DependencyError, GraphError, Result};
use crate::id::{OwnerId, TaskId};
use crate::types::Verdict;

/// Which way a traversal follows edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// dependent -> prerequisite ("what does it wait for")
    Upstream,
    /// prerequisite -> dependent ("what waits for it")
    Downstream,
}

pub struct DependencyValidator<'a, R: NodeReader + ?Sized> {
    repo: &'a R,
    owner: &'a OwnerId,
    limit: u32,
}

impl<'a, R: NodeReader + ?Sized> DependencyValidator<'a, R> {
    pub fn new(repo: &'a R, owner: &'a OwnerId, limit: u32) -> Self {
        Self { repo, owner, limit }
    }

    fn is_visible(&self, id: &TaskId) -> Result<bool> {
        Ok(self
            .repo
            .get_node(id)?
            .is_some_and(|node| node.is_visible_to(self.owner)))
    }

    /// Neighbours of `id` over active edges whose far end is a live node of
    /// the owner.
    fn neighbours(&self, id: &TaskId, direction: Direction) -> Result<Vec<TaskId>> {
        let edges = match direction {
            Direction::Upstream => self.repo.get_active_edges_where_dependent(id)?,
            Direction::Downstream => self.repo.get_active_edges_where_prerequisite(id)?,
        };
        let mut out = Vec::with_capacity(edges.len());
        for edge in edges {
            if &edge.owner_id != self.owner {
                continue;
            }
            let far = match direction {
                Direction::Upstream => edge.prerequisite_id,
                Direction::Downstream => edge.dependent_id,
            };
            if self.is_visible(&far)? {
                out.push(far);
            }
        }
        Ok(out)
    }

    /// Checks that `dependent` may start waiting on `prerequisite`. Read-only.
    pub fn validate(&self, dependent: &TaskId, prerequisite: &TaskId) -> Result<()> {
        if dependent == prerequisite {
            return Err(DependencyError::SelfDependency(dependent.clone()).into());
        }
        for id in [dependent, prerequisite] {
            if !self.is_visible(id)? {
                return Err(DependencyError::NotFound(id.clone()).into());
            }
        }

        if self.depends_on(prerequisite, dependent)? {
            return Err(DependencyError::CircularDependency {
                dependent_id: dependent.clone(),
                prerequisite_id: prerequisite.clone(),
            }
            .into());
        }

        let up = self.longest_chain(prerequisite, Direction::Upstream)?;
        let down = self.longest_chain(dependent, Direction::Downstream)?;
        let chain = up.saturating_add(down).saturating_add(1);
        trace!(%dependent, %prerequisite, up, down, limit = self.limit, "dependency check");
        if chain > self.limit {
            return Err(DependencyError::DependencyDepthLimitExceeded {
                depth: chain,
                limit: self.limit,
            }
            .into());
        }
        Ok(())
    }

    pub fn can_add_dependency(&self, dependent: &TaskId, prerequisite: &TaskId) -> Result<Verdict> {
        verdict(self.validate(dependent, prerequisite))
    }

    /// True when `from` transitively waits for `target`.
    pub fn depends_on(&self, from: &TaskId, target: &TaskId) -> Result<bool> {
        let mut visited = HashSet::new();
        let mut stack = vec![from.clone()];

        while let Some(current) = stack.pop() {
            if &current == target {
                return Ok(true);
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            stack.extend(self.neighbours(&current, Direction::Upstream)?);
        }
        Ok(false)
    }

    /// Longest chain, in edges, starting at `id` in `direction`. Stops as soon
    /// as it exceeds the limit, so the value saturates at `limit + 1`.
    fn longest_chain(&self, id: &TaskId, direction: Direction) -> Result<u32> {
        let mut walk = ChainWalk {
            validator: self,
            direction,
            memo: HashMap::new(),
            on_path: HashSet::new(),
        };
        walk.longest_from(id, self.limit.saturating_add(1))
    }

    /// Longest chain of prerequisites below `id`.
    pub fn upstream_length(&self, id: &TaskId) -> Result<u32> {
        self.longest_chain(id, Direction::Upstream)
    }

    /// Longest chain of dependents above `id`.
    pub fn downstream_length(&self, id: &TaskId) -> Result<u32> {
        self.longest_chain(id, Direction::Downstream)
    }
}

struct ChainWalk<'v, 'a, R: NodeReader + ?Sized> {
    validator: &'v DependencyValidator<'a, R>,
    direction: Direction,
    /// id -> (length found, budget it was searched with)
    memo: HashMap<TaskId, (u32, u32)>,
    on_path: HashSet<TaskId>,
}

impl<R: NodeReader + ?Sized> ChainWalk<'_, '_, R> {
    /// Longest chain from `id`, saturating at `budget`. Never descends more
    /// than `budget` edges, however long the stored chain is.
    fn longest_from(&mut self, id: &TaskId, budget: u32) -> Result<u32> {
        if budget == 0 {
            return Ok(0);
        }
        if let Some(&(length, searched)) = self.memo.get(id) {
            // Below its budget the length is exact; at it, only a lower bound
            if length < searched || searched >= budget {
                return Ok(length.min(budget));
            }
        }
        if !self.on_path.insert(id.clone()) {
            return Err(GraphError::Integrity(format!(
                "dependency cycle through {id}"
            )));
        }

        let mut best = 0u32;
        for next in self.validator.neighbours(id, self.direction)? {
            let length = self.longest_from(&next, budget - 1)? + 1;
            best = best.max(length);
            if best >= budget {
                break;
            }
        }

        self.on_path.remove(id);
        self.memo.insert(id.clone(), (best, budget));
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NodeRepository, SqliteRepository};
    use crate::error::ErrorKind;
    use crate::testutil::{owner, GraphFixture};

    fn setup_repo() -> SqliteRepository {
        SqliteRepository::open_in_memory().unwrap()
    }

    #[test]
    fn test_self_dependency_for_unknown_id() {
        let repo = setup_repo();
        let owner = owner();
        let validator = DependencyValidator::new(&repo, &owner, 5);
        let ghost = TaskId::new();

        let verdict = validator.can_add_dependency(&ghost, &ghost).unwrap();
        assert_eq!(verdict, Verdict::rejected(ErrorKind::SelfDependency));
    }

    #[test]
    fn test_transitive_cycle_rejected() {
        let repo = setup_repo();
        let owner = owner();
        let p1 = repo.seed_task(&owner, "P1", None);
        let p2 = repo.seed_task(&owner, "P2", None);
        let p3 = repo.seed_task(&owner, "P3", None);
        repo.seed_edge(&p2, &p1);
        repo.seed_edge(&p3, &p2);
        let validator = DependencyValidator::new(&repo, &owner, 5);

        let result = validator.validate(&p1.id, &p3.id);
        assert!(matches!(
            result,
            Err(GraphError::Dependency(DependencyError::CircularDependency { .. }))
        ));
        // The other direction only duplicates the existing chain
        validator.validate(&p3.id, &p1.id).unwrap();
    }

    #[test]
    fn test_inactive_edge_does_not_close_cycle() {
        let repo = setup_repo();
        let owner = owner();
        let a = repo.seed_task(&owner, "A", None);
        let b = repo.seed_task(&owner, "B", None);
        let edge = repo.seed_edge(&b, &a);
        repo.run_in_transaction(|tx| tx.set_edge_active(&edge.id, false))
            .unwrap();
        let validator = DependencyValidator::new(&repo, &owner, 5);

        validator.validate(&a.id, &b.id).unwrap();
    }

    #[test]
    fn test_chain_length_limit() {
        let repo = setup_repo();
        let owner = owner();
        let tasks: Vec<_> = (0..7)
            .map(|i| repo.seed_task(&owner, &format!("T{i}"), None))
            .collect();
        // T1 waits for T0, T2 for T1, ... T5 for T4: five edges
        for pair in tasks[..6].windows(2) {
            repo.seed_edge(&pair[1], &pair[0]);
        }
        let validator = DependencyValidator::new(&repo, &owner, 5);
        assert_eq!(validator.upstream_length(&tasks[5].id).unwrap(), 5);
        assert_eq!(validator.downstream_length(&tasks[0].id).unwrap(), 5);

        let result = validator.validate(&tasks[6].id, &tasks[5].id);
        assert!(matches!(
            result,
            Err(GraphError::Dependency(
                DependencyError::DependencyDepthLimitExceeded { depth: 6, limit: 5 }
            ))
        ));

        // A wider limit lets the same edge through
        let relaxed = DependencyValidator::new(&repo, &owner, 6);
        relaxed.validate(&tasks[6].id, &tasks[5].id).unwrap();
    }

    #[test]
    fn test_long_stored_chain_walk_stops_at_limit() {
        let repo = setup_repo();
        let owner = owner();
        let tasks: Vec<_> = (0..40)
            .map(|i| repo.seed_task(&owner, &format!("T{i}"), None))
            .collect();
        for pair in tasks.windows(2) {
            repo.seed_edge(&pair[1], &pair[0]);
        }
        // Close a loop far past the limit: a full walk would report it
        repo.seed_edge(&tasks[0], &tasks[39]);
        let validator = DependencyValidator::new(&repo, &owner, 3);

        assert_eq!(validator.upstream_length(&tasks[39].id).unwrap(), 4);
        assert_eq!(validator.downstream_length(&tasks[0].id).unwrap(), 4);
    }

    #[test]
    fn test_shared_prerequisite_counts_its_full_tail() {
        let repo = setup_repo();
        let owner = owner();
        let top = repo.seed_task(&owner, "Top", None);
        let near = repo.seed_task(&owner, "Near", None);
        let shared = repo.seed_task(&owner, "Shared", None);
        let tail: Vec<_> = (0..3)
            .map(|i| repo.seed_task(&owner, &format!("Tail{i}"), None))
            .collect();
        // Top -> Near -> Shared and Top -> Shared; Shared heads a 3-edge tail
        repo.seed_edge(&top, &near);
        repo.seed_edge(&near, &shared);
        repo.seed_edge(&top, &shared);
        repo.seed_edge(&shared, &tail[0]);
        repo.seed_edge(&tail[0], &tail[1]);
        repo.seed_edge(&tail[1], &tail[2]);
        let validator = DependencyValidator::new(&repo, &owner, 10);

        assert_eq!(validator.upstream_length(&top.id).unwrap(), 5);
        let tight = DependencyValidator::new(&repo, &owner, 4);
        assert_eq!(tight.upstream_length(&top.id).unwrap(), 5);
        assert_eq!(tight.upstream_length(&near.id).unwrap(), 4);
    }

    #[test]
    fn test_missing_endpoint_not_found() {
        let repo = setup_repo();
        let owner = owner();
        let a = repo.seed_task(&owner, "A", None);
        let gone = repo.seed_task(&owner, "Gone", None);
        repo.deactivate(&gone);
        let validator = DependencyValidator::new(&repo, &owner, 5);

        let result = validator.validate(&a.id, &gone.id);
        assert!(matches!(
            result,
            Err(GraphError::Dependency(DependencyError::NotFound(id))) if id == gone.id
        ));
    }

    #[test]
    fn test_stored_cycle_reported_as_integrity_error() {
        let repo = setup_repo();
        let owner = owner();
        let a = repo.seed_task(&owner, "A", None);
        let b = repo.seed_task(&owner, "B", None);
        let c = repo.seed_task(&owner, "C", None);
        repo.seed_edge(&a, &b);
        repo.seed_edge(&b, &a);
        let validator = DependencyValidator::new(&repo, &owner, 5);

        assert!(matches!(
            validator.upstream_length(&a.id),
            Err(GraphError::Integrity(_))
        ));
        // Cycle search itself still terminates
        assert!(!validator.depends_on(&a.id, &c.id).unwrap());
    }
}
