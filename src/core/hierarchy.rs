//! Parent/child rules: no self-parenting, no cycles through the ancestor
//! chain, no chain longer than the depth limit.

use std::collections::{HashSet, VecDeque};

use tracing::trace;

use crate::db::NodeReader;
use crate::error::{GraphError, HierarchyError, Result};
use crate::id::{OwnerId, TaskId};
use crate::types::{TaskNode, Verdict};

pub struct HierarchyValidator<'a, R: NodeReader + ?Sized> {
    repo: &'a R,
    owner: &'a OwnerId,
    limit: u32,
}

impl<'a, R: NodeReader + ?Sized> HierarchyValidator<'a, R> {
    pub fn new(repo: &'a R, owner: &'a OwnerId, limit: u32) -> Self {
        Self { repo, owner, limit }
    }

    /// The node if it is active and belongs to the owner.
    fn visible(&self, id: &TaskId) -> Result<Option<TaskNode>> {
        Ok(self
            .repo
            .get_node(id)?
            .filter(|node| node.is_visible_to(self.owner)))
    }

    fn resolve(&self, id: &TaskId) -> Result<TaskNode> {
        self.visible(id)?
            .ok_or_else(|| HierarchyError::NotFound(id.clone()).into())
    }

    /// Checks that `node_id` may be placed under `candidate` (`None` = make
    /// it a root). Read-only.
    pub fn validate(&self, node_id: &TaskId, candidate: Option<&TaskId>) -> Result<()> {
        let Some(candidate) = candidate else {
            self.resolve(node_id)?;
            return Ok(());
        };

        if candidate == node_id {
            return Err(HierarchyError::SelfReference(node_id.clone()).into());
        }
        self.resolve(node_id)?;
        let parent = self.resolve(candidate)?;

        let parent_depth = self.bounded_depth(&parent, Some(node_id))?;
        let height = self.subtree_height_capped(node_id, self.limit)?;
        let deepest = parent_depth + 1 + height;
        trace!(%node_id, %candidate, parent_depth, height, limit = self.limit, "reparent check");
        if deepest > self.limit {
            return Err(HierarchyError::DepthLimitExceeded {
                depth: deepest,
                limit: self.limit,
            }
            .into());
        }
        Ok(())
    }

    /// Checks that a brand-new (childless) task may be created under `parent_id`.
    pub fn validate_new_child(&self, parent_id: &TaskId) -> Result<()> {
        let parent = self.resolve(parent_id)?;
        let depth = self.bounded_depth(&parent, None)? + 1;
        if depth > self.limit {
            return Err(HierarchyError::DepthLimitExceeded {
                depth,
                limit: self.limit,
            }
            .into());
        }
        Ok(())
    }

    pub fn can_set_parent(&self, node_id: &TaskId, candidate: Option<&TaskId>) -> Result<Verdict> {
        verdict(self.validate(node_id, candidate))
    }

    /// Depth of `start` found by walking up at most `limit` steps. Fails with
    /// `CircularReference` when `forbidden` shows up on the way, and with
    /// `DepthLimitExceeded` when no root is reached in time.
    fn bounded_depth(&self, start: &TaskNode, forbidden: Option<&TaskId>) -> Result<u32> {
        let mut depth = 0u32;
        let mut current = start.clone();
        loop {
            if let Some(forbidden) = forbidden {
                if &current.id == forbidden {
                    return Err(HierarchyError::CircularReference {
                        task_id: forbidden.clone(),
                        parent_id: start.id.clone(),
                    }
                    .into());
                }
            }
            let Some(parent) = self.parent_of(&current)? else {
                return Ok(depth);
            };
            depth += 1;
            if depth > self.limit {
                return Err(HierarchyError::DepthLimitExceeded {
                    depth,
                    limit: self.limit,
                }
                .into());
            }
            current = parent;
        }
    }

    fn parent_of(&self, node: &TaskNode) -> Result<Option<TaskNode>> {
        match node.parent_id {
            Some(ref parent_id) => self.visible(parent_id),
            None => Ok(None),
        }
    }

    /// Edges between `id` and its root.
    pub fn compute_depth(&self, id: &TaskId) -> Result<u32> {
        Ok(self.ancestors(id)?.len() as u32)
    }

    /// Active ancestors, nearest first.
    pub fn ancestors(&self, id: &TaskId) -> Result<Vec<TaskNode>> {
        let node = self
            .visible(id)?
            .ok_or_else(|| GraphError::TaskNotFound(id.clone()))?;
        let mut seen = HashSet::from([node.id.clone()]);
        let mut chain = Vec::new();
        let mut current = node;
        while let Some(parent) = self.parent_of(&current)? {
            if !seen.insert(parent.id.clone()) {
                return Err(GraphError::Integrity(format!(
                    "parent chain of {id} loops through {}",
                    parent.id
                )));
            }
            chain.push(parent.clone());
            current = parent;
        }
        Ok(chain)
    }

    /// Longest path, in edges, from `id` down to an active descendant.
    pub fn subtree_height(&self, id: &TaskId) -> Result<u32> {
        self.subtree_height_capped(id, u32::MAX)
    }

    // Stops one level past `cap`; callers only need to know it is too deep.
    fn subtree_height_capped(&self, id: &TaskId, cap: u32) -> Result<u32> {
        let mut seen = HashSet::from([id.clone()]);
        let mut frontier = vec![id.clone()];
        let mut height = 0u32;
        loop {
            let mut next = Vec::new();
            for parent_id in &frontier {
                for child in self.repo.get_children(parent_id)? {
                    if child.is_visible_to(self.owner) && seen.insert(child.id.clone()) {
                        next.push(child.id);
                    }
                }
            }
            if next.is_empty() {
                return Ok(height);
            }
            height += 1;
            if height > cap {
                return Ok(height);
            }
            frontier = next;
        }
    }

    /// Active descendants of `id`, breadth-first.
    pub fn descendants(&self, id: &TaskId) -> Result<Vec<TaskNode>> {
        let mut seen = HashSet::from([id.clone()]);
        let mut queue = VecDeque::from([id.clone()]);
        let mut out = Vec::new();
        while let Some(current) = queue.pop_front() {
            for child in self.repo.get_children(&current)? {
                if child.is_visible_to(self.owner) && seen.insert(child.id.clone()) {
                    queue.push_back(child.id.clone());
                    out.push(child);
                }
            }
        }
        Ok(out)
    }
}

/// Turns a validation result into a verdict, passing system faults through.
pub(crate) fn verdict(result: Result<()>) -> Result<Verdict> {
    match result {
        Ok(()) => Ok(Verdict::allowed()),
        Err(err) if err.is_rejection() => Ok(Verdict::rejected(err.kind())),
        Err(err) => Err(err),
    }
}
