//! Graph mutation coordinator.
//!
//! Every structural write goes through here: take the owner lock, read the
//! owner's graph version, validate against committed state, write in one
//! transaction that advances the version, invalidate derived state, release.

use std::collections::BTreeMap;
use std::sync::PoisonError;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::GraphConfig;
use crate::core::cache::{DerivedCache, Epoch};
use crate::core::dependency::DependencyValidator;
use crate::core::hierarchy::HierarchyValidator;
use crate::core::locks::OwnerLocks;
use crate::core::resolver::CompletionResolver;
use crate::db::{NodeReader, NodeRepository, NodeWriter};
use crate::error::{GraphError, Result};
use crate::id::{EdgeId, OwnerId, TaskId};
use crate::types::{
    ChildPolicy, DeactivationReport, DependencyEdge, DependencyType, GraphSnapshot,
    ListTasksFilter, NewTask, TaskNode, TaskView, Verdict,
};

/// A commit that loses the version race is retried once against fresh state.
const MAX_ATTEMPTS: u32 = 2;

/// Result of one successful attempt plus the tasks whose derived state changed.
struct Applied<T> {
    value: T,
    touched: Vec<TaskId>,
    wrote: bool,
}

impl<T> Applied<T> {
    fn new(value: T, touched: Vec<TaskId>) -> Self {
        Self {
            value,
            touched,
            wrote: true,
        }
    }

    fn unchanged(value: T) -> Self {
        Self {
            value,
            touched: Vec::new(),
            wrote: false,
        }
    }
}

/// Lock contention reported by the store means another writer won.
fn classify(err: GraphError, owner: &OwnerId) -> GraphError {
    match err {
        GraphError::Storage(err) => GraphError::from_storage(err, owner),
        other => other,
    }
}

fn reload(tx: &dyn NodeWriter, id: &TaskId) -> Result<TaskNode> {
    tx.get_node(id)?
        .ok_or_else(|| GraphError::TaskNotFound(id.clone()))
}

fn ids(nodes: Vec<TaskNode>) -> Vec<TaskId> {
    nodes.into_iter().map(|node| node.id).collect()
}

pub struct GraphCoordinator<R: NodeRepository> {
    repo: R,
    config: GraphConfig,
    locks: OwnerLocks,
    cache: DerivedCache,
}

impl<R: NodeRepository> GraphCoordinator<R> {
    pub fn new(repo: R, config: GraphConfig) -> Self {
        let cache = DerivedCache::new(config.cache_derived_state);
        Self {
            repo,
            config,
            locks: OwnerLocks::new(),
            cache,
        }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn cache(&self) -> &DerivedCache {
        &self.cache
    }

    fn hierarchy<'a>(&'a self, owner: &'a OwnerId) -> HierarchyValidator<'a, R> {
        HierarchyValidator::new(&self.repo, owner, self.config.max_hierarchy_depth)
    }

    fn dependencies<'a>(&'a self, owner: &'a OwnerId) -> DependencyValidator<'a, R> {
        DependencyValidator::new(&self.repo, owner, self.config.dependency_depth_limit())
    }

    fn resolver<'a>(&'a self, owner: &'a OwnerId) -> CompletionResolver<'a, R> {
        CompletionResolver::new(&self.repo, owner)
    }

    /// Runs `attempt` under the owner lock with the current graph version.
    fn mutate<T>(
        &self,
        owner: &OwnerId,
        op: &'static str,
        mut attempt: impl FnMut(i64) -> Result<Applied<T>>,
    ) -> Result<T> {
        let lock = self.locks.lock_for(owner);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut tries = 1;
        loop {
            let result = self
                .repo
                .graph_version(owner)
                .and_then(|version| attempt(version).map(|applied| (version, applied)))
                .map_err(|err| classify(err, owner));

            match result {
                Ok((version, applied)) => {
                    self.cache.invalidate(owner, &applied.touched);
                    if applied.wrote {
                        self.cache.committed(owner, version, version + 1);
                    }
                    debug!(%owner, op, touched = applied.touched.len(), "graph mutation applied");
                    return Ok(applied.value);
                }
                Err(GraphError::Conflict { .. }) if tries < MAX_ATTEMPTS => {
                    // Someone outside this lock wrote: cached state is suspect too
                    self.cache.clear();
                    warn!(%owner, op, attempt = tries, "graph changed concurrently, retrying");
                    tries += 1;
                }
                Err(err) => {
                    if matches!(err, GraphError::Conflict { .. }) {
                        self.cache.clear();
                    }
                    return Err(err);
                }
            }
        }
    }

    // ============ Writes ============

    pub fn create_task(&self, owner: &OwnerId, input: NewTask) -> Result<TaskNode> {
        let title = input.title.trim();
        if title.is_empty() {
            return Err(GraphError::EmptyTitle);
        }
        let percentage = input.completion_percentage.unwrap_or(0);
        if percentage > 100 {
            return Err(GraphError::InvalidPercentage(percentage.into()));
        }

        self.mutate(owner, "create_task", |version| {
            if let Some(ref parent_id) = input.parent_id {
                self.hierarchy(owner).validate_new_child(parent_id)?;
            }
            let mut node = TaskNode::new(owner.clone(), title);
            node.parent_id = input.parent_id.clone();
            node.completion_percentage = percentage;

            self.repo.run_in_transaction(|tx| {
                tx.advance_graph_version(owner, version)?;
                tx.insert_node(&node)
            })?;
            Ok(Applied::new(node.clone(), vec![node.id]))
        })
    }

    /// Moves `task_id` under `new_parent`, or makes it a root when `None`.
    pub fn reparent(
        &self,
        owner: &OwnerId,
        task_id: &TaskId,
        new_parent: Option<&TaskId>,
    ) -> Result<TaskNode> {
        self.mutate(owner, "reparent", |version| {
            let hierarchy = self.hierarchy(owner);
            hierarchy.validate(task_id, new_parent)?;
            let mut touched = ids(hierarchy.descendants(task_id)?);
            touched.push(task_id.clone());

            let node = self.repo.run_in_transaction(|tx| {
                tx.advance_graph_version(owner, version)?;
                tx.update_parent(task_id, new_parent)?;
                reload(tx, task_id)
            })?;
            Ok(Applied::new(node, touched))
        })
    }

    /// Records that `dependent` waits for `prerequisite`. Adding a pair that
    /// is already linked returns the existing edge unchanged.
    pub fn add_dependency(
        &self,
        owner: &OwnerId,
        dependent: &TaskId,
        prerequisite: &TaskId,
        kind: DependencyType,
    ) -> Result<DependencyEdge> {
        self.mutate(owner, "add_dependency", |version| {
            self.dependencies(owner).validate(dependent, prerequisite)?;
            if let Some(existing) = self.active_edge_between(owner, dependent, prerequisite)? {
                return Ok(Applied::unchanged(existing));
            }

            let edge = DependencyEdge::new(
                owner.clone(),
                dependent.clone(),
                prerequisite.clone(),
                kind,
            );
            self.repo.run_in_transaction(|tx| {
                tx.advance_graph_version(owner, version)?;
                tx.insert_edge(&edge)
            })?;
            Ok(Applied::new(edge, vec![dependent.clone()]))
        })
    }

    pub fn remove_dependency(&self, owner: &OwnerId, edge_id: &EdgeId) -> Result<DependencyEdge> {
        self.mutate(owner, "remove_dependency", |version| {
            let edge = self
                .repo
                .get_edge(edge_id)?
                .filter(|edge| edge.active && &edge.owner_id == owner)
                .ok_or_else(|| GraphError::EdgeNotFound(edge_id.clone()))?;
            self.deactivate_edge(owner, version, edge)
        })
    }

    pub fn remove_dependency_between(
        &self,
        owner: &OwnerId,
        dependent: &TaskId,
        prerequisite: &TaskId,
    ) -> Result<DependencyEdge> {
        self.mutate(owner, "remove_dependency", |version| {
            let edge = self
                .active_edge_between(owner, dependent, prerequisite)?
                .ok_or_else(|| GraphError::DependencyNotFound {
                    dependent_id: dependent.clone(),
                    prerequisite_id: prerequisite.clone(),
                })?;
            self.deactivate_edge(owner, version, edge)
        })
    }

    fn deactivate_edge(
        &self,
        owner: &OwnerId,
        version: i64,
        mut edge: DependencyEdge,
    ) -> Result<Applied<DependencyEdge>> {
        self.repo.run_in_transaction(|tx| {
            tx.advance_graph_version(owner, version)?;
            tx.set_edge_active(&edge.id, false)
        })?;
        edge.active = false;
        let touched = vec![edge.dependent_id.clone()];
        Ok(Applied::new(edge, touched))
    }

    /// Completes or reopens a task. Dependents are not touched; their blocked
    /// state follows on the next read.
    pub fn set_completed(
        &self,
        owner: &OwnerId,
        task_id: &TaskId,
        completed: bool,
    ) -> Result<TaskNode> {
        let op = if completed { "complete" } else { "reopen" };
        self.mutate(owner, op, |version| {
            self.visible_node(owner, task_id)?;
            let mut touched = self.resolver(owner).dependents(task_id)?;
            touched.push(task_id.clone());

            let node = self.repo.run_in_transaction(|tx| {
                tx.advance_graph_version(owner, version)?;
                tx.set_completed(task_id, completed)?;
                reload(tx, task_id)
            })?;
            Ok(Applied::new(node, touched))
        })
    }

    pub fn set_completion_percentage(
        &self,
        owner: &OwnerId,
        task_id: &TaskId,
        percentage: u8,
    ) -> Result<TaskNode> {
        if percentage > 100 {
            return Err(GraphError::InvalidPercentage(percentage.into()));
        }
        self.mutate(owner, "set_completion_percentage", |version| {
            self.visible_node(owner, task_id)?;
            let node = self.repo.run_in_transaction(|tx| {
                tx.advance_graph_version(owner, version)?;
                tx.set_completion_percentage(task_id, percentage)?;
                reload(tx, task_id)
            })?;
            Ok(Applied::new(node, vec![task_id.clone()]))
        })
    }

    /// Soft-deletes a task together with every edge touching it. Children are
    /// handled according to the configured [`ChildPolicy`].
    pub fn deactivate_task(&self, owner: &OwnerId, task_id: &TaskId) -> Result<DeactivationReport> {
        let policy = self.config.child_policy;
        self.mutate(owner, "deactivate_task", |version| {
            let node = self.visible_node(owner, task_id)?;
            let hierarchy = self.hierarchy(owner);

            let mut targets = vec![node.id.clone()];
            let mut moved = Vec::new();
            let mut touched = Vec::new();
            match policy {
                ChildPolicy::Cascade => targets.extend(ids(hierarchy.descendants(task_id)?)),
                ChildPolicy::Detach | ChildPolicy::ReparentToGrandparent => {
                    moved = ids(self.children(owner, task_id)?);
                    touched.extend(ids(hierarchy.descendants(task_id)?));
                }
            }
            let new_parent = match policy {
                ChildPolicy::ReparentToGrandparent => node.parent_id.clone(),
                ChildPolicy::Cascade | ChildPolicy::Detach => None,
            };

            let mut edges = BTreeMap::new();
            for id in &targets {
                let incoming = self.repo.get_active_edges_where_dependent(id)?;
                let outgoing = self.repo.get_active_edges_where_prerequisite(id)?;
                for edge in incoming.into_iter().chain(outgoing) {
                    if &edge.owner_id == owner {
                        edges.insert(edge.id.clone(), edge);
                    }
                }
            }
            touched.extend(targets.iter().cloned());
            touched.extend(edges.values().map(|edge| edge.dependent_id.clone()));

            self.repo.run_in_transaction(|tx| {
                tx.advance_graph_version(owner, version)?;
                for edge_id in edges.keys() {
                    tx.set_edge_active(edge_id, false)?;
                }
                for id in &targets {
                    tx.set_node_active(id, false)?;
                }
                for id in &moved {
                    tx.update_parent(id, new_parent.as_ref())?;
                }
                Ok(())
            })?;

            info!(
                %owner,
                task = %task_id,
                ?policy,
                tasks = targets.len(),
                edges = edges.len(),
                moved = moved.len(),
                "task deactivated"
            );
            let report = DeactivationReport {
                deactivated_tasks: targets,
                deactivated_edges: edges.into_keys().collect(),
                moved_children: moved,
            };
            Ok(Applied::new(report, touched))
        })
    }

    /// Brings a deactivated task back as a root with no dependencies.
    pub fn reactivate_task(&self, owner: &OwnerId, task_id: &TaskId) -> Result<TaskNode> {
        self.mutate(owner, "reactivate_task", |version| {
            let node = self.owned_node(owner, task_id)?;
            if node.active {
                return Ok(Applied::unchanged(node));
            }
            let node = self.repo.run_in_transaction(|tx| {
                tx.advance_graph_version(owner, version)?;
                tx.update_parent(task_id, None)?;
                tx.set_node_active(task_id, true)?;
                reload(tx, task_id)
            })?;
            Ok(Applied::new(node, vec![task_id.clone()]))
        })
    }

    // ============ Validation ============

    pub fn validate_reparent(
        &self,
        owner: &OwnerId,
        task_id: &TaskId,
        new_parent: Option<&TaskId>,
    ) -> Result<()> {
        self.hierarchy(owner).validate(task_id, new_parent)
    }

    pub fn can_set_parent(
        &self,
        owner: &OwnerId,
        task_id: &TaskId,
        new_parent: Option<&TaskId>,
    ) -> Result<Verdict> {
        self.hierarchy(owner).can_set_parent(task_id, new_parent)
    }

    pub fn validate_add_dependency(
        &self,
        owner: &OwnerId,
        dependent: &TaskId,
        prerequisite: &TaskId,
    ) -> Result<()> {
        self.dependencies(owner).validate(dependent, prerequisite)
    }

    pub fn can_add_dependency(
        &self,
        owner: &OwnerId,
        dependent: &TaskId,
        prerequisite: &TaskId,
    ) -> Result<Verdict> {
        self.dependencies(owner)
            .can_add_dependency(dependent, prerequisite)
    }

    // ============ Derived state ============

    /// Syncs the cache with the stored graph version of `owner`, so writes
    /// from other coordinators or processes evict what they made stale.
    fn cache_epoch(&self, owner: &OwnerId) -> Result<Epoch> {
        if !self.cache.is_enabled() {
            return Ok(self.cache.epoch());
        }
        let version = self.repo.graph_version(owner)?;
        Ok(self.cache.observe(owner, version))
    }

    pub fn is_blocked(&self, owner: &OwnerId, task_id: &TaskId) -> Result<bool> {
        let epoch = self.cache_epoch(owner)?;
        self.visible_node(owner, task_id)?;
        if let Some(blocked) = self.cache.get(owner, task_id).blocked {
            return Ok(blocked);
        }
        let blocked = self.resolver(owner).is_blocked(task_id)?;
        self.cache.store_blocked(owner, task_id, blocked, epoch);
        Ok(blocked)
    }

    pub fn can_start(&self, owner: &OwnerId, task_id: &TaskId) -> Result<bool> {
        Ok(!self.is_blocked(owner, task_id)?)
    }

    pub fn blocking_prerequisites(&self, owner: &OwnerId, task_id: &TaskId) -> Result<Vec<TaskId>> {
        self.resolver(owner).blocking_prerequisites(task_id)
    }

    pub fn compute_depth(&self, owner: &OwnerId, task_id: &TaskId) -> Result<u32> {
        let epoch = self.cache_epoch(owner)?;
        self.visible_node(owner, task_id)?;
        if let Some(depth) = self.cache.get(owner, task_id).depth {
            return Ok(depth);
        }
        let depth = self.hierarchy(owner).compute_depth(task_id)?;
        self.cache.store_depth(owner, task_id, depth, epoch);
        Ok(depth)
    }

    pub fn ancestors(&self, owner: &OwnerId, task_id: &TaskId) -> Result<Vec<TaskNode>> {
        self.hierarchy(owner).ancestors(task_id)
    }

    pub fn descendants(&self, owner: &OwnerId, task_id: &TaskId) -> Result<Vec<TaskNode>> {
        self.visible_node(owner, task_id)?;
        self.hierarchy(owner).descendants(task_id)
    }

    pub fn effective_completion_percentage(&self, owner: &OwnerId, task_id: &TaskId) -> Result<u8> {
        self.resolver(owner).effective_completion_percentage(task_id)
    }

    pub fn ready_tasks(&self, owner: &OwnerId) -> Result<Vec<TaskNode>> {
        self.resolver(owner).ready_tasks()
    }

    // ============ Reads ============

    /// The task if it belongs to `owner`, deactivated or not.
    fn owned_node(&self, owner: &OwnerId, task_id: &TaskId) -> Result<TaskNode> {
        self.repo
            .get_node(task_id)?
            .filter(|node| &node.owner_id == owner)
            .ok_or_else(|| GraphError::TaskNotFound(task_id.clone()))
    }

    fn visible_node(&self, owner: &OwnerId, task_id: &TaskId) -> Result<TaskNode> {
        self.repo
            .get_node(task_id)?
            .filter(|node| node.is_visible_to(owner))
            .ok_or_else(|| GraphError::TaskNotFound(task_id.clone()))
    }

    fn active_edge_between(
        &self,
        owner: &OwnerId,
        dependent: &TaskId,
        prerequisite: &TaskId,
    ) -> Result<Option<DependencyEdge>> {
        Ok(self
            .repo
            .get_active_edges_where_dependent(dependent)?
            .into_iter()
            .find(|edge| &edge.owner_id == owner && &edge.prerequisite_id == prerequisite))
    }

    pub fn get_task(&self, owner: &OwnerId, task_id: &TaskId) -> Result<TaskNode> {
        self.owned_node(owner, task_id)
    }

    /// The task with its derived state. A deactivated task reports no graph
    /// relations.
    pub fn get_task_view(&self, owner: &OwnerId, task_id: &TaskId) -> Result<TaskView> {
        let node = self.owned_node(owner, task_id)?;
        if !node.active {
            return Ok(TaskView {
                effective_completion_percentage: node.completion_percentage,
                node,
                depth: 0,
                blocked: false,
                blocked_by: Vec::new(),
                blocks: Vec::new(),
            });
        }

        let resolver = self.resolver(owner);
        let blocked_by = resolver.blocking_prerequisites(task_id)?;
        Ok(TaskView {
            depth: self.compute_depth(owner, task_id)?,
            blocked: !blocked_by.is_empty(),
            blocked_by,
            blocks: resolver.dependents(task_id)?,
            effective_completion_percentage: resolver.effective_completion_percentage(task_id)?,
            node,
        })
    }

    pub fn list_tasks(&self, owner: &OwnerId, filter: &ListTasksFilter) -> Result<Vec<TaskNode>> {
        let tasks = self
            .repo
            .list_nodes(owner)?
            .into_iter()
            .filter(|node| filter.include_inactive || node.active)
            .filter(|node| {
                filter
                    .parent_id
                    .as_ref()
                    .is_none_or(|parent| node.parent_id.as_ref() == Some(parent))
            })
            .filter(|node| !filter.roots_only || node.parent_id.is_none())
            .filter(|node| filter.completed.is_none_or(|done| node.completed == done))
            .collect();
        Ok(tasks)
    }

    /// Active children of `task_id`.
    pub fn children(&self, owner: &OwnerId, task_id: &TaskId) -> Result<Vec<TaskNode>> {
        self.owned_node(owner, task_id)?;
        Ok(self
            .repo
            .get_children(task_id)?
            .into_iter()
            .filter(|child| child.is_visible_to(owner))
            .collect())
    }

    /// Active edges on which `task_id` waits.
    pub fn dependencies_of(&self, owner: &OwnerId, task_id: &TaskId) -> Result<Vec<DependencyEdge>> {
        self.owned_node(owner, task_id)?;
        Ok(self
            .repo
            .get_active_edges_where_dependent(task_id)?
            .into_iter()
            .filter(|edge| &edge.owner_id == owner)
            .collect())
    }

    /// Active edges that wait on `task_id`.
    pub fn dependents_of(&self, owner: &OwnerId, task_id: &TaskId) -> Result<Vec<DependencyEdge>> {
        self.owned_node(owner, task_id)?;
        Ok(self
            .repo
            .get_active_edges_where_prerequisite(task_id)?
            .into_iter()
            .filter(|edge| &edge.owner_id == owner)
            .collect())
    }

    /// Consistent export of the owner's whole graph, inactive records included.
    pub fn snapshot(&self, owner: &OwnerId) -> Result<GraphSnapshot> {
        let lock = self.locks.lock_for(owner);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(GraphSnapshot {
            owner_id: owner.clone(),
            version: self.repo.graph_version(owner)?,
            exported_at: Utc::now(),
            tasks: self.repo.list_nodes(owner)?,
            dependencies: self.repo.list_edges(owner)?,
        })
    }
}
