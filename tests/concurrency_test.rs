//! Concurrency tests for the graph coordinator.
//!
//! Tests cover:
//! - Parallel writers on one owner are linearised
//! - Racing opposite dependencies never form a cycle
//! - Writers outside the owner lock are detected through the graph version
//! - One lost race is retried, a second surfaces as a conflict

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use taskgraph::config::GraphConfig;
use taskgraph::db::{MemoryRepository, NodeReader, NodeRepository, NodeWriter};
use taskgraph::error::{GraphError, Result};
use taskgraph::id::{EdgeId, OwnerId, TaskId};
use taskgraph::types::{DependencyEdge, DependencyType, NewTask, TaskNode};
use taskgraph::GraphCoordinator;

fn owner() -> OwnerId {
    "alice".parse().unwrap()
}

fn new_task(title: &str) -> NewTask {
    NewTask {
        title: title.to_string(),
        ..Default::default()
    }
}

/// Simulates a writer in another process: before each of the next
/// `pending` transactions, the owner's graph version is advanced behind the
/// coordinator's back.
struct RacingRepository {
    inner: MemoryRepository,
    owner: OwnerId,
    pending: AtomicU32,
}

impl RacingRepository {
    fn new(owner: OwnerId) -> Self {
        Self {
            inner: MemoryRepository::new(),
            owner,
            pending: AtomicU32::new(0),
        }
    }

    fn race(&self, times: u32) {
        self.pending.store(times, Ordering::SeqCst);
    }

    fn bump_behind_the_scenes(&self) -> Result<()> {
        self.inner.run_in_transaction(|tx| {
            let version = tx.graph_version(&self.owner)?;
            tx.advance_graph_version(&self.owner, version).map(|_| ())
        })
    }
}

impl NodeReader for RacingRepository {
    fn get_node(&self, id: &TaskId) -> Result<Option<TaskNode>> {
        self.inner.get_node(id)
    }

    fn get_children(&self, parent_id: &TaskId) -> Result<Vec<TaskNode>> {
        self.inner.get_children(parent_id)
    }

    fn get_edge(&self, id: &EdgeId) -> Result<Option<DependencyEdge>> {
        self.inner.get_edge(id)
    }

    fn get_active_edges_where_dependent(&self, task_id: &TaskId) -> Result<Vec<DependencyEdge>> {
        self.inner.get_active_edges_where_dependent(task_id)
    }

    fn get_active_edges_where_prerequisite(
        &self,
        task_id: &TaskId,
    ) -> Result<Vec<DependencyEdge>> {
        self.inner.get_active_edges_where_prerequisite(task_id)
    }

    fn list_nodes(&self, owner: &OwnerId) -> Result<Vec<TaskNode>> {
        self.inner.list_nodes(owner)
    }

    fn list_edges(&self, owner: &OwnerId) -> Result<Vec<DependencyEdge>> {
        self.inner.list_edges(owner)
    }

    fn graph_version(&self, owner: &OwnerId) -> Result<i64> {
        self.inner.graph_version(owner)
    }
}

impl NodeRepository for RacingRepository {
    fn run_in_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn NodeWriter) -> Result<T>,
    {
        let raced = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if raced {
            self.bump_behind_the_scenes()?;
        }
        self.inner.run_in_transaction(f)
    }
}

fn racing_graph(config: GraphConfig) -> GraphCoordinator<RacingRepository> {
    GraphCoordinator::new(RacingRepository::new(owner()), config)
}

// ==================== Threads on one owner ====================

#[test]
fn test_parallel_creates_are_all_applied() {
    let graph = Arc::new(GraphCoordinator::new(
        MemoryRepository::new(),
        GraphConfig::default(),
    ));
    let threads = 8;
    let per_thread = 10;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let graph = Arc::clone(&graph);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..per_thread {
                    graph
                        .create_task(&owner(), new_task(&format!("t{t}-{i}")))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let total = (threads * per_thread) as i64;
    assert_eq!(graph.repository().graph_version(&owner()).unwrap(), total);
    assert_eq!(
        graph.repository().list_nodes(&owner()).unwrap().len() as i64,
        total
    );
}

#[test]
fn test_opposite_dependencies_race_to_one_winner() {
    for _ in 0..20 {
        let graph = Arc::new(GraphCoordinator::new(
            MemoryRepository::new(),
            GraphConfig::default(),
        ));
        let a = graph.create_task(&owner(), new_task("A")).unwrap();
        let b = graph.create_task(&owner(), new_task("B")).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let spawn = |dependent: TaskId, prerequisite: TaskId| {
            let graph = Arc::clone(&graph);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                graph.add_dependency(
                    &owner(),
                    &dependent,
                    &prerequisite,
                    DependencyType::FinishToStart,
                )
            })
        };
        let first = spawn(a.id.clone(), b.id.clone());
        let second = spawn(b.id.clone(), a.id.clone());
        let results = [first.join().unwrap(), second.join().unwrap()];

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        let loser = results.into_iter().find_map(|r| r.err()).unwrap();
        assert!(loser.is_rejection());
        assert_eq!(graph.repository().list_edges(&owner()).unwrap().len(), 1);
    }
}

#[test]
fn test_different_owners_do_not_share_versions() {
    let graph = Arc::new(GraphCoordinator::new(
        MemoryRepository::new(),
        GraphConfig::default(),
    ));
    let owners: Vec<OwnerId> = ["alice", "bob", "carol"]
        .iter()
        .map(|o| o.parse().unwrap())
        .collect();

    let handles: Vec<_> = owners
        .iter()
        .cloned()
        .map(|owner| {
            let graph = Arc::clone(&graph);
            thread::spawn(move || {
                for i in 0..5 {
                    graph.create_task(&owner, new_task(&format!("{i}"))).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for owner in &owners {
        assert_eq!(graph.repository().graph_version(owner).unwrap(), 5);
        assert_eq!(graph.list_tasks(owner, &Default::default()).unwrap().len(), 5);
    }
}

// ==================== Optimistic version ====================

#[test]
fn test_single_lost_race_is_retried() {
    let graph = racing_graph(GraphConfig::default());
    graph.repository().race(1);

    let task = graph.create_task(&owner(), new_task("A")).unwrap();

    assert_eq!(graph.get_task(&owner(), &task.id).unwrap().title, "A");
    // One foreign bump plus our own write
    assert_eq!(graph.repository().graph_version(&owner()).unwrap(), 2);
}

#[test]
fn test_second_lost_race_surfaces_conflict() {
    let graph = racing_graph(GraphConfig::default());
    let a = graph.create_task(&owner(), new_task("A")).unwrap();
    let b = graph.create_task(&owner(), new_task("B")).unwrap();
    graph.repository().race(2);

    let err = graph
        .add_dependency(&owner(), &a.id, &b.id, DependencyType::FinishToStart)
        .unwrap_err();

    assert!(matches!(err, GraphError::Conflict { ref owner_id } if owner_id == &owner()));
    assert!(graph.dependencies_of(&owner(), &a.id).unwrap().is_empty());
    assert!(!graph.is_blocked(&owner(), &a.id).unwrap());
}

#[test]
fn test_conflict_drops_cached_state() {
    let config = GraphConfig {
        cache_derived_state: true,
        ..Default::default()
    };
    let graph = racing_graph(config);
    let a = graph.create_task(&owner(), new_task("A")).unwrap();
    let b = graph.create_task(&owner(), new_task("B")).unwrap();
    assert!(!graph.is_blocked(&owner(), &a.id).unwrap());
    assert!(!graph.cache().is_empty());

    graph.repository().race(2);
    graph
        .set_completed(&owner(), &b.id, true)
        .unwrap_err();

    assert!(graph.cache().is_empty());
}

#[test]
fn test_retry_revalidates_against_fresh_state() {
    let graph = racing_graph(GraphConfig::default());
    let a = graph.create_task(&owner(), new_task("A")).unwrap();
    let b = graph.create_task(&owner(), new_task("B")).unwrap();
    graph.repository().race(1);

    let edge = graph
        .add_dependency(&owner(), &a.id, &b.id, DependencyType::FinishToStart)
        .unwrap();

    assert_eq!(graph.dependencies_of(&owner(), &a.id).unwrap(), vec![edge]);
    assert!(graph.is_blocked(&owner(), &a.id).unwrap());
}
