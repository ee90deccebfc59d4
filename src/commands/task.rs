use clap::{ArgGroup, Args, Subcommand};
use serde::Serialize;

use crate::core::GraphCoordinator;
use crate::db::NodeRepository;
use crate::error::Result;
use crate::id::{OwnerId, TaskId};
use crate::types::{
    DeactivationReport, DependencyEdge, DependencyType, ListTasksFilter, NewTask, TaskNode,
    TaskView, Verdict,
};

/// Parse TaskId from CLI string (requires prefix)
fn parse_task_id(s: &str) -> std::result::Result<TaskId, String> {
    s.parse().map_err(|e| format!("{e}"))
}

fn parse_dependency_type(s: &str) -> std::result::Result<DependencyType, String> {
    s.parse()
}

#[derive(Subcommand, Clone)]
pub enum TaskCommand {
    /// Create a task, optionally under a parent
    Create(CreateArgs),
    /// Show a task with its derived state
    Get {
        #[arg(value_parser = parse_task_id)]
        id: TaskId,
    },
    List(ListArgs),
    /// Show the hierarchy below a task, or every root
    Tree(TreeArgs),
    /// Move a task under another parent, or to the top level
    Reparent(ParentArgs),
    /// Make a task wait for another
    Block(BlockArgs),
    /// Remove a dependency
    Unblock(UnblockArgs),
    Complete {
        #[arg(value_parser = parse_task_id)]
        id: TaskId,
    },
    Reopen {
        #[arg(value_parser = parse_task_id)]
        id: TaskId,
    },
    /// Set the manual completion percentage of a task
    Percent {
        #[arg(value_parser = parse_task_id)]
        id: TaskId,
        #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
        value: u8,
    },
    /// Deactivate a task (children follow the configured child policy)
    Delete {
        #[arg(value_parser = parse_task_id)]
        id: TaskId,
    },
    /// Reactivate a deleted task as a top-level task
    Restore {
        #[arg(value_parser = parse_task_id)]
        id: TaskId,
    },
    /// Check whether a reparent would be accepted, without applying it
    CheckParent(ParentArgs),
    /// Check whether a dependency would be accepted, without applying it
    CheckDependency(UnblockArgs),
    /// List tasks that can start now
    Ready,
    /// Show a task's depth and ancestor chain
    Depth {
        #[arg(value_parser = parse_task_id)]
        id: TaskId,
    },
    Progress(ProgressArgs),
}

#[derive(Args, Clone)]
pub struct CreateArgs {
    pub title: String,

    #[arg(long, value_parser = parse_task_id)]
    pub parent: Option<TaskId>,

    /// Initial completion percentage (0-100)
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub percent: Option<u8>,
}

#[derive(Args, Clone)]
pub struct ListArgs {
    #[arg(long, value_parser = parse_task_id, conflicts_with = "roots")]
    pub parent: Option<TaskId>,

    /// Only top-level tasks
    #[arg(long)]
    pub roots: bool,

    #[arg(long, conflicts_with = "pending")]
    pub completed: bool,

    #[arg(long)]
    pub pending: bool,

    /// Include deleted tasks
    #[arg(long)]
    pub all: bool,
}

#[derive(Args, Clone)]
pub struct TreeArgs {
    #[arg(value_parser = parse_task_id)]
    pub id: Option<TaskId>,
}

#[derive(Args, Clone)]
#[command(group = ArgGroup::new("target").required(true).args(["parent", "root"]))]
pub struct ParentArgs {
    #[arg(value_parser = parse_task_id)]
    pub id: TaskId,

    #[arg(long, value_parser = parse_task_id)]
    pub parent: Option<TaskId>,

    /// Make the task top-level
    #[arg(long)]
    pub root: bool,
}

#[derive(Args, Clone)]
pub struct BlockArgs {
    #[arg(value_parser = parse_task_id)]
    pub id: TaskId,

    /// Prerequisite the task waits for
    #[arg(long, value_parser = parse_task_id)]
    pub by: TaskId,

    #[arg(long, default_value = "finish_to_start", value_parser = parse_dependency_type)]
    pub kind: DependencyType,
}

#[derive(Args, Clone)]
pub struct UnblockArgs {
    #[arg(value_parser = parse_task_id)]
    pub id: TaskId,

    #[arg(long, value_parser = parse_task_id)]
    pub by: TaskId,
}

#[derive(Args, Clone)]
pub struct ProgressArgs {
    /// Task to summarise, including all of its descendants. If omitted, covers every task.
    #[arg(value_parser = parse_task_id)]
    pub id: Option<TaskId>,
}

pub enum TaskResult {
    One(TaskNode),
    View(TaskView),
    Many(Vec<TaskNode>),
    Edge(DependencyEdge),
    Deactivated(DeactivationReport),
    Verdict(Verdict),
    Tree(TaskTree),
    Trees(Vec<TaskTree>),
    Depth(DepthResult),
    Progress(TaskProgressResult),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgressResult {
    pub total: usize,
    pub completed: usize,
    pub ready: usize,
    pub blocked: usize,
    /// Derived completion of the requested task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_completion_percentage: Option<u8>,
}

#[derive(Serialize)]
pub struct TaskTree {
    pub task: TaskView,
    pub children: Vec<TaskTree>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthResult {
    pub task_id: TaskId,
    pub depth: u32,
    /// Nearest first
    pub ancestors: Vec<TaskId>,
}

pub fn handle<R: NodeRepository>(
    graph: &GraphCoordinator<R>,
    owner: &OwnerId,
    cmd: TaskCommand,
) -> Result<TaskResult> {
    match cmd {
        TaskCommand::Create(args) => {
            let input = NewTask {
                title: args.title,
                parent_id: args.parent,
                completion_percentage: args.percent,
            };
            Ok(TaskResult::One(graph.create_task(owner, input)?))
        }

        TaskCommand::Get { id } => Ok(TaskResult::View(graph.get_task_view(owner, &id)?)),

        TaskCommand::List(args) => {
            let completed = match (args.completed, args.pending) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let filter = ListTasksFilter {
                parent_id: args.parent,
                completed,
                include_inactive: args.all,
                roots_only: args.roots,
            };
            Ok(TaskResult::Many(graph.list_tasks(owner, &filter)?))
        }

        TaskCommand::Tree(args) => match args.id {
            Some(id) => Ok(TaskResult::Tree(build_tree(graph, owner, &id)?)),
            None => {
                let filter = ListTasksFilter {
                    roots_only: true,
                    ..Default::default()
                };
                let mut trees = Vec::new();
                for root in graph.list_tasks(owner, &filter)? {
                    trees.push(build_tree(graph, owner, &root.id)?);
                }
                Ok(TaskResult::Trees(trees))
            }
        },

        TaskCommand::Reparent(args) => {
            let node = graph.reparent(owner, &args.id, target_parent(&args))?;
            Ok(TaskResult::One(node))
        }

        TaskCommand::Block(args) => Ok(TaskResult::Edge(graph.add_dependency(
            owner,
            &args.id,
            &args.by,
            args.kind,
        )?)),

        TaskCommand::Unblock(args) => Ok(TaskResult::Edge(
            graph.remove_dependency_between(owner, &args.id, &args.by)?,
        )),

        TaskCommand::Complete { id } => Ok(TaskResult::One(graph.set_completed(owner, &id, true)?)),

        TaskCommand::Reopen { id } => Ok(TaskResult::One(graph.set_completed(owner, &id, false)?)),

        TaskCommand::Percent { id, value } => Ok(TaskResult::One(
            graph.set_completion_percentage(owner, &id, value)?,
        )),

        TaskCommand::Delete { id } => Ok(TaskResult::Deactivated(graph.deactivate_task(owner, &id)?)),

        TaskCommand::Restore { id } => Ok(TaskResult::One(graph.reactivate_task(owner, &id)?)),

        TaskCommand::CheckParent(args) => Ok(TaskResult::Verdict(graph.can_set_parent(
            owner,
            &args.id,
            target_parent(&args),
        )?)),

        TaskCommand::CheckDependency(args) => Ok(TaskResult::Verdict(
            graph.can_add_dependency(owner, &args.id, &args.by)?,
        )),

        TaskCommand::Ready => Ok(TaskResult::Many(graph.ready_tasks(owner)?)),

        TaskCommand::Depth { id } => {
            let ancestors = graph
                .ancestors(owner, &id)?
                .into_iter()
                .map(|node| node.id)
                .collect();
            Ok(TaskResult::Depth(DepthResult {
                depth: graph.compute_depth(owner, &id)?,
                task_id: id,
                ancestors,
            }))
        }

        TaskCommand::Progress(args) => Ok(TaskResult::Progress(calculate_progress(
            graph,
            owner,
            args.id.as_ref(),
        )?)),
    }
}

/// `--root` wins over a missing `--parent`; clap guarantees one of them.
fn target_parent(args: &ParentArgs) -> Option<&TaskId> {
    if args.root {
        None
    } else {
        args.parent.as_ref()
    }
}

fn build_tree<R: NodeRepository>(
    graph: &GraphCoordinator<R>,
    owner: &OwnerId,
    id: &TaskId,
) -> Result<TaskTree> {
    let task = graph.get_task_view(owner, id)?;
    let mut children = Vec::new();
    if task.node.active {
        for child in graph.children(owner, id)? {
            children.push(build_tree(graph, owner, &child.id)?);
        }
    }
    Ok(TaskTree { task, children })
}

fn calculate_progress<R: NodeRepository>(
    graph: &GraphCoordinator<R>,
    owner: &OwnerId,
    root_id: Option<&TaskId>,
) -> Result<TaskProgressResult> {
    let tasks = match root_id {
        Some(id) => {
            let mut tasks = vec![graph.get_task(owner, id)?];
            tasks.extend(graph.descendants(owner, id)?);
            tasks
        }
        None => graph.list_tasks(owner, &ListTasksFilter::default())?,
    };

    let mut completed = 0;
    let mut blocked = 0;
    for task in &tasks {
        if task.completed {
            completed += 1;
        } else if graph.is_blocked(owner, &task.id)? {
            blocked += 1;
        }
    }

    let effective_completion_percentage = match root_id {
        Some(id) => Some(graph.effective_completion_percentage(owner, id)?),
        None => None,
    };

    Ok(TaskProgressResult {
        total: tasks.len(),
        completed,
        ready: tasks.len() - completed - blocked,
        blocked,
        effective_completion_percentage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;
    use crate::db::SqliteRepository;
    use crate::testutil::owner;

    fn setup() -> GraphCoordinator<SqliteRepository> {
        GraphCoordinator::new(
            SqliteRepository::open_in_memory().unwrap(),
            GraphConfig::default(),
        )
    }

    fn create(graph: &GraphCoordinator<SqliteRepository>, title: &str, parent: Option<&TaskId>) -> TaskId {
        let cmd = TaskCommand::Create(CreateArgs {
            title: title.to_string(),
            parent: parent.cloned(),
            percent: None,
        });
        match handle(graph, &owner(), cmd).unwrap() {
            TaskResult::One(node) => node.id,
            _ => panic!("expected a task"),
        }
    }

    #[test]
    fn test_tree_nests_children() {
        let graph = setup();
        let root = create(&graph, "Root", None);
        let child = create(&graph, "Child", Some(&root));
        create(&graph, "Grandchild", Some(&child));
        create(&graph, "Other root", None);

        let TaskResult::Trees(trees) = handle(&graph, &owner(), TaskCommand::Tree(TreeArgs { id: None })).unwrap() else {
            panic!("expected trees");
        };
        assert_eq!(trees.len(), 2);
        assert_eq!(trees[0].task.node.id, root);
        assert_eq!(trees[0].children[0].task.node.id, child);
        assert_eq!(trees[0].children[0].children[0].task.depth, 2);
    }

    #[test]
    fn test_progress_counts_subtree() {
        let graph = setup();
        let root = create(&graph, "Root", None);
        let done = create(&graph, "Done", Some(&root));
        let waiting = create(&graph, "Waiting", Some(&root));
        let first = create(&graph, "First", Some(&root));
        create(&graph, "Elsewhere", None);

        handle(&graph, &owner(), TaskCommand::Complete { id: done }).unwrap();
        handle(
            &graph,
            &owner(),
            TaskCommand::Block(BlockArgs {
                id: waiting,
                by: first,
                kind: DependencyType::FinishToStart,
            }),
        )
        .unwrap();

        let TaskResult::Progress(progress) = handle(
            &graph,
            &owner(),
            TaskCommand::Progress(ProgressArgs { id: Some(root) }),
        )
        .unwrap() else {
            panic!("expected progress");
        };
        assert_eq!(progress.total, 4);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.blocked, 1);
        assert_eq!(progress.ready, 2);
        assert_eq!(progress.effective_completion_percentage, Some(33));
    }

    #[test]
    fn test_check_parent_reports_without_writing() {
        let graph = setup();
        let root = create(&graph, "Root", None);
        let child = create(&graph, "Child", Some(&root));

        let cmd = TaskCommand::CheckParent(ParentArgs {
            id: root.clone(),
            parent: Some(child.clone()),
            root: false,
        });
        let TaskResult::Verdict(verdict) = handle(&graph, &owner(), cmd).unwrap() else {
            panic!("expected verdict");
        };
        assert!(!verdict.allowed);
        assert_eq!(graph.get_task(&owner(), &root).unwrap().parent_id, None);
    }
}
