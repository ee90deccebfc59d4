use std::collections::{HashMap, HashSet};
use std::io::IsTerminal;

use owo_colors::{OwoColorize, Style};
use serde::Deserialize;

use taskgraph::commands::{DataCommand, TaskCommand};
use taskgraph::id::{EdgeId, TaskId};

use crate::Command;

/// Task status for display classification
#[derive(Clone, Copy, PartialEq, Eq)]
enum TaskStatus {
    Deleted,
    Completed,
    Blocked,
    Open,
}

impl TaskStatus {
    fn classify(task: &ShownTask) -> Self {
        if !task.active {
            Self::Deleted
        } else if task.completed {
            Self::Completed
        } else if task.blocked {
            Self::Blocked
        } else {
            Self::Open
        }
    }
}

/// Fields shared by plain task records and task views. View-only fields
/// default when a plain record is printed.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShownTask {
    id: TaskId,
    parent_id: Option<TaskId>,
    title: String,
    completed: bool,
    completion_percentage: u8,
    active: bool,
    created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    depth: Option<u32>,
    #[serde(default)]
    blocked: bool,
    #[serde(default)]
    blocked_by: Vec<TaskId>,
    #[serde(default)]
    blocks: Vec<TaskId>,
    #[serde(default)]
    effective_completion_percentage: Option<u8>,
}

#[derive(Deserialize)]
struct TreeNode {
    task: ShownTask,
    children: Vec<TreeNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShownEdge {
    id: EdgeId,
    dependent_id: TaskId,
    prerequisite_id: TaskId,
    kind: String,
    active: bool,
}

#[derive(Deserialize)]
struct ShownVerdict {
    allowed: bool,
    reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShownDeactivation {
    deactivated_tasks: Vec<TaskId>,
    deactivated_edges: Vec<EdgeId>,
    moved_children: Vec<TaskId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShownDepth {
    task_id: TaskId,
    depth: u32,
    ancestors: Vec<TaskId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShownProgress {
    total: usize,
    completed: usize,
    ready: usize,
    blocked: usize,
    effective_completion_percentage: Option<u8>,
}

#[derive(Deserialize)]
struct ShownExport {
    path: String,
    version: i64,
    tasks: usize,
    dependencies: usize,
}

/// Color policy: --no-color > NO_COLOR env > TERM=dumb > !isatty > default (color)
fn should_use_color_for(no_color_flag: bool, is_tty: bool) -> bool {
    if no_color_flag {
        return false;
    }
    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }
    if std::env::var("TERM").ok().as_deref() == Some("dumb") {
        return false;
    }
    is_tty
}

/// Color scheme for output
struct Colors {
    task_id: Style,
    completed: Style,
    pending: Style,
    blocked: Style,
    deleted: Style,
    root: Style,
    tree_line: Style,
    error: Style,
}

impl Colors {
    fn new(use_color: bool) -> Self {
        if use_color {
            Self {
                task_id: Style::new().cyan().dimmed(),
                completed: Style::new().green(),
                pending: Style::new().yellow(),
                blocked: Style::new().red(),
                deleted: Style::new().dimmed().strikethrough(),
                root: Style::new().bold(),
                tree_line: Style::new().dimmed(),
                error: Style::new().red().bold(),
            }
        } else {
            // No-op styles when color disabled
            Self {
                task_id: Style::new(),
                completed: Style::new(),
                pending: Style::new(),
                blocked: Style::new(),
                deleted: Style::new(),
                root: Style::new(),
                tree_line: Style::new(),
                error: Style::new(),
            }
        }
    }
}

/// Handles human-readable CLI output.
pub struct Printer {
    colors: Colors,
}

impl Printer {
    /// Create printer for stdout (standard output)
    pub fn new(no_color_flag: bool) -> Self {
        let use_color = should_use_color_for(no_color_flag, std::io::stdout().is_terminal());
        Self {
            colors: Colors::new(use_color),
        }
    }

    /// Create printer for stderr (error output)
    pub fn new_for_stderr(no_color_flag: bool) -> Self {
        let use_color = should_use_color_for(no_color_flag, std::io::stderr().is_terminal());
        Self {
            colors: Colors::new(use_color),
        }
    }

    /// Print an error message to stderr with appropriate coloring
    pub fn print_error(&self, message: &str) {
        eprintln!("{}", message.style(self.colors.error));
    }

    fn fmt_id(&self, id: &impl std::fmt::Display) -> String {
        format!("{}", id.to_string().style(self.colors.task_id))
    }

    fn fmt_ids(&self, ids: &[impl std::fmt::Display]) -> String {
        ids.iter()
            .map(|id| self.fmt_id(id))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Get status symbol and style for a task status
    fn status_symbol_style(&self, status: TaskStatus) -> (&'static str, Style) {
        match status {
            TaskStatus::Deleted => ("✗", self.colors.deleted),
            TaskStatus::Completed => ("✓", self.colors.completed),
            TaskStatus::Blocked => ("⊘", self.colors.blocked),
            TaskStatus::Open => ("○", self.colors.pending),
        }
    }

    pub fn print(&self, command: &Command, output: &str) {
        match command {
            Command::Init => self.print_init(output),
            Command::Task(TaskCommand::Tree(_)) => self.print_task_tree(output),
            Command::Task(TaskCommand::List(_)) => self.print_task_list_tree(output),
            Command::Task(TaskCommand::Ready) => self.print_task_list_flat(output),
            Command::Task(TaskCommand::Progress(_)) => self.print_task_progress(output),
            Command::Task(TaskCommand::Depth { .. }) => self.print_depth(output),
            Command::Task(TaskCommand::Block(_)) | Command::Task(TaskCommand::Unblock(_)) => {
                self.print_edge(output)
            }
            Command::Task(TaskCommand::Delete { .. }) => self.print_deactivation(output),
            Command::Task(TaskCommand::CheckParent(_))
            | Command::Task(TaskCommand::CheckDependency(_)) => self.print_verdict(output),
            Command::Task(_) => self.print_task(output),
            Command::Data(DataCommand::Export { .. }) => self.print_data_export(output),
            // PRECONDITION: Completions handled in main() before print() is called
            Command::Completions { .. } => unreachable!("completions handled before print()"),
        }
    }

    fn print_init(&self, output: &str) {
        match serde_json::from_str::<serde_json::Value>(output)
            .ok()
            .and_then(|json| json.get("path").and_then(|v| v.as_str()).map(String::from))
        {
            Some(path) => println!("Initialized taskgraph database at {}", path),
            None => println!("Initialized taskgraph database"),
        }
    }

    fn print_task(&self, output: &str) {
        let Ok(task) = serde_json::from_str::<ShownTask>(output) else {
            println!("{}", output);
            return;
        };

        let (status_label, status_style) = match TaskStatus::classify(&task) {
            TaskStatus::Deleted => ("deleted", self.colors.deleted),
            TaskStatus::Completed => ("completed", self.colors.completed),
            TaskStatus::Blocked => ("blocked", self.colors.blocked),
            TaskStatus::Open => ("open", self.colors.pending),
        };

        println!(
            "Task: {} ({})",
            self.fmt_id(&task.id),
            status_label.style(status_style)
        );
        println!("  Title: {}", task.title);
        if let Some(ref parent) = task.parent_id {
            println!("  Parent: {}", self.fmt_id(parent));
        }
        if let Some(depth) = task.depth {
            println!("  Depth: {}", depth);
        }
        match task.effective_completion_percentage {
            Some(pct) => println!("  Progress: {}%", pct),
            None => println!("  Progress: {}%", task.completion_percentage),
        }
        if !task.blocked_by.is_empty() {
            println!("  Blocked by: {}", self.fmt_ids(&task.blocked_by));
        }
        if !task.blocks.is_empty() {
            println!("  Blocks: {}", self.fmt_ids(&task.blocks));
        }
    }

    fn print_task_tree(&self, output: &str) {
        // Try single tree first, then array of trees
        if let Ok(tree) = serde_json::from_str::<TreeNode>(output) {
            let (completed, blocked, open) = Self::count_tree_stats(&tree);
            self.print_tree_node(&tree, "", "", true);
            self.print_progress_summary(completed + blocked + open, completed, blocked, open);
        } else if let Ok(trees) = serde_json::from_str::<Vec<TreeNode>>(output) {
            if trees.is_empty() {
                println!("No tasks found");
                return;
            }
            let (mut completed, mut blocked, mut open) = (0, 0, 0);
            for (i, tree) in trees.iter().enumerate() {
                let (c, b, o) = Self::count_tree_stats(tree);
                completed += c;
                blocked += b;
                open += o;
                self.print_tree_node(tree, "", "", true);
                if i < trees.len() - 1 {
                    println!(); // Blank line between roots
                }
            }
            self.print_progress_summary(completed + blocked + open, completed, blocked, open);
        } else {
            println!("{}", output);
        }
    }

    /// Count completed/blocked/open tasks in a tree recursively
    fn count_tree_stats(node: &TreeNode) -> (usize, usize, usize) {
        let (mut completed, mut blocked, mut open) = match TaskStatus::classify(&node.task) {
            TaskStatus::Completed => (1, 0, 0),
            TaskStatus::Blocked => (0, 1, 0),
            TaskStatus::Open => (0, 0, 1),
            TaskStatus::Deleted => (0, 0, 0),
        };

        for child in &node.children {
            let (c, b, o) = Self::count_tree_stats(child);
            completed += c;
            blocked += b;
            open += o;
        }

        (completed, blocked, open)
    }

    /// `line_prefix` goes in front of this node, `child_prefix` in front of
    /// its children's connectors.
    fn print_tree_node(&self, node: &TreeNode, line_prefix: &str, child_prefix: &str, is_root: bool) {
        let (status_sym, status_style) = self.status_symbol_style(TaskStatus::classify(&node.task));

        // Top-level tasks are bold
        let title = if is_root || node.task.depth == Some(0) {
            format!("{}", node.task.title.style(self.colors.root))
        } else {
            node.task.title.clone()
        };

        println!(
            "{}[{}] {} - {}",
            line_prefix.style(self.colors.tree_line),
            status_sym.style(status_style),
            self.fmt_id(&node.task.id),
            title
        );

        let child_count = node.children.len();
        for (i, child) in node.children.iter().enumerate() {
            let is_last = i == child_count - 1;
            let connector = if is_last { "└─ " } else { "├─ " };
            let continuation = if is_last { "   " } else { "│  " };
            self.print_tree_node(
                child,
                &format!("{}{}", child_prefix, connector),
                &format!("{}{}", child_prefix, continuation),
                false,
            );
        }
    }

    fn print_task_list_flat(&self, output: &str) {
        let Ok(tasks) = serde_json::from_str::<Vec<ShownTask>>(output) else {
            println!("{}", output);
            return;
        };
        if tasks.is_empty() {
            println!("No tasks found");
            return;
        }
        for t in &tasks {
            let (status_sym, status_style) = self.status_symbol_style(TaskStatus::classify(t));
            println!(
                "[{}] {} - {}",
                status_sym.style(status_style),
                self.fmt_id(&t.id),
                t.title
            );
        }
    }

    fn print_task_list_tree(&self, output: &str) {
        let Ok(tasks) = serde_json::from_str::<Vec<ShownTask>>(output) else {
            println!("{}", output);
            return;
        };
        if tasks.is_empty() {
            println!("No tasks found");
            return;
        }

        let total = tasks.iter().filter(|t| t.active).count();
        let completed = tasks.iter().filter(|t| t.active && t.completed).count();

        for root in build_forest(tasks) {
            self.print_tree_node(&root, "", "", true);
        }

        println!();
        println!(
            "{}/{} complete",
            completed.style(self.colors.completed),
            total
        );
    }

    /// Print progress summary footer: "X/Y complete | Z blocked | W ready"
    fn print_progress_summary(&self, total: usize, completed: usize, blocked: usize, ready: usize) {
        println!();
        println!(
            "{}/{} complete | {} blocked | {} ready",
            completed.style(self.colors.completed),
            total,
            blocked.style(self.colors.blocked),
            ready.style(self.colors.pending),
        );
    }

    fn print_task_progress(&self, output: &str) {
        let Ok(progress) = serde_json::from_str::<ShownProgress>(output) else {
            println!("{}", output);
            return;
        };
        println!(
            "{}/{} complete | {} blocked | {} ready",
            progress.completed.style(self.colors.completed),
            progress.total,
            progress.blocked.style(self.colors.blocked),
            progress.ready.style(self.colors.pending),
        );
        if let Some(pct) = progress.effective_completion_percentage {
            println!("Effective completion: {}%", pct);
        }
    }

    fn print_depth(&self, output: &str) {
        let Ok(depth) = serde_json::from_str::<ShownDepth>(output) else {
            println!("{}", output);
            return;
        };
        println!("{} is at depth {}", self.fmt_id(&depth.task_id), depth.depth);
        if !depth.ancestors.is_empty() {
            println!("  Ancestors: {}", self.fmt_ids(&depth.ancestors));
        }
    }

    fn print_edge(&self, output: &str) {
        let Ok(edge) = serde_json::from_str::<ShownEdge>(output) else {
            println!("{}", output);
            return;
        };
        let verb = if edge.active { "waits for" } else { "no longer waits for" };
        println!(
            "{} {} {} ({}, {})",
            self.fmt_id(&edge.dependent_id),
            verb,
            self.fmt_id(&edge.prerequisite_id),
            edge.kind,
            self.fmt_id(&edge.id)
        );
    }

    fn print_deactivation(&self, output: &str) {
        let Ok(report) = serde_json::from_str::<ShownDeactivation>(output) else {
            println!("{}", output);
            return;
        };
        println!(
            "Deleted {} task(s): {}",
            report.deactivated_tasks.len(),
            self.fmt_ids(&report.deactivated_tasks)
        );
        if !report.deactivated_edges.is_empty() {
            println!("  Dependencies removed: {}", report.deactivated_edges.len());
        }
        if !report.moved_children.is_empty() {
            println!("  Children moved: {}", self.fmt_ids(&report.moved_children));
        }
    }

    fn print_verdict(&self, output: &str) {
        let Ok(verdict) = serde_json::from_str::<ShownVerdict>(output) else {
            println!("{}", output);
            return;
        };
        if verdict.allowed {
            println!("{}", "allowed".style(self.colors.completed));
        } else {
            println!(
                "{} ({})",
                "rejected".style(self.colors.blocked),
                verdict.reason.as_deref().unwrap_or("unknown")
            );
        }
    }

    fn print_data_export(&self, output: &str) {
        let Ok(export) = serde_json::from_str::<ShownExport>(output) else {
            println!("{}", output);
            return;
        };
        println!(
            "Exported {} tasks and {} dependencies (version {}) to {}",
            export.tasks, export.dependencies, export.version, export.path
        );
    }
}

impl Default for Printer {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Build a forest of trees from a flat task list.
/// Tasks whose parent is not in the list become roots.
fn build_forest(tasks: Vec<ShownTask>) -> Vec<TreeNode> {
    let task_ids: HashSet<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
    let mut children_map: HashMap<Option<TaskId>, Vec<TaskId>> = HashMap::new();
    for task in &tasks {
        let parent_key = task.parent_id.clone().filter(|p| task_ids.contains(p));
        children_map.entry(parent_key).or_default().push(task.id.clone());
    }
    let mut task_map: HashMap<TaskId, ShownTask> =
        tasks.into_iter().map(|t| (t.id.clone(), t)).collect();

    fn build_node(
        id: &TaskId,
        task_map: &mut HashMap<TaskId, ShownTask>,
        children_map: &HashMap<Option<TaskId>, Vec<TaskId>>,
    ) -> Option<TreeNode> {
        let task = task_map.remove(id)?;
        let child_ids = children_map.get(&Some(id.clone())).cloned().unwrap_or_default();
        let mut children: Vec<TreeNode> = child_ids
            .iter()
            .filter_map(|cid| build_node(cid, task_map, children_map))
            .collect();
        sort_siblings(&mut children);
        Some(TreeNode { task, children })
    }

    let root_ids = children_map.get(&None).cloned().unwrap_or_default();
    let mut roots: Vec<TreeNode> = root_ids
        .iter()
        .filter_map(|id| build_node(id, &mut task_map, &children_map))
        .collect();
    sort_siblings(&mut roots);
    roots
}

/// Creation order, id as tiebreak (same order the graph lists children in).
fn sort_siblings(nodes: &mut [TreeNode]) {
    nodes.sort_by(|a, b| {
        a.task
            .created_at
            .cmp(&b.task.created_at)
            .then_with(|| a.task.id.cmp(&b.task.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shown(id: &TaskId, parent: Option<&TaskId>, secs: i64) -> ShownTask {
        ShownTask {
            id: id.clone(),
            parent_id: parent.cloned(),
            title: id.to_string(),
            completed: false,
            completion_percentage: 0,
            active: true,
            created_at: chrono::DateTime::from_timestamp(secs, 0).unwrap(),
            depth: None,
            blocked: false,
            blocked_by: vec![],
            blocks: vec![],
            effective_completion_percentage: None,
        }
    }

    #[test]
    fn test_no_color_flag_wins() {
        assert!(!should_use_color_for(true, true));
        assert!(!should_use_color_for(true, false));
    }

    #[test]
    fn test_build_forest_orphans_become_roots() {
        let root = TaskId::new();
        let child = TaskId::new();
        let missing_parent = TaskId::new();
        let orphan = TaskId::new();

        let forest = build_forest(vec![
            shown(&orphan, Some(&missing_parent), 3),
            shown(&child, Some(&root), 2),
            shown(&root, None, 1),
        ]);

        assert_eq!(forest.len(), 2);
        assert_eq!(forest[0].task.id, root);
        assert_eq!(forest[0].children[0].task.id, child);
        assert_eq!(forest[1].task.id, orphan);
    }

    #[test]
    fn test_task_record_parses_without_view_fields() {
        let node = taskgraph::types::TaskNode::new("alice".parse().unwrap(), "Plain");
        let json = serde_json::to_string(&node).unwrap();
        let task: ShownTask = serde_json::from_str(&json).unwrap();
        assert_eq!(task.depth, None);
        assert!(!task.blocked);
        assert!(TaskStatus::classify(&task) == TaskStatus::Open);
    }
}
