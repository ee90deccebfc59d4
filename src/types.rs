use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::id::{EdgeId, OwnerId, TaskId};

/// One task in an owner's graph. Structure lives in `parent_id` only; children
/// are found through the repository's parent index, never through references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskNode {
    pub id: TaskId,
    pub owner_id: OwnerId,
    pub parent_id: Option<TaskId>,
    pub title: String,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    /// Manually tracked progress, used only while the task has no children
    pub completion_percentage: u8,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskNode {
    pub fn new(owner_id: OwnerId, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            owner_id,
            parent_id: None,
            title: title.into(),
            completed: false,
            completed_at: None,
            completion_percentage: 0,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Active and owned by `owner`: the only nodes graph traversals see.
    pub fn is_visible_to(&self, owner: &OwnerId) -> bool {
        self.active && &self.owner_id == owner
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    #[default]
    FinishToStart,
    StartToStart,
    FinishToFinish,
    StartToFinish,
}

impl DependencyType {
    pub const ALL: [DependencyType; 4] = [
        DependencyType::FinishToStart,
        DependencyType::StartToStart,
        DependencyType::FinishToFinish,
        DependencyType::StartToFinish,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DependencyType::FinishToStart => "finish_to_start",
            DependencyType::StartToStart => "start_to_start",
            DependencyType::FinishToFinish => "finish_to_finish",
            DependencyType::StartToFinish => "start_to_finish",
        }
    }

    /// Only finish-to-start edges block their dependent. The other kinds are
    /// stored for the caller but carry no gating here.
    pub fn gates_start(self) -> bool {
        matches!(self, DependencyType::FinishToStart)
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        DependencyType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| {
                format!(
                    "unknown dependency type '{s}' (expected finish_to_start, start_to_start, finish_to_finish or start_to_finish)"
                )
            })
    }
}

impl ToSql for DependencyType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for DependencyType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// "`dependent_id` cannot start until `prerequisite_id` finishes" (for the
/// default kind).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyEdge {
    pub id: EdgeId,
    pub owner_id: OwnerId,
    pub dependent_id: TaskId,
    pub prerequisite_id: TaskId,
    pub kind: DependencyType,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl DependencyEdge {
    pub fn new(
        owner_id: OwnerId,
        dependent_id: TaskId,
        prerequisite_id: TaskId,
        kind: DependencyType,
    ) -> Self {
        Self {
            id: EdgeId::new(),
            owner_id,
            dependent_id,
            prerequisite_id,
            kind,
            active: true,
            created_at: Utc::now(),
        }
    }
}

/// What happens to the children of a deactivated task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildPolicy {
    /// Deactivate the whole subtree together with the task
    #[default]
    Cascade,
    /// Children become roots
    Detach,
    /// Children move up to the deactivated task's parent
    ReparentToGrandparent,
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub parent_id: Option<TaskId>,
    pub completion_percentage: Option<u8>,
}

/// Answer of a validator that does not throw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ErrorKind>,
}

impl Verdict {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn rejected(reason: ErrorKind) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// A task with its derived graph state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    #[serde(flatten)]
    pub node: TaskNode,
    pub depth: u32,
    pub blocked: bool,
    /// Incomplete finish-to-start prerequisites
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<TaskId>,
    /// Active dependents of this task
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<TaskId>,
    pub effective_completion_percentage: u8,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeactivationReport {
    pub deactivated_tasks: Vec<TaskId>,
    pub deactivated_edges: Vec<EdgeId>,
    /// Children that stayed active and were moved (detach / reparent policies)
    pub moved_children: Vec<TaskId>,
}

#[derive(Debug, Clone, Default)]
pub struct ListTasksFilter {
    pub parent_id: Option<TaskId>,
    pub completed: Option<bool>,
    pub include_inactive: bool,
    pub roots_only: bool,
}

/// Full dump of one owner's graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSnapshot {
    pub owner_id: OwnerId,
    pub version: i64,
    pub exported_at: DateTime<Utc>,
    pub tasks: Vec<TaskNode>,
    pub dependencies: Vec<DependencyEdge>,
}
