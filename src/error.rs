use serde::Serialize;
use thiserror::Error;

use crate::id::{EdgeId, OwnerId, TaskId};

/// Rejections of a proposed parent assignment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HierarchyError {
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Task cannot be its own parent: {0}")]
    SelfReference(TaskId),

    #[error("Moving {task_id} under {parent_id} would make it its own ancestor")]
    CircularReference { task_id: TaskId, parent_id: TaskId },

    #[error("Hierarchy depth {depth} exceeds limit of {limit}")]
    DepthLimitExceeded { depth: u32, limit: u32 },
}

/// Rejections of a proposed prerequisite -> dependent edge.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DependencyError {
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Task cannot depend on itself: {0}")]
    SelfDependency(TaskId),

    #[error("{dependent_id} depending on {prerequisite_id} would create a dependency cycle")]
    CircularDependency {
        dependent_id: TaskId,
        prerequisite_id: TaskId,
    },

    #[error("Dependency chain length {depth} exceeds limit of {limit}")]
    DependencyDepthLimitExceeded { depth: u32, limit: u32 },
}

#[derive(Error, Debug)]
pub enum GraphError {
    #[error(transparent)]
    Hierarchy(#[from] HierarchyError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Dependency not found: {0}")]
    EdgeNotFound(EdgeId),

    #[error("{dependent_id} does not depend on {prerequisite_id}")]
    DependencyNotFound {
        dependent_id: TaskId,
        prerequisite_id: TaskId,
    },

    #[error("Task title cannot be empty")]
    EmptyTitle,

    #[error("Invalid completion percentage: {0} (must be 0-100)")]
    InvalidPercentage(i64),

    /// Another writer changed the owner's graph between validation and commit
    #[error("Task graph of {owner_id} was modified concurrently; retry the operation")]
    Conflict { owner_id: OwnerId },

    #[error("Database error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Constraint violation reported by a non-SQL store
    #[error("Storage integrity violation: {0}")]
    Integrity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Config(String),
}

impl From<toml::de::Error> for GraphError {
    fn from(err: toml::de::Error) -> Self {
        GraphError::Config(err.to_string())
    }
}

/// Flat classification of every failure, stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NotFound,
    SelfReference,
    SelfDependency,
    CircularReference,
    CircularDependency,
    DepthLimitExceeded,
    DependencyDepthLimitExceeded,
    Conflict,
    Storage,
    Invalid,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::SelfReference => "SELF_REFERENCE",
            ErrorKind::SelfDependency => "SELF_DEPENDENCY",
            ErrorKind::CircularReference => "CIRCULAR_REFERENCE",
            ErrorKind::CircularDependency => "CIRCULAR_DEPENDENCY",
            ErrorKind::DepthLimitExceeded => "DEPTH_LIMIT_EXCEEDED",
            ErrorKind::DependencyDepthLimitExceeded => "DEPENDENCY_DEPTH_LIMIT_EXCEEDED",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Storage => "STORAGE_ERROR",
            ErrorKind::Invalid => "INVALID",
        }
    }
}

impl GraphError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphError::Hierarchy(err) => match err {
                HierarchyError::NotFound(_) => ErrorKind::NotFound,
                HierarchyError::SelfReference(_) => ErrorKind::SelfReference,
                HierarchyError::CircularReference { .. } => ErrorKind::CircularReference,
                HierarchyError::DepthLimitExceeded { .. } => ErrorKind::DepthLimitExceeded,
            },
            GraphError::Dependency(err) => match err {
                DependencyError::NotFound(_) => ErrorKind::NotFound,
                DependencyError::SelfDependency(_) => ErrorKind::SelfDependency,
                DependencyError::CircularDependency { .. } => ErrorKind::CircularDependency,
                DependencyError::DependencyDepthLimitExceeded { .. } => {
                    ErrorKind::DependencyDepthLimitExceeded
                }
            },
            GraphError::TaskNotFound(_)
            | GraphError::EdgeNotFound(_)
            | GraphError::DependencyNotFound { .. } => ErrorKind::NotFound,
            GraphError::Conflict { .. } => ErrorKind::Conflict,
            GraphError::Storage(_) | GraphError::Integrity(_) | GraphError::Io(_) => {
                ErrorKind::Storage
            }
            GraphError::InvalidPercentage(_)
            | GraphError::EmptyTitle
            | GraphError::Json(_)
            | GraphError::Config(_) => ErrorKind::Invalid,
        }
    }

    /// True when a validator turned the request down (a normal negative answer,
    /// not a system fault).
    pub fn is_rejection(&self) -> bool {
        matches!(self, GraphError::Hierarchy(_) | GraphError::Dependency(_))
    }

    /// SQLite reports lock contention from other connections as busy/locked;
    /// both mean another writer got there first.
    pub(crate) fn from_storage(err: rusqlite::Error, owner_id: &OwnerId) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                GraphError::Conflict {
                    owner_id: owner_id.clone(),
                }
            }
            _ => GraphError::Storage(err),
        }
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl From<&GraphError> for ErrorResponse {
    fn from(err: &GraphError) -> Self {
        ErrorResponse {
            error: err.to_string(),
            code: err.kind().code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
