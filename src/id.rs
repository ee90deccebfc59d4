//! Identifier newtypes.
//!
//! - `TaskId`: `task_01ARZ3NDEKTSV4RRFFQ69G5FAV`
//! - `EdgeId`: `dep_01ARZ3NDEKTSV4RRFFQ69G5FAV`
//! - `OwnerId`: opaque principal id handed in by the caller

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IdParseError {
    #[error("Invalid ULID format: {0}")]
    InvalidUlid(String),
    #[error("Missing prefix: expected '{expected}', got '{actual}'")]
    MissingPrefix {
        expected: &'static str,
        actual: String,
    },
    #[error("Owner id cannot be empty")]
    EmptyOwner,
}

fn validate_ulid(s: &str) -> Result<(), IdParseError> {
    ulid::Ulid::from_string(s)
        .map(|_| ())
        .map_err(|_| IdParseError::InvalidUlid(s.to_string()))
}

// ============ TaskId ============

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub const PREFIX: &'static str = "task_";

    /// Generate new TaskId with fresh ULID
    pub fn new() -> Self {
        Self(format!("{}{}", Self::PREFIX, ulid::Ulid::new()))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ulid = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| IdParseError::MissingPrefix {
                expected: Self::PREFIX,
                actual: s.to_string(),
            })?;
        validate_ulid(ulid)?;
        Ok(Self(s.to_string()))
    }
}

impl ToSql for TaskId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.as_str()))
    }
}

impl FromSql for TaskId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(Self(value.as_str()?.to_string()))
    }
}

// ============ EdgeId ============

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(String);

impl EdgeId {
    pub const PREFIX: &'static str = "dep_";

    pub fn new() -> Self {
        Self(format!("{}{}", Self::PREFIX, ulid::Ulid::new()))
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EdgeId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ulid = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| IdParseError::MissingPrefix {
                expected: Self::PREFIX,
                actual: s.to_string(),
            })?;
        validate_ulid(ulid)?;
        Ok(Self(s.to_string()))
    }
}

impl ToSql for EdgeId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.as_str()))
    }
}

impl FromSql for EdgeId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(Self(value.as_str()?.to_string()))
    }
}

// ============ OwnerId ============

/// Principal that owns a task graph. Graphs of different owners never touch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OwnerId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(IdParseError::EmptyOwner);
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl ToSql for OwnerId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.as_str()))
    }
}

impl FromSql for OwnerId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(Self(value.as_str()?.to_string()))
    }
}
