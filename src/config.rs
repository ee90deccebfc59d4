//! Configuration loading.
//!
//! Reads an optional `.taskgraph.toml`, then applies `TASKGRAPH_*`
//! environment overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::types::ChildPolicy;

pub const CONFIG_FILE_NAME: &str = ".taskgraph.toml";

pub const DEFAULT_MAX_DEPTH: u32 = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Owner used by the CLI when `--owner` is not given
    #[serde(default)]
    pub default_owner: Option<String>,

    #[serde(default)]
    pub graph: GraphConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// Limits and policies of the graph core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Maximum edges from a root to any descendant
    #[serde(default = "default_max_depth")]
    pub max_hierarchy_depth: u32,

    /// Maximum edges along a dependency chain; falls back to the hierarchy limit
    #[serde(default)]
    pub max_dependency_depth: Option<u32>,

    #[serde(default)]
    pub child_policy: ChildPolicy,

    /// Cache blocked status and depth between writes
    #[serde(default)]
    pub cache_derived_state: bool,
}

fn default_max_depth() -> u32 {
    DEFAULT_MAX_DEPTH
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_hierarchy_depth: default_max_depth(),
            max_dependency_depth: None,
            child_policy: ChildPolicy::default(),
            cache_derived_state: false,
        }
    }
}

impl GraphConfig {
    pub fn dependency_depth_limit(&self) -> u32 {
        self.max_dependency_depth.unwrap_or(self.max_hierarchy_depth)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_hierarchy_depth == 0 {
            return Err(GraphError::Config(
                "graph.max_hierarchy_depth must be at least 1".to_string(),
            ));
        }
        if self.max_dependency_depth == Some(0) {
            return Err(GraphError::Config(
                "graph.max_dependency_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.graph.validate()?;
        Ok(config)
    }

    /// Explicit path wins; otherwise `.taskgraph.toml` in `dir` if present,
    /// else defaults. Environment overrides are applied last.
    pub fn resolve(explicit: Option<&Path>, dir: &Path) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => {
                let candidate = dir.join(CONFIG_FILE_NAME);
                if candidate.exists() {
                    Self::load(&candidate)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = var("TASKGRAPH_DB_PATH") {
            self.storage.db_path = Some(PathBuf::from(path));
        }
        if let Some(owner) = var("TASKGRAPH_OWNER") {
            self.default_owner = Some(owner);
        }
        if let Some(raw) = var("TASKGRAPH_MAX_DEPTH") {
            self.graph.max_hierarchy_depth = raw.trim().parse().map_err(|_| {
                GraphError::Config(format!("TASKGRAPH_MAX_DEPTH: not a number: '{raw}'"))
            })?;
        }
        self.graph.validate()
    }
}
