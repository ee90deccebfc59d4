pub mod commands;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod id;
pub mod logging;
pub mod types;

#[cfg(test)]
pub mod testutil;

pub use crate::core::GraphCoordinator;
pub use crate::error::{GraphError, Result};
