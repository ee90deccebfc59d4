use std::fs;
use std::path::PathBuf;

use clap::Subcommand;

use crate::core::GraphCoordinator;
use crate::db::NodeRepository;
use crate::error::Result;
use crate::id::OwnerId;

#[derive(Subcommand, Clone)]
pub enum DataCommand {
    /// Export the owner's tasks and dependencies (deleted ones included) to JSON
    Export {
        /// Output file path (default: taskgraph-export.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

pub enum DataResult {
    Exported {
        path: String,
        version: i64,
        tasks: usize,
        dependencies: usize,
    },
}

pub fn handle<R: NodeRepository>(
    graph: &GraphCoordinator<R>,
    owner: &OwnerId,
    cmd: DataCommand,
) -> Result<DataResult> {
    match cmd {
        DataCommand::Export { output } => export_data(graph, owner, output),
    }
}

pub(crate) fn export_data<R: NodeRepository>(
    graph: &GraphCoordinator<R>,
    owner: &OwnerId,
    output: Option<PathBuf>,
) -> Result<DataResult> {
    let output_path = output.unwrap_or_else(|| PathBuf::from("taskgraph-export.json"));

    let snapshot = graph.snapshot(owner)?;
    let json = serde_json::to_string_pretty(&snapshot)?;
    fs::write(&output_path, json)?;

    Ok(DataResult::Exported {
        path: output_path.display().to_string(),
        version: snapshot.version,
        tasks: snapshot.tasks.len(),
        dependencies: snapshot.dependencies.len(),
    })
}
