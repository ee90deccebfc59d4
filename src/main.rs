use std::io;
use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use tracing::debug;

use taskgraph::commands::{data, task, DataCommand, DataResult, TaskCommand, TaskResult};
use taskgraph::config::Config;
use taskgraph::core::GraphCoordinator;
use taskgraph::db::{self, SqliteRepository};
use taskgraph::error::{ErrorResponse, GraphError, Result};
use taskgraph::id::OwnerId;
use taskgraph::logging;

mod output;

use output::Printer;

#[derive(Parser)]
#[command(name = "tg")]
#[command(version)]
#[command(
    about = "taskgraph - task hierarchy and dependency graph",
    long_about = r#"
taskgraph (tg) - Task hierarchy and dependency graph with integrity checks.

Features:
  • Parent/child hierarchy with a depth limit (default 5)
  • Prerequisite edges with cycle and chain-length checks
  • Derived blocked state and completion percentage
  • Every owner's graph is isolated

Environment:
  TASKGRAPH_DB_PATH    Override database location
  TASKGRAPH_OWNER      Owner to act as when --owner is not given
  TASKGRAPH_MAX_DEPTH  Override the hierarchy depth limit
  RUST_LOG             Log filter (overrides -v and the config file)
  NO_COLOR             Disable colored output
"#
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Output in JSON format (for programmatic use)
    #[arg(long, global = true)]
    json: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Override database path (default: .taskgraph/tasks.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Owner whose graph to operate on
    #[arg(long, global = true)]
    owner: Option<String>,

    /// Config file (default: ./.taskgraph.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging on stderr (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Task management (hierarchy, dependencies, completion, queries)
    #[command(subcommand)]
    Task(TaskCommand),

    /// Data export
    #[command(subcommand)]
    Data(DataCommand),

    /// Generate shell completions
    #[command(
        about = "Generate shell completions",
        long_about = r#"
Generate shell completions for tg CLI.

Examples:
  tg completions bash > ~/.local/share/bash-completion/completions/tg
  tg completions zsh > ~/.zfunc/_tg
  tg completions fish > ~/.config/fish/completions/tg.fish
"#
    )]
    Completions {
        /// Shell to generate completions for (bash, zsh, fish, powershell, elvish)
        shell: Shell,
    },

    /// Initialize database
    #[command(
        about = "Initialize database",
        long_about = r#"
Initialize the taskgraph database.

The database is created at:
  1. --db (if given)
  2. TASKGRAPH_DB_PATH or storage.db_path from the config file
  3. CWD/.taskgraph/tasks.db (fallback)

Usually runs automatically on first command.
"#
    )]
    Init,
}

fn default_db_path(cwd: &Path) -> PathBuf {
    cwd.join(".taskgraph").join("tasks.db")
}

/// `--owner`, then `default_owner` / `TASKGRAPH_OWNER`, then the login name.
fn resolve_owner(flag: Option<&str>, config: &Config) -> Result<OwnerId> {
    let raw = flag
        .map(str::to_string)
        .or_else(|| config.default_owner.clone())
        .or_else(|| std::env::var("USER").ok())
        .ok_or_else(|| {
            GraphError::Config("no owner: pass --owner or set default_owner".to_string())
        })?;
    raw.parse()
        .map_err(|e| GraphError::Config(format!("owner: {e}")))
}

fn main() {
    let cli = Cli::parse();

    // PRECONDITION: Completions bypass normal output flow - raw shell script to stdout
    if let Command::Completions { shell } = &cli.command {
        generate(*shell, &mut Cli::command(), "tg", &mut io::stdout());
        return;
    }

    match run(&cli) {
        Ok(output) => {
            if cli.json {
                println!("{}", output);
            } else {
                let printer = Printer::new(cli.no_color);
                printer.print(&cli.command, &output);
            }
        }
        Err(e) => {
            if cli.json {
                let body = serde_json::to_string(&ErrorResponse::from(&e))
                    .unwrap_or_else(|_| e.to_string());
                eprintln!("{}", body);
            } else {
                let printer = Printer::new_for_stderr(cli.no_color);
                printer.print_error(&format!("Error: {}", e));
            }
            std::process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> Result<String> {
    let cwd = std::env::current_dir()?;
    let config = Config::resolve(cli.config.as_deref(), &cwd)?;
    logging::init(&config.log, cli.verbose);

    let db_path = cli
        .db
        .clone()
        .or_else(|| config.storage.db_path.clone())
        .unwrap_or_else(|| default_db_path(&cwd));

    match &cli.command {
        Command::Init => {
            db::open_db(&db_path)?;
            Ok(serde_json::json!({ "initialized": true, "path": db_path }).to_string())
        }
        Command::Task(cmd) => {
            let (graph, owner) = open_graph(cli, &config, &db_path)?;
            match task::handle(&graph, &owner, cmd.clone())? {
                TaskResult::One(t) => Ok(serde_json::to_string_pretty(&t)?),
                TaskResult::View(v) => Ok(serde_json::to_string_pretty(&v)?),
                TaskResult::Many(ts) => Ok(serde_json::to_string_pretty(&ts)?),
                TaskResult::Edge(e) => Ok(serde_json::to_string_pretty(&e)?),
                TaskResult::Deactivated(report) => Ok(serde_json::to_string_pretty(&report)?),
                TaskResult::Verdict(verdict) => Ok(serde_json::to_string_pretty(&verdict)?),
                TaskResult::Tree(tree) => Ok(serde_json::to_string_pretty(&tree)?),
                TaskResult::Trees(trees) => Ok(serde_json::to_string_pretty(&trees)?),
                TaskResult::Depth(depth) => Ok(serde_json::to_string_pretty(&depth)?),
                TaskResult::Progress(progress) => Ok(serde_json::to_string_pretty(&progress)?),
            }
        }
        Command::Data(cmd) => {
            let (graph, owner) = open_graph(cli, &config, &db_path)?;
            match data::handle(&graph, &owner, cmd.clone())? {
                DataResult::Exported {
                    path,
                    version,
                    tasks,
                    dependencies,
                } => Ok(serde_json::to_string_pretty(&serde_json::json!({
                    "exported": true,
                    "path": path,
                    "version": version,
                    "tasks": tasks,
                    "dependencies": dependencies
                }))?),
            }
        }
        // PRECONDITION: Completions handled in main() before run() is called
        Command::Completions { .. } => unreachable!("completions handled before run()"),
    }
}

fn open_graph(
    cli: &Cli,
    config: &Config,
    db_path: &Path,
) -> Result<(GraphCoordinator<SqliteRepository>, OwnerId)> {
    let owner = resolve_owner(cli.owner.as_deref(), config)?;
    debug!(db = %db_path.display(), %owner, "opening task graph");
    let repo = SqliteRepository::open(db_path)?;
    Ok((GraphCoordinator::new(repo, config.graph.clone()), owner))
}
