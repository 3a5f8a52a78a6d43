//! Hive Agent
//!
//! One backlog worker. Claims features as `HIVE_AGENT_ID`, executes their
//! steps, and reports progress as protocol frames on stdout. Logs go to
//! stderr.
//!
//! Exit codes: 0 when stopped or out of work, 2 when a required directory is
//! missing, 1 on any other failure.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, error, info, warn};

use hive_agent::{
    AgentRunner, Backlog, CommandExecutor, Control, DryRunExecutor, LocalBacklog, RunSummary,
    StdioBacklog, StepExecutor,
};
use hive_core::config::{self, Config};
use hive_core::protocol::{EventBus, WorkerChannel};

const EXIT_FAILURE: u8 = 1;
const EXIT_MISSING_DIRECTORY: u8 = 2;

/// Time allowed for the last frames to reach stdout.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "hive-agent")]
#[command(version, about = "Hive worker - claims backlog features and executes their steps")]
struct Args {
    /// Backlog database file
    #[arg(long, env = "HIVE_DB_PATH")]
    db_path: PathBuf,

    /// Owner id used for claims
    #[arg(long, env = "HIVE_AGENT_ID")]
    agent_id: String,

    /// Model name handed to the step command (default: `agent.default_model`)
    #[arg(long)]
    model: Option<String>,

    /// Stop after claiming this many features
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Disable regression sampling in the backlog tools
    #[arg(long)]
    yolo: bool,

    /// Working directory (default: current directory)
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Shell command run once per step; without it the run is dry
    #[arg(long, env = "HIVE_STEP_COMMAND")]
    step_command: Option<String>,

    /// Reach the backlog through this tool server command instead of
    /// opening the database directly (e.g. `hive-daemon tools`)
    #[arg(long, env = "HIVE_TOOL_SERVER")]
    tool_server: Option<String>,

    /// Output logs as JSON
    #[arg(long, env = "HIVE_LOG_JSON")]
    log_json: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(_) => return ExitCode::from(EXIT_FAILURE),
    };
    let code = runtime.block_on(agent_main(args));
    // stdin is read on a blocking thread that only returns when the pipe
    // closes; do not wait for it.
    runtime.shutdown_timeout(Duration::from_millis(100));
    code
}

async fn agent_main(args: Args) -> ExitCode {
    let workdir = match &args.workdir {
        Some(dir) => dir.clone(),
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(_) => return ExitCode::from(EXIT_MISSING_DIRECTORY),
        },
    };

    let config = config::load_config(Some(&workdir));
    let level = config
        .as_ref()
        .map_or("info", |c| c.supervisor.log_level.as_str());
    let log_filter = format!("hive_agent={level},hive_store={level},hive_core={level}");
    hive_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    if let Some(missing) = missing_directory(&workdir, &args.db_path) {
        error!(path = %missing.display(), "Required directory does not exist");
        return ExitCode::from(EXIT_MISSING_DIRECTORY);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        owner = %args.agent_id,
        workdir = %workdir.display(),
        "Starting hive-agent"
    );

    match run(args, config, workdir).await {
        Ok(summary) => {
            info!(
                outcome = ?summary.outcome,
                completed = summary.completed,
                "Agent finished"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Agent failed");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// The working directory, or the directory that should hold the database,
/// if either is missing.
fn missing_directory<'a>(workdir: &'a Path, db_path: &'a Path) -> Option<&'a Path> {
    if !workdir.is_dir() {
        return Some(workdir);
    }
    match db_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => Some(parent),
        _ => None,
    }
}

async fn run(args: Args, config: Config, workdir: PathBuf) -> anyhow::Result<RunSummary> {
    let yolo = args.yolo || config.agent.yolo;
    let model = args.model.unwrap_or(config.agent.default_model);
    let max_iterations = args.max_iterations.or(config.agent.max_iterations);

    let backlog: Arc<dyn Backlog> = match &args.tool_server {
        Some(command) => Arc::new(StdioBacklog::spawn(command, &args.db_path, yolo)?),
        None => Arc::new(LocalBacklog::open(&args.db_path, yolo).await?),
    };

    let executor: Arc<dyn StepExecutor> = match &args.step_command {
        Some(command) => Arc::new(CommandExecutor::new(command, &workdir).with_model(model)),
        None => {
            warn!("No step command configured; steps are only narrated");
            Arc::new(DryRunExecutor)
        }
    };

    let control = Control::new();
    let channel = WorkerChannel::spawn_with(
        tokio::io::stdin(),
        tokio::io::stdout(),
        EventBus::new(),
        &args.agent_id,
        |bus, sender| {
            control.register(bus, &sender);
            bus.on_raw(|line| {
                debug!(line, "Ignoring non-protocol input");
                Ok(())
            });
        },
    );

    let runner = AgentRunner::new(
        args.agent_id,
        backlog,
        executor,
        channel.sender(),
        Arc::clone(&control),
    );
    let result = runner.run(max_iterations).await;

    drop(runner);
    channel.shutdown(FLUSH_TIMEOUT).await;
    Ok(result?)
}
