//! Hive Daemon
//!
//! Runs a fleet of backlog workers, serves the backlog tools over stdio, and
//! offers a few administrative store commands.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use hive_core::config::{self, Config};
use hive_daemon::fleet::{self, FleetConfig};
use hive_daemon::registry::WorkerRegistry;
use hive_store::storage::NewFeature;
use hive_store::{Database, ToolDispatcher};

#[derive(Parser, Debug)]
#[command(name = "hive-daemon")]
#[command(version, about = "Hive supervisor - runs backlog workers over a shared store")]
struct Cli {
    /// Backlog database file
    #[arg(long, global = true, env = "HIVE_DB_PATH")]
    db: Option<PathBuf>,

    /// Output logs as JSON
    #[arg(long, global = true, env = "HIVE_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Spawn workers and supervise them until they finish or Ctrl+C
    Run(RunArgs),
    /// Serve backlog tool calls as JSON lines on stdin/stdout
    Tools {
        /// Refuse the regression tool
        #[arg(long, env = "HIVE_YOLO_MODE")]
        yolo: bool,
    },
    /// Print backlog progress
    Stats,
    /// List every feature in queue order
    List,
    /// Add features from a JSON file holding an array of items
    Create {
        #[arg(long)]
        file: PathBuf,
        /// Label attached to every created feature
        #[arg(long)]
        label: Option<String>,
    },
    /// Drop a claim so the feature can be picked up again
    Release {
        #[arg(long)]
        feature_id: i64,
        /// Only release if this owner holds the claim
        #[arg(long)]
        owner: Option<String>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Number of workers (default: `supervisor.max_workers`)
    #[arg(long, env = "HIVE_WORKERS")]
    workers: Option<u32>,

    /// Worker binary
    #[arg(long, default_value = "hive-agent", env = "HIVE_AGENT_BIN")]
    agent_bin: PathBuf,

    /// Root of the per-worker working directories
    #[arg(long)]
    workdir_root: PathBuf,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    max_iterations: Option<u32>,

    #[arg(long)]
    yolo: bool,

    /// Command each worker runs per step
    #[arg(long)]
    step_command: Option<String>,
}

impl RunArgs {
    fn agent_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(model) = &self.model {
            args.extend(["--model".to_string(), model.clone()]);
        }
        if let Some(n) = self.max_iterations {
            args.extend(["--max-iterations".to_string(), n.to_string()]);
        }
        if self.yolo {
            args.push("--yolo".to_string());
        }
        if let Some(cmd) = &self.step_command {
            args.extend(["--step-command".to_string(), cmd.clone()]);
        }
        args
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cwd = std::env::current_dir()?;
    let config = config::load_config(Some(&cwd))?;

    let level = &config.supervisor.log_level;
    let log_filter = format!("hive_daemon={level},hive_store={level},hive_core={level}");
    hive_core::tracing_init::init_tracing(&log_filter, cli.log_json);

    let db_path = resolve_db_path(cli.db.as_deref(), &config)?;

    match cli.command {
        Command::Run(args) => run(args, &config, db_path).await,
        Command::Tools { yolo } => serve_tools(&db_path, yolo || config.agent.yolo).await,
        Command::Stats => print_stats(&open(&db_path).await?).await,
        Command::List => print_list(&open(&db_path).await?).await,
        Command::Create { file, label } => {
            create(&open(&db_path).await?, &file, label.as_deref()).await
        }
        Command::Release { feature_id, owner } => {
            release(&open(&db_path).await?, feature_id, owner.as_deref()).await
        }
    }
}

fn resolve_db_path(flag: Option<&Path>, config: &Config) -> anyhow::Result<PathBuf> {
    flag.map(Path::to_path_buf)
        .or_else(|| config.supervisor.database_path.clone())
        .or_else(config::database_path)
        .ok_or_else(|| anyhow::anyhow!("Cannot determine database path; pass --db"))
}

async fn open(path: &Path) -> anyhow::Result<Database> {
    info!(path = %path.display(), "Opening backlog");
    Ok(Database::open(path).await?)
}

async fn run(args: RunArgs, config: &Config, db_path: PathBuf) -> anyhow::Result<()> {
    // Migrate once up front so workers never race on schema creation.
    drop(open(&db_path).await?);

    let fleet_config = FleetConfig {
        workers: args.workers.unwrap_or(config.supervisor.max_workers),
        program: args.agent_bin.clone(),
        args: args.agent_args(),
        workdir_root: args.workdir_root.clone(),
        db_path,
    };
    let grace = Duration::from_secs(config.supervisor.terminate_timeout_secs);
    let registry = WorkerRegistry::new();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = fleet_config.workers,
        agent_bin = %fleet_config.program.display(),
        "Starting hive-daemon"
    );

    if let Err(e) = fleet::launch(&fleet_config, &registry).await {
        registry.terminate_all(grace).await;
        return Err(e.into());
    }

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        () = registry.wait_all() => {
            info!("All workers exited");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let failed = registry.terminate_all(grace).await;
    for status in registry.statuses().await {
        info!(
            owner = %status.owner,
            state = %status.state,
            exit_code = ?status.exit_code,
            "Worker final state"
        );
    }
    if failed > 0 {
        warn!(failed, "Some workers did not stop cleanly");
    }

    info!("Daemon stopped");
    Ok(())
}

async fn serve_tools(db_path: &Path, yolo: bool) -> anyhow::Result<()> {
    let tools = ToolDispatcher::new(open(db_path).await?, yolo);
    hive_store::server::serve(&tools, tokio::io::stdin(), tokio::io::stdout()).await?;
    Ok(())
}

#[allow(clippy::print_stdout)]
async fn print_stats(db: &Database) -> anyhow::Result<()> {
    let stats = db.stats().await?;
    println!(
        "{}/{} completed ({:.1}%), {} claimed",
        stats.completed, stats.total, stats.percentage, stats.claimed
    );
    for label in db.labels().await? {
        println!(
            "  {:<20} {}/{} completed, {} claimed, {} pending",
            label.label.as_deref().unwrap_or("(unlabelled)"),
            label.completed,
            label.count,
            label.claimed,
            label.pending
        );
    }
    Ok(())
}

#[allow(clippy::print_stdout)]
async fn print_list(db: &Database) -> anyhow::Result<()> {
    for f in db.list_features().await? {
        let status = if f.completed {
            "done".to_string()
        } else if let Some(owner) = &f.owner {
            format!("claimed by {owner}")
        } else {
            "pending".to_string()
        };
        println!(
            "#{:<5} p{:<6} {:<8} {} [{}]",
            f.id,
            f.priority,
            f.kind.as_str(),
            f.name,
            status
        );
    }
    Ok(())
}

#[allow(clippy::print_stdout)]
async fn create(db: &Database, file: &Path, label: Option<&str>) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", file.display()))?;
    let items: Vec<NewFeature> = serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", file.display()))?;
    let created = db.create_batch(&items, label).await?;
    println!("Created {created} features");
    Ok(())
}

#[allow(clippy::print_stdout)]
async fn release(db: &Database, feature_id: i64, owner: Option<&str>) -> anyhow::Result<()> {
    let feature = db.release(feature_id, owner).await?;
    println!("Released #{} {}", feature.id, feature.name);
    Ok(())
}
