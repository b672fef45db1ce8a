use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use orchestrate::errors::{EXIT_FAILURE, OrchestratorError};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "orchestrate")]
#[command(
    version,
    about = "Phase pipelines, capability locks, budgets and backlog scheduling for agent workflows",
    after_help = "Run a phase with `orchestrate <pipeline> <phase> [args...]`, or a whole pipeline with `orchestrate <pipeline>`."
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    pub json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// State directory (default: <project>/.orchestrate)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Backlog task the phase works on (pipeline runs only)
    #[arg(long)]
    pub task: Option<String>,

    /// Spec file substituted for `{spec}` in lock templates (pipeline runs only)
    #[arg(long)]
    pub spec: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the state directory, a commented config and an empty backlog
    Init,
    /// Ask another pipeline to run an action
    Request(RequestArgs),
    /// Dispatch pending interop requests (all of them by default)
    Pump {
        /// Dispatch only the oldest pending request
        #[arg(long, conflicts_with = "request")]
        once: bool,
        /// Dispatch this request, retrying it if the last attempt failed
        #[arg(long)]
        request: Option<String>,
    },
    /// Auto-advance through the backlog
    Program {
        #[arg(long)]
        max_cycles: Option<u32>,
        /// Continue the interrupted or halted program
        #[arg(long)]
        resume: bool,
        /// Show the order and next task without running anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Summarize backlog, locks, budgets and pending requests
    Status,
    /// List recent runs
    Runs {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Inspect or repair the lock table
    Locks {
        #[command(subcommand)]
        command: Option<LocksCommands>,
    },
    /// List pipeline definitions
    Pipelines,
    /// Pre-tool-use hook: deny tool calls the active phase may not make
    Guard,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    #[command(external_subcommand)]
    Pipeline(Vec<String>),
}

#[derive(Args, Clone)]
pub struct RequestArgs {
    /// Source pipeline (default: $ORCHESTRATE_PIPELINE)
    #[arg(long)]
    pub from: Option<String>,
    /// Source phase (default: $ORCHESTRATE_PHASE)
    #[arg(long)]
    pub from_phase: Option<String>,
    #[arg(long)]
    pub to: String,
    /// Target phase, as `phase` or `pipeline.phase`
    #[arg(long)]
    pub action: String,
    #[arg(long = "arg")]
    pub args: Vec<String>,
    #[arg(long)]
    pub must_read: Vec<String>,
    #[arg(long)]
    pub allowed_path: Vec<String>,
    #[arg(long)]
    pub deliverable: Vec<String>,
    #[arg(long, default_value = "")]
    pub justification: String,
    /// Parent run (default: $ORCHESTRATE_RUN_ID)
    #[arg(long)]
    pub parent_run: Option<String>,
    #[arg(long)]
    pub max_read_bytes: Option<u64>,
    /// Explicit request ID, for idempotent resubmission
    #[arg(long)]
    pub id: Option<String>,
}

#[derive(Subcommand, Clone)]
pub enum LocksCommands {
    /// Show every live grant
    List,
    /// Drop every grant held by a crashed holder
    Release {
        #[arg(long)]
        holder: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the resolved configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    orchestrate::logging::init(cli.verbose);

    let code = match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", console::style("error:").red().bold(), e);
            e.downcast_ref::<OrchestratorError>()
                .map_or(EXIT_FAILURE, OrchestratorError::exit_code)
        }
    };
    std::process::exit(code);
}

async fn run(cli: &Cli) -> Result<i32> {
    match &cli.command {
        Commands::Init => cmd::cmd_init(cli),
        Commands::Request(args) => cmd::cmd_request(cli, args),
        Commands::Pump { once, request } => cmd::cmd_pump(cli, *once, request.clone()).await,
        Commands::Program {
            max_cycles,
            resume,
            dry_run,
        } => cmd::cmd_program(cli, *max_cycles, *resume, *dry_run).await,
        Commands::Status => cmd::cmd_status(cli),
        Commands::Runs { limit } => cmd::cmd_runs(cli, *limit),
        Commands::Locks { command } => cmd::cmd_locks(cli, command.clone()),
        Commands::Pipelines => cmd::cmd_pipelines(cli),
        Commands::Guard => cmd::cmd_guard(cli),
        Commands::Config { command } => cmd::cmd_config(cli, command.clone()),
        Commands::Pipeline(args) => cmd::run_pipeline(cli, args).await,
    }
}
