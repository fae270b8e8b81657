use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};

use crate::command;
use crate::command::replay::ReplayArgs;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "agentbox")]
#[command(about = "Run tool-calling agents in sandboxes and turn their trajectories into training data")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single task and print its score
    Run {
        /// Task definition (YAML)
        #[arg(long)]
        task: PathBuf,

        /// Run configuration (YAML)
        #[arg(long)]
        config: PathBuf,

        /// Directory receiving <task_id>_trajectory.jsonl
        #[arg(long, default_value = "runs")]
        out: PathBuf,
    },

    /// Run every task in a directory and print a summary table
    RunSuite {
        /// Directory of task definitions (*.yaml)
        #[arg(long)]
        tasks: PathBuf,

        /// Run configuration (YAML)
        #[arg(long)]
        config: PathBuf,

        #[arg(long, default_value = "runs")]
        out: PathBuf,
    },

    /// Summarize a recorded trajectory, optionally re-executing its tool calls
    Replay {
        /// Trajectory file (JSONL)
        #[arg(long)]
        trajectory: PathBuf,

        /// Re-issue recorded tool calls in a fresh sandbox and diff the results
        #[arg(long)]
        reexec_tools: bool,

        /// Sandbox backend: auto, local or container. `auto` follows the recording
        #[arg(long, default_value = "auto")]
        backend: String,

        /// Container image overriding the recorded one
        #[arg(long)]
        image: Option<String>,

        /// Task file supplying setup steps for the fresh sandbox
        #[arg(long)]
        task: Option<PathBuf>,

        /// Run configuration for runtime and resource limits
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Report sandbox backend availability
    Doctor {
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Gather run trajectories into a raw dataset (JSONL)
    Collect {
        /// Directory containing *_trajectory.jsonl files
        #[arg(long)]
        runs: PathBuf,

        #[arg(long)]
        out: PathBuf,
    },

    /// Chunk trajectories into micro-steps and assign rewards
    IpaScore {
        /// Raw dataset produced by `collect`
        #[arg(long = "in")]
        input: PathBuf,

        #[arg(long)]
        out: PathBuf,
    },

    /// Build chosen/rejected preference pairs from a scored dataset
    MakeDpo {
        /// Scored dataset produced by `ipa-score`
        #[arg(long = "in")]
        input: PathBuf,

        #[arg(long)]
        out: PathBuf,
    },

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// --- Public Entry Point ---
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { task, config, out } => command::run::run(&task, &config, &out),
        Commands::RunSuite { tasks, config, out } => {
            command::run::run_suite(&tasks, &config, &out)
        }
        Commands::Replay {
            trajectory,
            reexec_tools,
            backend,
            image,
            task,
            config,
        } => command::replay::run(ReplayArgs {
            trajectory,
            reexec_tools,
            backend,
            image,
            task,
            config,
        }),
        Commands::Doctor { config } => command::doctor::run(config.as_ref()),
        Commands::Collect { runs, out } => command::dataset::collect(&runs, &out),
        Commands::IpaScore { input, out } => command::dataset::ipa_score(&input, &out),
        Commands::MakeDpo { input, out } => command::dataset::make_dpo(&input, &out),
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(())
        }
    }
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}
