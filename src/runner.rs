//! Task harness: sandbox setup, agent run, scoring, and the closing outcome event.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::agent::{AgentConfig, AgentController, TaskAgent};
use crate::config::RunConfig;
use crate::llm::{CommandChatClient, RetryPolicy, RetryingClient};
use crate::prompts::Prompts;
use crate::sandbox::{Sandbox, make_sandbox};
use crate::scoring::evaluate;
use crate::task::TaskSpec;
use crate::trajectory::{EventType, OutcomeRecord, TrajectoryWriter, trajectory_file_name};

#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub task_id: String,
    pub success: bool,
    pub score: f64,
    pub outcome: String,
    pub reason: String,
    pub duration_s: f64,
    pub trajectory_path: PathBuf,
}

/// Agent used by the CLI: the configured chat command behind the retry policy.
pub fn default_agent(
    config: &RunConfig,
) -> Result<AgentController<RetryingClient<CommandChatClient>>> {
    let client = RetryingClient::new(
        CommandChatClient::new(config.llm.clone())?,
        RetryPolicy::from_config(&config.llm),
    );
    Ok(AgentController::new(
        client,
        AgentConfig::from(&config.agent),
        Prompts::from_section(&config.agent),
    ))
}

/// Run one task end to end and write `<task_id>_trajectory.jsonl` into `out_dir`.
pub fn run_task(
    task: &TaskSpec,
    config: &RunConfig,
    out_dir: &Path,
    agent: &mut dyn TaskAgent,
) -> Result<RunResult> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create output directory {}", out_dir.display()))?;

    let sandbox_config = config.sandbox.sandbox_config(task.constraints.network);
    let mut sandbox = make_sandbox(
        &config.sandbox,
        sandbox_config,
        config.sandbox.backend()?,
        task.image.as_deref(),
    )?;
    sandbox.create_workspace()?;

    let outcome = run_in_sandbox(task, config, out_dir, agent, sandbox.as_ref());
    sandbox.teardown()?;
    outcome
}

fn run_in_sandbox(
    task: &TaskSpec,
    config: &RunConfig,
    out_dir: &Path,
    agent: &mut dyn TaskAgent,
    sandbox: &dyn Sandbox,
) -> Result<RunResult> {
    let setup_timeout = config.sandbox.time_limit_s() as f64;
    for step in &task.setup_steps {
        let output = sandbox
            .run_command(step, setup_timeout)
            .with_context(|| format!("Setup step failed to run: {}", step))?;
        if !output.success() {
            warn!(task_id = %task.id, step = %step, exit_code = output.exit_code, "runner:setup step exited non-zero");
        }
    }

    let trajectory_path = out_dir.join(trajectory_file_name(&task.id));
    let mut trajectory = TrajectoryWriter::create(&trajectory_path)?;

    let agent_result = agent.run(task, sandbox, &mut trajectory)?;
    let score = evaluate(sandbox, &task.success_criteria)?;

    let record = OutcomeRecord {
        success: score.success,
        score: score.score,
        reason: agent_result.reason.clone(),
        outcome: agent_result.outcome.as_str().to_string(),
        duration_s: agent_result.duration_s,
    };
    trajectory.log(EventType::Outcome, serde_json::to_value(&record)?)?;

    info!(
        task_id = %task.id,
        events = trajectory.events().len(),
        agent_success = agent_result.success,
        success = record.success,
        score = record.score,
        outcome = %record.outcome,
        "runner:task finished"
    );

    Ok(RunResult {
        task_id: task.id.clone(),
        success: record.success,
        score: record.score,
        outcome: record.outcome,
        reason: record.reason,
        duration_s: record.duration_s,
        trajectory_path: trajectory.path().to_path_buf(),
    })
}

/// Run tasks one after another. A task that fails to run is reported with
/// outcome `error` and score 0 instead of stopping the suite.
pub fn run_suite(
    tasks: &[TaskSpec],
    config: &RunConfig,
    out_dir: &Path,
    agent: &mut dyn TaskAgent,
) -> Vec<RunResult> {
    tasks
        .iter()
        .map(|task| match run_task(task, config, out_dir, agent) {
            Ok(result) => result,
            Err(e) => {
                error!(task_id = %task.id, error = %format!("{:#}", e), "runner:task errored");
                RunResult {
                    task_id: task.id.clone(),
                    success: false,
                    score: 0.0,
                    outcome: "error".to_string(),
                    reason: format!("{:#}", e),
                    duration_s: 0.0,
                    trajectory_path: out_dir.join(trajectory_file_name(&task.id)),
                }
            }
        })
        .collect()
}
