use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use crate::agent::AgentConfig;
use crate::config::RunConfig;
use crate::replay::{ReplayPlan, ToolDiff, plan_replay, prepare_sandbox, reexec_tools, summarize};
use crate::sandbox::{BackendRequest, make_sandbox};
use crate::task::{TaskSpec, load_task};
use crate::trajectory::{TrajectoryEvent, load_trajectory};

pub struct ReplayArgs {
    pub trajectory: PathBuf,
    pub reexec_tools: bool,
    pub backend: String,
    pub image: Option<String>,
    pub task: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

pub fn run(args: ReplayArgs) -> Result<()> {
    let events = load_trajectory(&args.trajectory)?;
    let summary = summarize(&events);
    println!("steps: {}", summary.steps);
    println!("tool_calls: {}", summary.tool_calls);
    println!("outcome: {}", summary.outcome);

    if !args.reexec_tools {
        return Ok(());
    }

    let config = RunConfig::load_or_default(args.config.as_ref())?;
    let requested: BackendRequest = args.backend.parse()?;
    let task = args.task.as_deref().map(load_task).transpose()?;
    let plan = build_plan(&events, requested, args.image.as_deref(), task.as_ref(), &config);
    info!(
        trajectory = %args.trajectory.display(),
        backend = ?plan.backend,
        setup_steps = plan.setup_steps.len(),
        "replay:reexec starting"
    );

    let diffs = reexec(&events, &config, &plan)
        .with_context(|| format!("Failed to re-execute {}", args.trajectory.display()))?;
    for line in render_diffs(&diffs) {
        println!("{line}");
    }
    Ok(())
}

/// A task file supplies setup steps and a fallback image for trajectories
/// recorded without them. The run config's allowlist fills in for recordings
/// that carry none.
fn build_plan(
    events: &[TrajectoryEvent],
    requested: BackendRequest,
    image: Option<&str>,
    task: Option<&TaskSpec>,
    config: &RunConfig,
) -> ReplayPlan {
    let mut plan = plan_replay(events, requested, image, config.sandbox.time_limit_s());
    if plan.sandbox.allowlist_paths.is_empty() {
        plan.sandbox.allowlist_paths = config.sandbox.allowlist_paths.clone().unwrap_or_default();
    }
    if let Some(task) = task {
        plan.setup_steps = task.setup_steps.clone();
        if plan.image.is_none() {
            plan.image = task.image.clone();
        }
    }
    plan
}

fn reexec(events: &[TrajectoryEvent], config: &RunConfig, plan: &ReplayPlan) -> Result<Vec<ToolDiff>> {
    let mut sandbox = make_sandbox(
        &config.sandbox,
        plan.sandbox.clone(),
        plan.backend,
        plan.image.as_deref(),
    )?;
    prepare_sandbox(sandbox.as_mut(), plan)?;
    let fallback_cap = AgentConfig::from(&config.agent).tool_timeout_s;
    let diffs = reexec_tools(events, sandbox.as_ref(), Some(fallback_cap));
    sandbox.teardown()?;
    Ok(diffs)
}

fn render_diffs(diffs: &[ToolDiff]) -> Vec<String> {
    if diffs.is_empty() {
        return vec!["reexec: no differences found".to_string()];
    }
    let mut lines = Vec::new();
    for diff in diffs {
        lines.push(format!("tool #{} {}:", diff.index, diff.name));
        for field in &diff.differences {
            lines.push(format!("  {field}"));
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::replay::FieldDiff;
    use crate::trajectory::EventType;

    fn recorded() -> Vec<TrajectoryEvent> {
        vec![TrajectoryEvent::new(
            EventType::Config,
            json!({
                "sandbox": {"type": "local", "network_enabled": false},
                "task": {"id": "t", "setup_steps": ["echo recorded"], "image": null}
            }),
        )]
    }

    #[test]
    fn task_file_replaces_setup_steps_and_fills_image() {
        let task: TaskSpec = serde_yaml::from_str(
            "id: t\ngoal: g\nimage: alpine:3\nsetup_steps:\n  - echo from task\nsuccess_criteria:\n  type: command_exit_code\n  command: 'true'\n",
        )
        .unwrap();
        let config = RunConfig::default();
        let plan = build_plan(&recorded(), BackendRequest::Auto, None, Some(&task), &config);
        assert_eq!(plan.setup_steps, vec!["echo from task"]);
        assert_eq!(plan.image.as_deref(), Some("alpine:3"));
        assert_eq!(plan.backend, BackendRequest::Local);

        let plan = build_plan(&recorded(), BackendRequest::Auto, Some("busybox"), Some(&task), &config);
        assert_eq!(plan.image.as_deref(), Some("busybox"));
    }

    #[test]
    fn recorded_setup_steps_used_without_task() {
        let plan = build_plan(&recorded(), BackendRequest::Auto, None, None, &RunConfig::default());
        assert_eq!(plan.setup_steps, vec!["echo recorded"]);
        assert_eq!(plan.sandbox.time_limit_s, 30);
    }

    #[test]
    fn config_allowlist_fills_in_for_recordings_without_one() {
        let config: RunConfig =
            serde_yaml::from_str("sandbox:\n  allowlist_paths: [\"/data/ref.txt\"]\n").unwrap();
        let plan = build_plan(&recorded(), BackendRequest::Container, None, None, &config);
        assert_eq!(plan.sandbox.allowlist_paths, vec!["/data/ref.txt"]);

        let mut events = recorded();
        events[0].payload["sandbox"]["allowlist_paths"] = json!(["/rec/only.txt"]);
        let plan = build_plan(&events, BackendRequest::Container, None, None, &config);
        assert_eq!(plan.sandbox.allowlist_paths, vec!["/rec/only.txt"]);
    }

    #[test]
    fn diff_rendering() {
        assert_eq!(render_diffs(&[]), vec!["reexec: no differences found"]);

        let lines = render_diffs(&[ToolDiff {
            index: 2,
            name: "terminal.exec".to_string(),
            differences: vec![FieldDiff {
                field: "stdout".to_string(),
                recorded: json!("a\n"),
                replayed: json!("b\n"),
            }],
        }]);
        assert_eq!(lines[0], "tool #2 terminal.exec:");
        assert!(lines[1].starts_with("  stdout: recorded="));
    }

    #[cfg(unix)]
    #[test]
    fn reexec_against_local_backend_matches_recording() {
        use crate::sandbox::{LocalSandbox, Sandbox, SandboxConfig};
        use crate::sandbox::limits::ResourceLimits;
        use crate::tools::dispatch;
        use crate::trajectory::tool_payload;

        let mut original = LocalSandbox::new(
            SandboxConfig {
                time_limit_s: 30,
                ..Default::default()
            },
            ResourceLimits::default(),
        );
        original.create_workspace().unwrap();
        original.run_command("echo recorded > seed.txt", 30.0).unwrap();
        let args = json!({"path": "seed.txt"});
        let result = dispatch(&original, "filesystem.read", &args).unwrap();

        let mut events = recorded();
        events[0].payload["task"]["setup_steps"] = json!(["echo recorded > seed.txt"]);
        events.push(TrajectoryEvent::new(
            EventType::Tool,
            tool_payload("filesystem.read", &args, &result.raw, None),
        ));

        let config = RunConfig::default();
        let plan = build_plan(&events, BackendRequest::Local, None, None, &config);
        assert!(reexec(&events, &config, &plan).unwrap().is_empty());
        original.teardown().unwrap();
    }
}
