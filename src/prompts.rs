use anyhow::{Context, Result};
use minijinja::{AutoEscape, Environment};
use serde_json::{Value as JsonValue, json};

use crate::config::AgentSection;
use crate::task::TaskSpec;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an agent operating inside a sandbox. \
Use the provided tools to inspect and modify files and execute commands. \
Be concise and follow the task goal. \
When the goal is met, reply with SUCCESS and no tool calls.";

pub const DEFAULT_TASK_PROMPT: &str = "Task goal:\n{{ goal }}\n\nEvaluation:\n{{ evaluation }}";

/// System and task prompt templates, rendered once per run.
pub struct Prompts {
    env: Environment<'static>,
    system: String,
    task: String,
}

impl Prompts {
    pub fn from_section(section: &AgentSection) -> Self {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::None);
        Self {
            env,
            system: section
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            task: section
                .task_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_TASK_PROMPT.to_string()),
        }
    }

    pub fn system(&self, task: &TaskSpec) -> Result<String> {
        self.env
            .render_str(&self.system, template_context(task))
            .context("Failed to render system prompt")
    }

    pub fn task(&self, task: &TaskSpec) -> Result<String> {
        self.env
            .render_str(&self.task, template_context(task))
            .context("Failed to render task prompt")
    }
}

fn template_context(task: &TaskSpec) -> JsonValue {
    json!({
        "task_id": task.id,
        "goal": task.goal,
        "description": task.description,
        "evaluation": task.evaluation_text(),
    })
}
