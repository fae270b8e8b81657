//! The bounded tool-calling loop.
//!
//! One [`AgentController`] drives one run: it assembles a budgeted context,
//! asks the chat model for the next turn, executes any tool calls in the
//! sandbox, and logs every step to the trajectory before moving on. Runs end
//! when the model reports success, the step or turn budget is spent, or the
//! wall-clock deadline passes.

use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::AgentSection;
use crate::context::{WorkingMemory, build_messages};
use crate::llm::{ChatClient, ChatRequest, Message, Role, ToolCall};
use crate::prompts::Prompts;
use crate::sandbox::Sandbox;
use crate::task::TaskSpec;
use crate::tools::{ToolResult, dispatch_with_timeout, tool_schema};
use crate::trajectory::{
    EventType, TrajectoryWriter, config_payload, message_payload, tool_payload,
};

/// Case-insensitive marker the model uses to declare the task done.
pub const SUCCESS_MARKER: &str = "SUCCESS";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentConfig {
    pub max_steps: u32,
    /// Cap on tool executions across the whole run
    pub max_turns: u32,
    pub tool_timeout_s: f64,
    /// `None` sends the full working memory every step
    pub context_max_tokens: Option<usize>,
    pub memory_items: usize,
    pub time_limit_s: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 40,
            max_turns: 80,
            tool_timeout_s: 60.0,
            context_max_tokens: Some(8000),
            memory_items: 20,
            time_limit_s: 600.0,
        }
    }
}

impl From<&AgentSection> for AgentConfig {
    fn from(section: &AgentSection) -> Self {
        let defaults = AgentConfig::default();
        Self {
            max_steps: section.max_steps.unwrap_or(defaults.max_steps),
            max_turns: section.max_turns.unwrap_or(defaults.max_turns),
            tool_timeout_s: section.tool_timeout_s.unwrap_or(defaults.tool_timeout_s),
            // 0 disables budgeting
            context_max_tokens: match section.context_max_tokens {
                Some(0) => None,
                Some(n) => Some(n),
                None => defaults.context_max_tokens,
            },
            memory_items: section.memory_items.unwrap_or(defaults.memory_items),
            time_limit_s: section.time_limit_s.unwrap_or(defaults.time_limit_s),
        }
    }
}

/// Monotonic seconds since an arbitrary origin.
pub trait Clock {
    fn now(&self) -> f64;
}

pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    TimedOut,
    MaxStepsReached,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::TimedOut => "timed_out",
            RunOutcome::MaxStepsReached => "max_steps_reached",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentResult {
    pub success: bool,
    pub reason: String,
    pub outcome: RunOutcome,
    pub duration_s: f64,
}

/// Anything that can drive a task to a terminal outcome inside a sandbox.
pub trait TaskAgent {
    fn run(
        &mut self,
        task: &TaskSpec,
        sandbox: &dyn Sandbox,
        trajectory: &mut TrajectoryWriter,
    ) -> Result<AgentResult>;
}

pub struct AgentController<C, K = SystemClock> {
    client: C,
    clock: K,
    config: AgentConfig,
    prompts: Prompts,
}

impl<C: ChatClient> AgentController<C> {
    pub fn new(client: C, config: AgentConfig, prompts: Prompts) -> Self {
        Self::with_clock(client, SystemClock::default(), config, prompts)
    }
}

impl<C: ChatClient, K: Clock> AgentController<C, K> {
    pub fn with_clock(client: C, clock: K, config: AgentConfig, prompts: Prompts) -> Self {
        Self {
            client,
            clock,
            config,
            prompts,
        }
    }

    /// Execute one tool call, turning dispatch failures into error results
    /// so a bad call costs the model a turn rather than ending the run.
    fn execute(
        &self,
        sandbox: &dyn Sandbox,
        call: &ToolCall,
        timeout_cap: f64,
    ) -> (Value, ToolResult) {
        let name = call.function.name.as_str();
        let arguments = match call.parsed_arguments() {
            Ok(arguments) => arguments,
            Err(e) => {
                warn!(tool = name, error = %e, "agent:unparseable tool arguments");
                return (
                    Value::String(call.function.arguments.clone()),
                    ToolResult::from_error(name, &e),
                );
            }
        };

        let result = match dispatch_with_timeout(sandbox, name, &arguments, Some(timeout_cap)) {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = name, error = %format!("{:#}", e), "agent:tool failed");
                ToolResult::from_error(name, &e)
            }
        };
        (arguments, result)
    }

    fn finish(&self, started: f64, outcome: RunOutcome, reason: &str) -> AgentResult {
        let duration_s = self.clock.now() - started;
        info!(outcome = outcome.as_str(), reason, duration_s, "agent:run finished");
        AgentResult {
            success: outcome == RunOutcome::Succeeded,
            reason: reason.to_string(),
            outcome,
            duration_s,
        }
    }
}

impl<C: ChatClient, K: Clock> TaskAgent for AgentController<C, K> {
    fn run(
        &mut self,
        task: &TaskSpec,
        sandbox: &dyn Sandbox,
        trajectory: &mut TrajectoryWriter,
    ) -> Result<AgentResult> {
        let started = self.clock.now();
        let time_limit_s = task
            .constraints
            .time_limit_s
            .unwrap_or(self.config.time_limit_s);
        let deadline = started + time_limit_s;
        let mut memory = WorkingMemory::new(self.config.memory_items);
        let mut turns = 0u32;

        let mut agent_info = serde_json::to_value(&self.config)?;
        agent_info["time_limit_s"] = json!(time_limit_s);
        trajectory.log(
            EventType::Config,
            config_payload(
                self.client.describe(),
                sandbox.describe(),
                agent_info,
                json!({ "id": task.id, "setup_steps": task.setup_steps, "image": task.image }),
            ),
        )?;

        let system_prompt = self.prompts.system(task)?;
        let task_prompt = self.prompts.task(task)?;
        info!(task_id = %task.id, max_steps = self.config.max_steps, time_limit_s, "agent:run start");

        for step in 0..self.config.max_steps {
            if self.clock.now() >= deadline {
                return Ok(self.finish(started, RunOutcome::TimedOut, "deadline exceeded"));
            }

            let messages = build_messages(
                &system_prompt,
                &task_prompt,
                &memory.to_messages(),
                self.config.context_max_tokens,
            );
            debug!(step, messages = messages.len(), memory = memory.len(), "agent:step");
            let request = ChatRequest::auto(messages, tool_schema());
            let response = self
                .client
                .chat(&request)
                .with_context(|| format!("Chat request failed at step {}", step))?;

            memory.push(Message::assistant(
                response.content.clone(),
                response.tool_calls.clone(),
            ));
            trajectory.log(
                EventType::Message,
                message_payload(Role::Assistant, &response.content, &response.tool_calls),
            )?;

            if response.tool_calls.is_empty() {
                if response
                    .content
                    .to_uppercase()
                    .contains(SUCCESS_MARKER)
                {
                    return Ok(self.finish(
                        started,
                        RunOutcome::Succeeded,
                        "assistant reported success",
                    ));
                }
                continue;
            }

            for call in &response.tool_calls {
                if turns >= self.config.max_turns {
                    return Ok(self.finish(
                        started,
                        RunOutcome::MaxStepsReached,
                        "max turns reached",
                    ));
                }
                let remaining = deadline - self.clock.now();
                if remaining <= 0.0 {
                    return Ok(self.finish(started, RunOutcome::TimedOut, "deadline exceeded"));
                }

                let timeout_cap = self.config.tool_timeout_s.min(remaining);
                let (arguments, result) = self.execute(sandbox, call, timeout_cap);
                turns += 1;
                debug!(
                    tool = %call.function.name,
                    success = result.success,
                    truncated = result.truncated,
                    timeout_cap,
                    "agent:tool executed"
                );

                trajectory.log(
                    EventType::Tool,
                    tool_payload(
                        &call.function.name,
                        &arguments,
                        &result.raw,
                        Some(timeout_cap),
                    ),
                )?;
                memory.push(Message::tool(&call.function.name, &call.id, result.output.clone()));
                trajectory.log(
                    EventType::Message,
                    message_payload(Role::Tool, &result.output, &[]),
                )?;
            }
        }

        Ok(self.finish(started, RunOutcome::MaxStepsReached, "max steps reached"))
    }
}
