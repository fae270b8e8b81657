//! Chat-model seam: wire types, the [`ChatClient`] trait, and the retry policy.
//!
//! The only concrete transport is [`CommandChatClient`], which hands each
//! request to an external program. Anything that speaks the request/response
//! JSON below (an OpenAI-compatible shim, a local model runner) can sit behind it.

use std::fmt;
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::sandbox::process::run_with_input;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object, as produced by the model
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

impl ToolCall {
    /// Parsed arguments; an empty string means no arguments.
    pub fn parsed_arguments(&self) -> Result<Value> {
        parse_arguments(&self.function.name, &self.function.arguments)
    }
}

/// Decode a tool call's JSON argument string. Blank means `{}`.
pub fn parse_arguments(tool: &str, raw: &str) -> Result<Value> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).with_context(|| format!("Invalid JSON arguments for tool {}", tool))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            name: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool(name: &str, tool_call_id: &str, content: impl Into<String>) -> Self {
        Self {
            name: Some(name.to_string()),
            tool_call_id: Some(tool_call_id.to_string()).filter(|id| !id.is_empty()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<Value>,
    pub tool_choice: String,
}

impl ChatRequest {
    /// Request offering `tools` with automatic tool choice.
    pub fn auto(messages: Vec<Message>, tools: Vec<Value>) -> Self {
        Self {
            messages,
            tools,
            tool_choice: "auto".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ChatResponse {
    /// Parse either a bare `{content, tool_calls}` object or an
    /// OpenAI-style completion with `choices[0].message`.
    pub fn parse(body: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(body.trim()).context("Chat response is not valid JSON")?;
        let message = value.pointer("/choices/0/message").unwrap_or(&value);
        if !message.is_object() {
            bail!("Chat response is not a JSON object");
        }

        let content = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let tool_calls = match message.get("tool_calls") {
            None | Some(Value::Null) => Vec::new(),
            Some(calls) => serde_json::from_value(calls.clone())
                .context("Chat response has malformed tool_calls")?,
        };
        Ok(Self {
            content,
            tool_calls,
        })
    }
}

pub trait ChatClient {
    fn chat(&mut self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Model provenance recorded in the trajectory `config` event.
    fn describe(&self) -> Value;
}

impl<C: ChatClient + ?Sized> ChatClient for Box<C> {
    fn chat(&mut self, request: &ChatRequest) -> Result<ChatResponse> {
        (**self).chat(request)
    }

    fn describe(&self) -> Value {
        (**self).describe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            max_retries: config.max_retries(),
            initial_backoff: Duration::from_secs_f64(config.initial_backoff_s().max(0.0)),
        }
    }
}

/// Run `op` up to `max_retries + 1` times, sleeping between failures with a
/// doubling backoff. The last error is returned with the attempt count attached.
pub fn retry_with_backoff<T>(
    policy: &RetryPolicy,
    mut sleep: impl FnMut(Duration),
    mut op: impl FnMut(u32) -> Result<T>,
) -> Result<T> {
    let mut backoff = policy.initial_backoff;
    let mut attempt = 0;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= policy.max_retries => {
                return Err(e.context(format!("Giving up after {} attempts", attempt + 1)));
            }
            Err(e) => {
                warn!(attempt, backoff_s = backoff.as_secs_f64(), error = %format!("{:#}", e), "llm:retrying");
                sleep(backoff);
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
        }
    }
}

/// Wraps a client with [`retry_with_backoff`].
pub struct RetryingClient<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C: ChatClient> RetryingClient<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<C: ChatClient> ChatClient for RetryingClient<C> {
    fn chat(&mut self, request: &ChatRequest) -> Result<ChatResponse> {
        let inner = &mut self.inner;
        retry_with_backoff(&self.policy, thread::sleep, |_| inner.chat(request))
    }

    fn describe(&self) -> Value {
        self.inner.describe()
    }
}

/// Chat client that runs `llm.command` once per request, writing the request
/// JSON to its stdin and reading the response JSON from its stdout.
pub struct CommandChatClient {
    config: LlmConfig,
    program: String,
}

impl CommandChatClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let program = config
            .command()
            .ok_or_else(|| anyhow!("llm.command is not configured"))?
            .to_string();
        Ok(Self { config, program })
    }

    fn payload(&self, request: &ChatRequest) -> Value {
        json!({
            "model": self.config.model(),
            "temperature": self.config.temperature(),
            "max_tokens": self.config.max_tokens(),
            "base_url": self.config.base_url,
            "messages": request.messages,
            "tools": request.tools,
            "tool_choice": request.tool_choice,
        })
    }
}

impl ChatClient for CommandChatClient {
    fn chat(&mut self, request: &ChatRequest) -> Result<ChatResponse> {
        let payload = serde_json::to_string(&self.payload(request))?;
        let mut cmd = Command::new(&self.program);
        cmd.args(self.config.args());
        debug!(program = %self.program, messages = request.messages.len(), "llm:chat request");

        let output = run_with_input(cmd, Some(&payload), self.config.timeout_s(), || {})
            .with_context(|| format!("Failed to run chat command {}", self.program))?;
        if output.timed_out {
            bail!(
                "Chat command timed out after {:.1}s",
                self.config.timeout_s()
            );
        }
        if !output.success() {
            bail!(
                "Chat command exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            );
        }

        let response = ChatResponse::parse(&output.stdout)?;
        debug!(tool_calls = response.tool_calls.len(), "llm:chat response");
        Ok(response)
    }

    fn describe(&self) -> Value {
        json!({
            "model": self.config.model(),
            "temperature": self.config.temperature(),
            "base_url": self.config.base_url,
        })
    }
}
