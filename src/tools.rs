//! The fixed tool surface exposed to the model.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::AgentboxError;
use crate::sandbox::Sandbox;

/// Character budget for tool output shown to the model.
pub const MAX_OUTPUT_CHARS: usize = 2000;

pub const TRUNCATION_MARKER: &str = "...<truncated>";

/// Default `terminal.exec` timeout when the call does not pass one.
pub const DEFAULT_EXEC_TIMEOUT_S: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolName {
    TerminalExec,
    FilesystemRead,
    FilesystemWrite,
    FilesystemList,
}

impl ToolName {
    pub const ALL: [ToolName; 4] = [
        ToolName::TerminalExec,
        ToolName::FilesystemRead,
        ToolName::FilesystemWrite,
        ToolName::FilesystemList,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::TerminalExec => "terminal.exec",
            ToolName::FilesystemRead => "filesystem.read",
            ToolName::FilesystemWrite => "filesystem.write",
            ToolName::FilesystemList => "filesystem.list",
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = AgentboxError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ToolName::ALL
            .into_iter()
            .find(|tool| tool.as_str() == s)
            .ok_or_else(|| AgentboxError::ToolNotFound(s.to_string()))
    }
}

/// Outcome of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub name: String,
    /// Text shown to the model, capped at [`MAX_OUTPUT_CHARS`]
    pub output: String,
    pub success: bool,
    pub truncated: bool,
    /// Untruncated structured result, recorded in the trajectory
    pub raw: Value,
}

impl ToolResult {
    /// Result reported to the model when dispatch itself failed.
    pub fn from_error(name: &str, err: &anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        Self {
            name: name.to_string(),
            output: format!("error: {}", message),
            success: false,
            truncated: false,
            raw: json!({ "error": message }),
        }
    }
}

/// Cap `text` at [`MAX_OUTPUT_CHARS`] characters.
pub fn truncate(text: &str) -> (String, bool) {
    match text.char_indices().nth(MAX_OUTPUT_CHARS) {
        None => (text.to_string(), false),
        Some((cut, _)) => (format!("{}{}", &text[..cut], TRUNCATION_MARKER), true),
    }
}

/// Dispatch with no cap beyond what the call requests.
#[cfg(test)]
pub fn dispatch(sandbox: &dyn Sandbox, name: &str, args: &Value) -> Result<ToolResult> {
    dispatch_with_timeout(sandbox, name, args, None)
}

/// Dispatch a tool call. `timeout_cap` bounds `terminal.exec` below whatever
/// timeout the call itself requested.
pub fn dispatch_with_timeout(
    sandbox: &dyn Sandbox,
    name: &str,
    args: &Value,
    timeout_cap: Option<f64>,
) -> Result<ToolResult> {
    let tool: ToolName = name.parse()?;
    debug!(tool = %tool, "tool:dispatch");

    match tool {
        ToolName::TerminalExec => {
            let cmd = str_arg(args, "cmd", "");
            let requested = args
                .get("timeout_s")
                .and_then(Value::as_f64)
                .unwrap_or(DEFAULT_EXEC_TIMEOUT_S);
            let timeout_s = match timeout_cap {
                Some(cap) => requested.min(cap),
                None => requested,
            };
            let result = sandbox.run_command(cmd, timeout_s)?;
            let (output, truncated) = truncate(&format!("{}{}", result.stdout, result.stderr));
            Ok(ToolResult {
                name: tool.to_string(),
                output,
                success: result.success(),
                truncated,
                raw: result.to_raw(),
            })
        }
        ToolName::FilesystemRead => {
            let path = str_arg(args, "path", "");
            let content = sandbox.read_file(path)?;
            let (output, truncated) = truncate(&content);
            Ok(ToolResult {
                name: tool.to_string(),
                output,
                success: true,
                truncated,
                raw: json!({ "path": path, "content": content }),
            })
        }
        ToolName::FilesystemWrite => {
            let path = str_arg(args, "path", "");
            let content = str_arg(args, "content", "");
            sandbox.write_file(path, content)?;
            Ok(ToolResult {
                name: tool.to_string(),
                output: format!("Wrote {} bytes to {}", content.len(), path),
                success: true,
                truncated: false,
                raw: json!({ "path": path, "content": content }),
            })
        }
        ToolName::FilesystemList => {
            let path = str_arg(args, "path", ".");
            let entries = sandbox.list_dir(path)?;
            let (output, truncated) = truncate(&entries.join("\n"));
            Ok(ToolResult {
                name: tool.to_string(),
                output,
                success: true,
                truncated,
                raw: json!({ "path": path, "entries": entries }),
            })
        }
    }
}

fn str_arg<'a>(args: &'a Value, key: &str, default: &'a str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or(default)
}

/// Function-calling schema advertised to the model on every request.
pub fn tool_schema() -> Vec<Value> {
    let function = |name: ToolName, description: &str, properties: Value, required: &[&str]| {
        json!({
            "type": "function",
            "function": {
                "name": name.as_str(),
                "description": description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                },
            },
        })
    };

    vec![
        function(
            ToolName::TerminalExec,
            "Run a shell command inside the sandbox.",
            json!({ "cmd": {"type": "string"}, "timeout_s": {"type": "number"} }),
            &["cmd"],
        ),
        function(
            ToolName::FilesystemRead,
            "Read a file inside the sandbox.",
            json!({ "path": {"type": "string"} }),
            &["path"],
        ),
        function(
            ToolName::FilesystemWrite,
            "Write a file inside the sandbox.",
            json!({ "path": {"type": "string"}, "content": {"type": "string"} }),
            &["path", "content"],
        ),
        function(
            ToolName::FilesystemList,
            "List a directory inside the sandbox.",
            json!({ "path": {"type": "string"} }),
            &["path"],
        ),
    ]
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::sandbox::limits::ResourceLimits;
    use crate::sandbox::{LocalSandbox, SandboxConfig};

    fn sandbox() -> LocalSandbox {
        let mut sandbox = LocalSandbox::new(SandboxConfig::default(), ResourceLimits::default());
        sandbox.create_workspace().unwrap();
        sandbox
    }

    #[test]
    fn unknown_tool_is_rejected() {
        let sandbox = sandbox();
        let err = dispatch(&sandbox, "browser.open", &json!({})).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentboxError>(),
            Some(AgentboxError::ToolNotFound(name)) if name == "browser.open"
        ));
    }

    #[test]
    fn exec_success_follows_exit_code() {
        let sandbox = sandbox();
        let ok = dispatch(&sandbox, "terminal.exec", &json!({"cmd": "echo hi"})).unwrap();
        assert!(ok.success);
        assert_eq!(ok.output, "hi\n");
        assert_eq!(ok.raw["exit_code"], 0);

        let failed = dispatch(&sandbox, "terminal.exec", &json!({"cmd": "echo oops >&2; exit 2"}))
            .unwrap();
        assert!(!failed.success);
        assert_eq!(failed.output, "oops\n");
        assert_eq!(failed.raw["stderr"], "oops\n");
    }

    #[test]
    fn long_output_is_truncated_but_raw_is_complete() {
        let sandbox = sandbox();
        let big = "x".repeat(MAX_OUTPUT_CHARS + 500);
        sandbox.write_file("big.txt", &big).unwrap();

        let result = dispatch(&sandbox, "filesystem.read", &json!({"path": "big.txt"})).unwrap();
        assert!(result.truncated);
        assert!(result.output.ends_with(TRUNCATION_MARKER));
        assert_eq!(
            result.output.len(),
            MAX_OUTPUT_CHARS + TRUNCATION_MARKER.len()
        );
        assert_eq!(result.raw["content"].as_str().unwrap().len(), big.len());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(MAX_OUTPUT_CHARS + 1);
        let (output, truncated) = truncate(&text);
        assert!(truncated);
        assert_eq!(output.chars().count(), MAX_OUTPUT_CHARS + TRUNCATION_MARKER.len());
        assert_eq!(truncate("short"), ("short".to_string(), false));
    }

    #[test]
    fn write_and_list_report_structured_results() {
        let sandbox = sandbox();
        let write = dispatch(
            &sandbox,
            "filesystem.write",
            &json!({"path": "dir/note.txt", "content": "fixed"}),
        )
        .unwrap();
        assert_eq!(write.output, "Wrote 5 bytes to dir/note.txt");

        let list = dispatch(&sandbox, "filesystem.list", &json!({})).unwrap();
        assert_eq!(list.raw, json!({"path": ".", "entries": ["dir"]}));
    }

    #[test]
    fn timeout_cap_bounds_requested_timeout() {
        let sandbox = sandbox();
        let result = dispatch_with_timeout(
            &sandbox,
            "terminal.exec",
            &json!({"cmd": "sleep 20", "timeout_s": 30}),
            Some(0.3),
        )
        .unwrap();
        assert!(!result.success);
        assert_eq!(result.raw["exit_code"], 124);
    }

    #[test]
    fn path_escape_surfaces_as_error() {
        let sandbox = sandbox();
        let err = dispatch(&sandbox, "filesystem.read", &json!({"path": "../etc/passwd"}))
            .unwrap_err();
        let failed = ToolResult::from_error("filesystem.read", &err);
        assert!(!failed.success);
        assert!(failed.raw["error"].as_str().unwrap().contains("traversal"));
    }

    #[test]
    fn schema_lists_the_four_tools() {
        let names: Vec<String> = tool_schema()
            .iter()
            .map(|t| t["function"]["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["terminal.exec", "filesystem.read", "filesystem.write", "filesystem.list"]
        );
    }
}
