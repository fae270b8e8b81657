//! Binary scoring of a finished workspace against a task's success criteria.

use anyhow::Result;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::sandbox::Sandbox;
use crate::task::{Criterion, SuccessCriteria};

const COMMAND_TIMEOUT_S: f64 = 30.0;
const UNIT_TEST_TIMEOUT_S: f64 = 60.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreResult {
    pub score: f64,
    pub success: bool,
    pub details: Value,
}

impl ScoreResult {
    fn binary(success: bool, details: Value) -> Self {
        Self {
            score: if success { 1.0 } else { 0.0 },
            success,
            details,
        }
    }
}

/// Score the sandbox workspace. Unsupported criteria score 0.0 with an
/// `"unsupported criteria"` marker; only sandbox failures are errors.
pub fn evaluate(sandbox: &dyn Sandbox, criteria: &SuccessCriteria) -> Result<ScoreResult> {
    let criterion = match Criterion::try_from(criteria) {
        Ok(criterion) => criterion,
        Err(e) => {
            warn!(kind = %criteria.kind, error = %e, "scoring:unsupported criteria");
            return Ok(ScoreResult::binary(
                false,
                json!({ "error": "unsupported criteria", "reason": e.to_string() }),
            ));
        }
    };

    let result = match criterion {
        Criterion::CommandExitCode { command } => {
            let output = sandbox.run_command(&command, COMMAND_TIMEOUT_S)?;
            ScoreResult::binary(output.success(), output.to_raw())
        }
        Criterion::UnitTestsPass { command } => {
            let output = sandbox.run_command(&command, UNIT_TEST_TIMEOUT_S)?;
            ScoreResult::binary(output.success(), output.to_raw())
        }
        Criterion::RegexInStdout { command, regex } => {
            let output = sandbox.run_command(&command, COMMAND_TIMEOUT_S)?;
            ScoreResult::binary(regex.is_match(&output.stdout), output.to_raw())
        }
        Criterion::FileContains { file, contains } => match sandbox.read_file(&file) {
            Ok(content) => ScoreResult::binary(content.contains(&contains), json!({ "file": file })),
            // A missing file is a failed task, not a broken harness
            Err(e) => ScoreResult::binary(false, json!({ "file": file, "error": format!("{:#}", e) })),
        },
    };

    info!(kind = %criteria.kind, success = result.success, score = result.score, "scoring:evaluated");
    Ok(result)
}
