//! Micro-step chunking and credit assignment over a finished trajectory.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::trajectory::{EventType, TrajectoryEvent};

pub const MICRO_STEP_START: &str = "<micro-step>";
pub const MICRO_STEP_END: &str = "</micro-step>";

/// Subtracted from a chunk whose tool calls include a failing command.
pub const TOOL_ERROR_PENALTY: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub assistant_text: String,
    /// `{content}` of each tool-role message since the previous chunk
    pub observations: Vec<Value>,
    #[serde(default)]
    pub outcome_features: Map<String, Value>,
    /// Most recent `config` payload, serialized
    pub state_summary: String,
    /// `tool` event payloads since the previous chunk
    pub tool_calls: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub advantage: f64,
    pub chunk: Chunk,
    pub reward: f64,
}

/// Split an assistant turn on `<micro-step>` markers.
///
/// Text without markers is one segment, verbatim. Otherwise text around and
/// inside each marker pair becomes a trimmed segment when non-empty; an
/// unclosed start marker swallows the rest of the text.
pub fn split_micro_steps(text: &str) -> Vec<String> {
    if !text.contains(MICRO_STEP_START) {
        return vec![text.to_string()];
    }

    let mut segments = Vec::new();
    let mut push = |s: &str| {
        let s = s.trim();
        if !s.is_empty() {
            segments.push(s.to_string());
        }
    };

    let mut remaining = text;
    while let Some((before, rest)) = remaining.split_once(MICRO_STEP_START) {
        push(before);
        match rest.split_once(MICRO_STEP_END) {
            Some((inside, after)) => {
                push(inside);
                remaining = after;
            }
            None => {
                push(rest);
                remaining = "";
            }
        }
    }
    push(remaining);
    segments
}

/// One chunk per micro-step of every assistant message, in log order.
pub fn chunk_trajectory(events: &[TrajectoryEvent]) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    let mut observations: Vec<Value> = Vec::new();
    let mut state_summary = String::new();

    for event in events {
        match event.kind {
            EventType::Config => {
                state_summary = serde_json::to_string(&event.payload).unwrap_or_default();
            }
            EventType::Tool => tool_calls.push(event.payload.clone()),
            EventType::Message => {
                let content = event.payload["content"].as_str().unwrap_or_default();
                match event.payload["role"].as_str() {
                    Some("assistant") => {
                        for segment in split_micro_steps(content) {
                            chunks.push(Chunk {
                                assistant_text: segment,
                                observations: std::mem::take(&mut observations),
                                outcome_features: Map::new(),
                                state_summary: state_summary.clone(),
                                tool_calls: std::mem::take(&mut tool_calls),
                            });
                        }
                    }
                    Some("tool") => observations.push(json!({ "content": content })),
                    _ => {}
                }
            }
            EventType::Outcome => {}
        }
    }
    chunks
}

/// Score from the last `outcome` event, 0.0 when the run never closed.
pub fn final_reward(events: &[TrajectoryEvent]) -> f64 {
    events
        .iter()
        .rev()
        .find(|e| e.kind == EventType::Outcome)
        .and_then(|e| e.payload["score"].as_f64())
        .unwrap_or(0.0)
}

fn has_tool_error(chunk: &Chunk) -> bool {
    chunk.tool_calls.iter().any(|call| match &call["result"]["exit_code"] {
        Value::Null => false,
        code => code.as_f64() != Some(0.0),
    })
}

/// Later chunks earn a larger share of `final_reward`; failing tool calls
/// cost [`TOOL_ERROR_PENALTY`]. Advantages are rewards minus their mean.
pub fn assign_rewards(chunks: Vec<Chunk>, final_reward: f64) -> Vec<ScoredChunk> {
    let total = chunks.len().max(1) as f64;
    let mut scored: Vec<ScoredChunk> = chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            let mut reward = final_reward * (index as f64 + 1.0) / total;
            if has_tool_error(&chunk) {
                reward = (reward - TOOL_ERROR_PENALTY).max(0.0);
            }
            ScoredChunk {
                advantage: 0.0,
                chunk,
                reward,
            }
        })
        .collect();

    let mean = scored.iter().map(|s| s.reward).sum::<f64>() / total;
    for item in &mut scored {
        item.advantage = item.reward - mean;
    }
    scored
}
