//! Working memory and token-budgeted context assembly.

use std::collections::VecDeque;

use tracing::trace;

use crate::llm::Message;

pub const SUMMARY_PREFIX: &str = "Working memory summary:\n";

/// Characters of each entry kept in a summary line.
const SUMMARY_ITEM_CHARS: usize = 200;

/// Bounded buffer of recent assistant and tool turns. Oldest entries fall off
/// silently once `max_items` is exceeded.
#[derive(Debug, Clone)]
pub struct WorkingMemory {
    max_items: usize,
    items: VecDeque<Message>,
}

impl WorkingMemory {
    pub fn new(max_items: usize) -> Self {
        Self {
            max_items,
            items: VecDeque::with_capacity(max_items.min(64)),
        }
    }

    pub fn push(&mut self, message: Message) {
        self.items.push_back(message);
        while self.items.len() > self.max_items {
            self.items.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Chronological snapshot.
    pub fn to_messages(&self) -> Vec<Message> {
        self.items.iter().cloned().collect()
    }
}

/// One `role: content` line per message, each content clipped to 200 chars.
pub fn summarize(items: &[Message]) -> String {
    if items.is_empty() {
        return "No prior steps.".to_string();
    }
    items
        .iter()
        .map(|m| format!("{}: {}", m.role, take_chars(&m.content, SUMMARY_ITEM_CHARS)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `max(1, chars / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() / 4).max(1)
}

/// Estimated cost of a message, including its serialized tool calls.
pub fn message_cost(message: &Message) -> usize {
    if message.tool_calls.is_empty() {
        return estimate_tokens(&message.content);
    }
    let calls = serde_json::to_string(&message.tool_calls).unwrap_or_default();
    estimate_tokens(&format!("{}{}", message.content, calls))
}

pub fn total_cost(messages: &[Message]) -> usize {
    messages.iter().map(message_cost).sum()
}

/// Assemble `[system, task, summary?, memory...]` within `max_tokens`.
///
/// Memory is kept newest-first until the next entry would not fit; whatever
/// was evicted is represented by a single summary message clipped to the
/// remaining budget. The result never exceeds `max_tokens` unless the two
/// mandatory prompts alone do.
pub fn build_messages(
    system_prompt: &str,
    task_prompt: &str,
    memory: &[Message],
    max_tokens: Option<usize>,
) -> Vec<Message> {
    let system = Message::system(system_prompt);
    let task = Message::user(task_prompt);

    let Some(budget) = max_tokens else {
        let mut messages = vec![system, task];
        messages.extend_from_slice(memory);
        return messages;
    };

    let base_cost = message_cost(&system) + message_cost(&task);
    if base_cost >= budget {
        trace!(base_cost, budget, "context:no room for memory");
        return vec![system, task];
    }

    let mut remaining = budget - base_cost;
    let mut split = memory.len();
    for (index, message) in memory.iter().enumerate().rev() {
        let cost = message_cost(message);
        if cost > remaining {
            break;
        }
        remaining -= cost;
        split = index;
    }
    let mut retained: Vec<Message> = memory[split..].to_vec();
    let evicted = &memory[..split];

    let mut summary = None;
    if !evicted.is_empty() {
        let max_chars = remaining.saturating_mul(4);
        let prefix_chars = SUMMARY_PREFIX.chars().count();
        if max_chars > prefix_chars {
            let summary_text = summarize(evicted);
            let body = take_chars(&summary_text, max_chars - prefix_chars);
            summary = Some(Message::system(format!("{}{}", SUMMARY_PREFIX, body)));
        }
    }

    let cost_of = |summary: &Option<Message>, retained: &[Message]| {
        base_cost + summary.as_ref().map(message_cost).unwrap_or(0) + total_cost(retained)
    };
    while cost_of(&summary, &retained) > budget {
        if !retained.is_empty() {
            retained.remove(0);
        } else if summary.is_some() {
            summary = None;
        } else {
            break;
        }
    }

    trace!(
        budget,
        retained = retained.len(),
        evicted = evicted.len(),
        summarized = summary.is_some(),
        "context:assembled"
    );

    let mut messages = Vec::with_capacity(3 + retained.len());
    messages.push(system);
    messages.push(task);
    messages.extend(summary);
    messages.extend(retained);
    messages
}

fn take_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((cut, _)) => &text[..cut],
        None => text,
    }
}
