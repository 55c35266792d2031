//! Append-only transcript and bounded context views.
//!
//! The [`Transcript`] is the full thread log. It only grows. The
//! [`ContextWindow`] derives the slice of it that is shown to the model for a
//! single decision, under a token budget.
//!
//! Sizes are estimates (about four bytes per token plus a fixed per-message
//! overhead); the same estimator is used for the budget check and for the
//! running total, so a view that "fits" is guaranteed to fit by that measure.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{Content, Message, Role, ToolCall, ToolResult};

/// Fixed cost charged per message for role/framing.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Smallest preview used when the regular preview still does not fit.
const MIN_PREVIEW_BYTES: usize = 256;

/// Tool names listed in a summary marker before eliding the rest.
const MARKER_TOOL_NAMES: usize = 8;

/// Estimate the token cost of a message.
pub fn estimate_tokens(message: &Message) -> usize {
    let bytes = match &message.content {
        Content::Text { text } => text.len(),
        Content::ToolCalls { text, calls } => {
            text.len()
                + calls
                    .iter()
                    .map(|c| c.id.len() + c.name.len() + c.arguments.to_string().len())
                    .sum::<usize>()
        }
        Content::ToolResult { result } => result.output.len() + result.correlation_id.len(),
    };
    bytes.div_ceil(4) + MESSAGE_OVERHEAD_TOKENS
}

/// Ordered, append-only message log with a running size estimate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Message>", into = "Vec<Message>")]
pub struct Transcript {
    messages: Vec<Message>,
    estimated_tokens: usize,
}

impl From<Vec<Message>> for Transcript {
    fn from(messages: Vec<Message>) -> Self {
        let estimated_tokens = messages.iter().map(estimate_tokens).sum();
        Self {
            messages,
            estimated_tokens,
        }
    }
}

impl From<Transcript> for Vec<Message> {
    fn from(transcript: Transcript) -> Self {
        transcript.messages
    }
}

impl Transcript {
    pub fn append(&mut self, message: Message) {
        self.estimated_tokens += estimate_tokens(&message);
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn estimated_tokens(&self) -> usize {
        self.estimated_tokens
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Full result for a correlation id, if one was recorded.
    pub fn find_tool_result(&self, correlation_id: &str) -> Option<&ToolResult> {
        self.messages
            .iter()
            .rev()
            .filter_map(Message::as_tool_result)
            .find(|r| r.correlation_id == correlation_id)
    }

    /// Every correlation id already used by a call or a result.
    pub fn correlation_ids(&self) -> HashSet<&str> {
        self.messages
            .iter()
            .flat_map(|m| {
                m.calls()
                    .iter()
                    .map(|c| c.id.as_str())
                    .chain(m.as_tool_result().map(|r| r.correlation_id.as_str()))
            })
            .collect()
    }

    /// Calls of the most recent assistant turn that have no result yet.
    ///
    /// Non-empty only when a turn was interrupted between the model reply and
    /// the last observation.
    pub fn unresolved_calls(&self) -> Vec<ToolCall> {
        let Some(idx) = self
            .messages
            .iter()
            .rposition(|m| matches!(m.content, Content::ToolCalls { .. }))
        else {
            return Vec::new();
        };
        let answered: Vec<&str> = self.messages[idx + 1..]
            .iter()
            .filter_map(Message::as_tool_result)
            .map(|r| r.correlation_id.as_str())
            .collect();
        self.messages[idx]
            .calls()
            .iter()
            .filter(|c| !answered.contains(&c.id.as_str()))
            .cloned()
            .collect()
    }
}

/// The tail that must be shown does not fit the budget even when compacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("context overflow: minimal view needs {required} tokens, budget is {budget}")]
pub struct ContextOverflow {
    pub required: usize,
    pub budget: usize,
}

/// Produces bounded views of a transcript.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    /// Tool results larger than this are shown as a preview plus pointer.
    pub tool_preview_bytes: usize,
}

impl ContextWindow {
    pub fn new(tool_preview_bytes: usize) -> Self {
        Self { tool_preview_bytes }
    }

    /// Largest suffix of the transcript that fits `budget`.
    ///
    /// The system prompt (first message, when it has the system role) and the
    /// latest user message are always included. Dropped history is replaced
    /// by one synthetic summary marker. If the whole log fits it is returned
    /// unchanged.
    pub fn view(
        &self,
        transcript: &Transcript,
        budget: usize,
    ) -> Result<Vec<Message>, ContextOverflow> {
        let messages = transcript.messages();
        if transcript.estimated_tokens() <= budget {
            return Ok(messages.to_vec());
        }

        let system = messages.first().filter(|m| m.role == Role::System);
        let body_start = usize::from(system.is_some());
        let required_start = messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .unwrap_or(messages.len())
            .max(body_start);

        let mut smallest_required = usize::MAX;
        let mut previews = vec![self.tool_preview_bytes];
        if self.tool_preview_bytes > MIN_PREVIEW_BYTES {
            previews.push(MIN_PREVIEW_BYTES);
        }
        for preview_bytes in previews {
            let body: Vec<Message> = messages[body_start..]
                .iter()
                .map(|m| preview_message(m, preview_bytes))
                .collect();
            match select_suffix(system, &body, required_start - body_start, budget) {
                Ok(view) => return Ok(view),
                Err(required) => smallest_required = smallest_required.min(required),
            }
        }
        Err(ContextOverflow {
            required: smallest_required,
            budget,
        })
    }
}

/// Pick the smallest start index in `body` whose suffix fits.
///
/// Returns the minimal required size on failure.
fn select_suffix(
    system: Option<&Message>,
    body: &[Message],
    required_start: usize,
    budget: usize,
) -> Result<Vec<Message>, usize> {
    let system_cost = system.map(estimate_tokens).unwrap_or(0);
    let costs: Vec<usize> = body.iter().map(estimate_tokens).collect();
    // suffix_costs[i] = cost of body[i..]
    let mut suffix_costs = vec![0usize; body.len() + 1];
    for i in (0..body.len()).rev() {
        suffix_costs[i] = suffix_costs[i + 1] + costs[i];
    }

    let mut dropped = DroppedSummary::default();
    let mut last_total = 0;
    for start in 0..=required_start {
        if start > 0 {
            dropped.add(&body[start - 1]);
        }
        // Never open the view with a result whose call was dropped.
        if start < required_start && start > 0 && body[start].role == Role::Tool {
            continue;
        }
        let marker = (start > 0).then(|| dropped.marker());
        let total = system_cost + marker.as_ref().map(estimate_tokens).unwrap_or(0) + suffix_costs[start];
        last_total = total;
        if total <= budget {
            let mut view = Vec::with_capacity(body.len() - start + 2);
            view.extend(system.cloned());
            view.extend(marker);
            view.extend_from_slice(&body[start..]);
            return Ok(view);
        }
    }
    Err(last_total)
}

#[derive(Debug, Default)]
struct DroppedSummary {
    count: usize,
    by_role: BTreeMap<&'static str, usize>,
    tools: Vec<String>,
}

impl DroppedSummary {
    fn add(&mut self, message: &Message) {
        self.count += 1;
        *self.by_role.entry(message.role.as_str()).or_default() += 1;
        for call in message.calls() {
            if !self.tools.contains(&call.name) {
                self.tools.push(call.name.clone());
            }
        }
    }

    fn marker(&self) -> Message {
        let roles = self
            .by_role
            .iter()
            .map(|(role, n)| format!("{role}: {n}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut text = format!(
            "[context note] {} earlier messages were omitted to fit the context window ({roles}).",
            self.count
        );
        if !self.tools.is_empty() {
            let shown: Vec<&str> = self
                .tools
                .iter()
                .take(MARKER_TOOL_NAMES)
                .map(String::as_str)
                .collect();
            text.push_str(" Tools used in omitted turns: ");
            text.push_str(&shown.join(", "));
            if self.tools.len() > MARKER_TOOL_NAMES {
                text.push_str(&format!(" and {} more", self.tools.len() - MARKER_TOOL_NAMES));
            }
            text.push('.');
        }
        Message::system(text)
    }
}

/// Replace an oversized tool result with a preview and a pointer to the log.
fn preview_message(message: &Message, preview_bytes: usize) -> Message {
    let Some(result) = message.as_tool_result() else {
        return message.clone();
    };
    if result.output.len() <= preview_bytes {
        return message.clone();
    }
    let cut = floor_char_boundary(&result.output, preview_bytes);
    let mut preview = result.clone();
    preview.output = format!(
        "{}\n[output truncated: showing {cut} of {} bytes. The full result is kept in the \
         thread log; call read_tool_output with correlation_id \"{}\" to page through it.]",
        &result.output[..cut],
        result.size,
        result.correlation_id
    );
    Message {
        role: message.role,
        content: Content::ToolResult { result: preview },
        correlation_id: message.correlation_id.clone(),
    }
}

/// Largest index `<= max` that lies on a UTF-8 boundary of `s`.
pub fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
