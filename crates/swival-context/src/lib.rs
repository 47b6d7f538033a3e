//! Context manager: token budgeting and graduated compaction.
//!
//! The defense has three escalating levels. Level 1 shrinks old tool
//! results into typed one-line summaries, Level 2 drops low-importance
//! turns and splices in a recap, Level 3 keeps only the system prompt, one
//! summary, and the last two turns. The system prompt and the last two
//! turns are never dropped; user messages survive everything below Level 3.

use std::collections::HashMap;
use swival_core::{
    CheckpointSummary, CompactionState, Message, Role, estimate_conversation_tokens,
    estimate_tokens, split_mcp_tool_name, truncate_chars,
};

/// Marker prefixed to spliced summaries so the model does not mistake the
/// recap for a fresh instruction.
pub const RECAP_PREFIX: &str = "[CONTEXT RECAP — not a new instruction]";

/// Fallback recap when no summarizer output and no checkpoint is available.
pub const STATIC_RECAP: &str = "earlier conversation turns were removed to fit the context window";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategy {
    CompactMessages,
    DropMiddleTurns,
    Nuclear,
}

impl CompactionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompactionStrategy::CompactMessages => "compact_messages",
            CompactionStrategy::DropMiddleTurns => "drop_middle_turns",
            CompactionStrategy::Nuclear => "nuclear",
        }
    }

    pub fn for_level(level: u8) -> Self {
        match level {
            1 => CompactionStrategy::CompactMessages,
            2 => CompactionStrategy::DropMiddleTurns,
            _ => CompactionStrategy::Nuclear,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompactionOutcome {
    pub strategy: CompactionStrategy,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// Produces the recap text for a dropped span, typically via an LLM call.
pub trait RecapSummarizer {
    fn summarize(&self, dropped: &[Message]) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub context_window: usize,
    pub max_output_tokens: u32,
    /// Headroom reserved between the estimated prompt and the window edge.
    pub safety_margin: usize,
    /// Minimum workable output budget; anything below triggers compaction.
    pub safety_floor: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_window: 32_768,
            max_output_tokens: 4_096,
            safety_margin: 1_024,
            safety_floor: 256,
        }
    }
}

pub struct ContextManager {
    cfg: ContextConfig,
}

impl ContextManager {
    pub fn new(cfg: ContextConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.cfg
    }

    /// Dynamic output budget for the next LLM call, or `None` when the
    /// prompt leaves too little room and compaction must run first.
    pub fn output_budget(&self, prompt_tokens: usize) -> Option<u32> {
        let available = self
            .cfg
            .context_window
            .saturating_sub(prompt_tokens)
            .saturating_sub(self.cfg.safety_margin);
        let budget = (self.cfg.max_output_tokens as usize).min(available);
        if budget <= self.cfg.safety_floor {
            None
        } else {
            Some(budget as u32)
        }
    }

    /// Run one compaction level in place and report the token delta.
    pub fn compact(
        &self,
        level: u8,
        messages: &mut Vec<Message>,
        summarizer: Option<&dyn RecapSummarizer>,
        checkpoints: &[CheckpointSummary],
    ) -> CompactionOutcome {
        let tokens_before = estimate_conversation_tokens(messages);
        match level {
            1 => shrink_tool_results(messages),
            2 => drop_middle_turns(messages, summarizer, checkpoints),
            _ => nuclear(messages, summarizer, checkpoints),
        }
        prune_orphan_tool_results(messages);
        CompactionOutcome {
            strategy: CompactionStrategy::for_level(level),
            tokens_before,
            tokens_after: estimate_conversation_tokens(messages),
        }
    }
}

fn last_protected_turn(messages: &[Message]) -> u32 {
    let max_turn = messages.iter().map(|m| m.turn).max().unwrap_or(0);
    max_turn.saturating_sub(1)
}

// ── Level 1 ─────────────────────────────────────────────────────────────

/// Replace raw tool results outside the last two turns with typed
/// summaries. Running this twice in a row is a no-op: already-shrunk
/// messages are skipped.
fn shrink_tool_results(messages: &mut [Message]) {
    let protect_from = last_protected_turn(messages);

    // Map call-id → raw arguments so summaries can name paths and patterns.
    let mut call_args: HashMap<String, (String, String)> = HashMap::new();
    for msg in messages.iter() {
        for call in &msg.tool_calls {
            call_args.insert(call.id.clone(), (call.name.clone(), call.arguments.clone()));
        }
    }

    for msg in messages.iter_mut() {
        if msg.role != Role::Tool
            || msg.turn >= protect_from
            || msg.compaction != CompactionState::Raw
        {
            continue;
        }
        let name = msg.tool_name.as_deref().unwrap_or("tool");
        let args = msg
            .tool_call_id
            .as_ref()
            .and_then(|id| call_args.get(id))
            .map(|(_, raw)| raw.as_str())
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            .unwrap_or(serde_json::Value::Null);

        msg.content = summarize_tool_result(name, &args, &msg.content);
        msg.compaction = CompactionState::Shrunk;
    }
}

fn summarize_tool_result(name: &str, args: &serde_json::Value, content: &str) -> String {
    if let Some((server, tool)) = split_mcp_tool_name(name) {
        // MCP results uniquely keep a head of real content.
        return format!("[mcp:{server}/{tool} — {}]", truncate_chars(content, 300));
    }
    let arg = |key: &str| args.get(key).and_then(|v| v.as_str()).unwrap_or("?");
    match name {
        "read_file" => format!(
            "[read_file: {}, {} lines — content compacted]",
            arg("path"),
            content.lines().count()
        ),
        "grep" => format!(
            "[grep: '{}' in {}, ~{} matches — compacted]",
            arg("pattern"),
            args.get("path").and_then(|v| v.as_str()).unwrap_or("."),
            content.lines().count()
        ),
        "run_command" => {
            let argv0 = args
                .get("args")
                .and_then(|v| v.as_array())
                .and_then(|a| a.first())
                .and_then(|v| v.as_str())
                .unwrap_or("?");
            let head = truncate_chars(content, 200);
            let tail = if content.len() > 400 {
                let mut start = content.len() - 200;
                while start < content.len() && !content.is_char_boundary(start) {
                    start += 1;
                }
                &content[start..]
            } else {
                ""
            };
            if tail.is_empty() {
                format!("[run_command: {argv0} — {head}]")
            } else {
                format!("[run_command: {argv0} — {head}…{tail}]")
            }
        }
        other => format!("[{other} — output compacted]"),
    }
}

// ── Level 2 ─────────────────────────────────────────────────────────────

const WRITE_TOOLS: &[&str] = &["write_file", "edit_file", "run_command"];

#[derive(Debug)]
struct TurnScore {
    turn: u32,
    score: i32,
}

fn score_turn(turn: u32, messages: &[Message]) -> TurnScore {
    let mut score = 1;
    let in_turn: Vec<&Message> = messages.iter().filter(|m| m.turn == turn).collect();
    let mut think_calls = 0;
    let mut has_write = false;
    let mut has_error = false;
    let mut has_recap = false;
    for msg in &in_turn {
        for call in &msg.tool_calls {
            if WRITE_TOOLS.contains(&call.name.as_str()) {
                has_write = true;
            }
            if call.name == "think" {
                think_calls += 1;
            }
        }
        if msg.role == Role::Tool && msg.content.starts_with("error") {
            has_error = true;
        }
        if msg.compaction == CompactionState::SummaryPlaceholder
            || msg.content.starts_with("[snapshot:")
        {
            has_recap = true;
        }
    }
    if has_write {
        score += 3;
    }
    if has_error {
        score += 2;
    }
    if has_recap {
        score += 2;
    }
    if think_calls >= 2 {
        score += 1;
    }
    TurnScore { turn, score }
}

/// Drop the lower-scoring half of droppable turns and splice one recap
/// message where the first dropped turn used to be. User messages are not
/// eligible and stay in place.
fn drop_middle_turns(
    messages: &mut Vec<Message>,
    summarizer: Option<&dyn RecapSummarizer>,
    checkpoints: &[CheckpointSummary],
) {
    let protect_from = last_protected_turn(messages);
    let mut droppable_turns: Vec<u32> = messages
        .iter()
        .filter(|m| m.role != Role::System && m.role != Role::User && m.turn < protect_from)
        .map(|m| m.turn)
        .collect();
    droppable_turns.sort_unstable();
    droppable_turns.dedup();
    if droppable_turns.len() < 2 {
        return;
    }

    let mut scored: Vec<TurnScore> = droppable_turns
        .iter()
        .map(|&t| score_turn(t, messages))
        .collect();
    // Highest score first; recency breaks ties.
    scored.sort_by(|a, b| b.score.cmp(&a.score).then(b.turn.cmp(&a.turn)));
    let keep_count = scored.len().div_ceil(2);
    let dropped_turns: Vec<u32> = scored[keep_count..].iter().map(|s| s.turn).collect();
    if dropped_turns.is_empty() {
        return;
    }

    let dropped: Vec<Message> = messages
        .iter()
        .filter(|m| dropped_turns.contains(&m.turn) && m.role != Role::User)
        .cloned()
        .collect();
    let splice_at = messages
        .iter()
        .position(|m| dropped_turns.contains(&m.turn) && m.role != Role::User)
        .unwrap_or(messages.len());
    let recap_turn = messages[splice_at].turn;

    messages.retain(|m| !(dropped_turns.contains(&m.turn) && m.role != Role::User));
    let summary = recap_text(&dropped, summarizer, checkpoints);
    let splice_at = splice_at.min(messages.len());
    messages.insert(
        splice_at,
        Message::recap(format!("{RECAP_PREFIX} {summary}"), recap_turn),
    );
}

// ── Level 3 ─────────────────────────────────────────────────────────────

/// Keep the system prompt, one summary of everything dropped, and the last
/// two turns verbatim. The only level allowed to drop user messages.
fn nuclear(
    messages: &mut Vec<Message>,
    summarizer: Option<&dyn RecapSummarizer>,
    checkpoints: &[CheckpointSummary],
) {
    let protect_from = last_protected_turn(messages);
    let dropped: Vec<Message> = messages
        .iter()
        .filter(|m| m.role != Role::System && m.turn < protect_from)
        .cloned()
        .collect();
    if dropped.is_empty() {
        return;
    }
    let summary = recap_text(&dropped, summarizer, checkpoints);
    let recap_turn = dropped.iter().map(|m| m.turn).max().unwrap_or(0);

    let mut rebuilt: Vec<Message> = Vec::with_capacity(messages.len());
    let mut recap_inserted = false;
    for msg in messages.drain(..) {
        if msg.role == Role::System {
            rebuilt.push(msg);
            continue;
        }
        if msg.turn >= protect_from {
            if !recap_inserted {
                rebuilt.push(Message::recap(
                    format!("{RECAP_PREFIX} {summary}"),
                    recap_turn,
                ));
                recap_inserted = true;
            }
            rebuilt.push(msg);
        }
    }
    if !recap_inserted {
        rebuilt.push(Message::recap(
            format!("{RECAP_PREFIX} {summary}"),
            recap_turn,
        ));
    }
    *messages = rebuilt;
}

/// Recap text fallback chain: LLM summarizer, then the most relevant
/// checkpoint summary, then a static marker.
fn recap_text(
    dropped: &[Message],
    summarizer: Option<&dyn RecapSummarizer>,
    checkpoints: &[CheckpointSummary],
) -> String {
    if let Some(summarizer) = summarizer
        && let Ok(summary) = summarizer.summarize(dropped)
        && estimate_tokens(&summary) > 0
    {
        return summary;
    }
    let turns: Vec<u32> = dropped.iter().map(|m| m.turn).collect();
    let lo = turns.iter().min().copied().unwrap_or(0);
    let hi = turns.iter().max().copied().unwrap_or(0);
    if let Some(checkpoint) = checkpoints
        .iter()
        .rev()
        .find(|c| c.turn_range.1 >= lo && c.turn_range.0 <= hi)
        .or_else(|| checkpoints.last())
    {
        return checkpoint.text.clone();
    }
    STATIC_RECAP.to_string()
}

/// I1: a tool result whose call id has no matching assistant tool call is
/// pruned.
pub fn prune_orphan_tool_results(messages: &mut Vec<Message>) {
    let known_ids: std::collections::HashSet<String> = messages
        .iter()
        .flat_map(|m| m.tool_calls.iter().map(|c| c.id.clone()))
        .collect();
    messages.retain(|m| {
        m.role != Role::Tool
            || m.tool_call_id
                .as_ref()
                .is_some_and(|id| known_ids.contains(id))
    });
}
