//! Knowledge channels: out-of-band stores injected into the system prompt
//! every turn, immune to compaction.
//!
//! Thinking steps, todos, snapshot recaps, and proactive checkpoint
//! summaries all live here. Todos are mirrored to `.swival/todo.md`
//! atomically on every change.

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use swival_core::{
    CheckpointSummary, SnapshotRecap, ToolError, ToolErrorKind, estimate_tokens, truncate_chars,
};

/// Consolidate checkpoint summaries once their total estimate passes this.
pub const CHECKPOINT_TOKEN_BUDGET: usize = 2000;

/// Render at most this many trailing thinking steps verbatim.
const THINKING_RENDER_TAIL: usize = 20;

// ── Thinking ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingLink {
    Revision,
    Branch,
}

#[derive(Debug, Clone)]
pub struct ThinkingStep {
    pub number: u32,
    pub text: String,
    pub parent: Option<(u32, ThinkingLink)>,
}

#[derive(Debug, Default)]
pub struct ThinkingLog {
    steps: Vec<ThinkingStep>,
}

impl ThinkingLog {
    pub fn think(
        &mut self,
        text: &str,
        revise_of: Option<u32>,
        branch_of: Option<u32>,
    ) -> Result<u32, ToolError> {
        let parent = match (revise_of, branch_of) {
            (Some(_), Some(_)) => {
                return Err(ToolError::new(
                    ToolErrorKind::InvalidToolArguments,
                    "pass at most one of revise_of / branch_of",
                ));
            }
            (Some(n), None) => Some((n, ThinkingLink::Revision)),
            (None, Some(n)) => Some((n, ThinkingLink::Branch)),
            (None, None) => None,
        };
        if let Some((n, _)) = parent
            && !self.steps.iter().any(|s| s.number == n)
        {
            return Err(ToolError::new(
                ToolErrorKind::InvalidToolArguments,
                format!("no thinking step #{n} to link to"),
            ));
        }
        let number = self.steps.len() as u32 + 1;
        self.steps.push(ThinkingStep {
            number,
            text: text.to_string(),
            parent,
        });
        Ok(number)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Full history, or a summarized head plus verbatim tail once it grows.
    pub fn render(&self) -> Option<String> {
        if self.steps.is_empty() {
            return None;
        }
        let mut lines = vec!["[Thinking steps]".to_string()];
        if self.steps.len() > THINKING_RENDER_TAIL {
            let omitted = self.steps.len() - THINKING_RENDER_TAIL;
            lines.push(format!("({omitted} earlier steps omitted)"));
        }
        let tail_start = self.steps.len().saturating_sub(THINKING_RENDER_TAIL);
        for step in &self.steps[tail_start..] {
            let marker = match step.parent {
                Some((n, ThinkingLink::Revision)) => format!(" (revises #{n})"),
                Some((n, ThinkingLink::Branch)) => format!(" (branches #{n})"),
                None => String::new(),
            };
            lines.push(format!(
                "{}.{marker} {}",
                step.number,
                truncate_chars(&step.text, 400)
            ));
        }
        Some(lines.join("\n"))
    }
}

// ── Todos ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TodoState {
    Pending,
    InProgress,
    Done,
    Cancelled,
}

impl TodoState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TodoState::Pending => "pending",
            TodoState::InProgress => "in-progress",
            TodoState::Done => "done",
            TodoState::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TodoState::Pending),
            "in-progress" | "in_progress" => Some(TodoState::InProgress),
            "done" => Some(TodoState::Done),
            "cancelled" | "canceled" => Some(TodoState::Cancelled),
            _ => None,
        }
    }

    fn checkbox(&self) -> &'static str {
        match self {
            TodoState::Pending => "[ ]",
            TodoState::InProgress => "[~]",
            TodoState::Done => "[x]",
            TodoState::Cancelled => "[-]",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TodoItem {
    pub id: u32,
    pub text: String,
    pub state: TodoState,
}

#[derive(Debug)]
pub struct TodoList {
    items: Vec<TodoItem>,
    mirror_path: PathBuf,
    turns_since_interaction: u32,
}

impl TodoList {
    pub fn new(scratch: &Path) -> Self {
        Self {
            items: Vec::new(),
            mirror_path: scratch.join("todo.md"),
            turns_since_interaction: 0,
        }
    }

    pub fn items(&self) -> &[TodoItem] {
        &self.items
    }

    pub fn handle(&mut self, args: &Value) -> Result<String, ToolError> {
        let action = args.get("action").and_then(|v| v.as_str()).unwrap_or("");
        self.turns_since_interaction = 0;
        let response = match action {
            "add" => {
                let text = args.get("text").and_then(|v| v.as_str()).ok_or_else(|| {
                    ToolError::new(ToolErrorKind::InvalidToolArguments, "add requires 'text'")
                })?;
                let id = self.items.len() as u32 + 1;
                self.items.push(TodoItem {
                    id,
                    text: text.to_string(),
                    state: TodoState::Pending,
                });
                format!("added todo #{id}: {text}")
            }
            "update" => {
                let id = args.get("id").and_then(|v| v.as_u64()).ok_or_else(|| {
                    ToolError::new(ToolErrorKind::InvalidToolArguments, "update requires 'id'")
                })? as u32;
                let state = args
                    .get("state")
                    .and_then(|v| v.as_str())
                    .and_then(TodoState::parse)
                    .ok_or_else(|| {
                        ToolError::new(
                            ToolErrorKind::InvalidToolArguments,
                            "update requires a valid 'state'",
                        )
                    })?;
                let item = self.items.iter_mut().find(|i| i.id == id).ok_or_else(|| {
                    ToolError::new(
                        ToolErrorKind::InvalidToolArguments,
                        format!("no todo #{id}"),
                    )
                })?;
                item.state = state;
                format!("todo #{id} is now {}", state.as_str())
            }
            "list" => self.render_inline(),
            other => {
                return Err(ToolError::new(
                    ToolErrorKind::InvalidToolArguments,
                    format!("unknown todo action '{other}'"),
                ));
            }
        };
        self.mirror().map_err(|e| {
            ToolError::failed(format!("todo mirror write failed: {e}"))
        })?;
        Ok(response)
    }

    fn render_inline(&self) -> String {
        if self.items.is_empty() {
            return "no todos".to_string();
        }
        self.items
            .iter()
            .map(|i| format!("{} #{} {}", i.state.checkbox(), i.id, i.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Atomic mirror: write a temp file next to todo.md, then rename.
    fn mirror(&self) -> std::io::Result<()> {
        if let Some(parent) = self.mirror_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut body = String::from("# Todos\n\n");
        for item in &self.items {
            body.push_str(&format!(
                "- {} {} (#{})\n",
                item.state.checkbox(),
                item.text,
                item.id
            ));
        }
        let tmp = self.mirror_path.with_extension("md.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.mirror_path)
    }

    pub fn note_turn(&mut self) {
        self.turns_since_interaction += 1;
    }

    /// Reminder condition: three or more turns without a todo interaction
    /// while work is still open.
    pub fn reminder_due(&self) -> bool {
        self.turns_since_interaction >= 3
            && self
                .items
                .iter()
                .any(|i| matches!(i.state, TodoState::Pending | TodoState::InProgress))
    }

    pub fn render(&self) -> Option<String> {
        if self.items.is_empty() {
            return None;
        }
        Some(format!("[Todos]\n{}", self.render_inline()))
    }

    pub fn reset(&mut self) {
        self.items.clear();
        self.turns_since_interaction = 0;
        let _ = self.mirror();
    }
}

// ── Channels bundle ─────────────────────────────────────────────────────

#[derive(Debug)]
pub struct KnowledgeChannels {
    pub thinking: ThinkingLog,
    pub todos: TodoList,
    pub recaps: Vec<SnapshotRecap>,
    pub checkpoints: Vec<CheckpointSummary>,
}

impl KnowledgeChannels {
    pub fn new(scratch: &Path) -> Self {
        Self {
            thinking: ThinkingLog::default(),
            todos: TodoList::new(scratch),
            recaps: Vec::new(),
            checkpoints: Vec::new(),
        }
    }

    pub fn add_recap(&mut self, recap: SnapshotRecap) {
        self.recaps.push(recap);
    }

    pub fn add_checkpoint(&mut self, summary: CheckpointSummary) {
        self.checkpoints.push(summary);
        self.consolidate_checkpoints();
    }

    /// Pairwise-merge the oldest half once the channel outgrows its budget.
    fn consolidate_checkpoints(&mut self) {
        let total: usize = self
            .checkpoints
            .iter()
            .map(|c| estimate_tokens(&c.text))
            .sum();
        if total <= CHECKPOINT_TOKEN_BUDGET || self.checkpoints.len() < 2 {
            return;
        }
        let half = self.checkpoints.len() / 2;
        let oldest: Vec<CheckpointSummary> = self.checkpoints.drain(..half).collect();
        let mut merged_text = oldest
            .chunks(2)
            .map(|pair| {
                pair.iter()
                    .map(|c| c.text.as_str())
                    .collect::<Vec<_>>()
                    .join(" / ")
            })
            .collect::<Vec<_>>()
            .join("\n");
        merged_text = truncate_chars(&merged_text, CHECKPOINT_TOKEN_BUDGET * 2);
        let lo = oldest.first().map(|c| c.turn_range.0).unwrap_or(0);
        let hi = oldest.last().map(|c| c.turn_range.1).unwrap_or(0);
        self.checkpoints.insert(
            0,
            CheckpointSummary {
                turn_range: (lo, hi),
                text: merged_text,
            },
        );
    }

    /// Serialization hook: everything the system prompt carries each turn.
    pub fn render_for_prompt(&self) -> String {
        let mut sections = Vec::new();
        if !self.recaps.is_empty() {
            let mut lines = vec!["[Snapshot history — prior investigation summaries]".to_string()];
            for recap in &self.recaps {
                lines.push(format!(
                    "- [{}] {}",
                    recap.label,
                    truncate_chars(&recap.summary, 1200)
                ));
            }
            sections.push(lines.join("\n"));
        }
        if !self.checkpoints.is_empty() {
            let mut lines = vec!["[Progress checkpoints]".to_string()];
            for checkpoint in &self.checkpoints {
                lines.push(format!(
                    "- turns {}-{}: {}",
                    checkpoint.turn_range.0,
                    checkpoint.turn_range.1,
                    truncate_chars(&checkpoint.text, 800)
                ));
            }
            sections.push(lines.join("\n"));
        }
        if let Some(thinking) = self.thinking.render() {
            sections.push(thinking);
        }
        if let Some(todos) = self.todos.render() {
            sections.push(todos);
        }
        if self.todos.reminder_due() {
            sections.push(
                "[Reminder] The todo list has open items you have not touched for several turns."
                    .to_string(),
            );
        }
        sections.join("\n\n")
    }

    pub fn reset(&mut self) {
        self.thinking = ThinkingLog::default();
        self.todos.reset();
        self.recaps.clear();
        self.checkpoints.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn think_numbers_and_links() {
        let mut log = ThinkingLog::default();
        assert_eq!(log.think("first", None, None).unwrap(), 1);
        assert_eq!(log.think("second", None, None).unwrap(), 2);
        assert_eq!(log.think("fix", Some(1), None).unwrap(), 3);
        let err = log.think("bad", Some(99), None).unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::InvalidToolArguments);
        let rendered = log.render().unwrap();
        assert!(rendered.contains("3. (revises #1) fix"));
    }

    #[test]
    fn long_thinking_log_summarizes_head() {
        let mut log = ThinkingLog::default();
        for i in 0..30 {
            log.think(&format!("step {i}"), None, None).unwrap();
        }
        let rendered = log.render().unwrap();
        assert!(rendered.contains("earlier steps omitted"));
        assert!(rendered.contains("step 29"));
        assert!(!rendered.contains("step 0\n"));
    }

    #[test]
    fn todo_lifecycle_and_mirror() {
        let tmp = tempfile::tempdir().expect("tmp");
        let mut todos = TodoList::new(tmp.path());
        todos.handle(&json!({"action": "add", "text": "write tests"})).unwrap();
        todos
            .handle(&json!({"action": "update", "id": 1, "state": "in-progress"}))
            .unwrap();

        let mirror = fs::read_to_string(tmp.path().join("todo.md")).expect("mirror");
        assert!(mirror.contains("[~] write tests"));
        assert!(!tmp.path().join("todo.md.tmp").exists());

        let listing = todos.handle(&json!({"action": "list"})).unwrap();
        assert!(listing.contains("#1 write tests"));
    }

    #[test]
    fn todo_reminder_after_three_idle_turns() {
        let tmp = tempfile::tempdir().expect("tmp");
        let mut todos = TodoList::new(tmp.path());
        todos.handle(&json!({"action": "add", "text": "pending work"})).unwrap();
        assert!(!todos.reminder_due());
        for _ in 0..3 {
            todos.note_turn();
        }
        assert!(todos.reminder_due());
        // An interaction clears the counter.
        todos.handle(&json!({"action": "list"})).unwrap();
        assert!(!todos.reminder_due());
    }

    #[test]
    fn no_reminder_when_everything_done() {
        let tmp = tempfile::tempdir().expect("tmp");
        let mut todos = TodoList::new(tmp.path());
        todos.handle(&json!({"action": "add", "text": "x"})).unwrap();
        todos
            .handle(&json!({"action": "update", "id": 1, "state": "done"}))
            .unwrap();
        for _ in 0..5 {
            todos.note_turn();
        }
        assert!(!todos.reminder_due());
    }

    #[test]
    fn checkpoints_consolidate_past_budget() {
        let tmp = tempfile::tempdir().expect("tmp");
        let mut channels = KnowledgeChannels::new(tmp.path());
        for i in 0..6 {
            channels.add_checkpoint(CheckpointSummary {
                turn_range: (i * 10 + 1, (i + 1) * 10),
                text: format!("summary {i}: {}", "detail ".repeat(300)),
            });
        }
        // Oldest entries were merged into one leading summary.
        assert!(channels.checkpoints.len() < 6);
        assert_eq!(channels.checkpoints[0].turn_range.0, 1);
    }

    #[test]
    fn recaps_always_render() {
        let tmp = tempfile::tempdir().expect("tmp");
        let mut channels = KnowledgeChannels::new(tmp.path());
        channels.add_recap(SnapshotRecap {
            label: "auth-investigation".to_string(),
            summary: "login bug was in token refresh".to_string(),
            turn_range: (2, 7),
        });
        let prompt = channels.render_for_prompt();
        assert!(prompt.contains("[auth-investigation]"));
        assert!(prompt.contains("token refresh"));
    }
}
