//! Snapshot controller: user-labeled conversation scopes that collapse
//! into a single recap message.
//!
//! State machine `Idle → Active(checkpoint) → Idle`. Scopes are referenced
//! by turn index, never by message pointer, so compaction can rewrite
//! content without breaking boundaries. A dirty scope (any successful
//! mutating tool call since the boundary) refuses to collapse without
//! `force`.

use serde_json::{Value, json};
use std::collections::BTreeSet;
use swival_core::{Message, Role, SnapshotRecap, ToolError, estimate_tokens, truncate_chars};
use swival_tools::is_read_only_tool;

pub const MAX_LABEL_LENGTH: usize = 100;
pub const MAX_SUMMARY_LENGTH: usize = 4000;
const MAX_SUMMARY_DISPLAY: usize = 1200;

/// Consecutive read-only turns before the one-time restore nudge.
pub const READ_STREAK_NUDGE_AT: u32 = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    pub saves: u64,
    pub restores: u64,
    pub cancels: u64,
    pub blocked: u64,
    pub force_restores: u64,
    pub tokens_saved: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub label: String,
    pub turn: u32,
    pub dirty: bool,
}

#[derive(Debug, Default)]
pub struct SnapshotState {
    active: Option<Checkpoint>,
    last_restore_turn: Option<u32>,
    dirty_tools: BTreeSet<String>,
    stats: SnapshotStats,
    read_streak: u32,
    nudged_this_streak: bool,
}

/// Outcome of a snapshot tool call: the text for the model, plus a recap
/// to append to the knowledge channels when a restore collapsed a scope.
#[derive(Debug)]
pub struct SnapshotOutcome {
    pub text: String,
    pub recap: Option<SnapshotRecap>,
}

impl SnapshotState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &SnapshotStats {
        &self.stats
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.active.as_ref()
    }

    pub fn is_dirty(&self) -> bool {
        self.active.as_ref().map(|c| c.dirty).unwrap_or(!self.dirty_tools.is_empty())
    }

    pub fn process(
        &mut self,
        args: &Value,
        messages: &mut Vec<Message>,
        current_turn: u32,
    ) -> Result<SnapshotOutcome, ToolError> {
        let action = args.get("action").and_then(|v| v.as_str()).unwrap_or("");
        match action {
            "save" => {
                let label = args.get("label").and_then(|v| v.as_str()).unwrap_or("");
                self.save(label, current_turn).map(|text| SnapshotOutcome {
                    text,
                    recap: None,
                })
            }
            "restore" => {
                let summary = args.get("summary").and_then(|v| v.as_str()).unwrap_or("");
                let force = args.get("force").and_then(|v| v.as_bool()).unwrap_or(false);
                self.restore(summary, force, messages, current_turn)
            }
            "cancel" => Ok(SnapshotOutcome {
                text: self.cancel(),
                recap: None,
            }),
            "status" => Ok(SnapshotOutcome {
                text: self.status(),
                recap: None,
            }),
            other => Err(ToolError::failed(format!(
                "invalid action '{other}', expected one of: cancel, restore, save, status"
            ))),
        }
    }

    fn save(&mut self, label: &str, current_turn: u32) -> Result<String, ToolError> {
        if label.is_empty() {
            return Err(ToolError::failed("save requires a non-empty 'label'"));
        }
        if label.len() > MAX_LABEL_LENGTH {
            return Err(ToolError::failed(format!(
                "label exceeds {MAX_LABEL_LENGTH} character limit"
            )));
        }
        if let Some(active) = &self.active {
            return Err(ToolError::failed(format!(
                "checkpoint already active (label '{}'); call cancel first",
                active.label
            )));
        }
        self.active = Some(Checkpoint {
            label: label.to_string(),
            turn: current_turn,
            dirty: false,
        });
        self.dirty_tools.clear();
        self.stats.saves += 1;
        Ok(json!({"action": "save", "label": label, "status": "checkpoint_set"}).to_string())
    }

    fn restore(
        &mut self,
        summary: &str,
        force: bool,
        messages: &mut Vec<Message>,
        current_turn: u32,
    ) -> Result<SnapshotOutcome, ToolError> {
        if summary.is_empty() {
            return Err(ToolError::failed("restore requires a non-empty 'summary'"));
        }
        if summary.len() > MAX_SUMMARY_LENGTH {
            return Err(ToolError::failed(format!(
                "summary exceeds {MAX_SUMMARY_LENGTH} character limit"
            )));
        }
        let dirty = self.is_dirty();
        if dirty && !force {
            self.stats.blocked += 1;
            let tools: Vec<&str> = self.dirty_tools.iter().map(String::as_str).collect();
            return Err(ToolError::failed(format!(
                "scope is dirty ({}); call restore with force=true to override, or cancel to keep context",
                tools.join(", ")
            )));
        }

        let start = self.resolve_start(messages)?;
        // Exclude the current turn's assistant message (which issued this
        // restore) and any tool results already appended for it: collapsing
        // them would orphan tool call ids.
        let end = messages
            .iter()
            .rposition(|m| m.role == Role::Assistant && !m.tool_calls.is_empty())
            .unwrap_or(messages.len());

        if end <= start {
            return Ok(SnapshotOutcome {
                text: json!({
                    "action": "restore",
                    "status": "warning",
                    "message": "empty scope — nothing to collapse"
                })
                .to_string(),
                recap: None,
            });
        }

        let scope = &messages[start..end];
        let collapsed = scope.len();
        let tokens_before: usize = scope.iter().map(|m| estimate_tokens(&m.content)).sum();
        let tokens_after = estimate_tokens(summary);
        let tokens_saved = tokens_before.saturating_sub(tokens_after);
        let turn_lo = scope.iter().map(|m| m.turn).min().unwrap_or(current_turn);
        let turn_hi = scope.iter().map(|m| m.turn).max().unwrap_or(current_turn);

        let label = self
            .active
            .as_ref()
            .map(|c| c.label.clone())
            .unwrap_or_else(|| "investigation".to_string());
        let recap_message = Message::recap(
            format!(
                "[snapshot: {label}]\n{summary}\n(collapsed {collapsed} messages, saved ~{tokens_saved} tokens)"
            ),
            turn_hi,
        );
        messages.splice(start..end, std::iter::once(recap_message));

        self.stats.restores += 1;
        self.stats.tokens_saved += tokens_saved as u64;
        if force && dirty {
            self.stats.force_restores += 1;
        }
        self.active = None;
        self.last_restore_turn = Some(current_turn);
        self.reset_dirty();

        Ok(SnapshotOutcome {
            text: json!({
                "action": "restore",
                "status": "collapsed",
                "messages_collapsed": collapsed,
                "tokens_saved": tokens_saved
            })
            .to_string(),
            recap: Some(SnapshotRecap {
                label,
                summary: truncate_chars(summary, MAX_SUMMARY_DISPLAY),
                turn_range: (turn_lo, turn_hi),
            }),
        })
    }

    /// First message index inside the collapsible scope.
    fn resolve_start(&self, messages: &[Message]) -> Result<usize, ToolError> {
        if let Some(checkpoint) = &self.active {
            let start = messages.iter().position(|m| m.turn > checkpoint.turn);
            return start.ok_or_else(|| {
                ToolError::failed(
                    "checkpoint scope is empty or was removed by compaction; call cancel and retry",
                )
            });
        }
        // Implicit scope: after the most recent user message or the
        // previous restore boundary, whichever is newer.
        let last_user = messages.iter().rposition(|m| m.role == Role::User);
        let last_recap = self.last_restore_turn.and_then(|turn| {
            messages
                .iter()
                .rposition(|m| m.turn <= turn && m.content.starts_with("[snapshot:"))
        });
        match (last_user, last_recap) {
            (Some(u), Some(r)) => Ok(u.max(r) + 1),
            (Some(u), None) => Ok(u + 1),
            (None, Some(r)) => Ok(r + 1),
            (None, None) => Err(ToolError::failed(
                "no implicit checkpoint found (no user message in history)",
            )),
        }
    }

    fn cancel(&mut self) -> String {
        match self.active.take() {
            Some(checkpoint) => {
                self.stats.cancels += 1;
                self.reset_dirty();
                json!({"action": "cancel", "status": "cleared", "label": checkpoint.label})
                    .to_string()
            }
            None => json!({
                "action": "cancel",
                "status": "no_checkpoint",
                "message": "no checkpoint to cancel"
            })
            .to_string(),
        }
    }

    fn status(&self) -> String {
        json!({
            "action": "status",
            "active": self.active.is_some(),
            "label": self.active.as_ref().map(|c| c.label.clone()),
            "dirty": self.is_dirty(),
            "dirty_tools": self.dirty_tools.iter().collect::<Vec<_>>(),
            "stats": {
                "saves": self.stats.saves,
                "restores": self.stats.restores,
                "cancels": self.stats.cancels,
                "blocked": self.stats.blocked,
                "force_restores": self.stats.force_restores,
                "tokens_saved": self.stats.tokens_saved,
            }
        })
        .to_string()
    }

    /// Called after every successful tool call.
    pub fn mark_dirty(&mut self, tool_name: &str) {
        if !is_read_only_tool(tool_name) {
            self.dirty_tools.insert(tool_name.to_string());
            if let Some(checkpoint) = &mut self.active {
                checkpoint.dirty = true;
            }
        }
    }

    fn reset_dirty(&mut self) {
        self.dirty_tools.clear();
        if let Some(checkpoint) = &mut self.active {
            checkpoint.dirty = false;
        }
    }

    /// Track consecutive read-only turns; returns the one-time nudge text
    /// on the fifth. The streak resets on any mutating tool call, and no
    /// second nudge fires until it builds back up.
    pub fn note_turn(&mut self, all_read_only: bool) -> Option<String> {
        if !all_read_only {
            self.read_streak = 0;
            self.nudged_this_streak = false;
            return None;
        }
        self.read_streak += 1;
        if self.read_streak >= READ_STREAK_NUDGE_AT && !self.nudged_this_streak {
            self.nudged_this_streak = true;
            return Some(
                "[nudge] The last five turns were read-only investigation. Consider \
                 `snapshot restore` with a summary to collapse them and free context."
                    .to_string(),
            );
        }
        None
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use swival_core::ToolCallRequest;

    fn call(id: &str, name: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            arguments: "{}".to_string(),
        }
    }

    /// system, user(1), then N investigation turns, then the current turn's
    /// assistant message issuing the snapshot call.
    fn conversation(turns: u32, current: u32) -> Vec<Message> {
        let mut messages = vec![Message::system("s"), Message::user("task", 1)];
        for turn in 1..=turns {
            let id = format!("c{turn}");
            messages.push(Message::assistant("", vec![call(&id, "read_file")], turn));
            messages.push(Message::tool_result(&id, "read_file", "contents", turn));
        }
        messages.push(Message::assistant(
            "",
            vec![call("snap", "snapshot")],
            current,
        ));
        messages
    }

    #[test]
    fn save_restore_collapses_scope() {
        let mut state = SnapshotState::new();
        let mut messages = conversation(6, 7);
        state
            .process(&json!({"action": "save", "label": "dig"}), &mut messages, 3)
            .expect("save");
        let before = messages.len();
        let outcome = state
            .process(
                &json!({"action": "restore", "summary": "found the bug in parser.rs"}),
                &mut messages,
                7,
            )
            .expect("restore");
        assert!(messages.len() < before);
        let recap = outcome.recap.expect("recap");
        assert_eq!(recap.label, "dig");
        assert!(recap.turn_range.0 >= 4);
        assert!(
            messages
                .iter()
                .any(|m| m.content.starts_with("[snapshot: dig]"))
        );
        // The restoring assistant message survives the collapse.
        assert!(
            messages
                .iter()
                .any(|m| m.tool_calls.iter().any(|c| c.id == "snap"))
        );
        assert!(!state.is_active());
    }

    #[test]
    fn double_save_is_rejected() {
        let mut state = SnapshotState::new();
        let mut messages = conversation(2, 3);
        state
            .process(&json!({"action": "save", "label": "a"}), &mut messages, 1)
            .expect("save");
        let err = state
            .process(&json!({"action": "save", "label": "b"}), &mut messages, 2)
            .unwrap_err();
        assert!(err.message.contains("already active"));
    }

    #[test]
    fn save_cancel_save_equals_single_save() {
        let mut state = SnapshotState::new();
        let mut messages = conversation(2, 3);
        state
            .process(&json!({"action": "save", "label": "L"}), &mut messages, 2)
            .expect("save");
        state
            .process(&json!({"action": "cancel"}), &mut messages, 2)
            .expect("cancel");
        state
            .process(&json!({"action": "save", "label": "L"}), &mut messages, 2)
            .expect("save again");
        let checkpoint = state.checkpoint().expect("active");
        assert_eq!(checkpoint.label, "L");
        assert_eq!(checkpoint.turn, 2);
        assert!(!checkpoint.dirty);
    }

    #[test]
    fn dirty_scope_blocks_restore_without_force() {
        let mut state = SnapshotState::new();
        let mut messages = conversation(4, 5);
        state
            .process(&json!({"action": "save", "label": "work"}), &mut messages, 1)
            .expect("save");
        state.mark_dirty("write_file");
        let err = state
            .process(
                &json!({"action": "restore", "summary": "s"}),
                &mut messages,
                5,
            )
            .unwrap_err();
        assert!(err.message.contains("dirty"));
        assert!(err.message.contains("write_file"));
        assert_eq!(state.stats().blocked, 1);

        let outcome = state
            .process(
                &json!({"action": "restore", "summary": "s", "force": true}),
                &mut messages,
                5,
            )
            .expect("forced restore");
        assert!(outcome.recap.is_some());
        assert_eq!(state.stats().force_restores, 1);
    }

    #[test]
    fn reads_do_not_dirty_the_scope() {
        let mut state = SnapshotState::new();
        state.mark_dirty("read_file");
        state.mark_dirty("grep");
        state.mark_dirty("think");
        assert!(!state.is_dirty());
        state.mark_dirty("run_command");
        assert!(state.is_dirty());
    }

    #[test]
    fn implicit_restore_uses_last_user_boundary() {
        let mut state = SnapshotState::new();
        let mut messages = conversation(5, 6);
        let outcome = state
            .process(
                &json!({"action": "restore", "summary": "investigated the cache layer"}),
                &mut messages,
                6,
            )
            .expect("implicit restore");
        assert!(outcome.recap.is_some());
        // User message survives; everything between it and the current
        // assistant collapsed into the recap.
        assert!(messages.iter().any(|m| m.role == Role::User));
        assert_eq!(
            messages
                .iter()
                .filter(|m| m.content.starts_with("[snapshot:"))
                .count(),
            1
        );
    }

    #[test]
    fn read_streak_nudges_once_at_five() {
        let mut state = SnapshotState::new();
        for _ in 0..4 {
            assert!(state.note_turn(true).is_none());
        }
        assert!(state.note_turn(true).is_some());
        // No repeat while the streak continues.
        assert!(state.note_turn(true).is_none());
        // A mutating turn resets; five more read-only turns nudge again.
        assert!(state.note_turn(false).is_none());
        for _ in 0..4 {
            assert!(state.note_turn(true).is_none());
        }
        assert!(state.note_turn(true).is_some());
    }

    #[test]
    fn status_reports_state() {
        let mut state = SnapshotState::new();
        let mut messages = conversation(1, 2);
        let outcome = state
            .process(&json!({"action": "status"}), &mut messages, 2)
            .expect("status");
        let parsed: Value = serde_json::from_str(&outcome.text).expect("json");
        assert_eq!(parsed["active"], false);
        assert_eq!(parsed["dirty"], false);
    }
}
