//! The agent loop: a turn-based scheduler alternating LLM completions and
//! tool invocations.
//!
//! One iteration per turn: refresh the system prompt from the knowledge
//! channels, fit the conversation through the context manager, invoke the
//! LLM, then either finish (pure text), execute tool calls in model order,
//! or recover (truncation, overflow). Provider overflow escalates through
//! the compaction levels and retries the same turn.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use serde_json::Value;
use swival_context::{ContextManager, RecapSummarizer};
use swival_core::{
    ChatRequest, LlmError, LlmResponse, Message, SamplingParams, ToolError, ToolErrorKind,
    ToolSpec, estimate_conversation_tokens, estimate_tokens, truncate_chars,
};
use swival_llm::LlmClient;
use swival_mcp::McpPool;
use swival_observe::{Observer, ReportCollector};
use swival_tools::{LocalToolHost, ToolRegistry, is_read_only_tool};

use crate::channels::KnowledgeChannels;
use crate::guardrail::Guardrail;
use crate::proactive::ProactiveSummarizer;
use crate::reviewer::run_reviewer_command;
use crate::skills::SkillSet;
use crate::snapshot::SnapshotState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Exhausted,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Exhausted => "exhausted",
            Outcome::Error => "error",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::Error => 1,
            Outcome::Exhausted => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub outcome: Outcome,
    pub answer: Option<String>,
    pub exit_code: i32,
    pub error_message: Option<String>,
    pub turns: u32,
}

impl RunOutcome {
    fn success(answer: String, turns: u32) -> Self {
        Self {
            outcome: Outcome::Success,
            answer: Some(answer),
            exit_code: 0,
            error_message: None,
            turns,
        }
    }

    fn exhausted(turns: u32) -> Self {
        Self {
            outcome: Outcome::Exhausted,
            answer: None,
            exit_code: 2,
            error_message: None,
            turns,
        }
    }

    fn error(message: impl Into<String>, turns: u32) -> Self {
        Self {
            outcome: Outcome::Error,
            answer: None,
            exit_code: 1,
            error_message: Some(message.into()),
            turns,
        }
    }
}

/// Everything one run borrows from the session. No ambient singletons: the
/// whole session context travels through here explicitly.
pub struct TurnRunner<'a> {
    pub llm: Arc<dyn LlmClient + Send + Sync>,
    pub model: String,
    pub sampling: SamplingParams,
    pub host: &'a mut LocalToolHost,
    pub registry: &'a ToolRegistry,
    pub mcp: &'a McpPool,
    pub context: &'a ContextManager,
    pub channels: &'a mut KnowledgeChannels,
    pub snapshot: &'a mut SnapshotState,
    pub guardrail: &'a mut Guardrail,
    pub report: &'a mut ReportCollector,
    pub observer: &'a Observer,
    pub skills: &'a SkillSet,
    pub proactive: &'a mut ProactiveSummarizer,
    pub preamble: String,
    pub max_turns: u32,
    pub reviewer: Option<String>,
    pub max_review_rounds: u32,
    pub base_dir: PathBuf,
    pub task: String,
    pub cancel: Arc<AtomicBool>,
}

impl TurnRunner<'_> {
    pub fn run(mut self, messages: &mut Vec<Message>, first_turn: u32) -> RunOutcome {
        let schema_tokens: usize = self
            .registry
            .specs()
            .iter()
            .map(spec_tokens)
            .sum();
        let mut turn = first_turn;
        let mut turns_used: u32 = 0;
        let mut review_round: u32 = 0;

        loop {
            if turns_used >= self.max_turns {
                self.proactive.cancel_inflight();
                return RunOutcome::exhausted(turns_used);
            }
            if self.cancelled() {
                return self.cancelled_outcome(turns_used);
            }
            turns_used += 1;

            if let Some(summary) = self.proactive.try_merge() {
                self.channels.add_checkpoint(summary);
            }
            self.refresh_system_prompt(messages);

            let response = match self.call_with_compaction(messages, turn, schema_tokens) {
                Ok(response) => response,
                Err(message) => {
                    self.host.clean_run_spills();
                    return RunOutcome::error(message, turns_used);
                }
            };

            if response.tool_calls.is_empty() {
                if response.finish_reason == "length" {
                    // Truncated output: record it and let the model continue.
                    self.report.record_truncated_response(turn);
                    messages.push(Message::assistant(response.text, vec![], turn));
                    self.finish_turn(&mut turn, turns_used, messages, true);
                    continue;
                }
                let answer = response.text;
                messages.push(Message::assistant(answer.clone(), vec![], turn));

                if let Some(feedback) =
                    self.maybe_review(&answer, &mut review_round)
                {
                    turn += 1;
                    messages.push(Message::user(feedback, turn));
                    continue;
                }
                self.proactive.cancel_inflight();
                return RunOutcome::success(answer, turns_used);
            }

            messages.push(Message::assistant(
                response.text.clone(),
                response.tool_calls.clone(),
                turn,
            ));

            let mut all_read_only = true;
            for call in &response.tool_calls {
                if self.cancelled() {
                    return self.cancelled_outcome(turns_used);
                }
                let read_only = self.execute_tool_call(call, messages, turn);
                all_read_only = all_read_only && read_only;
            }

            if let Some(nudge) = self.snapshot.note_turn(all_read_only) {
                messages.push(Message::user(nudge, turn));
            }
            self.finish_turn(&mut turn, turns_used, messages, false);
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn cancelled_outcome(&mut self, turns_used: u32) -> RunOutcome {
        self.proactive.cancel_inflight();
        self.host.clean_run_spills();
        self.mcp.shutdown();
        RunOutcome::error("run cancelled by interrupt signal", turns_used)
    }

    /// End-of-turn bookkeeping shared by tool turns and truncated turns.
    fn finish_turn(
        &mut self,
        turn: &mut u32,
        turns_used: u32,
        messages: &[Message],
        truncated: bool,
    ) {
        if !truncated {
            self.proactive.maybe_start(turns_used, messages);
        }
        self.channels.todos.note_turn();
        *turn += 1;
    }

    fn refresh_system_prompt(&mut self, messages: &mut [Message]) {
        let channel_text = self.channels.render_for_prompt();
        messages[0].content = if channel_text.is_empty() {
            self.preamble.clone()
        } else {
            format!("{}\n\n{}", self.preamble, channel_text)
        };
    }

    /// Fit the conversation, call the LLM, and recover from overflow by
    /// escalating compaction levels and retrying the same turn.
    fn call_with_compaction(
        &mut self,
        messages: &mut Vec<Message>,
        turn: u32,
        schema_tokens: usize,
    ) -> Result<LlmResponse, String> {
        let mut level: u8 = 0;
        let mut last_strategy: Option<&'static str> = None;

        loop {
            let budget = loop {
                let prompt_tokens = estimate_conversation_tokens(messages) + schema_tokens;
                match self.context.output_budget(prompt_tokens) {
                    Some(budget) => break budget,
                    None if level >= 3 => {
                        return Err(
                            "context window cannot fit the conversation after nuclear compaction"
                                .to_string(),
                        );
                    }
                    None => {
                        level += 1;
                        last_strategy = Some(self.run_compaction(level, messages, turn));
                    }
                }
            };

            let request = ChatRequest {
                model: self.model.clone(),
                messages: messages.clone(),
                tools: self.registry.specs().to_vec(),
                max_tokens: budget,
                sampling: self.sampling,
            };
            let prompt_tokens = estimate_conversation_tokens(messages) + schema_tokens;
            let started = Instant::now();
            let result = self.llm.complete(&request);
            let duration = started.elapsed().as_secs_f64();

            match result {
                Ok(response) => {
                    self.report.record_llm_call(
                        turn,
                        duration,
                        prompt_tokens,
                        &response.finish_reason,
                        last_strategy.is_some(),
                        last_strategy,
                    );
                    return Ok(response);
                }
                Err(LlmError::ContextOverflow(detail)) => {
                    self.report.record_llm_call(
                        turn,
                        duration,
                        prompt_tokens,
                        "context_overflow",
                        last_strategy.is_some(),
                        last_strategy,
                    );
                    self.observer
                        .verbose_log(&format!("provider reported overflow: {detail}"));
                    if level >= 3 {
                        return Err(format!("context overflow persists after nuclear compaction: {detail}"));
                    }
                    level += 1;
                    last_strategy = Some(self.run_compaction(level, messages, turn));
                }
                Err(LlmError::Provider(message)) => return Err(message),
                Err(LlmError::Cancelled(message)) => return Err(message),
            }
        }
    }

    fn run_compaction(
        &mut self,
        level: u8,
        messages: &mut Vec<Message>,
        turn: u32,
    ) -> &'static str {
        // Compaction never waits on a proactive summary in flight.
        self.proactive.cancel_inflight();
        let summarizer = LlmRecapSummarizer {
            llm: self.llm.clone(),
            model: self.model.clone(),
        };
        let outcome = self.context.compact(
            level,
            messages,
            Some(&summarizer),
            &self.channels.checkpoints,
        );
        self.report.record_compaction(
            turn,
            outcome.strategy.as_str(),
            outcome.tokens_before,
            outcome.tokens_after,
        );
        self.observer.verbose_log(&format!(
            "compaction level {level}: {} → {} tokens",
            outcome.tokens_before, outcome.tokens_after
        ));
        outcome.strategy.as_str()
    }

    /// Execute one tool call end to end. Returns whether it was read-only.
    fn execute_tool_call(
        &mut self,
        call: &swival_core::ToolCallRequest,
        messages: &mut Vec<Message>,
        turn: u32,
    ) -> bool {
        let started = Instant::now();
        let parsed: Option<Value> = serde_json::from_str(&call.arguments).ok();
        let result = match &parsed {
            Some(args) => self.invoke_tool(&call.name, args, messages, turn),
            None => Err(ToolError::new(
                ToolErrorKind::InvalidToolArguments,
                "tool arguments were not valid JSON",
            )),
        };
        let duration = started.elapsed().as_secs_f64();

        let read_only = is_read_only_tool(&call.name);
        match result {
            Ok(text) => {
                self.snapshot.mark_dirty(&call.name);
                self.guardrail.observe(&call.name, parsed.as_ref(), true);
                self.report.record_tool_call(
                    turn,
                    &call.name,
                    parsed,
                    true,
                    duration,
                    text.len(),
                    None,
                );
                messages.push(Message::tool_result(&call.id, &call.name, text, turn));
                read_only
            }
            Err(err) => {
                let text = format!("error ({}): {}", err.kind.as_str(), err.message);
                self.report.record_tool_call(
                    turn,
                    &call.name,
                    parsed.clone(),
                    false,
                    duration,
                    text.len(),
                    Some(err.kind.as_str()),
                );
                messages.push(Message::tool_result(&call.id, &call.name, text, turn));
                if let Some(level) = self.guardrail.observe(&call.name, parsed.as_ref(), false) {
                    self.report
                        .record_guardrail(turn, &call.name, level.as_str());
                    messages.push(Message::user(
                        Guardrail::message(&call.name, level),
                        turn,
                    ));
                }
                read_only
            }
        }
    }

    fn invoke_tool(
        &mut self,
        name: &str,
        args: &Value,
        messages: &mut Vec<Message>,
        turn: u32,
    ) -> Result<String, ToolError> {
        match name {
            "think" => {
                let text = args.get("text").and_then(|v| v.as_str()).ok_or_else(|| {
                    ToolError::new(ToolErrorKind::InvalidToolArguments, "think requires 'text'")
                })?;
                let revise_of = args.get("revise_of").and_then(|v| v.as_u64()).map(|v| v as u32);
                let branch_of = args.get("branch_of").and_then(|v| v.as_u64()).map(|v| v as u32);
                let number = self.channels.thinking.think(text, revise_of, branch_of)?;
                Ok(format!("recorded thinking step #{number}"))
            }
            "todo" => self.channels.todos.handle(args),
            "snapshot" => {
                let outcome = self.snapshot.process(args, messages, turn)?;
                if let Some(recap) = outcome.recap {
                    self.channels.add_recap(recap);
                }
                Ok(outcome.text)
            }
            "use_skill" => {
                let skill = args.get("name").and_then(|v| v.as_str()).ok_or_else(|| {
                    ToolError::new(
                        ToolErrorKind::InvalidToolArguments,
                        "use_skill requires 'name'",
                    )
                })?;
                self.skills.load(skill)
            }
            mcp_name if mcp_name.starts_with("mcp__") => {
                if self.registry.get(mcp_name).is_none() {
                    return Err(ToolError::new(
                        ToolErrorKind::UnknownTool,
                        format!("unknown tool: {mcp_name}"),
                    ));
                }
                match self.mcp.call(mcp_name, args) {
                    Ok(text) => Ok(self.host.cap_mcp_result(&text)),
                    Err(err) => Err(ToolError::new(
                        err.kind,
                        LocalToolHost::cap_mcp_error(&err.message),
                    )),
                }
            }
            builtin => self.host.run(builtin, args),
        }
    }

    /// Run the external reviewer over a candidate answer. Returns feedback
    /// to feed back into the loop when another round is requested.
    fn maybe_review(&mut self, answer: &str, review_round: &mut u32) -> Option<String> {
        let command = self.reviewer.clone()?;
        if *review_round >= self.max_review_rounds {
            self.observer
                .warn("max review rounds reached; accepting answer");
            return None;
        }
        *review_round += 1;
        match run_reviewer_command(&command, answer, &self.task, &self.base_dir) {
            Ok(outcome) => {
                self.report.record_review(
                    *review_round,
                    outcome.exit_code,
                    &outcome.stdout,
                    &outcome.stderr,
                );
                if outcome.wants_retry() {
                    self.observer
                        .verbose_log(&format!("reviewer requested round {}", *review_round + 1));
                    return Some(format!(
                        "[reviewer feedback — address before finishing]\n{}",
                        truncate_chars(&outcome.stdout, 4000)
                    ));
                }
                if !outcome.accepted() {
                    self.observer.warn(&format!(
                        "reviewer exited {}; accepting answer as-is",
                        outcome.exit_code
                    ));
                }
                None
            }
            Err(err) => {
                self.observer.warn(&format!("reviewer error: {err}"));
                None
            }
        }
    }
}

fn spec_tokens(spec: &ToolSpec) -> usize {
    estimate_tokens(&spec.name)
        + estimate_tokens(&spec.description)
        + estimate_tokens(&spec.schema.to_string())
}

/// Level 2/3 recap production: one toolless LLM call over a condensed
/// transcript of the dropped span.
struct LlmRecapSummarizer {
    llm: Arc<dyn LlmClient + Send + Sync>,
    model: String,
}

impl RecapSummarizer for LlmRecapSummarizer {
    fn summarize(&self, dropped: &[Message]) -> anyhow::Result<String> {
        let mut transcript = String::new();
        for msg in dropped {
            let head = truncate_chars(&msg.content, 300);
            match msg.role {
                swival_core::Role::User => transcript.push_str(&format!("USER: {head}\n")),
                swival_core::Role::Assistant => {
                    if !msg.content.is_empty() {
                        transcript.push_str(&format!("ASSISTANT: {head}\n"));
                    }
                    for call in &msg.tool_calls {
                        transcript.push_str(&format!(
                            "CALL: {}({})\n",
                            call.name,
                            truncate_chars(&call.arguments, 150)
                        ));
                    }
                }
                swival_core::Role::Tool => transcript.push_str(&format!(
                    "RESULT[{}]: {head}\n",
                    msg.tool_name.as_deref().unwrap_or("tool")
                )),
                swival_core::Role::System => {}
            }
        }
        if transcript.len() < 80 {
            anyhow::bail!("dropped span too small to summarize");
        }
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message::system(
                    "Summarize this agent transcript span in a short factual paragraph. \
                     Preserve file paths, findings, and decisions. Output only the summary.",
                ),
                Message::user(transcript, 1),
            ],
            tools: vec![],
            max_tokens: 512,
            sampling: SamplingParams::default(),
        };
        let response = self
            .llm
            .complete(&request)
            .map_err(|e| anyhow::anyhow!("recap summarizer failed: {e}"))?;
        let text = response.text.trim().to_string();
        if text.is_empty() {
            anyhow::bail!("recap summarizer produced no text");
        }
        Ok(text)
    }
}
