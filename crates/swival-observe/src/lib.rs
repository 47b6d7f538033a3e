//! Report recorder: typed timeline events, aggregate counters, and the
//! final JSON document.
//!
//! Events append in real-time order; counters update incrementally; the
//! finished report serializes atomically (temp file + rename). With
//! `--report` the final answer lands in the JSON instead of stdout.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const REPORT_VERSION: u32 = 1;

/// Verbosity-gated stderr logger. Diagnostics always go to stderr, never
/// stdout; stdout is reserved for the final answer.
#[derive(Debug, Clone, Default)]
pub struct Observer {
    verbose: bool,
}

impl Observer {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[swival] {msg}");
        }
    }

    pub fn warn(&self, msg: &str) {
        eprintln!("[swival warn] {msg}");
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineEvent {
    LlmCall {
        turn: u32,
        duration_s: f64,
        prompt_tokens_est: usize,
        finish_reason: String,
        is_retry: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_reason: Option<String>,
    },
    ToolCall {
        turn: u32,
        name: String,
        arguments: Option<Value>,
        succeeded: bool,
        duration_s: f64,
        result_length: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Compaction {
        turn: u32,
        strategy: String,
        tokens_before: usize,
        tokens_after: usize,
    },
    Guardrail {
        turn: u32,
        tool: String,
        level: String,
    },
    TruncatedResponse {
        turn: u32,
    },
    Review {
        round: u32,
        exit_code: i32,
        feedback: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stderr: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolStat {
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSettings {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub seed: Option<u64>,
    pub max_turns: u32,
    pub max_output_tokens: u32,
    pub context_length: usize,
    pub yolo: bool,
    pub allowed_commands: Vec<String>,
    pub skills_discovered: Vec<String>,
    pub instructions_loaded: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxInfo {
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strict_read: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agentfs_version: Option<String>,
}

impl Default for SandboxInfo {
    fn default() -> Self {
        Self {
            mode: "builtin".to_string(),
            session: None,
            strict_read: None,
            agentfs_version: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResult {
    pub outcome: String,
    pub answer: Option<String>,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunStats {
    pub turns: u32,
    pub llm_calls: u64,
    pub total_llm_time_s: f64,
    pub total_tool_time_s: f64,
    pub tool_calls_total: u64,
    pub tool_calls_succeeded: u64,
    pub tool_calls_failed: u64,
    pub tool_calls_by_name: BTreeMap<String, ToolStat>,
    pub compactions: u64,
    pub turn_drops: u64,
    pub guardrail_interventions: u64,
    pub truncated_responses: u64,
    pub review_rounds: u32,
    pub skills_used: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Report {
    pub version: u32,
    pub timestamp: String,
    pub task: String,
    pub model: String,
    pub provider: String,
    pub settings: RunSettings,
    pub sandbox: SandboxInfo,
    pub result: RunResult,
    pub stats: RunStats,
    pub timeline: Vec<TimelineEvent>,
}

/// Accumulates events and counters during a run.
#[derive(Debug, Default)]
pub struct ReportCollector {
    events: Vec<TimelineEvent>,
    tool_stats: BTreeMap<String, ToolStat>,
    compactions: u64,
    turn_drops: u64,
    guardrail_interventions: u64,
    truncated_responses: u64,
    llm_calls: u64,
    total_llm_time: f64,
    total_tool_time: f64,
    review_rounds: u32,
    skills_used: Vec<String>,
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

impl ReportCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn llm_calls(&self) -> u64 {
        self.llm_calls
    }

    pub fn record_llm_call(
        &mut self,
        turn: u32,
        duration_s: f64,
        prompt_tokens_est: usize,
        finish_reason: &str,
        is_retry: bool,
        retry_reason: Option<&str>,
    ) {
        self.llm_calls += 1;
        self.total_llm_time += duration_s;
        self.events.push(TimelineEvent::LlmCall {
            turn,
            duration_s: round3(duration_s),
            prompt_tokens_est,
            finish_reason: finish_reason.to_string(),
            is_retry,
            retry_reason: retry_reason.map(String::from),
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_tool_call(
        &mut self,
        turn: u32,
        name: &str,
        arguments: Option<Value>,
        succeeded: bool,
        duration_s: f64,
        result_length: usize,
        error: Option<&str>,
    ) {
        self.total_tool_time += duration_s;
        if name == "use_skill"
            && succeeded
            && let Some(skill) = arguments
                .as_ref()
                .and_then(|a| a.get("name"))
                .and_then(|v| v.as_str())
            && !self.skills_used.iter().any(|s| s == skill)
        {
            self.skills_used.push(skill.to_string());
        }
        let stat = self.tool_stats.entry(name.to_string()).or_default();
        if succeeded {
            stat.succeeded += 1;
        } else {
            stat.failed += 1;
        }
        self.events.push(TimelineEvent::ToolCall {
            turn,
            name: name.to_string(),
            arguments,
            succeeded,
            duration_s: round3(duration_s),
            result_length,
            error: error.map(String::from),
        });
    }

    pub fn record_compaction(
        &mut self,
        turn: u32,
        strategy: &str,
        tokens_before: usize,
        tokens_after: usize,
    ) {
        if strategy == "drop_middle_turns" {
            self.turn_drops += 1;
        } else {
            self.compactions += 1;
        }
        self.events.push(TimelineEvent::Compaction {
            turn,
            strategy: strategy.to_string(),
            tokens_before,
            tokens_after,
        });
    }

    pub fn record_guardrail(&mut self, turn: u32, tool: &str, level: &str) {
        self.guardrail_interventions += 1;
        self.events.push(TimelineEvent::Guardrail {
            turn,
            tool: tool.to_string(),
            level: level.to_string(),
        });
    }

    pub fn record_truncated_response(&mut self, turn: u32) {
        self.truncated_responses += 1;
        self.events.push(TimelineEvent::TruncatedResponse { turn });
    }

    pub fn record_review(&mut self, round: u32, exit_code: i32, feedback: &str, stderr: &str) {
        self.review_rounds = self.review_rounds.max(round);
        self.events.push(TimelineEvent::Review {
            round,
            exit_code,
            feedback: feedback.to_string(),
            stderr: if stderr.is_empty() {
                None
            } else {
                Some(stderr.to_string())
            },
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build_report(
        &self,
        task: &str,
        model: &str,
        provider: &str,
        settings: RunSettings,
        sandbox: SandboxInfo,
        result: RunResult,
        turns: u32,
    ) -> Report {
        let tool_calls_succeeded: u64 = self.tool_stats.values().map(|s| s.succeeded).sum();
        let tool_calls_failed: u64 = self.tool_stats.values().map(|s| s.failed).sum();
        Report {
            version: REPORT_VERSION,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            task: task.to_string(),
            model: model.to_string(),
            provider: provider.to_string(),
            settings,
            sandbox,
            result,
            stats: RunStats {
                turns,
                llm_calls: self.llm_calls,
                total_llm_time_s: round3(self.total_llm_time),
                total_tool_time_s: round3(self.total_tool_time),
                tool_calls_total: tool_calls_succeeded + tool_calls_failed,
                tool_calls_succeeded,
                tool_calls_failed,
                tool_calls_by_name: self.tool_stats.clone(),
                compactions: self.compactions,
                turn_drops: self.turn_drops,
                guardrail_interventions: self.guardrail_interventions,
                truncated_responses: self.truncated_responses,
                review_rounds: self.review_rounds,
                skills_used: self.skills_used.clone(),
            },
            timeline: self.events.clone(),
        }
    }
}

/// Serialize the report atomically: write a sibling temp file, then rename
/// over the target.
pub fn write_report(path: &Path, report: &Report) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, format!("{json}\n"))?;
    fs::rename(&tmp, path)?;
    Ok(())
}
