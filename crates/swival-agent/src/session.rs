//! Session facade: wires policies, tools, MCP, context management, and the
//! knowledge channels into one explicit bundle, then drives runs through
//! the turn runner.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use swival_context::{ContextConfig, ContextManager};
use swival_core::{Message, SamplingParams, runtime_dir};
use swival_llm::LlmClient;
use swival_mcp::{DEFAULT_CALL_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, McpPool, load_server_configs};
use swival_observe::{Observer, Report, ReportCollector, RunResult, RunSettings, SandboxInfo};
use swival_policy::{CommandPolicy, PathPolicy};
use swival_tools::{BuiltinOptions, LocalToolHost, ToolHostOptions, ToolRegistry, builtin_specs};

use crate::channels::KnowledgeChannels;
use crate::guardrail::Guardrail;
use crate::proactive::ProactiveSummarizer;
use crate::runner::{Outcome, RunOutcome, TurnRunner};
use crate::skills::{SkillSet, load_instruction_files};
use crate::snapshot::SnapshotState;

const PREAMBLE: &str = "You are Swival, a coding agent working inside a sandboxed workspace.\n\
Investigate with the read-only tools before changing anything, keep edits \
minimal and reviewable, and reply with plain final text once the task is \
done. Tool failures come back as error text: adjust your approach instead \
of repeating the same call.";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub base_dir: PathBuf,
    pub add_dirs: Vec<PathBuf>,
    pub add_dirs_ro: Vec<PathBuf>,
    pub allowed_commands: Vec<String>,
    pub yolo: bool,
    pub no_read_guard: bool,
    pub max_turns: u32,
    pub max_output_tokens: u32,
    pub max_context_tokens: usize,
    pub sampling: SamplingParams,
    pub model: String,
    pub provider: String,
    pub proactive_summaries: bool,
    pub skills_dir: Option<PathBuf>,
    pub reviewer: Option<String>,
    pub max_review_rounds: u32,
    pub mcp_enabled: bool,
    pub mcp_config: Option<PathBuf>,
    pub command_timeout_s: u64,
    pub fetch_timeout_s: u64,
    pub verbose: bool,
    pub sandbox: SandboxInfo,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            add_dirs: Vec::new(),
            add_dirs_ro: Vec::new(),
            allowed_commands: Vec::new(),
            yolo: false,
            no_read_guard: false,
            max_turns: 30,
            max_output_tokens: 4096,
            max_context_tokens: 32_768,
            sampling: SamplingParams::default(),
            model: "gpt-4o-mini".to_string(),
            provider: "openai".to_string(),
            proactive_summaries: false,
            skills_dir: None,
            reviewer: None,
            max_review_rounds: 3,
            mcp_enabled: true,
            mcp_config: None,
            command_timeout_s: 120,
            fetch_timeout_s: 30,
            verbose: false,
            sandbox: SandboxInfo::default(),
        }
    }
}

/// Result of one run: loop outcome plus the finished report document.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub outcome: Outcome,
    pub answer: Option<String>,
    pub exit_code: i32,
    pub error_message: Option<String>,
    pub turns: u32,
    pub report: Report,
    pub messages: Vec<Message>,
}

pub struct Session {
    cfg: SessionConfig,
    llm: Arc<dyn LlmClient + Send + Sync>,
    host: LocalToolHost,
    registry: ToolRegistry,
    mcp: McpPool,
    context: ContextManager,
    channels: KnowledgeChannels,
    snapshot: SnapshotState,
    guardrail: Guardrail,
    observer: Observer,
    skills: SkillSet,
    proactive: ProactiveSummarizer,
    preamble: String,
    instructions_loaded: Vec<String>,
    conversation: Vec<Message>,
    cancel: Arc<AtomicBool>,
}

impl Session {
    /// Build a session. Configuration problems here are fatal with a clear
    /// message; MCP *connection* problems are only warnings.
    pub fn new(
        cfg: SessionConfig,
        llm: Arc<dyn LlmClient + Send + Sync>,
    ) -> anyhow::Result<Self> {
        let observer = Observer::new(cfg.verbose);
        let paths = PathPolicy::new(&cfg.base_dir, &cfg.add_dirs, &cfg.add_dirs_ro, cfg.yolo)?;
        let base = paths.base().to_path_buf();
        let commands = CommandPolicy::new(&cfg.allowed_commands, &base, cfg.yolo)?;
        let host = LocalToolHost::new(
            paths,
            commands,
            ToolHostOptions {
                no_read_guard: cfg.no_read_guard,
                command_timeout: std::time::Duration::from_secs(cfg.command_timeout_s),
                fetch_timeout: std::time::Duration::from_secs(cfg.fetch_timeout_s),
            },
        )?;

        let skills = match &cfg.skills_dir {
            Some(dir) => SkillSet::discover(dir),
            None => SkillSet::empty(),
        };

        let mcp = if cfg.mcp_enabled {
            let configs = load_server_configs(&base, cfg.mcp_config.as_deref())?;
            if configs.is_empty() {
                McpPool::empty()
            } else {
                let mut pool =
                    McpPool::connect_all(configs, DEFAULT_CONNECT_TIMEOUT, DEFAULT_CALL_TIMEOUT);
                pool.apply_schema_budget(cfg.max_context_tokens);
                for warning in pool.warnings() {
                    observer.warn(warning);
                }
                pool
            }
        } else {
            McpPool::empty()
        };

        let mut registry = ToolRegistry::new(builtin_specs(BuiltinOptions {
            run_command: cfg.yolo || !cfg.allowed_commands.is_empty(),
            use_skill: !skills.is_empty(),
        }));
        for spec in mcp.tool_specs() {
            registry.register(spec);
        }

        let context = ContextManager::new(ContextConfig {
            context_window: cfg.max_context_tokens,
            max_output_tokens: cfg.max_output_tokens,
            ..ContextConfig::default()
        });

        let scratch = runtime_dir(&base);
        let channels = KnowledgeChannels::new(&scratch);
        let proactive = ProactiveSummarizer::new(llm.clone(), &cfg.model, cfg.proactive_summaries);

        let mut preamble = PREAMBLE.to_string();
        let mut instructions_loaded = Vec::new();
        for (name, body) in load_instruction_files(&base) {
            preamble.push_str(&format!("\n\n[Project instructions: {name}]\n{body}"));
            instructions_loaded.push(name);
        }

        Ok(Self {
            cfg,
            llm,
            host,
            registry,
            mcp,
            context,
            channels,
            snapshot: SnapshotState::new(),
            guardrail: Guardrail::new(),
            observer,
            skills,
            proactive,
            preamble,
            instructions_loaded,
            conversation: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Shared cancellation flag; flipping it aborts the run at the next
    /// suspension point.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn observer(&self) -> &Observer {
        &self.observer
    }

    pub fn mcp_servers(&self) -> Vec<String> {
        self.mcp.server_names()
    }

    /// One-shot run: fresh conversation each call.
    pub fn run(&mut self, task: &str) -> RunRecord {
        self.conversation = vec![Message::system(""), Message::user(task, 1)];
        self.drive(task, 1)
    }

    /// REPL-style run: continues the existing conversation.
    pub fn ask(&mut self, task: &str) -> RunRecord {
        if self.conversation.is_empty() {
            return self.run(task);
        }
        let next_turn = self
            .conversation
            .iter()
            .map(|m| m.turn)
            .max()
            .unwrap_or(0)
            + 1;
        self.conversation.push(Message::user(task, next_turn));
        self.drive(task, next_turn)
    }

    /// Clear conversation and session-scoped stores.
    pub fn reset(&mut self) {
        self.conversation.clear();
        self.channels.reset();
        self.snapshot.reset();
        self.guardrail = Guardrail::new();
        self.host.tracker_mut().reset();
    }

    pub fn shutdown(&self) {
        self.mcp.shutdown();
    }

    fn drive(&mut self, task: &str, first_turn: u32) -> RunRecord {
        let mut report = ReportCollector::new();
        let mut messages = std::mem::take(&mut self.conversation);

        let runner = TurnRunner {
            llm: self.llm.clone(),
            model: self.cfg.model.clone(),
            sampling: self.cfg.sampling,
            host: &mut self.host,
            registry: &self.registry,
            mcp: &self.mcp,
            context: &self.context,
            channels: &mut self.channels,
            snapshot: &mut self.snapshot,
            guardrail: &mut self.guardrail,
            report: &mut report,
            observer: &self.observer,
            skills: &self.skills,
            proactive: &mut self.proactive,
            preamble: self.preamble.clone(),
            max_turns: self.cfg.max_turns,
            reviewer: self.cfg.reviewer.clone(),
            max_review_rounds: self.cfg.max_review_rounds,
            base_dir: self.cfg.base_dir.clone(),
            task: task.to_string(),
            cancel: self.cancel.clone(),
        };
        let outcome = runner.run(&mut messages, first_turn);
        self.conversation = messages;

        let report_doc = report.build_report(
            task,
            &self.cfg.model,
            &self.cfg.provider,
            self.settings(),
            self.cfg.sandbox.clone(),
            RunResult {
                outcome: outcome.outcome.as_str().to_string(),
                answer: outcome.answer.clone(),
                exit_code: outcome.exit_code,
                error_message: outcome.error_message.clone(),
            },
            outcome.turns,
        );
        self.record_to_run(outcome, report_doc)
    }

    fn record_to_run(&self, outcome: RunOutcome, report: Report) -> RunRecord {
        RunRecord {
            outcome: outcome.outcome,
            answer: outcome.answer,
            exit_code: outcome.exit_code,
            error_message: outcome.error_message,
            turns: outcome.turns,
            report,
            messages: self.conversation.clone(),
        }
    }

    fn settings(&self) -> RunSettings {
        let mut allowed_commands = self.cfg.allowed_commands.clone();
        allowed_commands.sort();
        RunSettings {
            temperature: self.cfg.sampling.temperature,
            top_p: self.cfg.sampling.top_p,
            seed: self.cfg.sampling.seed,
            max_turns: self.cfg.max_turns,
            max_output_tokens: self.cfg.max_output_tokens,
            context_length: self.cfg.max_context_tokens,
            yolo: self.cfg.yolo,
            allowed_commands,
            skills_discovered: self.skills.names_sorted(),
            instructions_loaded: self.instructions_loaded.clone(),
        }
    }
}
