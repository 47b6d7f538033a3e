//! Swival CLI entry point: argument surface, provider resolution, sandbox
//! bootstrap, and the run/REPL/report plumbing around the agent session.

mod sandbox;

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::io::{BufRead, IsTerminal, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use swival_agent::{Session, SessionConfig, reviewer};
use swival_core::SamplingParams;
use swival_llm::{LlmClient, OpenAiCompatClient, ProviderConfig};
use swival_observe::{SandboxInfo, write_report};

#[derive(Debug, Parser)]
#[command(
    name = "swival",
    version,
    about = "LLM coding agent over a constrained context window"
)]
struct Cli {
    /// Task for the agent. Omit together with --repl.
    task: Option<String>,

    #[arg(long, default_value = ".")]
    base_dir: PathBuf,
    /// Additional read-write root (repeatable).
    #[arg(long = "add-dir")]
    add_dir: Vec<PathBuf>,
    /// Additional read-only root (repeatable).
    #[arg(long = "add-dir-ro")]
    add_dir_ro: Vec<PathBuf>,
    /// Comma-separated command allowlist for run_command.
    #[arg(long, value_delimiter = ',')]
    allowed_commands: Vec<String>,
    /// Relaxed sandbox: no root checks (except /), no command allowlist.
    #[arg(long)]
    yolo: bool,
    #[arg(long)]
    no_read_guard: bool,

    #[arg(long, default_value_t = 30)]
    max_turns: u32,
    #[arg(long, default_value_t = 4096)]
    max_output_tokens: u32,
    #[arg(long, default_value_t = 32_768)]
    max_context_tokens: usize,
    #[arg(long)]
    temperature: Option<f32>,
    #[arg(long)]
    top_p: Option<f32>,
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    proactive_summaries: bool,
    /// Write the run report JSON here; the answer goes into the report
    /// instead of stdout.
    #[arg(long, conflicts_with = "repl")]
    report: Option<PathBuf>,
    #[arg(long)]
    repl: bool,

    #[arg(long)]
    no_mcp: bool,
    #[arg(long)]
    mcp_config: Option<PathBuf>,

    #[arg(long, default_value = "builtin")]
    sandbox: String,
    #[arg(long)]
    sandbox_session: Option<String>,
    #[arg(long)]
    no_sandbox_auto_session: bool,
    #[arg(long)]
    sandbox_strict_read: bool,

    #[arg(long)]
    skills_dir: Option<PathBuf>,

    /// External reviewer command run over candidate answers.
    #[arg(long)]
    reviewer: Option<String>,
    #[arg(long, default_value_t = 3)]
    max_review_rounds: u32,
    /// Judge mode: review an answer from stdin instead of running a task.
    #[arg(long)]
    as_reviewer: bool,
    /// Task description file for judge mode.
    #[arg(long)]
    objective: Option<PathBuf>,
    /// Verification criteria file for judge mode.
    #[arg(long)]
    verify: Option<PathBuf>,
    /// Extra instructions for judge mode.
    #[arg(long)]
    review_prompt: Option<String>,

    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value = "openai")]
    provider: String,
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("swival: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    sandbox::maybe_reexec(
        &cli.sandbox,
        resolved_session(&cli).as_deref(),
        &cli.base_dir,
        &cli.add_dir,
        cli.sandbox_strict_read,
    )?;

    let (model, llm) = resolve_provider(&cli)?;

    if cli.as_reviewer {
        return run_judge_mode(&cli, &model, llm);
    }

    let sandbox_info = sandbox_info(&cli);
    let config = SessionConfig {
        base_dir: cli.base_dir.clone(),
        add_dirs: cli.add_dir.clone(),
        add_dirs_ro: cli.add_dir_ro.clone(),
        allowed_commands: cli.allowed_commands.clone(),
        yolo: cli.yolo,
        no_read_guard: cli.no_read_guard,
        max_turns: cli.max_turns,
        max_output_tokens: cli.max_output_tokens,
        max_context_tokens: cli.max_context_tokens,
        sampling: SamplingParams {
            temperature: cli.temperature,
            top_p: cli.top_p,
            seed: cli.seed,
        },
        model,
        provider: cli.provider.clone(),
        proactive_summaries: cli.proactive_summaries,
        skills_dir: cli.skills_dir.clone(),
        reviewer: cli.reviewer.clone(),
        max_review_rounds: cli.max_review_rounds,
        mcp_enabled: !cli.no_mcp,
        mcp_config: cli.mcp_config.clone(),
        command_timeout_s: 120,
        fetch_timeout_s: 30,
        verbose: cli.verbose,
        sandbox: sandbox_info,
    };
    let mut session = Session::new(config, llm).context("session startup failed")?;

    if cli.repl {
        return run_repl(&mut session);
    }

    let Some(task) = cli.task.clone() else {
        bail!("a task is required (or pass --repl)");
    };
    let record = session.run(&task);
    session.shutdown();

    if let Some(report_path) = &cli.report {
        write_report(report_path, &record.report)
            .with_context(|| format!("writing report to {}", report_path.display()))?;
    } else if let Some(answer) = &record.answer {
        println!("{answer}");
    }
    if let Some(message) = &record.error_message {
        eprintln!("swival: {message}");
    }
    Ok(record.exit_code)
}

/// REPL mode: one line per task, shared conversation, `/clear` and `/exit`.
/// Line-editor niceties are deliberately out of scope.
fn run_repl(session: &mut Session) -> Result<i32> {
    let stdin = std::io::stdin();
    let interactive = stdin.is_terminal();
    let mut lines = stdin.lock().lines();
    loop {
        if interactive {
            eprint!("swival> ");
            std::io::stderr().flush().ok();
        }
        let Some(line) = lines.next() else { break };
        let line = line?;
        let line = line.trim();
        match line {
            "" => continue,
            "/exit" | "/quit" => break,
            "/clear" => {
                session.reset();
                eprintln!("(conversation cleared)");
                continue;
            }
            task => {
                let record = session.ask(task);
                match &record.answer {
                    Some(answer) => println!("{answer}"),
                    None => eprintln!(
                        "swival: {}",
                        record
                            .error_message
                            .as_deref()
                            .unwrap_or("no answer produced")
                    ),
                }
            }
        }
    }
    session.shutdown();
    Ok(0)
}

/// Judge mode: read the candidate answer from stdin, review it with one
/// toolless LLM call, exit 0 accept / 1 retry / 2 reviewer error.
fn run_judge_mode(
    cli: &Cli,
    model: &str,
    llm: Arc<dyn LlmClient + Send + Sync>,
) -> Result<i32> {
    let mut answer = String::new();
    std::io::stdin().read_to_string(&mut answer)?;
    if answer.trim().is_empty() {
        eprintln!("reviewer error: empty answer on stdin");
        return Ok(2);
    }

    let task = match &cli.objective {
        Some(path) => {
            let resolved = if path.is_absolute() {
                path.clone()
            } else {
                cli.base_dir.join(path)
            };
            match std::fs::read_to_string(&resolved) {
                Ok(text) => Some(text),
                Err(err) => {
                    eprintln!("reviewer error: cannot read --objective file: {err}");
                    return Ok(2);
                }
            }
        }
        None => std::env::var("SWIVAL_TASK").ok(),
    };
    let Some(task) = task.filter(|t| !t.trim().is_empty()) else {
        eprintln!("reviewer error: no task description (set SWIVAL_TASK or use --objective)");
        return Ok(2);
    };

    let verification = match &cli.verify {
        Some(path) => {
            let resolved = if path.is_absolute() {
                path.clone()
            } else {
                cli.base_dir.join(path)
            };
            match std::fs::read_to_string(&resolved) {
                Ok(text) => Some(text),
                Err(err) => {
                    eprintln!("reviewer error: cannot read --verify file: {err}");
                    return Ok(2);
                }
            }
        }
        None => None,
    };

    let prompt = reviewer::build_review_prompt(
        &task,
        &answer,
        verification.as_deref(),
        cli.review_prompt.as_deref(),
    );
    let sampling = SamplingParams {
        temperature: cli.temperature,
        top_p: cli.top_p,
        seed: cli.seed,
    };
    match reviewer::judge(&llm, model, sampling, cli.max_output_tokens, &prompt) {
        Ok((Some(reviewer::Verdict::Accept), text)) => {
            println!("{text}");
            Ok(0)
        }
        Ok((Some(reviewer::Verdict::Retry), text)) => {
            println!("{text}");
            Ok(1)
        }
        Ok((None, text)) => {
            eprintln!("reviewer error: no VERDICT found in LLM response");
            println!("{text}");
            Ok(2)
        }
        Err(err) => {
            eprintln!("reviewer error: {err}");
            Ok(2)
        }
    }
}

fn resolved_session(cli: &Cli) -> Option<String> {
    if cli.sandbox != "agentfs" {
        return None;
    }
    if let Some(session) = &cli.sandbox_session {
        return Some(session.clone());
    }
    if cli.no_sandbox_auto_session {
        return None;
    }
    Some(sandbox::derive_session_id(&cli.base_dir))
}

fn sandbox_info(cli: &Cli) -> SandboxInfo {
    if cli.sandbox == "agentfs" {
        SandboxInfo {
            mode: "agentfs".to_string(),
            session: resolved_session(cli),
            strict_read: Some(cli.sandbox_strict_read),
            agentfs_version: sandbox::agentfs_version(),
        }
    } else {
        SandboxInfo::default()
    }
}

/// Resolve provider endpoint, credentials, and default model. Missing
/// credentials are a configuration error, reported before any turn runs.
fn resolve_provider(cli: &Cli) -> Result<(String, Arc<dyn LlmClient + Send + Sync>)> {
    let (endpoint, key_env, default_model) = match cli.provider.as_str() {
        "openai" => (
            "https://api.openai.com/v1/chat/completions",
            "OPENAI_API_KEY",
            Some("gpt-4o-mini"),
        ),
        "openrouter" => (
            "https://openrouter.ai/api/v1/chat/completions",
            "OPENROUTER_API_KEY",
            None,
        ),
        "deepseek" => (
            "https://api.deepseek.com/chat/completions",
            "DEEPSEEK_API_KEY",
            Some("deepseek-chat"),
        ),
        "local" => ("http://127.0.0.1:8080/v1/chat/completions", "", None),
        other => bail!("unknown provider '{other}' (expected openai, openrouter, deepseek, or local)"),
    };

    let model = match cli.model.clone().or(default_model.map(String::from)) {
        Some(model) => model,
        None => bail!("--model is required for provider '{}'", cli.provider),
    };

    let api_key = match cli.api_key.clone() {
        Some(key) => Some(key),
        None if key_env.is_empty() => None,
        None => match std::env::var(key_env) {
            Ok(key) if !key.is_empty() => Some(key),
            _ => bail!("{key_env} is not set (required for provider '{}')", cli.provider),
        },
    };

    let endpoint = cli
        .base_url
        .clone()
        .unwrap_or_else(|| endpoint.to_string());
    let client = OpenAiCompatClient::new(ProviderConfig {
        endpoint,
        api_key,
        ..ProviderConfig::default()
    })?;
    Ok((model, Arc::new(client)))
}
