//! Reviewer support: running an external reviewer over a candidate answer,
//! and acting as the LLM judge on the other side of that pipe.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use swival_core::{ChatRequest, Message, SamplingParams};
use swival_llm::LlmClient;

/// Outcome of one external reviewer invocation. Exit 0 accepts the answer,
/// exit 1 asks for another round with the stdout as feedback, anything
/// else is a reviewer failure.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ReviewOutcome {
    pub fn accepted(&self) -> bool {
        self.exit_code == 0
    }

    pub fn wants_retry(&self) -> bool {
        self.exit_code == 1
    }
}

/// Run the configured reviewer command with the candidate answer on stdin
/// and the task in `SWIVAL_TASK`.
pub fn run_reviewer_command(
    command: &str,
    answer: &str,
    task: &str,
    base_dir: &Path,
) -> anyhow::Result<ReviewOutcome> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(base_dir)
        .env("SWIVAL_TASK", task)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| anyhow::anyhow!("failed to start reviewer '{command}': {e}"))?;
    child
        .stdin
        .as_mut()
        .ok_or_else(|| anyhow::anyhow!("reviewer stdin unavailable"))?
        .write_all(answer.as_bytes())?;
    let output = child.wait_with_output()?;
    Ok(ReviewOutcome {
        exit_code: output.status.code().unwrap_or(2),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

// ── Judge side ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Retry,
}

/// Parse the last `VERDICT: ACCEPT|RETRY` line, case-insensitively.
pub fn parse_verdict(text: &str) -> Option<Verdict> {
    let mut verdict = None;
    for line in text.lines() {
        let trimmed = line.trim();
        let Some(rest) = trimmed
            .strip_prefix("VERDICT:")
            .or_else(|| trimmed.strip_prefix("verdict:"))
            .or_else(|| trimmed.strip_prefix("Verdict:"))
        else {
            continue;
        };
        match rest.trim().to_ascii_uppercase().as_str() {
            "ACCEPT" => verdict = Some(Verdict::Accept),
            "RETRY" => verdict = Some(Verdict::Retry),
            _ => {}
        }
    }
    verdict
}

pub fn build_review_prompt(
    task: &str,
    answer: &str,
    verification: Option<&str>,
    custom_instructions: Option<&str>,
) -> String {
    let verification_section = verification
        .map(|v| {
            format!(
                "<verification>\n{v}\n</verification>\n\n\
                 The answer must satisfy these verification criteria.\n\n"
            )
        })
        .unwrap_or_default();
    let custom = custom_instructions
        .map(|c| format!("{c}\n\n"))
        .unwrap_or_default();
    format!(
        "You are reviewing a coding agent's work.\n\n\
         <task>\n{task}\n</task>\n\n\
         {verification_section}\
         <answer>\n{answer}\n</answer>\n\n\
         Evaluate whether the answer correctly and completely addresses the task.\n\
         {custom}\
         You MUST end your response with exactly one of these lines:\n\
         \x20 VERDICT: ACCEPT\n\
         \x20 VERDICT: RETRY\n\n\
         If RETRY, explain what needs to be fixed above the verdict line. \
         Be specific and actionable."
    )
}

/// Judge-mode entry: one toolless LLM call over the review prompt.
/// Returns (verdict, full response text); `None` verdict means the model
/// never produced one.
pub fn judge(
    llm: &Arc<dyn LlmClient + Send + Sync>,
    model: &str,
    sampling: SamplingParams,
    max_output_tokens: u32,
    prompt: &str,
) -> anyhow::Result<(Option<Verdict>, String)> {
    let request = ChatRequest {
        model: model.to_string(),
        messages: vec![Message::user(prompt, 1)],
        tools: vec![],
        max_tokens: max_output_tokens,
        sampling,
    };
    let response = llm
        .complete(&request)
        .map_err(|e| anyhow::anyhow!("reviewer LLM call failed: {e}"))?;
    Ok((parse_verdict(&response.text), response.text))
}
