//! Proactive checkpoint summarization.
//!
//! Every ten completed turns a background LLM call summarizes that batch
//! into a [`CheckpointSummary`]. The call runs on its own thread and its
//! result merges into the knowledge channels at a turn boundary. An
//! in-flight call is cancellable; compaction never waits for it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use swival_core::{
    ChatRequest, CheckpointSummary, Message, Role, SamplingParams, truncate_chars,
};
use swival_llm::LlmClient;

/// Completed-turn batch size between proactive summaries.
pub const SUMMARY_INTERVAL: u32 = 10;

struct InFlight {
    rx: mpsc::Receiver<CheckpointSummary>,
    cancel: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

pub struct ProactiveSummarizer {
    llm: Arc<dyn LlmClient + Send + Sync>,
    model: String,
    enabled: bool,
    last_summarized_turn: u32,
    inflight: Option<InFlight>,
}

impl ProactiveSummarizer {
    pub fn new(llm: Arc<dyn LlmClient + Send + Sync>, model: &str, enabled: bool) -> Self {
        Self {
            llm,
            model: model.to_string(),
            enabled,
            last_summarized_turn: 0,
            inflight: None,
        }
    }

    /// Kick off a background summary when a ten-turn batch has completed
    /// and nothing is already in flight.
    pub fn maybe_start(&mut self, completed_turn: u32, messages: &[Message]) {
        if !self.enabled
            || self.inflight.is_some()
            || completed_turn < self.last_summarized_turn + SUMMARY_INTERVAL
        {
            return;
        }
        let lo = self.last_summarized_turn + 1;
        let hi = completed_turn;
        let batch: Vec<Message> = messages
            .iter()
            .filter(|m| m.role != Role::System && m.turn >= lo && m.turn <= hi)
            .cloned()
            .collect();
        if batch.is_empty() {
            self.last_summarized_turn = hi;
            return;
        }

        let (tx, rx) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let thread_cancel = cancel.clone();
        let llm = self.llm.clone();
        let model = self.model.clone();
        let handle = thread::spawn(move || {
            let request = summary_request(&model, &batch, (lo, hi));
            if let Ok(response) = llm.complete(&request)
                && !thread_cancel.load(Ordering::SeqCst)
                && !response.text.trim().is_empty()
            {
                let _ = tx.send(CheckpointSummary {
                    turn_range: (lo, hi),
                    text: response.text.trim().to_string(),
                });
            }
        });
        self.last_summarized_turn = hi;
        self.inflight = Some(InFlight { rx, cancel, handle });
    }

    /// Merge a finished summary, if one arrived. Called between turns.
    pub fn try_merge(&mut self) -> Option<CheckpointSummary> {
        let finished = self
            .inflight
            .as_ref()
            .map(|i| i.handle.is_finished())
            .unwrap_or(false);
        if !finished {
            return None;
        }
        let inflight = self.inflight.take()?;
        let _ = inflight.handle.join();
        inflight.rx.try_recv().ok()
    }

    /// Cancel an in-flight call; compaction proceeds without its output.
    pub fn cancel_inflight(&mut self) {
        if let Some(inflight) = self.inflight.take() {
            inflight.cancel.store(true, Ordering::SeqCst);
            // The worker is abandoned, not joined: its send lands in a
            // dropped receiver.
        }
    }

    /// Block until any in-flight call finishes (run teardown).
    pub fn join(&mut self) -> Option<CheckpointSummary> {
        let inflight = self.inflight.take()?;
        let _ = inflight.handle.join();
        inflight.rx.try_recv().ok()
    }
}

fn summary_request(model: &str, batch: &[Message], range: (u32, u32)) -> ChatRequest {
    let mut transcript = String::new();
    for msg in batch {
        let line = match msg.role {
            Role::User => format!("USER: {}\n", truncate_chars(&msg.content, 400)),
            Role::Assistant => {
                let mut s = String::new();
                if !msg.content.is_empty() {
                    s.push_str(&format!("ASSISTANT: {}\n", truncate_chars(&msg.content, 400)));
                }
                for call in &msg.tool_calls {
                    s.push_str(&format!(
                        "CALL: {}({})\n",
                        call.name,
                        truncate_chars(&call.arguments, 200)
                    ));
                }
                s
            }
            Role::Tool => format!(
                "RESULT[{}]: {}\n",
                msg.tool_name.as_deref().unwrap_or("tool"),
                truncate_chars(&msg.content, 300)
            ),
            Role::System => String::new(),
        };
        transcript.push_str(&line);
    }
    ChatRequest {
        model: model.to_string(),
        messages: vec![
            Message::system(
                "Summarize the following agent transcript batch in 3-6 factual bullet \
                 points. Name concrete files, commands, and findings. Output only the bullets.",
            ),
            Message::user(
                format!("Turns {}-{}:\n\n{transcript}", range.0, range.1),
                1,
            ),
        ],
        tools: vec![],
        max_tokens: 512,
        sampling: SamplingParams::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use swival_testkit::{ScriptedLlm, text_response};

    fn batch_messages(turns: u32) -> Vec<Message> {
        let mut messages = vec![Message::system("s")];
        for turn in 1..=turns {
            messages.push(Message::assistant(format!("turn {turn}"), vec![], turn));
        }
        messages
    }

    fn wait_for_merge(summarizer: &mut ProactiveSummarizer) -> Option<CheckpointSummary> {
        for _ in 0..100 {
            if let Some(summary) = summarizer.try_merge() {
                return Some(summary);
            }
            thread::sleep(Duration::from_millis(10));
        }
        None
    }

    #[test]
    fn summarizes_every_ten_turns() {
        let llm = Arc::new(ScriptedLlm::from_responses(vec![text_response(
            "- investigated parser",
        )]));
        let mut summarizer = ProactiveSummarizer::new(llm, "test-model", true);
        let messages = batch_messages(10);

        summarizer.maybe_start(9, &messages);
        assert!(summarizer.inflight.is_none());

        summarizer.maybe_start(10, &messages);
        let summary = wait_for_merge(&mut summarizer).expect("summary");
        assert_eq!(summary.turn_range, (1, 10));
        assert!(summary.text.contains("parser"));
    }

    #[test]
    fn disabled_summarizer_never_starts() {
        let llm = Arc::new(ScriptedLlm::from_responses(vec![]));
        let mut summarizer = ProactiveSummarizer::new(llm, "test-model", false);
        summarizer.maybe_start(10, &batch_messages(10));
        assert!(summarizer.inflight.is_none());
    }

    #[test]
    fn cancel_discards_inflight_result() {
        let llm = Arc::new(ScriptedLlm::from_responses(vec![text_response("late")]));
        let mut summarizer = ProactiveSummarizer::new(llm, "test-model", true);
        summarizer.maybe_start(10, &batch_messages(10));
        summarizer.cancel_inflight();
        assert!(summarizer.try_merge().is_none());
        assert!(summarizer.join().is_none());
    }
}
