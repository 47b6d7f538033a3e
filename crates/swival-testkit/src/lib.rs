//! Scripted LLM client and response builders for agent tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use swival_core::{ChatRequest, LlmError, LlmResponse, ToolCallRequest};
use swival_llm::LlmClient;

/// An [`LlmClient`] that pops one scripted outcome per call. Running out of
/// script is a provider error, which keeps a runaway loop visible in tests.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    requests_seen: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<Result<LlmResponse, LlmError>>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from(responses)),
            requests_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn from_responses(responses: Vec<LlmResponse>) -> Self {
        Self::new(responses.into_iter().map(Ok).collect())
    }

    /// Requests captured so far, for asserting on prompt assembly.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests_seen.lock().expect("requests lock").clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().expect("responses lock").len()
    }
}

impl LlmClient for ScriptedLlm {
    fn complete(&self, req: &ChatRequest) -> Result<LlmResponse, LlmError> {
        self.requests_seen
            .lock()
            .expect("requests lock")
            .push(req.clone());
        self.responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Provider("scripted responses exhausted".into())))
    }
}

pub fn text_response(text: &str) -> LlmResponse {
    LlmResponse {
        text: text.to_string(),
        finish_reason: "stop".to_string(),
        tool_calls: vec![],
    }
}

pub fn truncated_response(text: &str) -> LlmResponse {
    LlmResponse {
        text: text.to_string(),
        finish_reason: "length".to_string(),
        tool_calls: vec![],
    }
}

pub fn tool_call(id: &str, name: &str, arguments: &str) -> ToolCallRequest {
    ToolCallRequest {
        id: id.to_string(),
        name: name.to_string(),
        arguments: arguments.to_string(),
    }
}

pub fn tool_calls_response(calls: Vec<ToolCallRequest>) -> LlmResponse {
    LlmResponse {
        text: String::new(),
        finish_reason: "tool_calls".to_string(),
        tool_calls: calls,
    }
}

pub fn overflow_error() -> LlmError {
    LlmError::ContextOverflow("maximum context length exceeded".to_string())
}
