//! Abstract LLM client plus the OpenAI-compatible blocking implementation.
//!
//! The loop only depends on [`LlmClient`]; the wire format here is one
//! provider family's concern. Context-window overflow reported by the
//! provider is mapped to [`LlmError::ContextOverflow`] so the agent loop can
//! route it into compaction instead of failing the run.

use serde_json::{Value, json};
use std::thread;
use std::time::Duration;
use swival_core::{ChatRequest, LlmError, LlmResponse, Message, Role, ToolCallRequest, ToolSpec};

pub trait LlmClient {
    fn complete(&self, req: &ChatRequest) -> Result<LlmResponse, LlmError>;
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: None,
            timeout_seconds: 120,
            max_retries: 3,
            retry_base_ms: 400,
        }
    }
}

/// Blocking client for OpenAI-compatible `/chat/completions` endpoints.
#[derive(Debug)]
pub struct OpenAiCompatClient {
    cfg: ProviderConfig,
    client: reqwest::blocking::Client,
}

impl OpenAiCompatClient {
    pub fn new(cfg: ProviderConfig) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .user_agent(concat!("swival/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { cfg, client })
    }

    fn send_once(&self, payload: &Value) -> Result<LlmResponse, RequestFailure> {
        let mut builder = self.client.post(&self.cfg.endpoint).json(payload);
        if let Some(key) = &self.cfg.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder
            .send()
            .map_err(|e| RequestFailure::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .map_err(|e| RequestFailure::Transport(e.to_string()))?;
        if status.is_success() {
            return parse_completion(&body).map_err(RequestFailure::Fatal);
        }
        if body_reports_overflow(&body) {
            return Err(RequestFailure::Overflow(format!("{status}: {body}")));
        }
        let retriable = status.as_u16() == 429 || status.is_server_error();
        let message = format!("provider returned {status}: {body}");
        if retriable {
            Err(RequestFailure::Transport(message))
        } else {
            Err(RequestFailure::Fatal(message))
        }
    }
}

enum RequestFailure {
    /// Retriable: network error, 429, 5xx.
    Transport(String),
    Overflow(String),
    Fatal(String),
}

impl LlmClient for OpenAiCompatClient {
    fn complete(&self, req: &ChatRequest) -> Result<LlmResponse, LlmError> {
        let payload = build_payload(req);
        let mut last = String::new();
        for attempt in 0..=self.cfg.max_retries {
            match self.send_once(&payload) {
                Ok(response) => return Ok(response),
                Err(RequestFailure::Overflow(msg)) => return Err(LlmError::ContextOverflow(msg)),
                Err(RequestFailure::Fatal(msg)) => return Err(LlmError::Provider(msg)),
                Err(RequestFailure::Transport(msg)) => {
                    last = msg;
                    if attempt < self.cfg.max_retries {
                        let backoff = self
                            .cfg
                            .retry_base_ms
                            .saturating_mul(2_u64.pow(attempt as u32));
                        thread::sleep(Duration::from_millis(backoff));
                    }
                }
            }
        }
        Err(LlmError::Provider(last))
    }
}

fn build_payload(req: &ChatRequest) -> Value {
    let messages: Vec<Value> = req.messages.iter().map(message_to_wire).collect();
    let mut payload = json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens,
        "stream": false,
    });
    if !req.tools.is_empty() {
        payload["tools"] = Value::Array(req.tools.iter().map(tool_to_wire).collect());
    }
    if let Some(t) = req.sampling.temperature {
        payload["temperature"] = json!(t);
    }
    if let Some(p) = req.sampling.top_p {
        payload["top_p"] = json!(p);
    }
    if let Some(seed) = req.sampling.seed {
        payload["seed"] = json!(seed);
    }
    payload
}

fn message_to_wire(msg: &Message) -> Value {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut wire = json!({"role": role, "content": msg.content});
    if !msg.tool_calls.is_empty() {
        wire["tool_calls"] = Value::Array(
            msg.tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {"name": call.name, "arguments": call.arguments},
                    })
                })
                .collect(),
        );
    }
    if let Some(id) = &msg.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }
    wire
}

fn tool_to_wire(spec: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": spec.name,
            "description": spec.description,
            "parameters": spec.schema,
        },
    })
}

fn parse_completion(body: &str) -> Result<LlmResponse, String> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| format!("unparsable completion body: {e}"))?;
    let choice = value
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .ok_or_else(|| format!("completion body has no choices: {body}"))?;
    let message = choice
        .get("message")
        .ok_or_else(|| "choice has no message".to_string())?;
    let text = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .unwrap_or("stop")
        .to_string();
    let tool_calls = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    Some(ToolCallRequest {
                        id: call.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                        name: function.get("name")?.as_str()?.to_string(),
                        arguments: function
                            .get("arguments")
                            .and_then(|v| v.as_str())
                            .unwrap_or("{}")
                            .to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(LlmResponse {
        text,
        finish_reason,
        tool_calls,
    })
}

/// Provider overflow detection. Phrasings vary; these cover the common
/// OpenAI-compatible families.
fn body_reports_overflow(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("context_length_exceeded")
        || lower.contains("maximum context length")
        || lower.contains("context window")
        || lower.contains("too many tokens")
}

#[cfg(test)]
mod tests {
    use super::*;
    use swival_core::SamplingParams;

    #[test]
    fn parses_text_completion() {
        let body = r#"{"choices":[{"message":{"content":"hi"},"finish_reason":"stop"}]}"#;
        let out = parse_completion(body).expect("parse");
        assert_eq!(out.text, "hi");
        assert_eq!(out.finish_reason, "stop");
        assert!(out.tool_calls.is_empty());
    }

    #[test]
    fn parses_tool_call_completion() {
        let body = r#"{"choices":[{"message":{"content":null,"tool_calls":[
            {"id":"c1","type":"function","function":{"name":"read_file","arguments":"{\"path\":\"x\"}"}}
        ]},"finish_reason":"tool_calls"}]}"#;
        let out = parse_completion(body).expect("parse");
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].name, "read_file");
        assert_eq!(out.tool_calls[0].id, "c1");
    }

    #[test]
    fn overflow_body_is_detected() {
        assert!(body_reports_overflow(
            r#"{"error":{"code":"context_length_exceeded"}}"#
        ));
        assert!(body_reports_overflow(
            "This model's maximum context length is 8192 tokens"
        ));
        assert!(!body_reports_overflow(r#"{"error":"rate limited"}"#));
    }

    #[test]
    fn payload_includes_tools_and_sampling() {
        let req = ChatRequest {
            model: "m".to_string(),
            messages: vec![Message::system("s")],
            tools: vec![ToolSpec {
                name: "read_file".to_string(),
                description: "read".to_string(),
                schema: json!({"type":"object"}),
                origin: swival_core::ToolOrigin::Builtin,
            }],
            max_tokens: 100,
            sampling: SamplingParams {
                temperature: Some(0.2),
                top_p: None,
                seed: Some(7),
            },
        };
        let payload = build_payload(&req);
        assert_eq!(payload["tools"][0]["function"]["name"], "read_file");
        assert_eq!(payload["seed"], 7);
        assert!(payload.get("top_p").is_none());
    }
}
