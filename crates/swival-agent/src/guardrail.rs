//! Repeated-failure guardrail.
//!
//! Tracks consecutive tool-call failures keyed by (tool name, canonicalized
//! arguments). Two identical failures in a row earn a nudge; three or more
//! earn a stop instruction.

use serde_json::Value;
use swival_core::canonical_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardrailLevel {
    Nudge,
    Stop,
}

impl GuardrailLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardrailLevel::Nudge => "nudge",
            GuardrailLevel::Stop => "stop",
        }
    }
}

#[derive(Debug, Default)]
pub struct Guardrail {
    last_failure_key: Option<String>,
    streak: u32,
}

impl Guardrail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe one tool-call outcome; returns the intervention due, if any.
    pub fn observe(
        &mut self,
        tool: &str,
        arguments: Option<&Value>,
        succeeded: bool,
    ) -> Option<GuardrailLevel> {
        let key = format!(
            "{tool}:{}",
            arguments.map(canonical_json).unwrap_or_else(|| "null".to_string())
        );
        if succeeded {
            self.last_failure_key = None;
            self.streak = 0;
            return None;
        }
        if self.last_failure_key.as_deref() == Some(&key) {
            self.streak += 1;
        } else {
            self.last_failure_key = Some(key);
            self.streak = 1;
        }
        match self.streak {
            0 | 1 => None,
            2 => Some(GuardrailLevel::Nudge),
            _ => Some(GuardrailLevel::Stop),
        }
    }

    /// Message injected alongside the intervention.
    pub fn message(tool: &str, level: GuardrailLevel) -> String {
        match level {
            GuardrailLevel::Nudge => format!(
                "[guardrail] The last two {tool} calls failed with identical arguments. \
                 Change your approach before retrying."
            ),
            GuardrailLevel::Stop => format!(
                "[guardrail] {tool} has now failed three or more times with the same arguments. \
                 Abandon this tool-argument combination and try something different."
            ),
        }
    }
}
