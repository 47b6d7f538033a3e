//! MCP client pool.
//!
//! Connects to configured tool servers concurrently at startup, namespaces
//! their tools as `mcp__<server>__<tool>`, enforces the schema token budget,
//! and tracks per-server degradation for the rest of the session.

pub mod config;
pub mod rpc;
pub mod transport;

use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use swival_core::{
    ToolError, ToolErrorKind, ToolOrigin, ToolSpec, estimate_tokens, mcp_tool_name,
    split_mcp_tool_name,
};

pub use config::{McpServerConfig, load_server_configs, validate_server_name};
pub use transport::{McpTransport, TransportError};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct McpTool {
    pub server: String,
    pub name: String,
    pub qualified: String,
    pub description: String,
    pub schema: Value,
}

struct ServerState {
    transport: Box<dyn McpTransport>,
    degraded: bool,
}

pub struct McpServer {
    name: String,
    tools: Vec<McpTool>,
    state: Mutex<ServerState>,
}

impl McpServer {
    /// Estimated token cost of advertising this server's tool schemas.
    fn schema_cost(&self) -> usize {
        self.tools
            .iter()
            .map(|t| {
                estimate_tokens(&t.qualified)
                    + estimate_tokens(&t.description)
                    + estimate_tokens(&t.schema.to_string())
            })
            .sum()
    }

    pub fn is_degraded(&self) -> bool {
        self.state.lock().map(|s| s.degraded).unwrap_or(true)
    }
}

pub struct McpPool {
    servers: Vec<McpServer>,
    warnings: Vec<String>,
    call_timeout: Duration,
}

impl Default for McpPool {
    fn default() -> Self {
        Self::empty()
    }
}

impl McpPool {
    pub fn empty() -> Self {
        Self {
            servers: Vec::new(),
            warnings: Vec::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Connect every configured server concurrently with a per-server
    /// timeout. Failures are warnings, never fatal.
    pub fn connect_all(
        configs: BTreeMap<String, McpServerConfig>,
        connect_timeout: Duration,
        call_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let expected = configs.len();
        for (name, server_config) in configs {
            let tx = tx.clone();
            thread::spawn(move || {
                let result = connect_server(&name, &server_config, connect_timeout);
                let _ = tx.send((name, result));
            });
        }
        drop(tx);

        let mut servers = Vec::new();
        let mut warnings = Vec::new();
        let deadline = Instant::now() + connect_timeout + Duration::from_secs(1);
        for _ in 0..expected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((_, Ok(server))) => servers.push(server),
                Ok((name, Err(err))) => {
                    warnings.push(format!("mcp server '{name}' skipped: {err}"));
                }
                Err(_) => {
                    warnings.push("mcp startup: a server did not connect in time".to_string());
                    break;
                }
            }
        }
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            servers,
            warnings,
            call_timeout,
        }
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name.clone()).collect()
    }

    /// Tool specs for every surviving server, namespaced and ready for the
    /// registry.
    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.servers
            .iter()
            .flat_map(|server| {
                server.tools.iter().map(|tool| ToolSpec {
                    name: tool.qualified.clone(),
                    description: tool.description.clone(),
                    schema: tool.schema.clone(),
                    origin: ToolOrigin::Mcp(tool.server.clone()),
                })
            })
            .collect()
    }

    /// Enforce the schema token budget: warn past 30% of the context
    /// window, and repeatedly drop the costliest server past 50% until the
    /// total fits. Returns human-readable warnings.
    pub fn apply_schema_budget(&mut self, context_window: usize) -> Vec<String> {
        let warn_threshold = context_window * 3 / 10;
        let hard_budget = context_window / 2;
        let mut notes = Vec::new();

        let total: usize = self.servers.iter().map(|s| s.schema_cost()).sum();
        if total > warn_threshold {
            notes.push(format!(
                "mcp tool schemas cost ~{total} tokens (> 30% of the {context_window}-token window)"
            ));
        }
        let mut running = total;
        while running > hard_budget {
            let Some((idx, cost)) = self
                .servers
                .iter()
                .enumerate()
                .map(|(i, s)| (i, s.schema_cost()))
                .max_by_key(|(_, cost)| *cost)
            else {
                break;
            };
            let removed = self.servers.remove(idx);
            removed
                .state
                .lock()
                .map(|mut s| s.transport.shutdown())
                .ok();
            running -= cost;
            notes.push(format!(
                "mcp server '{}' removed: schema budget exceeded ({cost} tokens)",
                removed.name
            ));
        }
        self.warnings.extend(notes.clone());
        notes
    }

    /// Invoke a namespaced MCP tool. Degraded servers answer `McpDegraded`
    /// without touching the transport; timeouts fail the call only; I/O
    /// errors degrade the server for the rest of the session.
    pub fn call(&self, qualified: &str, args: &Value) -> Result<String, ToolError> {
        let (server_name, tool_name) = split_mcp_tool_name(qualified).ok_or_else(|| {
            ToolError::new(
                ToolErrorKind::UnknownTool,
                format!("not an mcp tool name: {qualified}"),
            )
        })?;
        let server = self
            .servers
            .iter()
            .find(|s| s.name == server_name)
            .ok_or_else(|| {
                ToolError::new(
                    ToolErrorKind::UnknownTool,
                    format!("unknown mcp server: {server_name}"),
                )
            })?;

        let mut state = server
            .state
            .lock()
            .map_err(|_| ToolError::failed("mcp server state poisoned"))?;
        if state.degraded {
            return Err(ToolError::new(
                ToolErrorKind::McpDegraded,
                format!("mcp server '{server_name}' is degraded for this session"),
            ));
        }

        let params = json!({"name": tool_name, "arguments": args});
        match state.transport.request("tools/call", params, self.call_timeout) {
            Ok(result) => {
                let text = extract_content_text(&result);
                if result
                    .get("isError")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
                {
                    Err(ToolError::failed(text))
                } else {
                    Ok(text)
                }
            }
            Err(TransportError::Timeout) => Err(ToolError::new(
                ToolErrorKind::McpTimeout,
                format!("mcp call {server_name}/{tool_name} timed out"),
            )),
            Err(TransportError::Rpc { code, message }) => {
                Err(ToolError::failed(format!("mcp error {code}: {message}")))
            }
            Err(TransportError::Io(message)) => {
                state.degraded = true;
                Err(ToolError::failed(format!(
                    "mcp server '{server_name}' transport failed: {message}"
                )))
            }
        }
    }

    pub fn shutdown(&self) {
        for server in &self.servers {
            if let Ok(mut state) = server.state.lock() {
                state.transport.shutdown();
            }
        }
    }
}

fn connect_server(
    name: &str,
    config: &McpServerConfig,
    timeout: Duration,
) -> anyhow::Result<McpServer> {
    let mut transport = transport::connect(config)?;
    transport.request(
        "initialize",
        json!({
            "protocolVersion": "2024-11-05",
            "clientInfo": {"name": "swival", "version": env!("CARGO_PKG_VERSION")},
            "capabilities": {}
        }),
        timeout,
    )?;
    let listed = transport.request("tools/list", json!({}), timeout)?;
    let tools = parse_tool_list(name, &listed)?;
    Ok(McpServer {
        name: name.to_string(),
        tools,
        state: Mutex::new(ServerState {
            transport,
            degraded: false,
        }),
    })
}

/// Parse a `tools/list` result. A server advertising two tools under the
/// same name is dropped entirely.
fn parse_tool_list(server: &str, result: &Value) -> anyhow::Result<Vec<McpTool>> {
    let mut tools = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let listed = result
        .get("tools")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("tools/list returned no tools array"))?;
    for entry in listed {
        let name = entry
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("tool entry without a name"))?;
        if !seen.insert(name.to_string()) {
            anyhow::bail!("server advertises duplicate tool name '{name}'");
        }
        tools.push(McpTool {
            server: server.to_string(),
            name: name.to_string(),
            qualified: mcp_tool_name(server, name),
            description: entry
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            schema: entry
                .get("inputSchema")
                .cloned()
                .unwrap_or_else(|| json!({"type": "object"})),
        });
    }
    Ok(tools)
}

fn extract_content_text(result: &Value) -> String {
    match result.get("content").and_then(|v| v.as_array()) {
        Some(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        None => result.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted transport: pops one canned reply per request.
    struct ScriptedTransport {
        replies: Vec<Result<Value, TransportError>>,
        calls: Arc<AtomicUsize>,
    }

    impl McpTransport for ScriptedTransport {
        fn request(
            &mut self,
            _method: &str,
            _params: Value,
            _timeout: Duration,
        ) -> Result<Value, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.replies.is_empty() {
                Err(TransportError::Io("script exhausted".into()))
            } else {
                self.replies.remove(0)
            }
        }

        fn shutdown(&mut self) {}
    }

    fn pool_with_server(name: &str, tools: Vec<McpTool>, replies: Vec<Result<Value, TransportError>>) -> McpPool {
        McpPool {
            servers: vec![McpServer {
                name: name.to_string(),
                tools,
                state: Mutex::new(ServerState {
                    transport: Box::new(ScriptedTransport {
                        replies,
                        calls: Arc::new(AtomicUsize::new(0)),
                    }),
                    degraded: false,
                }),
            }],
            warnings: Vec::new(),
            call_timeout: Duration::from_secs(1),
        }
    }

    fn tool(server: &str, name: &str, schema_bytes: usize) -> McpTool {
        McpTool {
            server: server.to_string(),
            name: name.to_string(),
            qualified: mcp_tool_name(server, name),
            description: String::new(),
            schema: json!({"pad": "x".repeat(schema_bytes)}),
        }
    }

    #[test]
    fn duplicate_tool_names_drop_server() {
        let listed = json!({"tools": [
            {"name": "read", "inputSchema": {}},
            {"name": "read", "inputSchema": {}}
        ]});
        assert!(parse_tool_list("files", &listed).is_err());
    }

    #[test]
    fn tool_specs_are_namespaced() {
        let pool = pool_with_server("files", vec![tool("files", "read", 16)], vec![]);
        let specs = pool.tool_specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "mcp__files__read");
        assert_eq!(specs[0].origin, ToolOrigin::Mcp("files".to_string()));
    }

    #[test]
    fn budget_exactly_at_half_passes() {
        // One server whose cost lands exactly on the 50% budget.
        let mut pool = pool_with_server("files", vec![tool("files", "read", 16)], vec![]);
        let cost = pool.servers[0].schema_cost();
        let window = cost * 2;
        pool.apply_schema_budget(window);
        assert_eq!(pool.servers.len(), 1);
    }

    #[test]
    fn budget_one_over_half_trims_largest() {
        let mut pool = pool_with_server("files", vec![tool("files", "read", 4000)], vec![]);
        let cost = pool.servers[0].schema_cost();
        let window = cost * 2 - 2;
        let notes = pool.apply_schema_budget(window);
        assert!(pool.servers.is_empty());
        assert!(notes.iter().any(|n| n.contains("schema budget exceeded")));
    }

    #[test]
    fn budget_trims_costliest_first() {
        let big = McpServer {
            name: "big".to_string(),
            tools: vec![tool("big", "x", 40_000)],
            state: Mutex::new(ServerState {
                transport: Box::new(ScriptedTransport {
                    replies: vec![],
                    calls: Arc::new(AtomicUsize::new(0)),
                }),
                degraded: false,
            }),
        };
        let small = McpServer {
            name: "small".to_string(),
            tools: vec![tool("small", "y", 100)],
            state: Mutex::new(ServerState {
                transport: Box::new(ScriptedTransport {
                    replies: vec![],
                    calls: Arc::new(AtomicUsize::new(0)),
                }),
                degraded: false,
            }),
        };
        let mut pool = McpPool {
            servers: vec![big, small],
            warnings: Vec::new(),
            call_timeout: Duration::from_secs(1),
        };
        pool.apply_schema_budget(8192);
        assert_eq!(pool.server_names(), vec!["small".to_string()]);
    }

    #[test]
    fn transport_io_error_degrades_server() {
        let pool = pool_with_server(
            "files",
            vec![tool("files", "read", 16)],
            vec![Err(TransportError::Io("pipe closed".into()))],
        );
        let first = pool.call("mcp__files__read", &json!({})).unwrap_err();
        assert_eq!(first.kind, ToolErrorKind::Failed);
        // Degradation is sticky: the next call never reaches the transport.
        let second = pool.call("mcp__files__read", &json!({})).unwrap_err();
        assert_eq!(second.kind, ToolErrorKind::McpDegraded);
    }

    #[test]
    fn timeout_fails_call_without_degrading() {
        let pool = pool_with_server(
            "files",
            vec![tool("files", "read", 16)],
            vec![
                Err(TransportError::Timeout),
                Ok(json!({"content": [{"type": "text", "text": "ok"}]})),
            ],
        );
        let first = pool.call("mcp__files__read", &json!({})).unwrap_err();
        assert_eq!(first.kind, ToolErrorKind::McpTimeout);
        let second = pool.call("mcp__files__read", &json!({})).expect("recovers");
        assert_eq!(second, "ok");
    }

    #[test]
    fn tool_error_result_is_failure_not_degradation() {
        let pool = pool_with_server(
            "files",
            vec![tool("files", "read", 16)],
            vec![
                Ok(json!({"isError": true, "content": [{"type": "text", "text": "bad args"}]})),
                Ok(json!({"content": [{"type": "text", "text": "fine"}]})),
            ],
        );
        let first = pool.call("mcp__files__read", &json!({})).unwrap_err();
        assert_eq!(first.kind, ToolErrorKind::Failed);
        assert!(first.message.contains("bad args"));
        assert_eq!(pool.call("mcp__files__read", &json!({})).unwrap(), "fine");
    }
}
