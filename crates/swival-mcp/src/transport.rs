//! MCP transports: newline-delimited JSON-RPC over a child process's stdio,
//! and JSON-RPC POSTs for HTTP/SSE servers.

use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::McpServerConfig;
use crate::rpc::{JsonRpcRequest, JsonRpcResponse};

/// Distinguishes a slow call from a broken transport: timeouts fail the
/// call, I/O errors degrade the server.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("mcp call timed out")]
    Timeout,
    #[error("mcp transport error: {0}")]
    Io(String),
    #[error("mcp server error {code}: {message}")]
    Rpc { code: i64, message: String },
}

pub trait McpTransport: Send {
    fn request(
        &mut self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError>;
    fn shutdown(&mut self);
}

pub fn connect(config: &McpServerConfig) -> Result<Box<dyn McpTransport>, TransportError> {
    if let Some(command) = &config.command {
        Ok(Box::new(StdioTransport::spawn(
            command,
            &config.args,
            &config.env,
        )?))
    } else if let Some(url) = &config.url {
        Ok(Box::new(HttpTransport::new(url, &config.headers)?))
    } else {
        Err(TransportError::Io("server config has no transport".into()))
    }
}

// ── stdio ───────────────────────────────────────────────────────────────

pub struct StdioTransport {
    child: Child,
    stdin: ChildStdin,
    lines: mpsc::Receiver<String>,
    next_id: u64,
}

impl StdioTransport {
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<Self, TransportError> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| TransportError::Io(format!("spawn {command}: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Io("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Io("child stdout unavailable".into()))?;

        // Reader thread: the loop thread must not block on a dead pipe, so
        // lines flow through a channel and requests use recv_timeout.
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            child,
            stdin,
            lines: rx,
            next_id: 1,
        })
    }
}

impl McpTransport for StdioTransport {
    fn request(
        &mut self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let id = self.next_id;
        self.next_id += 1;
        let request = JsonRpcRequest::new(id, method, params);
        let line = serde_json::to_string(&request)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        writeln!(self.stdin, "{line}").map_err(|e| TransportError::Io(e.to_string()))?;
        self.stdin
            .flush()
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(TransportError::Timeout)?;
            let line = match self.lines.recv_timeout(remaining) {
                Ok(line) => line,
                Err(mpsc::RecvTimeoutError::Timeout) => return Err(TransportError::Timeout),
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::Io("mcp server closed its stdout".into()));
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Ok(response) = serde_json::from_str::<JsonRpcResponse>(trimmed) else {
                continue; // notifications and noise are skipped
            };
            if response.id != Value::from(id) {
                continue;
            }
            if let Some(error) = response.error {
                return Err(TransportError::Rpc {
                    code: error.code,
                    message: error.message,
                });
            }
            return Ok(response.result.unwrap_or(Value::Null));
        }
    }

    fn shutdown(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── HTTP / SSE ──────────────────────────────────────────────────────────

pub struct HttpTransport {
    client: reqwest::blocking::Client,
    url: String,
    headers: BTreeMap<String, String>,
    next_id: u64,
}

impl HttpTransport {
    pub fn new(url: &str, headers: &BTreeMap<String, String>) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
            headers: headers.clone(),
            next_id: 1,
        })
    }
}

impl McpTransport for HttpTransport {
    fn request(
        &mut self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let id = self.next_id;
        self.next_id += 1;
        let request = JsonRpcRequest::new(id, method, params);
        let mut builder = self.client.post(&self.url).timeout(timeout).json(&request);
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }
        let resp = builder.send().map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Io(e.to_string())
            }
        })?;
        let body = resp
            .text()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        // SSE-style endpoints frame the JSON-RPC response as `data:` lines.
        let payload = body
            .lines()
            .find_map(|line| line.strip_prefix("data:"))
            .map(str::trim)
            .unwrap_or(body.as_str());
        let response: JsonRpcResponse = serde_json::from_str(payload)
            .map_err(|e| TransportError::Io(format!("bad response body: {e}")))?;
        if let Some(error) = response.error {
            return Err(TransportError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    fn shutdown(&mut self) {}
}
