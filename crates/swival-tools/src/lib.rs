//! Built-in tool execution for the Swival agent.
//!
//! [`LocalToolHost`] runs the filesystem, command, and network tools against
//! a path-anchored workspace: every path goes through the path policy, every
//! result through the output caps, and every write through the
//! read-before-write tracker. Knowledge-channel tools (`think`, `todo`,
//! `snapshot`, `use_skill`) and MCP tools are dispatched by the agent loop
//! before reaching this host.

pub mod caps;
pub mod edit;
pub mod fetch;
pub mod shell;
pub mod tracker;

use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use swival_core::{ToolError, ToolErrorKind, ToolOrigin, ToolSpec, runtime_dir, truncate_chars};
use swival_policy::{CommandPolicy, Intent, NameResolver, PathPolicy, SystemResolver};

use caps::{
    COMMAND_INLINE_CAP, COMMAND_SPILL_CAP, FETCH_INLINE_CAP, FETCH_SPILL_CAP, LIST_ENTRY_CAP,
    READ_INLINE_CAP, READ_LINE_CAP, SpillArea, cap_inline, cap_with_spill,
};
use fetch::UrlFetcher;
use shell::{ArgvRunner, ProcessRunner};
use tracker::ReadTracker;

/// Tools that never mutate workspace state. Used by snapshot dirty tracking
/// and the read-streak nudge.
pub const READ_ONLY_TOOLS: &[&str] = &[
    "read_file",
    "list_dir",
    "grep",
    "fetch_url",
    "think",
    "todo",
    "snapshot",
    "use_skill",
];

pub fn is_read_only_tool(name: &str) -> bool {
    READ_ONLY_TOOLS.contains(&name) || name.starts_with("mcp__")
}

// ── Registry ────────────────────────────────────────────────────────────

/// Holds the contracts of every callable tool: built-ins plus dynamically
/// registered MCP tools under namespaced names.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    specs: Vec<ToolSpec>,
}

impl ToolRegistry {
    pub fn new(specs: Vec<ToolSpec>) -> Self {
        Self { specs }
    }

    pub fn register(&mut self, spec: ToolSpec) {
        if self.get(&spec.name).is_none() {
            self.specs.push(spec);
        }
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn origin(&self, name: &str) -> Option<&ToolOrigin> {
        self.get(name).map(|s| &s.origin)
    }
}

/// Options that shape which built-ins are advertised.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinOptions {
    pub run_command: bool,
    pub use_skill: bool,
}

pub fn builtin_specs(options: BuiltinOptions) -> Vec<ToolSpec> {
    let spec = |name: &str, description: &str, schema: Value| ToolSpec {
        name: name.to_string(),
        description: description.to_string(),
        schema,
        origin: ToolOrigin::Builtin,
    };
    let mut specs = vec![
        spec(
            "read_file",
            "Read a text file. Large files are truncated; use offset/limit to page.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "offset": {"type": "integer", "description": "1-based first line"},
                    "limit": {"type": "integer", "description": "max lines to return"}
                },
                "required": ["path"]
            }),
        ),
        spec(
            "write_file",
            "Create or overwrite a file. Overwriting an existing file requires reading it first.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"},
                    "move_from": {"type": "string", "description": "move this file to path"}
                },
                "required": ["path", "content"]
            }),
        ),
        spec(
            "edit_file",
            "Replace old_string with new_string in a file you have already read.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "old_string": {"type": "string"},
                    "new_string": {"type": "string"},
                    "replace_all": {"type": "boolean"}
                },
                "required": ["path", "old_string", "new_string"]
            }),
        ),
        spec(
            "list_dir",
            "List directory entries.",
            json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
        ),
        spec(
            "grep",
            "Search files for a regex pattern.",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "path": {"type": "string", "description": "file or directory, default ."}
                },
                "required": ["pattern"]
            }),
        ),
        spec(
            "fetch_url",
            "Fetch an http(s) URL and return its text content.",
            json!({
                "type": "object",
                "properties": {"url": {"type": "string"}},
                "required": ["url"]
            }),
        ),
        spec(
            "think",
            "Record a numbered thinking step. Use revise_of or branch_of to link steps.",
            json!({
                "type": "object",
                "properties": {
                    "text": {"type": "string"},
                    "revise_of": {"type": "integer"},
                    "branch_of": {"type": "integer"}
                },
                "required": ["text"]
            }),
        ),
        spec(
            "todo",
            "Manage the todo list: add items, change state, or list.",
            json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["add", "update", "list"]},
                    "text": {"type": "string"},
                    "id": {"type": "integer"},
                    "state": {
                        "type": "string",
                        "enum": ["pending", "in-progress", "done", "cancelled"]
                    }
                },
                "required": ["action"]
            }),
        ),
        spec(
            "snapshot",
            "Checkpoint and collapse a span of the conversation: save, restore, cancel, status.",
            json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["save", "restore", "cancel", "status"]},
                    "label": {"type": "string"},
                    "summary": {"type": "string"},
                    "force": {"type": "boolean"}
                },
                "required": ["action"]
            }),
        ),
    ];
    if options.run_command {
        specs.push(spec(
            "run_command",
            "Run an allowlisted command. args is an argv array; no shell is involved.",
            json!({
                "type": "object",
                "properties": {
                    "args": {"type": "array", "items": {"type": "string"}},
                    "timeout_s": {"type": "integer"}
                },
                "required": ["args"]
            }),
        ));
    }
    if options.use_skill {
        specs.push(spec(
            "use_skill",
            "Load a discovered skill's instructions by name.",
            json!({
                "type": "object",
                "properties": {"name": {"type": "string"}},
                "required": ["name"]
            }),
        ));
    }
    specs
}

// ── Local tool host ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ToolHostOptions {
    pub no_read_guard: bool,
    pub command_timeout: Duration,
    pub fetch_timeout: Duration,
}

impl Default for ToolHostOptions {
    fn default() -> Self {
        Self {
            no_read_guard: false,
            command_timeout: Duration::from_secs(120),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

pub struct LocalToolHost {
    paths: PathPolicy,
    commands: CommandPolicy,
    tracker: ReadTracker,
    spills: SpillArea,
    scratch: PathBuf,
    runner: Box<dyn ArgvRunner + Send>,
    fetcher: UrlFetcher,
    options: ToolHostOptions,
}

impl LocalToolHost {
    pub fn new(
        paths: PathPolicy,
        commands: CommandPolicy,
        options: ToolHostOptions,
    ) -> anyhow::Result<Self> {
        Self::with_parts(
            paths,
            commands,
            options,
            Box::new(ProcessRunner),
            Arc::new(SystemResolver),
        )
    }

    pub fn with_parts(
        paths: PathPolicy,
        commands: CommandPolicy,
        options: ToolHostOptions,
        runner: Box<dyn ArgvRunner + Send>,
        resolver: Arc<dyn NameResolver + Send + Sync>,
    ) -> anyhow::Result<Self> {
        let scratch = runtime_dir(paths.base());
        let spills = SpillArea::new(&scratch)?;
        spills.sweep();
        let fetcher = UrlFetcher::new(resolver, options.fetch_timeout)?;
        Ok(Self {
            paths,
            commands,
            tracker: ReadTracker::new(),
            spills,
            scratch,
            runner,
            fetcher,
            options,
        })
    }

    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    pub fn tracker_mut(&mut self) -> &mut ReadTracker {
        &mut self.tracker
    }

    /// Cancellation path: remove spill files created during this run.
    pub fn clean_run_spills(&mut self) {
        self.spills.remove_created();
    }

    /// Cap an MCP tool result: inline head plus a spill pointer past 20 KB.
    pub fn cap_mcp_result(&mut self, text: &str) -> String {
        cap_with_spill(
            &mut self.spills,
            "cmd_output",
            text,
            caps::MCP_INLINE_CAP,
            caps::MCP_SPILL_CAP,
        )
    }

    /// Cap an MCP error: inline only, never spilled.
    pub fn cap_mcp_error(text: &str) -> String {
        cap_inline(text, caps::MCP_ERROR_CAP)
    }

    /// Dispatch one built-in tool call. Errors are values destined for the
    /// model, never propagated past the loop.
    pub fn run(&mut self, name: &str, args: &Value) -> Result<String, ToolError> {
        match name {
            "read_file" => self.read_file(args),
            "write_file" => self.write_file(args),
            "edit_file" => self.edit_file(args),
            "list_dir" => self.list_dir(args),
            "grep" => self.grep(args),
            "run_command" => self.run_command(args),
            "fetch_url" => self.fetch_url(args),
            other => Err(ToolError::new(
                ToolErrorKind::UnknownTool,
                format!("unknown tool: {other}"),
            )),
        }
    }

    fn read_file(&mut self, args: &Value) -> Result<String, ToolError> {
        let path = require_str(args, "path")?;
        let resolved = self.paths.resolve(path, Intent::Read)?;
        let bytes = fs::read(&resolved.absolute)
            .map_err(|e| ToolError::failed(format!("{path}: {e}")))?;
        if is_binary(&bytes) {
            return Err(ToolError::new(
                ToolErrorKind::BinaryContent,
                format!("{path} is binary ({} bytes)", bytes.len()),
            ));
        }
        let content = String::from_utf8_lossy(&bytes);
        let offset = args.get("offset").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
        let limit = args.get("limit").and_then(|v| v.as_u64()).map(|v| v as usize);

        let mut lines: Vec<String> = Vec::new();
        let total_lines = content.lines().count();
        for (idx, line) in content.lines().enumerate() {
            let lineno = idx + 1;
            if lineno < offset {
                continue;
            }
            if let Some(limit) = limit
                && lines.len() >= limit
            {
                break;
            }
            lines.push(if line.len() > READ_LINE_CAP {
                format!("{} [line truncated]", truncate_chars(line, READ_LINE_CAP))
            } else {
                line.to_string()
            });
        }
        self.tracker.record_read(&resolved.absolute);

        let mut text = lines.join("\n");
        if text.len() > READ_INLINE_CAP {
            text = cap_inline(&text, READ_INLINE_CAP);
        }
        if offset > 1 || limit.is_some() {
            text.push_str(&format!(
                "\n[showing lines from {offset}; file has {total_lines} lines]"
            ));
        }
        Ok(text)
    }

    fn write_file(&mut self, args: &Value) -> Result<String, ToolError> {
        let path = require_str(args, "path")?;
        let content = require_str(args, "content")?;
        let move_from = args.get("move_from").and_then(|v| v.as_str());
        let resolved = self.paths.resolve(path, Intent::Write)?;
        let exists = resolved.absolute.exists();

        let source = match move_from {
            Some(src) => {
                let src_resolved = self.paths.resolve(src, Intent::Write)?;
                if !src_resolved.absolute.exists() {
                    return Err(ToolError::failed(format!("move_from {src} does not exist")));
                }
                Some(src_resolved.absolute)
            }
            None => None,
        };

        // Renames are exempt from the read requirement on both ends.
        if source.is_none()
            && !self.options.no_read_guard
            && !self.tracker.write_allowed(&resolved.absolute, exists)
        {
            return Err(ToolError::new(
                ToolErrorKind::UnreadTarget,
                format!(
                    "cannot write to existing file {path} that has not been read; \
                     use read_file first"
                ),
            ));
        }

        if let Some(parent) = resolved.absolute.parent() {
            fs::create_dir_all(parent).map_err(ToolError::from)?;
        }
        fs::write(&resolved.absolute, content).map_err(ToolError::from)?;
        self.tracker.record_write(&resolved.absolute);
        if let Some(src) = source {
            fs::remove_file(&src).map_err(ToolError::from)?;
            return Ok(format!(
                "moved {} to {path} ({} bytes written)",
                move_from.unwrap_or(""),
                content.len()
            ));
        }
        Ok(format!("wrote {path} ({} bytes)", content.len()))
    }

    fn edit_file(&mut self, args: &Value) -> Result<String, ToolError> {
        let path = require_str(args, "path")?;
        let old_string = require_str(args, "old_string")?;
        let new_string = require_str(args, "new_string")?;
        let replace_all = args
            .get("replace_all")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let resolved = self.paths.resolve(path, Intent::Write)?;
        if !resolved.absolute.exists() {
            return Err(ToolError::failed(format!("{path} does not exist")));
        }
        if !self.options.no_read_guard && !self.tracker.has_read(&resolved.absolute) {
            return Err(ToolError::new(
                ToolErrorKind::UnreadTarget,
                format!("cannot edit {path} before reading it; use read_file first"),
            ));
        }
        let before = fs::read_to_string(&resolved.absolute)
            .map_err(|e| ToolError::failed(format!("{path}: {e}")))?;
        let after = edit::replace(&before, old_string, new_string, replace_all)
            .map_err(|e| ToolError::failed(e.to_string()))?;
        fs::write(&resolved.absolute, &after).map_err(ToolError::from)?;
        self.tracker.record_write(&resolved.absolute);
        let delta = after.len() as i64 - before.len() as i64;
        Ok(format!("edited {path} ({delta:+} bytes)"))
    }

    fn list_dir(&mut self, args: &Value) -> Result<String, ToolError> {
        let path = require_str(args, "path")?;
        let resolved = self.paths.resolve(path, Intent::Read)?;
        let mut entries: Vec<String> = Vec::new();
        let read = fs::read_dir(&resolved.absolute)
            .map_err(|e| ToolError::failed(format!("{path}: {e}")))?;
        for entry in read.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();
        let total = entries.len();
        if total > LIST_ENTRY_CAP {
            entries.truncate(LIST_ENTRY_CAP);
            entries.push(format!("… ({} more entries omitted)", total - LIST_ENTRY_CAP));
        }
        if entries.is_empty() {
            return Ok(format!("{path}: empty directory"));
        }
        Ok(entries.join("\n"))
    }

    fn grep(&mut self, args: &Value) -> Result<String, ToolError> {
        let pattern = require_str(args, "pattern")?;
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let resolved = self.paths.resolve(path, Intent::Read)?;
        let regex = regex::Regex::new(pattern)
            .map_err(|e| ToolError::failed(format!("invalid pattern: {e}")))?;

        let mut matches: Vec<String> = Vec::new();
        let mut truncated = false;
        let files: Vec<PathBuf> = if resolved.absolute.is_file() {
            vec![resolved.absolute.clone()]
        } else {
            let mut builder = ignore::WalkBuilder::new(&resolved.absolute);
            builder.hidden(false).follow_links(false).require_git(false);
            builder
                .build()
                .flatten()
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .map(|e| e.into_path())
                .filter(|p| !p.components().any(|c| c.as_os_str() == ".swival"))
                .collect()
        };

        'outer: for file in files {
            let Ok(bytes) = fs::read(&file) else { continue };
            if is_binary(&bytes) {
                continue;
            }
            let content = String::from_utf8_lossy(&bytes);
            let display = file
                .strip_prefix(self.paths.base())
                .unwrap_or(&file)
                .display()
                .to_string();
            for (idx, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(format!(
                        "{display}:{}: {}",
                        idx + 1,
                        truncate_chars(line.trim_end(), READ_LINE_CAP)
                    ));
                    if matches.len() >= LIST_ENTRY_CAP {
                        truncated = true;
                        break 'outer;
                    }
                }
            }
        }
        if matches.is_empty() {
            return Ok(format!("no matches for '{pattern}' in {path}"));
        }
        if truncated {
            matches.push(format!("… (stopped at {LIST_ENTRY_CAP} matches)"));
        }
        Ok(matches.join("\n"))
    }

    fn run_command(&mut self, args: &Value) -> Result<String, ToolError> {
        if !self.commands.is_enabled() {
            return Err(ToolError::new(
                ToolErrorKind::CommandNotAllowed,
                "run_command is disabled: pass --allowed-commands or --yolo",
            ));
        }
        let argv: Vec<String> = args
            .get("args")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        if argv.is_empty() {
            return Err(ToolError::new(
                ToolErrorKind::InvalidToolArguments,
                "run_command requires a non-empty args array",
            ));
        }
        let program = self.commands.check(&argv[0])?;
        let timeout = args
            .get("timeout_s")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs)
            .unwrap_or(self.options.command_timeout);

        let output = self
            .runner
            .run(&program, &argv[1..], self.paths.base(), timeout)
            .map_err(|e| ToolError::failed(e.to_string()))?;

        let mut combined = output.stdout;
        if !output.stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str("[stderr]\n");
            combined.push_str(&output.stderr);
        }
        let capped = cap_with_spill(
            &mut self.spills,
            "cmd_output",
            &combined,
            COMMAND_INLINE_CAP,
            COMMAND_SPILL_CAP,
        );

        if output.timed_out {
            return Err(ToolError::failed(format!(
                "command timed out after {}s\n{capped}",
                timeout.as_secs()
            )));
        }
        match output.status {
            Some(0) => Ok(capped),
            code => Err(ToolError::failed(format!(
                "command exited with status {}\n{capped}",
                code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into())
            ))),
        }
    }

    fn fetch_url(&mut self, args: &Value) -> Result<String, ToolError> {
        let url = require_str(args, "url")?;
        let outcome = self.fetcher.fetch(url)?;
        fetch::append_history(&self.scratch, url, outcome.status, outcome.raw.len());

        let mut text = if outcome.text.len() > FETCH_INLINE_CAP {
            let head = truncate_chars(&outcome.text, FETCH_INLINE_CAP);
            match self.spills.spill("fetch", &outcome.raw, FETCH_SPILL_CAP) {
                Ok(spill) => format!(
                    "{head}\n[content truncated: {} raw bytes at {} — read_file with offset/limit to page through]",
                    outcome.raw.len(),
                    spill.display()
                ),
                Err(_) => format!("{head}\n[content truncated]"),
            }
        } else {
            outcome.text
        };
        text.insert_str(
            0,
            &format!(
                "{} {} ({})\n\n",
                outcome.status, outcome.final_url, outcome.content_type
            ),
        );
        Ok(text)
    }
}

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key).and_then(|v| v.as_str()).ok_or_else(|| {
        ToolError::new(
            ToolErrorKind::InvalidToolArguments,
            format!("missing required string argument '{key}'"),
        )
    })
}

fn is_binary(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    if bytes[..bytes.len().min(8192)].contains(&0) {
        return true;
    }
    let non_text = bytes
        .iter()
        .take(8192)
        .filter(|b| b.is_ascii_control() && !matches!(**b, b'\n' | b'\r' | b'\t'))
        .count();
    non_text > 64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    struct PublicResolver;
    impl NameResolver for PublicResolver {
        fn resolve(&self, _host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
            Ok(vec!["1.1.1.1".parse().unwrap()])
        }
    }

    fn host(dir: &Path) -> LocalToolHost {
        let paths = PathPolicy::new(dir, &[], &[], false).expect("paths");
        let commands = CommandPolicy::new(&[], dir, false).expect("commands");
        LocalToolHost::with_parts(
            paths,
            commands,
            ToolHostOptions::default(),
            Box::new(ProcessRunner),
            Arc::new(PublicResolver),
        )
        .expect("host")
    }

    #[test]
    fn read_then_edit_succeeds() {
        let tmp = tempfile::tempdir().expect("tmp");
        fs::write(tmp.path().join("x.txt"), "hello world\n").expect("seed");
        let mut h = host(tmp.path());

        let read = h.run("read_file", &json!({"path": "x.txt"})).expect("read");
        assert!(read.contains("hello world"));

        let edited = h
            .run(
                "edit_file",
                &json!({"path": "x.txt", "old_string": "world", "new_string": "swival"}),
            )
            .expect("edit");
        assert!(edited.contains("edited"));
        assert_eq!(
            fs::read_to_string(tmp.path().join("x.txt")).unwrap(),
            "hello swival\n"
        );
    }

    #[test]
    fn edit_without_read_is_unread_target() {
        let tmp = tempfile::tempdir().expect("tmp");
        fs::write(tmp.path().join("x.txt"), "a\n").expect("seed");
        let mut h = host(tmp.path());
        let err = h
            .run(
                "edit_file",
                &json!({"path": "x.txt", "old_string": "a", "new_string": "b"}),
            )
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::UnreadTarget);
    }

    #[test]
    fn overwrite_without_read_is_unread_target() {
        let tmp = tempfile::tempdir().expect("tmp");
        fs::write(tmp.path().join("x.txt"), "a\n").expect("seed");
        let mut h = host(tmp.path());
        let err = h
            .run("write_file", &json!({"path": "x.txt", "content": "b"}))
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::UnreadTarget);
    }

    #[test]
    fn new_file_write_is_allowed() {
        let tmp = tempfile::tempdir().expect("tmp");
        let mut h = host(tmp.path());
        h.run("write_file", &json!({"path": "sub/new.txt", "content": "b"}))
            .expect("write");
        assert_eq!(
            fs::read_to_string(tmp.path().join("sub/new.txt")).unwrap(),
            "b"
        );
    }

    #[test]
    fn move_from_bypasses_read_guard() {
        let tmp = tempfile::tempdir().expect("tmp");
        fs::write(tmp.path().join("src.txt"), "content\n").expect("seed");
        fs::write(tmp.path().join("dst.txt"), "old\n").expect("seed");
        let mut h = host(tmp.path());
        h.run(
            "write_file",
            &json!({"path": "dst.txt", "content": "content\n", "move_from": "src.txt"}),
        )
        .expect("move");
        assert!(!tmp.path().join("src.txt").exists());
        assert_eq!(
            fs::read_to_string(tmp.path().join("dst.txt")).unwrap(),
            "content\n"
        );
    }

    #[test]
    fn no_read_guard_flag_disables_tracking() {
        let tmp = tempfile::tempdir().expect("tmp");
        fs::write(tmp.path().join("x.txt"), "a\n").expect("seed");
        let paths = PathPolicy::new(tmp.path(), &[], &[], false).unwrap();
        let commands = CommandPolicy::new(&[], tmp.path(), false).unwrap();
        let mut h = LocalToolHost::with_parts(
            paths,
            commands,
            ToolHostOptions {
                no_read_guard: true,
                ..Default::default()
            },
            Box::new(ProcessRunner),
            Arc::new(PublicResolver),
        )
        .unwrap();
        h.run("write_file", &json!({"path": "x.txt", "content": "b"}))
            .expect("guard disabled");
    }

    #[test]
    fn list_dir_caps_entries() {
        let tmp = tempfile::tempdir().expect("tmp");
        for i in 0..(LIST_ENTRY_CAP + 5) {
            fs::write(tmp.path().join(format!("f{i:03}.txt")), "x").expect("seed");
        }
        let mut h = host(tmp.path());
        let out = h.run("list_dir", &json!({"path": "."})).expect("list");
        assert!(out.contains("more entries omitted"));
    }

    #[test]
    fn grep_finds_matches() {
        let tmp = tempfile::tempdir().expect("tmp");
        fs::write(tmp.path().join("a.rs"), "fn main() {}\nfn other() {}\n").expect("seed");
        let mut h = host(tmp.path());
        let out = h
            .run("grep", &json!({"pattern": "fn \\w+", "path": "."}))
            .expect("grep");
        assert!(out.contains("a.rs:1"));
        assert!(out.contains("a.rs:2"));
    }

    #[test]
    fn run_command_disabled_without_allowlist() {
        let tmp = tempfile::tempdir().expect("tmp");
        let mut h = host(tmp.path());
        let err = h
            .run("run_command", &json!({"args": ["echo", "hi"]}))
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::CommandNotAllowed);
    }

    #[cfg(unix)]
    #[test]
    fn run_command_with_allowlist() {
        let tmp = tempfile::tempdir().expect("tmp");
        let paths = PathPolicy::new(tmp.path(), &[], &[], false).unwrap();
        let commands = CommandPolicy::new(&["echo".to_string()], tmp.path(), false).unwrap();
        let mut h = LocalToolHost::with_parts(
            paths,
            commands,
            ToolHostOptions::default(),
            Box::new(ProcessRunner),
            Arc::new(PublicResolver),
        )
        .unwrap();
        let out = h
            .run("run_command", &json!({"args": ["echo", "hi there"]}))
            .expect("run");
        assert!(out.contains("hi there"));
    }

    #[test]
    fn unknown_tool_reports_kind() {
        let tmp = tempfile::tempdir().expect("tmp");
        let mut h = host(tmp.path());
        let err = h.run("nope", &json!({})).unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::UnknownTool);
    }

    #[test]
    fn builtin_specs_respect_options() {
        let base = builtin_specs(BuiltinOptions::default());
        assert!(base.iter().all(|s| s.name != "run_command"));
        let with_cmd = builtin_specs(BuiltinOptions {
            run_command: true,
            use_skill: true,
        });
        assert!(with_cmd.iter().any(|s| s.name == "run_command"));
        assert!(with_cmd.iter().any(|s| s.name == "use_skill"));
    }

    #[test]
    fn registry_ignores_duplicate_names() {
        let mut registry = ToolRegistry::new(builtin_specs(BuiltinOptions::default()));
        let count = registry.specs().len();
        registry.register(ToolSpec {
            name: "read_file".to_string(),
            description: "dup".to_string(),
            schema: json!({}),
            origin: ToolOrigin::Mcp("x".to_string()),
        });
        assert_eq!(registry.specs().len(), count);
    }
}
