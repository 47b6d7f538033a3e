//! MCP server configuration loading and layering.
//!
//! Precedence, high to low: explicit JSON override file (`--mcp-config`),
//! project `swival.toml` `[mcp_servers.<name>]` tables, project `.mcp.json`
//! `mcpServers` object, global config. Higher layers replace whole server
//! entries by name.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// One configured server: stdio (`command` + `args` + `env`) or
/// HTTP/SSE (`url` + `headers`). Exactly one of `command`/`url` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct McpServerConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub url: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl McpServerConfig {
    pub fn is_stdio(&self) -> bool {
        self.command.is_some()
    }

    fn validate(&self, name: &str) -> Result<()> {
        validate_server_name(name)?;
        match (&self.command, &self.url) {
            (Some(_), Some(_)) => bail!("mcp server '{name}' sets both command and url"),
            (None, None) => bail!("mcp server '{name}' needs either command or url"),
            _ => Ok(()),
        }
    }
}

/// Server names become tool-name prefixes, so `__` would make the
/// `mcp__<server>__<tool>` encoding ambiguous.
pub fn validate_server_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        bail!("invalid mcp server name '{name}': use [A-Za-z0-9_-]+");
    }
    if name.contains("__") {
        bail!("invalid mcp server name '{name}': '__' is reserved as a separator");
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct McpJsonFile {
    #[serde(default, rename = "mcpServers")]
    mcp_servers: BTreeMap<String, McpServerConfig>,
}

#[derive(Debug, Deserialize)]
struct ProjectTomlFile {
    #[serde(default)]
    mcp_servers: BTreeMap<String, McpServerConfig>,
}

pub fn global_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| Path::new(&home).join(".swival/mcp.json"))
}

/// Load and layer every config source. `None` override means no
/// `--mcp-config` flag was given.
pub fn load_server_configs(
    base_dir: &Path,
    override_file: Option<&Path>,
) -> Result<BTreeMap<String, McpServerConfig>> {
    let mut merged: BTreeMap<String, McpServerConfig> = BTreeMap::new();

    if let Some(global) = global_config_path()
        && global.exists()
    {
        merge_json_layer(&mut merged, &global)?;
    }

    let project_json = base_dir.join(".mcp.json");
    if project_json.exists() {
        merge_json_layer(&mut merged, &project_json)?;
    }

    let project_toml = base_dir.join("swival.toml");
    if project_toml.exists() {
        let raw = fs::read_to_string(&project_toml)
            .with_context(|| format!("reading {}", project_toml.display()))?;
        let parsed: ProjectTomlFile = toml::from_str(&raw)
            .with_context(|| format!("parsing {}", project_toml.display()))?;
        for (name, server) in parsed.mcp_servers {
            merged.insert(name, server);
        }
    }

    if let Some(path) = override_file {
        if !path.exists() {
            bail!("--mcp-config file not found: {}", path.display());
        }
        merge_json_layer(&mut merged, path)?;
    }

    for (name, server) in &merged {
        server.validate(name)?;
    }
    Ok(merged)
}

fn merge_json_layer(
    merged: &mut BTreeMap<String, McpServerConfig>,
    path: &Path,
) -> Result<()> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: McpJsonFile =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    for (name, server) in parsed.mcp_servers {
        merged.insert(name, server);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_rules() {
        assert!(validate_server_name("files").is_ok());
        assert!(validate_server_name("my-server_2").is_ok());
        assert!(validate_server_name("bad__name").is_err());
        assert!(validate_server_name("bad.name").is_err());
        assert!(validate_server_name("").is_err());
    }

    #[test]
    fn toml_overrides_project_json() {
        let tmp = tempfile::tempdir().expect("tmp");
        fs::write(
            tmp.path().join(".mcp.json"),
            r#"{"mcpServers": {"files": {"command": "old-files"}, "web": {"url": "http://x/sse"}}}"#,
        )
        .expect("json");
        fs::write(
            tmp.path().join("swival.toml"),
            "[mcp_servers.files]\ncommand = \"new-files\"\n",
        )
        .expect("toml");

        let merged = load_server_configs(tmp.path(), None).expect("load");
        assert_eq!(merged["files"].command.as_deref(), Some("new-files"));
        assert_eq!(merged["web"].url.as_deref(), Some("http://x/sse"));
    }

    #[test]
    fn override_file_wins() {
        let tmp = tempfile::tempdir().expect("tmp");
        fs::write(
            tmp.path().join(".mcp.json"),
            r#"{"mcpServers": {"files": {"command": "project-files"}}}"#,
        )
        .expect("json");
        let override_path = tmp.path().join("override.json");
        fs::write(
            &override_path,
            r#"{"mcpServers": {"files": {"command": "override-files"}}}"#,
        )
        .expect("override");

        let merged = load_server_configs(tmp.path(), Some(&override_path)).expect("load");
        assert_eq!(merged["files"].command.as_deref(), Some("override-files"));
    }

    #[test]
    fn missing_override_is_config_error() {
        let tmp = tempfile::tempdir().expect("tmp");
        let missing = tmp.path().join("nope.json");
        assert!(load_server_configs(tmp.path(), Some(&missing)).is_err());
    }

    #[test]
    fn bad_server_name_is_config_error() {
        let tmp = tempfile::tempdir().expect("tmp");
        fs::write(
            tmp.path().join(".mcp.json"),
            r#"{"mcpServers": {"bad__name": {"command": "x"}}}"#,
        )
        .expect("json");
        assert!(load_server_configs(tmp.path(), None).is_err());
    }

    #[test]
    fn server_needs_exactly_one_transport() {
        let tmp = tempfile::tempdir().expect("tmp");
        fs::write(
            tmp.path().join(".mcp.json"),
            r#"{"mcpServers": {"files": {}}}"#,
        )
        .expect("json");
        assert!(load_server_configs(tmp.path(), None).is_err());
    }
}
