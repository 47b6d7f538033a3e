//! AgentFS sandbox bootstrap: re-exec the CLI inside an overlay filesystem.
//!
//! Only the re-exec contract lives here; the overlay itself is an external
//! binary. Detection requires both env markers so exporting one variable
//! cannot fake a sandbox.

use anyhow::{Result, bail};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use wait_timeout::ChildExt;

const ENV_MARKER: &str = "SWIVAL_AGENTFS_ACTIVE";
const AGENTFS_ENV: &str = "AGENTFS";
const VERSION_ENV: &str = "SWIVAL_AGENTFS_VERSION";

/// Minimum agentfs version supporting strict read mode. No released
/// version supports it yet.
const STRICT_READ_MIN_VERSION: Option<&str> = None;

const PATH_FLAGS: &[&str] = &[
    "--base-dir",
    "--add-dir",
    "--add-dir-ro",
    "--skills-dir",
    "--mcp-config",
    "--objective",
    "--verify",
    "--report",
];

pub fn is_sandboxed() -> bool {
    std::env::var(ENV_MARKER).as_deref() == Ok("1")
        && std::env::var(AGENTFS_ENV).as_deref() == Ok("1")
}

/// True for any entry path into agentfs, including external wrapping via
/// `agentfs run -- swival …` which only sets AGENTFS=1.
pub fn is_inside_agentfs() -> bool {
    std::env::var(AGENTFS_ENV).as_deref() == Ok("1")
}

pub fn agentfs_version() -> Option<String> {
    std::env::var(VERSION_ENV).ok()
}

fn find_agentfs() -> Result<PathBuf> {
    let paths = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&paths)
        .map(|dir| dir.join("agentfs"))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "agentfs binary not found on PATH. Install AgentFS or use --sandbox builtin."
            )
        })
}

#[derive(Debug, Clone)]
pub struct AgentfsProbe {
    pub version: String,
    pub supports_strict_read: bool,
}

/// Run `agentfs --version` with a short timeout and parse `vX.Y.Z`. Any
/// failure produces a safe fallback.
pub fn probe_agentfs(binary: &Path) -> AgentfsProbe {
    let version = (|| -> Option<String> {
        let mut child = Command::new(binary)
            .arg("--version")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
            .ok()?;
        if child.wait_timeout(Duration::from_secs(5)).ok()?.is_none() {
            let _ = child.kill();
            let _ = child.wait();
            return None;
        }
        let output = child.wait_with_output().ok()?;
        let text = String::from_utf8_lossy(&output.stdout);
        let pattern = regex::Regex::new(r"v?(\d+\.\d+\.\d+)").ok()?;
        pattern
            .captures(&text)
            .map(|caps| caps[1].to_string())
    })()
    .unwrap_or_else(|| "unknown".to_string());

    let supports_strict_read = match STRICT_READ_MIN_VERSION {
        Some(minimum) if version != "unknown" => version_gte(&version, minimum),
        _ => false,
    };
    AgentfsProbe {
        version,
        supports_strict_read,
    }
}

fn version_gte(version: &str, minimum: &str) -> bool {
    let parts = |v: &str| -> Vec<u64> {
        v.split('.').filter_map(|p| p.parse().ok()).collect()
    };
    parts(version) >= parts(minimum)
}

/// Deterministic overlay session id: a digest of the canonical project
/// path, so re-runs in the same directory reuse the same session.
pub fn derive_session_id(base_dir: &Path) -> String {
    let canonical = base_dir
        .canonicalize()
        .unwrap_or_else(|_| base_dir.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("swival-{hex}")
}

/// Absolutize the values of path-bearing flags so relative paths survive
/// the chdir before re-exec. Handles `--flag value` and `--flag=value`.
fn absolutize_argv(argv: &[String]) -> Vec<String> {
    let absolutize = |value: &str| -> String {
        let path = Path::new(value);
        path.canonicalize()
            .unwrap_or_else(|_| {
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    std::env::current_dir()
                        .map(|cwd| cwd.join(path))
                        .unwrap_or_else(|_| path.to_path_buf())
                }
            })
            .to_string_lossy()
            .to_string()
    };

    let mut out = Vec::with_capacity(argv.len());
    let mut i = 0;
    while i < argv.len() {
        let token = &argv[i];
        if token == "--" {
            out.extend_from_slice(&argv[i..]);
            break;
        }
        if let Some(eq) = token.find('=')
            && PATH_FLAGS.contains(&&token[..eq])
        {
            out.push(format!("{}={}", &token[..eq], absolutize(&token[eq + 1..])));
            i += 1;
            continue;
        }
        if PATH_FLAGS.contains(&token.as_str()) && i + 1 < argv.len() {
            out.push(token.clone());
            out.push(absolutize(&argv[i + 1]));
            i += 2;
            continue;
        }
        out.push(token.clone());
        i += 1;
    }
    out
}

pub fn build_agentfs_argv(
    agentfs_bin: &Path,
    base_dir: &Path,
    add_dirs: &[PathBuf],
    session: Option<&str>,
    child_argv: &[String],
) -> Vec<String> {
    let mut argv = vec![
        agentfs_bin.to_string_lossy().to_string(),
        "run".to_string(),
        "--no-default-allows".to_string(),
    ];
    argv.push("--allow".to_string());
    argv.push(base_dir.to_string_lossy().to_string());
    for dir in add_dirs {
        let resolved = dir.canonicalize().unwrap_or_else(|_| dir.clone());
        argv.push("--allow".to_string());
        argv.push(resolved.to_string_lossy().to_string());
    }
    if let Some(session) = session {
        argv.push("--session".to_string());
        argv.push(session.to_string());
    }
    argv.push("--".to_string());
    argv.extend_from_slice(child_argv);
    argv
}

/// Re-exec inside agentfs when `--sandbox agentfs` asks for it. Returns
/// `Ok(())` without side effects when no re-exec is needed; on success the
/// call never returns.
pub fn maybe_reexec(
    sandbox: &str,
    sandbox_session: Option<&str>,
    base_dir: &Path,
    add_dirs: &[PathBuf],
    strict_read: bool,
) -> Result<()> {
    if sandbox != "agentfs" || is_sandboxed() {
        return Ok(());
    }
    let agentfs_bin = find_agentfs()?;
    let probe = probe_agentfs(&agentfs_bin);
    if strict_read && !probe.supports_strict_read {
        bail!(
            "--sandbox-strict-read requires AgentFS with strict read support \
             (installed: {}). No current version supports this feature yet.",
            probe.version
        );
    }

    let resolved_base = base_dir
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("base directory {}: {e}", base_dir.display()))?;
    let child_argv: Vec<String> = absolutize_argv(&std::env::args().collect::<Vec<_>>());
    let argv = build_agentfs_argv(
        &agentfs_bin,
        &resolved_base,
        add_dirs,
        sandbox_session,
        &child_argv,
    );

    // AgentFS overlays the process CWD; align it with the workspace.
    std::env::set_current_dir(&resolved_base)?;

    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .env(ENV_MARKER, "1")
        .env(VERSION_ENV, &probe.version);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let err = command.exec();
        bail!("failed to re-exec under agentfs: {err}");
    }
    #[cfg(not(unix))]
    {
        let status = command.status()?;
        std::process::exit(status.code().unwrap_or(1));
    }
}

/// Library-mode guard: `--sandbox agentfs` only works when the process is
/// actually inside agentfs (re-exec handles the CLI path).
pub fn check_sandbox_available(sandbox: &str) -> Result<()> {
    if sandbox == "agentfs" && !is_inside_agentfs() {
        bail!(
            "sandbox=\"agentfs\" requires running inside an AgentFS sandbox. \
             Use the CLI for automatic re-exec, or wrap the process with `agentfs run`."
        );
    }
    Ok(())
}
