//! Filesystem, command, and network policy for the agent sandbox.
//!
//! Every path a tool touches goes through [`PathPolicy::resolve`]; every
//! subprocess argv goes through [`CommandPolicy::check`]; every outbound
//! address goes through [`is_public_ip`]. These checks are application-layer
//! guardrails, not OS isolation.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Component, Path, PathBuf};
use swival_core::{ToolError, ToolErrorKind};

mod net;

pub use net::{NameResolver, SystemResolver, is_public_ip};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Read,
    Write,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PolicyError {
    #[error("path escapes the workspace: {0}")]
    PathEscape(String),
    #[error("path is outside every allowed root: {0}")]
    RootForbidden(String),
    #[error("path is inside a read-only root: {0}")]
    ReadOnlyViolation(String),
    #[error("command is not allowlisted: {0}")]
    CommandNotAllowed(String),
}

impl From<PolicyError> for ToolError {
    fn from(err: PolicyError) -> Self {
        let kind = match err {
            PolicyError::PathEscape(_) => ToolErrorKind::PathEscape,
            PolicyError::RootForbidden(_) => ToolErrorKind::RootForbidden,
            PolicyError::ReadOnlyViolation(_) => ToolErrorKind::ReadOnlyViolation,
            PolicyError::CommandNotAllowed(_) => ToolErrorKind::CommandNotAllowed,
        };
        ToolError::new(kind, err.to_string())
    }
}

/// A resolved path together with the root that admitted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub absolute: PathBuf,
    pub root: PathBuf,
}

/// Path anchoring policy: a base directory, optional extra read-write roots,
/// optional read-only roots, and the YOLO escape hatch. YOLO disables root
/// checks but still rejects the filesystem root.
#[derive(Debug, Clone)]
pub struct PathPolicy {
    base: PathBuf,
    rw_roots: Vec<PathBuf>,
    ro_roots: Vec<PathBuf>,
    yolo: bool,
}

impl PathPolicy {
    pub fn new(
        base: &Path,
        add_dirs: &[PathBuf],
        add_dirs_ro: &[PathBuf],
        yolo: bool,
    ) -> anyhow::Result<Self> {
        let base = base
            .canonicalize()
            .map_err(|e| anyhow::anyhow!("base directory {}: {e}", base.display()))?;
        let mut rw_roots = vec![base.clone()];
        for dir in add_dirs {
            rw_roots.push(
                dir.canonicalize()
                    .map_err(|e| anyhow::anyhow!("--add-dir {}: {e}", dir.display()))?,
            );
        }
        let mut ro_roots = Vec::new();
        for dir in add_dirs_ro {
            ro_roots.push(
                dir.canonicalize()
                    .map_err(|e| anyhow::anyhow!("--add-dir-ro {}: {e}", dir.display()))?,
            );
        }
        Ok(Self {
            base,
            rw_roots,
            ro_roots,
            yolo,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolve and validate a candidate path for the given intent.
    ///
    /// Relative paths anchor at the base directory. Symlinks are fully
    /// canonicalized on the candidate (through the nearest existing ancestor
    /// for not-yet-existing write targets); roots were canonicalized at
    /// construction. The canonical candidate must be a descendant of some
    /// allowed root matching the intent. `/` is always rejected.
    pub fn resolve(&self, path: &str, intent: Intent) -> Result<Resolved, PolicyError> {
        let raw = Path::new(path);
        let was_relative = raw.is_relative();
        let anchored = if was_relative {
            self.base.join(raw)
        } else {
            raw.to_path_buf()
        };
        let canonical = canonicalize_lenient(&anchored)
            .map_err(|_| PolicyError::RootForbidden(path.to_string()))?;

        if canonical == Path::new("/") {
            return Err(PolicyError::RootForbidden("/".to_string()));
        }
        if self.yolo {
            return Ok(Resolved {
                root: self
                    .matching_root(&canonical, intent)
                    .unwrap_or_else(|| self.base.clone()),
                absolute: canonical,
            });
        }

        if let Some(root) = self.matching_root(&canonical, intent) {
            return Ok(Resolved {
                absolute: canonical,
                root,
            });
        }

        if intent == Intent::Write && self.ro_roots.iter().any(|r| canonical.starts_with(r)) {
            return Err(PolicyError::ReadOnlyViolation(path.to_string()));
        }
        // A relative path that canonicalizes outside the base escaped via
        // `..` or a symlink; an absolute path simply names a forbidden root.
        if was_relative {
            Err(PolicyError::PathEscape(path.to_string()))
        } else {
            Err(PolicyError::RootForbidden(path.to_string()))
        }
    }

    fn matching_root(&self, canonical: &Path, intent: Intent) -> Option<PathBuf> {
        for root in &self.rw_roots {
            if canonical.starts_with(root) {
                return Some(root.clone());
            }
        }
        if intent == Intent::Read {
            for root in &self.ro_roots {
                if canonical.starts_with(root) {
                    return Some(root.clone());
                }
            }
        }
        None
    }
}

/// Canonicalize a path that may not exist yet: walk up to the nearest
/// existing ancestor, canonicalize that, then re-append the remainder after
/// normalizing `.` and `..` components lexically.
fn canonicalize_lenient(path: &Path) -> std::io::Result<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    let normalized = normalize_components(path);
    let mut existing = normalized.as_path();
    let mut tail = Vec::new();
    loop {
        match existing.parent() {
            Some(parent) => {
                if let Some(name) = existing.file_name() {
                    tail.push(name.to_os_string());
                }
                if parent.exists() {
                    let mut out = parent.canonicalize()?;
                    for part in tail.iter().rev() {
                        out.push(part);
                    }
                    return Ok(out);
                }
                existing = parent;
            }
            None => return Err(std::io::Error::from(std::io::ErrorKind::NotFound)),
        }
    }
}

fn normalize_components(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Command allowlist. Entries are command basenames resolved to absolute
/// paths at construction time via PATH lookup; an entry that resolves inside
/// the base directory is rejected at check time, even when allowlisted.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    resolved: HashMap<String, PathBuf>,
    base: PathBuf,
    yolo: bool,
}

impl CommandPolicy {
    pub fn new(allowed: &[String], base: &Path, yolo: bool) -> anyhow::Result<Self> {
        let base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
        let mut resolved = HashMap::new();
        for name in allowed {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            match lookup_in_path(name) {
                Some(path) => {
                    resolved.insert(name.to_string(), path);
                }
                None => {
                    anyhow::bail!("--allowed-commands entry not found on PATH: {name}");
                }
            }
        }
        Ok(Self {
            resolved,
            base,
            yolo,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.yolo || !self.resolved.is_empty()
    }

    /// Validate argv[0] and return the absolute program path to execute.
    pub fn check(&self, argv0: &str) -> Result<PathBuf, PolicyError> {
        let basename = Path::new(argv0)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(argv0);
        let program = match self.resolved.get(basename) {
            Some(path) => path.clone(),
            None if self.yolo => lookup_in_path(basename)
                .ok_or_else(|| PolicyError::CommandNotAllowed(basename.to_string()))?,
            None => return Err(PolicyError::CommandNotAllowed(basename.to_string())),
        };
        let canonical = program.canonicalize().unwrap_or(program);
        if !self.yolo && canonical.starts_with(&self.base) {
            return Err(PolicyError::CommandNotAllowed(format!(
                "{basename} resolves inside the base directory"
            )));
        }
        Ok(canonical)
    }
}

fn lookup_in_path(command: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(command))
        .find(|candidate| candidate.is_file())
}

/// Resolve a host via the standard resolver. Separated behind a trait so
/// SSRF tests can script addresses without touching DNS.
pub fn resolve_host(host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    Ok(addrs.into_iter().map(|a| a.ip()).collect())
}
