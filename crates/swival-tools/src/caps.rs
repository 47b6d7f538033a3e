//! Output caps: inline size limits per tool family, with oversize output
//! spilled to the scratch area and replaced by a pointer message.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use swival_core::truncate_chars;
use uuid::Uuid;

pub const READ_INLINE_CAP: usize = 50 * 1024;
pub const READ_LINE_CAP: usize = 2000;
pub const LIST_ENTRY_CAP: usize = 100;
pub const COMMAND_INLINE_CAP: usize = 10 * 1024;
pub const COMMAND_SPILL_CAP: usize = 1024 * 1024;
pub const MCP_INLINE_CAP: usize = 20 * 1024;
pub const MCP_SPILL_CAP: usize = 10 * 1024 * 1024;
pub const MCP_ERROR_CAP: usize = 20 * 1024;
pub const FETCH_INLINE_CAP: usize = 50 * 1024;
pub const FETCH_SPILL_CAP: usize = 5 * 1024 * 1024;
pub const INSTRUCTIONS_CHAR_CAP: usize = 10_000;

/// Spill files older than this are swept.
pub const SPILL_MAX_AGE: Duration = Duration::from_secs(600);

/// Manages spill files under `.swival/`. Single-writer: only the loop
/// creates spills, and names are unique per call.
#[derive(Debug)]
pub struct SpillArea {
    dir: PathBuf,
    created: Vec<PathBuf>,
}

impl SpillArea {
    pub fn new(scratch: &Path) -> io::Result<Self> {
        fs::create_dir_all(scratch)?;
        Ok(Self {
            dir: scratch.to_path_buf(),
            created: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write oversize output to disk, truncated at `disk_cap`. Returns the
    /// spill path.
    pub fn spill(&mut self, prefix: &str, bytes: &[u8], disk_cap: usize) -> io::Result<PathBuf> {
        let name = format!("{prefix}_{}.txt", Uuid::now_v7().simple());
        let path = self.dir.join(name);
        let capped = if bytes.len() > disk_cap {
            &bytes[..disk_cap]
        } else {
            bytes
        };
        fs::write(&path, capped)?;
        self.created.push(path.clone());
        Ok(path)
    }

    /// Remove spill files created during this run (used on cancellation).
    pub fn remove_created(&mut self) {
        for path in self.created.drain(..) {
            let _ = fs::remove_file(path);
        }
    }

    /// Sweep aged spill files left behind by earlier runs.
    pub fn sweep(&self) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        let now = SystemTime::now();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !(name.starts_with("cmd_output_") || name.starts_with("fetch_")) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            if now
                .duration_since(modified)
                .map(|age| age > SPILL_MAX_AGE)
                .unwrap_or(false)
            {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

/// Cap text for inline delivery; when over the cap, spill the full bytes
/// and return the truncated head plus a pointer to the spill file.
pub fn cap_with_spill(
    spills: &mut SpillArea,
    prefix: &str,
    text: &str,
    inline_cap: usize,
    disk_cap: usize,
) -> String {
    if text.len() <= inline_cap {
        return text.to_string();
    }
    let head = truncate_chars(text, inline_cap);
    match spills.spill(prefix, text.as_bytes(), disk_cap) {
        Ok(path) => format!(
            "{head}\n[output truncated: {} bytes total; full output at {} — read_file with offset/limit to page through]",
            text.len(),
            path.display()
        ),
        Err(_) => format!("{head}\n[output truncated: {} bytes total]", text.len()),
    }
}

/// Cap text inline with no spill (MCP errors, reads).
pub fn cap_inline(text: &str, inline_cap: usize) -> String {
    if text.len() <= inline_cap {
        return text.to_string();
    }
    format!(
        "{}\n[output truncated: {} bytes total]",
        truncate_chars(text, inline_cap),
        text.len()
    )
}
