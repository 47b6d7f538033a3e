//! Skill discovery and loading.
//!
//! Skills are directories under the skills dir, each carrying a `SKILL.md`.
//! Discovered names are reported in the run settings; `use_skill` loads a
//! body on demand, subject to the instruction-file cap.

use std::fs;
use std::path::{Path, PathBuf};
use swival_core::{ToolError, ToolErrorKind, truncate_chars};
use swival_tools::caps::INSTRUCTIONS_CHAR_CAP;

#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Default)]
pub struct SkillSet {
    skills: Vec<Skill>,
}

impl SkillSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn discover(dir: &Path) -> Self {
        let mut skills = Vec::new();
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let manifest = path.join("SKILL.md");
                if path.is_dir() && manifest.is_file() {
                    skills.push(Skill {
                        name: entry.file_name().to_string_lossy().to_string(),
                        path: manifest,
                    });
                }
            }
        }
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        Self { skills }
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn names_sorted(&self) -> Vec<String> {
        self.skills.iter().map(|s| s.name.clone()).collect()
    }

    pub fn load(&self, name: &str) -> Result<String, ToolError> {
        let skill = self.skills.iter().find(|s| s.name == name).ok_or_else(|| {
            ToolError::new(
                ToolErrorKind::InvalidToolArguments,
                format!(
                    "unknown skill '{name}'; available: {}",
                    self.names_sorted().join(", ")
                ),
            )
        })?;
        let body = fs::read_to_string(&skill.path)
            .map_err(|e| ToolError::failed(format!("skill '{name}': {e}")))?;
        Ok(if body.len() > INSTRUCTIONS_CHAR_CAP {
            format!(
                "{}\n[skill truncated at {INSTRUCTIONS_CHAR_CAP} characters]",
                truncate_chars(&body, INSTRUCTIONS_CHAR_CAP)
            )
        } else {
            body
        })
    }
}

/// Load the project instruction file (`AGENTS.md` in the base dir),
/// truncated at the instruction cap. Returns (file name, contents).
pub fn load_instruction_files(base: &Path) -> Vec<(String, String)> {
    let mut loaded = Vec::new();
    for name in ["AGENTS.md"] {
        let path = base.join(name);
        if let Ok(body) = fs::read_to_string(&path) {
            let body = if body.len() > INSTRUCTIONS_CHAR_CAP {
                truncate_chars(&body, INSTRUCTIONS_CHAR_CAP)
            } else {
                body
            };
            loaded.push((name.to_string(), body));
        }
    }
    loaded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovers_and_loads_skills() {
        let tmp = tempfile::tempdir().expect("tmp");
        fs::create_dir_all(tmp.path().join("deploy")).unwrap();
        fs::write(tmp.path().join("deploy/SKILL.md"), "# Deploy steps\n").unwrap();
        fs::create_dir_all(tmp.path().join("review")).unwrap();
        fs::write(tmp.path().join("review/SKILL.md"), "# Review\n").unwrap();
        fs::create_dir_all(tmp.path().join("not-a-skill")).unwrap();

        let skills = SkillSet::discover(tmp.path());
        assert_eq!(skills.names_sorted(), vec!["deploy", "review"]);
        assert!(skills.load("deploy").unwrap().contains("Deploy steps"));
        let err = skills.load("nope").unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::InvalidToolArguments);
    }

    #[test]
    fn oversize_skill_is_truncated() {
        let tmp = tempfile::tempdir().expect("tmp");
        fs::create_dir_all(tmp.path().join("big")).unwrap();
        fs::write(
            tmp.path().join("big/SKILL.md"),
            "x".repeat(INSTRUCTIONS_CHAR_CAP + 100),
        )
        .unwrap();
        let skills = SkillSet::discover(tmp.path());
        let body = skills.load("big").unwrap();
        assert!(body.contains("[skill truncated"));
    }

    #[test]
    fn instruction_files_respect_cap() {
        let tmp = tempfile::tempdir().expect("tmp");
        fs::write(
            tmp.path().join("AGENTS.md"),
            "y".repeat(INSTRUCTIONS_CHAR_CAP + 50),
        )
        .unwrap();
        let loaded = load_instruction_files(tmp.path());
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, "AGENTS.md");
        assert!(loaded[0].1.len() <= INSTRUCTIONS_CHAR_CAP + '…'.len_utf8());
    }
}
