//! `auto_commit_and_retry`: commit a dirty working tree so a failed
//! sync can be retried, with guard rails. Refuses merge conflicts and
//! suspicious untracked files, and never pushes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use pulse_core::event::SystemEvent;

use crate::process::run_command;
use crate::registry::{Remediation, RemediationHandler};

const COMMIT_MESSAGE: &str = "chore: auto-commit working tree before retry";
const GIT_TIMEOUT: Duration = Duration::from_secs(20);

/// What `git status --porcelain` says about the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorktreeAssessment {
    Clean,
    /// A path with a merge-conflict status code.
    Conflicted(String),
    /// An untracked path matching the temp/debug denylist.
    DeniedUntracked(String),
    Committable,
}

/// Pure assessment of porcelain output.
pub fn assess_worktree(porcelain: &str) -> WorktreeAssessment {
    let mut any = false;
    for line in porcelain.lines() {
        if line.len() < 4 {
            continue;
        }
        any = true;
        let code = &line[..2];
        let path = line[3..].trim();
        if matches!(code, "UU" | "AA" | "DD" | "AU" | "UA" | "DU" | "UD") {
            return WorktreeAssessment::Conflicted(path.to_string());
        }
        if code == "??" && is_denied_untracked(path) {
            return WorktreeAssessment::DeniedUntracked(path.to_string());
        }
    }
    if any {
        WorktreeAssessment::Committable
    } else {
        WorktreeAssessment::Clean
    }
}

/// Untracked paths we refuse to sweep into an automatic commit:
/// dotfiles, tmp/scratch directories, logs, editor swap files.
pub fn is_denied_untracked(path: &str) -> bool {
    let path = path.trim_end_matches('/');
    for component in path.split('/') {
        if component.starts_with('.') && component.len() > 1 {
            return true;
        }
        if matches!(component, "tmp" | "temp" | "scratch") {
            return true;
        }
    }
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".log")
        || lower.ends_with(".swp")
        || lower.ends_with(".swo")
        || lower.ends_with(".tmp")
        || lower.ends_with('~')
}

pub struct AutoCommitHandler {
    repo: PathBuf,
}

impl AutoCommitHandler {
    pub fn new(repo: impl AsRef<Path>) -> Self {
        Self {
            repo: repo.as_ref().to_path_buf(),
        }
    }

    async fn git(&self, args: &[&str]) -> anyhow::Result<(bool, String, String)> {
        let mut full = vec!["-C", self.repo.to_str().unwrap_or(".")];
        full.extend_from_slice(args);
        run_command("git", &full, GIT_TIMEOUT).await
    }
}

#[async_trait]
impl RemediationHandler for AutoCommitHandler {
    fn name(&self) -> &'static str {
        "auto_commit_and_retry"
    }

    async fn run(&self, _event: &SystemEvent) -> anyhow::Result<Remediation> {
        let (ok, stdout, stderr) = self.git(&["status", "--porcelain"]).await?;
        if !ok {
            return Ok(Remediation::unfixed(format!("git status failed: {stderr}")));
        }

        match assess_worktree(&stdout) {
            WorktreeAssessment::Clean => Ok(Remediation::fixed("nothing to commit")),
            WorktreeAssessment::Conflicted(path) => Ok(Remediation::unfixed(format!(
                "refusing to commit: merge conflict at `{path}`"
            ))),
            WorktreeAssessment::DeniedUntracked(path) => Ok(Remediation::unfixed(format!(
                "refusing to commit: untracked denylisted path `{path}`"
            ))),
            WorktreeAssessment::Committable => {
                let (ok, _, stderr) = self.git(&["add", "-A"]).await?;
                if !ok {
                    return Ok(Remediation::unfixed(format!("git add failed: {stderr}")));
                }
                let (ok, stdout, stderr) =
                    self.git(&["commit", "-m", COMMIT_MESSAGE]).await?;
                // A racing commit can empty the tree between status and
                // commit; that still counts as success.
                if ok || stdout.contains("nothing to commit") {
                    Ok(Remediation::fixed("working tree committed"))
                } else {
                    Ok(Remediation::unfixed(format!("git commit failed: {stderr}")))
                }
            }
        }
    }
}
