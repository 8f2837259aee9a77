use anyhow::{Context, Result};
use git2::{Repository, Status, StatusOptions};
use std::path::Path;

pub struct GitTracker {
    repo: Repository,
}

impl GitTracker {
    pub fn new(project_dir: &Path) -> Result<Self> {
        let repo = Repository::open(project_dir).context("Failed to open git repository")?;
        Ok(Self { repo })
    }

    /// Number of paths that differ from HEAD in the index or working tree,
    /// untracked files included and ignored files excluded.
    pub fn changed_files(&self) -> Result<u32> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = self
            .repo
            .statuses(Some(&mut opts))
            .context("Failed to read git status")?;
        let count = statuses
            .iter()
            .filter(|entry| {
                let status = entry.status();
                !status.is_empty() && !status.contains(Status::IGNORED)
            })
            .count();
        Ok(count as u32)
    }
}

/// Changed-file count for `dir`, `None` when it is not a git repository or
/// the status cannot be read.
pub fn count_changed_files(dir: &Path) -> Option<u32> {
    let tracker = GitTracker::new(dir).ok()?;
    match tracker.changed_files() {
        Ok(count) => Some(count),
        Err(e) => {
            tracing::debug!("git status unavailable for {}: {:#}", dir.display(), e);
            None
        }
    }
}
