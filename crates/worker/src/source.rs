// Local clone of the benchmarked repository

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info};

/// Repository clone kept in sync with a remote branch
#[derive(Debug, Clone)]
pub struct SourceRepo {
    dir: PathBuf,
    remote: String,
    branch: String,
}

impl SourceRepo {
    pub fn new(dir: impl Into<PathBuf>, remote: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            remote: remote.into(),
            branch: branch.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Clone the repository if missing, then fetch tags and hard reset to
    /// `origin/<branch>`
    pub async fn sync(&self) -> Result<()> {
        if !self.dir.join(".git").is_dir() {
            if let Some(parent) = self.dir.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            info!(remote = %self.remote, dir = %self.dir.display(), "Cloning source repository");
            let dir = self.dir.display().to_string();
            git(None, &["clone", &self.remote, &dir]).await?;
        }

        git(Some(&self.dir), &["fetch", "origin", "--tags"]).await?;
        let target = format!("origin/{}", self.branch);
        git(Some(&self.dir), &["reset", "--hard", &target]).await?;
        debug!(branch = %self.branch, "Source repository synced");
        Ok(())
    }

    /// SHA of the checked out commit
    pub async fn head(&self) -> Result<String> {
        let sha = git(Some(&self.dir), &["rev-parse", "HEAD"]).await?;
        Ok(sha.trim().to_string())
    }
}

async fn git(dir: Option<&Path>, args: &[&str]) -> Result<String> {
    let mut command = Command::new("git");
    command.args(args).kill_on_drop(true);
    if let Some(dir) = dir {
        command.current_dir(dir);
    }

    let output = command
        .output()
        .await
        .with_context(|| format!("Failed to run git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn init_remote(dir: &Path) -> String {
        let remote = dir.join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        for args in [
            vec!["init", "--initial-branch=main"],
            vec!["config", "user.email", "bench@example.com"],
            vec!["config", "user.name", "bench"],
            vec!["commit", "--allow-empty", "-m", "initial"],
        ] {
            git(Some(&remote), &args).await.unwrap();
        }
        git(Some(&remote), &["rev-parse", "HEAD"])
            .await
            .unwrap()
            .trim()
            .to_string()
    }

    #[tokio::test]
    async fn test_clone_then_follow_branch() {
        if !git_available().await {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let first = init_remote(dir.path()).await;
        let remote = dir.path().join("remote");

        let repo = SourceRepo::new(
            dir.path().join("clones/source"),
            remote.display().to_string(),
            "main",
        );
        repo.sync().await.unwrap();
        assert_eq!(repo.head().await.unwrap(), first);

        git(Some(&remote), &["commit", "--allow-empty", "-m", "second"])
            .await
            .unwrap();
        repo.sync().await.unwrap();
        assert_ne!(repo.head().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_git_failure_is_reported() {
        if !git_available().await {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let err = git(Some(dir.path()), &["rev-parse", "HEAD"]).await.unwrap_err();
        assert!(err.to_string().contains("git rev-parse HEAD exited"));
    }
}
