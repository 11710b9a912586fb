//! Git operations used by the build pipeline: shallow clone and remote tag
//! lookup.

use std::path::{Path, PathBuf};

use crate::runner::{ProcessRunner, RunOutput, RunnerError};

pub struct GitClient<'a, R: ProcessRunner> {
    runner: &'a R,
}

impl<'a, R: ProcessRunner> GitClient<'a, R> {
    pub fn new(runner: &'a R) -> Self {
        Self { runner }
    }

    /// Shallow recursive clone of `repo` at `branch` into `dest`.
    pub async fn clone_shallow(
        &self,
        repo: &str,
        branch: &str,
        dest: &Path,
    ) -> Result<RunOutput, GitError> {
        let dest_str = dest
            .to_str()
            .ok_or_else(|| GitError::InvalidPath(dest.to_path_buf()))?;
        let args: Vec<String> = [
            "clone",
            "--branch",
            branch,
            "--depth",
            "1",
            "--recursive",
            repo,
            dest_str,
        ]
        .iter()
        .map(|s| (*s).to_owned())
        .collect();

        self.runner
            .run("git", &args, None)
            .await
            .map_err(|e| GitError::Clone {
                repo: repo.to_owned(),
                branch: branch.to_owned(),
                source: e,
            })
    }

    /// Highest version tag published on `repo`.
    ///
    /// Queried with `ls-remote` against the origin rather than `describe`
    /// inside the checkout: a depth-1 clone only carries tags pointing at
    /// the fetched tip, so tags on earlier commits would be invisible
    /// locally.
    pub async fn latest_remote_tag(&self, repo: &str) -> Result<String, GitError> {
        let args: Vec<String> = ["ls-remote", "--tags", "--refs", "--sort=-v:refname", repo]
            .iter()
            .map(|s| (*s).to_owned())
            .collect();

        let out = self.runner.run("git", &args, None).await?;
        out.stdout
            .lines()
            .find_map(|line| line.split('\t').nth(1))
            .and_then(|reference| reference.strip_prefix("refs/tags/"))
            .map(str::to_owned)
            .ok_or_else(|| GitError::NoTag {
                repo: repo.to_owned(),
            })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git clone of {repo} ({branch}) failed")]
    Clone {
        repo: String,
        branch: String,
        source: RunnerError,
    },

    #[error("no version tags published on {repo} — tag the repository once before nightly builds")]
    NoTag { repo: String },

    #[error("path is not valid UTF-8: {0}")]
    InvalidPath(PathBuf),

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

impl GitError {
    pub fn output(&self) -> &str {
        match self {
            GitError::Clone { source, .. } => source.output(),
            GitError::Runner(source) => source.output(),
            _ => "",
        }
    }
}
