//! Derives the version a build is tagged with.
//!
//! Release builds use the version the project manifest declares. Nightly
//! builds derive a core version (highest tag published on the remote, or the
//! manifest version) and append the UTC build timestamp, then write the
//! result back into the clone through the configured version command so the
//! built artifact reports the same version it is tagged with.

use std::path::{Path, PathBuf};

use nightforge_core::config::{AppSpec, VersionSource};
use nightforge_core::tag::Mode;
use nightforge_exec::{GitClient, GitError, ProcessRunner, RunnerError};

use crate::template::{TemplateError, TemplateStore};

const MANIFEST_FILE: &str = "package.json";

pub struct VersionResolver<'a, R: ProcessRunner> {
    runner: &'a R,
}

impl<'a, R: ProcessRunner> VersionResolver<'a, R> {
    pub fn new(runner: &'a R) -> Self {
        Self { runner }
    }

    /// Resolve the version for `app` inside its fresh clone. `timestamp` is
    /// the already-formatted build timestamp of this run.
    pub async fn resolve(
        &self,
        app: &AppSpec,
        clone_dir: &Path,
        timestamp: &str,
    ) -> Result<String, VersionError> {
        match app.mode {
            Mode::Release => {
                let version = manifest_version(clone_dir)?;
                tracing::info!(app = %app.name, %version, "release version from manifest");
                Ok(version)
            }
            Mode::Nightly => {
                let core = match app.version_source {
                    VersionSource::GitTag => {
                        let tag = GitClient::new(self.runner)
                            .latest_remote_tag(&app.repo)
                            .await?;
                        strip_tag_prefix(&tag)?
                    }
                    VersionSource::Manifest => manifest_version(clone_dir)?,
                };
                let version = format!("{core}-{timestamp}");

                let template =
                    app.version_cmd
                        .as_deref()
                        .ok_or_else(|| VersionError::MissingVersionCmd {
                            app: app.name.clone(),
                        })?;
                let command = TemplateStore::render_command(template, &version)?;
                tracing::info!(app = %app.name, %version, %command, "writing nightly version back");
                self.runner.run_shell(&command, clone_dir).await?;

                Ok(version)
            }
        }
    }
}

/// The `"version"` field of the project manifest in `dir`.
fn manifest_version(dir: &Path) -> Result<String, VersionError> {
    let path = dir.join(MANIFEST_FILE);
    let content = std::fs::read_to_string(&path).map_err(|source| VersionError::ManifestRead {
        path: path.clone(),
        source,
    })?;
    let manifest: serde_json::Value =
        serde_json::from_str(&content).map_err(|source| VersionError::ManifestParse {
            path: path.clone(),
            source,
        })?;
    manifest
        .get("version")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .ok_or(VersionError::MissingManifestVersion { path })
}

/// Strip a leading non-numeric prefix from a version-control tag, so `v1.4.0`
/// and `release-1.4.0` both yield `1.4.0`.
fn strip_tag_prefix(tag: &str) -> Result<String, VersionError> {
    let stripped = tag.trim_start_matches(|c: char| !c.is_ascii_digit());
    if stripped.is_empty() {
        return Err(VersionError::UnversionedTag {
            tag: tag.to_owned(),
        });
    }
    Ok(stripped.to_owned())
}

#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error("failed to read project manifest {path}")]
    ManifestRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("project manifest {path} is not valid JSON")]
    ManifestParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("project manifest {path} declares no version")]
    MissingManifestVersion { path: PathBuf },

    #[error("app '{app}' is nightly but configures no version command")]
    MissingVersionCmd { app: String },

    #[error("tag '{tag}' contains no numeric version")]
    UnversionedTag { tag: String },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

impl VersionError {
    /// Captured output of the underlying failed command, if any.
    pub fn output(&self) -> &str {
        match self {
            VersionError::Git(e) => e.output(),
            VersionError::Runner(e) => e.output(),
            _ => "",
        }
    }
}
