//! Per-run staging directory.
//!
//! Every run gets a fresh temporary root holding the clones, rendered
//! manifests, and intermediate archives. The shared environment directory is
//! copied in as `environment/` so templates can reference it as part of the
//! build context.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

const RUN_PREFIX: &str = "nightforge-";

/// The temporary root of one run. Dropped at the end of the run unless the
/// caller asked to keep it for inspection.
#[derive(Debug)]
pub struct RunRoot {
    // None once the directory has been persisted
    dir: Option<TempDir>,
    path: PathBuf,
}

impl RunRoot {
    /// Create the run root and copy `env_dir` into it as `environment/`.
    pub fn create(env_dir: &Path) -> Result<Self, StageError> {
        let dir = tempfile::Builder::new()
            .prefix(RUN_PREFIX)
            .tempdir()
            .map_err(|source| StageError::Create {
                path: std::env::temp_dir(),
                source,
            })?;
        let path = dir.path().to_path_buf();
        tracing::info!(root = %path.display(), "run root created");

        if !env_dir.is_dir() {
            return Err(StageError::MissingEnvDir {
                path: env_dir.to_path_buf(),
            });
        }
        copy_tree(env_dir, &path.join("environment"))?;

        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Disarm the cleanup; the directory stays on disk after the run.
    pub fn keep(&mut self) {
        if let Some(dir) = self.dir.take() {
            let kept = dir.keep();
            tracing::info!(root = %kept.display(), "keeping run root");
        }
    }
}

/// Recursively copy a directory tree. Symlinks are followed.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<(), StageError> {
    std::fs::create_dir_all(dst).map_err(|source| StageError::Create {
        path: dst.to_path_buf(),
        source,
    })?;

    let entries = std::fs::read_dir(src).map_err(|source| StageError::Read {
        path: src.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| StageError::Read {
            path: src.to_path_buf(),
            source,
        })?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if from.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            std::fs::copy(&from, &to).map_err(|source| StageError::CopyFile {
                path: from.clone(),
                source,
            })?;
        }
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("failed to create directory {path}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read directory {path}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to copy file {path}")]
    CopyFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("environment directory {path} does not exist")]
    MissingEnvDir { path: PathBuf },
}
