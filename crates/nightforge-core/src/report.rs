//! Per-run outcome aggregation.

use std::fmt;

use crate::tag::ImageTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Succeeded,
    Failed,
}

/// Result of running one application through the pipeline. Created at
/// pipeline start, finalized exactly once at pipeline end.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub app: String,
    /// Resolved version, when the pipeline got that far.
    pub version: Option<String>,
    pub status: BuildStatus,
    /// Captured output of the last attempt of each pipeline state.
    pub log: String,
    /// Final tag, on success.
    pub tag: Option<ImageTag>,
}

impl BuildOutcome {
    pub fn succeeded(app: impl Into<String>, tag: ImageTag, log: String) -> Self {
        Self {
            app: app.into(),
            version: Some(tag.version.clone()),
            status: BuildStatus::Succeeded,
            log,
            tag: Some(tag),
        }
    }

    pub fn failed(app: impl Into<String>, version: Option<String>, log: String) -> Self {
        Self {
            app: app.into(),
            version,
            status: BuildStatus::Failed,
            log,
            tag: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status == BuildStatus::Failed
    }
}

/// All outcomes of one run, in application order, plus the rotation result.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub outcomes: Vec<BuildOutcome>,
    /// Tags removed by the rotation pass, if one ran.
    pub rotated: Vec<ImageTag>,
}

impl RunReport {
    pub fn push(&mut self, outcome: BuildOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(BuildOutcome::is_failure)
    }

    pub fn succeeded_count(&self) -> usize {
        self.outcomes.len() - self.failed_count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failure()).count()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "build report: {} succeeded, {} failed",
            self.succeeded_count(),
            self.failed_count()
        )?;
        for outcome in &self.outcomes {
            match (&outcome.status, &outcome.tag) {
                (BuildStatus::Succeeded, Some(tag)) => writeln!(f, "  ok   {tag}")?,
                _ => writeln!(
                    f,
                    "  FAIL {} ({})",
                    outcome.app,
                    outcome.version.as_deref().unwrap_or("no version")
                )?,
            }
        }
        if !self.rotated.is_empty() {
            writeln!(f, "rotated {} image(s):", self.rotated.len())?;
            for tag in &self.rotated {
                writeln!(f, "  rm   {tag}")?;
            }
        }
        for outcome in self.outcomes.iter().filter(|o| o.is_failure()) {
            writeln!(f, "\n--- log: {} ---", outcome.app)?;
            writeln!(f, "{}", outcome.log.trim_end())?;
        }
        Ok(())
    }
}
