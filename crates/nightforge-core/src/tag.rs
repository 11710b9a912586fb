//! The image tag contract: `<name>_<mode>:<version>`.
//!
//! The build pipeline encodes tags through [`ImageTag`] and the rotation
//! engine decodes them through the same type, so the two sides can never
//! drift apart. Nightly versions carry an embedded UTC build timestamp
//! (`<version>-YYYYMMDDHHMMSS`, second resolution) that rotation parses to
//! compute image age.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Format of the timestamp appended to nightly versions.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

const TIMESTAMP_LEN: usize = 14;

/// Build variant: nightly builds get a timestamped version and are run
/// locally; release builds are repacked and optionally archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Nightly,
    Release,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Nightly => "nightly",
            Mode::Release => "release",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "nightly" => Some(Mode::Nightly),
            "release" => Some(Mode::Release),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully qualified image tag produced by the build pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTag {
    pub name: String,
    pub mode: Mode,
    pub version: String,
}

impl ImageTag {
    pub fn new(name: impl Into<String>, mode: Mode, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode,
            version: version.into(),
        }
    }

    /// Repository part of the tag: `<name>_<mode>`.
    pub fn repository(&self) -> String {
        format!("{}_{}", self.name, self.mode)
    }

    /// Decode a `repository:version` reference. Returns `None` for anything
    /// that does not match the nightforge format; rotation relies on this to
    /// skip unrelated images in the same store.
    pub fn parse(reference: &str) -> Option<Self> {
        let (repository, version) = reference.split_once(':')?;
        Self::from_repo_tag(repository, version)
    }

    /// Decode from separate repository and tag columns, as returned by the
    /// container runtime's image listing.
    pub fn from_repo_tag(repository: &str, version: &str) -> Option<Self> {
        let (name, mode) = repository.rsplit_once('_')?;
        let mode = Mode::parse(mode)?;
        if name.is_empty() || version.is_empty() || version.contains(':') {
            return None;
        }
        Some(Self::new(name, mode, version))
    }

    /// The build timestamp embedded in the version string, if any.
    pub fn build_timestamp(&self) -> Option<DateTime<Utc>> {
        embedded_timestamp(&self.version)
    }
}

impl fmt::Display for ImageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository(), self.version)
    }
}

/// Render `at` in the fixed-width form appended to nightly versions.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Extract the trailing `-YYYYMMDDHHMMSS` component of a version string.
/// Anything that is not exactly 14 trailing digits after a hyphen is treated
/// as "no timestamp" rather than an error.
pub fn embedded_timestamp(version: &str) -> Option<DateTime<Utc>> {
    let (_, ts) = version.rsplit_once('-')?;
    if ts.len() != TIMESTAMP_LEN || !ts.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}
