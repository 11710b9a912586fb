//! JSON configuration document.
//!
//! Loaded once per run and validated eagerly: a malformed document produces
//! a [`ConfigError`] before any pipeline starts, instead of failing deep
//! inside a build on a missing key.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::tag::Mode;

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// SMTP settings for the run report. Optional; without it the report
    /// goes to stdout only.
    #[serde(default)]
    pub mail: Option<MailConfig>,
    /// DNS server handed to build and runtime containers.
    #[serde(default = "default_dns")]
    pub dns: String,
    /// Applications to build, in order.
    pub apps: Vec<AppSpec>,
    /// Run-level options. Every field has a default; CLI flags override.
    #[serde(default)]
    pub options: RunOptions,
}

impl Config {
    /// Load and validate the configuration at `path`.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut config: Config =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: e,
            })?;
        config.validate()?;
        tracing::debug!(apps = config.apps.len(), "configuration loaded");
        Ok(config)
    }

    /// Check cross-field invariants and fold deprecated fields.
    pub fn validate(&mut self) -> crate::Result<()> {
        if self.options.tries == 0 {
            return Err(ConfigError::ZeroTries);
        }

        let mut seen = HashSet::new();
        for app in &mut self.apps {
            if app.name.is_empty() {
                return Err(ConfigError::EmptyField {
                    app: "<unnamed>".to_owned(),
                    field: "name",
                });
            }
            if app.repo.is_empty() {
                return Err(ConfigError::EmptyField {
                    app: app.name.clone(),
                    field: "repo",
                });
            }
            if !seen.insert(app.name.clone()) {
                return Err(ConfigError::DuplicateApp {
                    name: app.name.clone(),
                });
            }
            // Absence of a version command in nightly mode is a configuration
            // error, not a build failure.
            if app.mode == Mode::Nightly && app.version_cmd.is_none() {
                return Err(ConfigError::MissingVersionCmd {
                    app: app.name.clone(),
                });
            }
            app.fold_legacy_ports()?;
        }
        Ok(())
    }
}

/// One source-controlled application to build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSpec {
    /// Unique identifier; also the image base name and container name.
    pub name: String,
    /// Git URL to clone.
    pub repo: String,
    /// Ref to check out.
    #[serde(default = "default_branch")]
    pub branch: String,
    pub mode: Mode,
    /// Name of the build-manifest template (without extension).
    pub docker_template: String,
    /// Command run inside the clone before the container build.
    #[serde(default)]
    pub build_cmd: Option<String>,
    /// Subdirectory staged as the application tree when `build_cmd` is set.
    #[serde(default)]
    pub build_dir: Option<String>,
    /// Template command that writes the derived version back into the
    /// project (variable: `version`). Mandatory in nightly mode.
    #[serde(default)]
    pub version_cmd: Option<String>,
    /// Where the nightly version core comes from.
    #[serde(default)]
    pub version_source: VersionSource,
    /// `host:hostPort:containerPort` triples, in order.
    #[serde(default)]
    pub port_forwards: Vec<PortForward>,
    /// Deprecated single-port pair; folded into `port_forwards` at load.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub inner_port: Option<u16>,
    /// `hostPath:containerPath:mode` triples, in order.
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    /// Environment variables baked into the runtime container. The map is
    /// ordered so rendered manifests are deterministic.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl AppSpec {
    /// Image base name: `<name>_<mode>`.
    pub fn image_name(&self) -> String {
        format!("{}_{}", self.name, self.mode)
    }

    fn fold_legacy_ports(&mut self) -> crate::Result<()> {
        match (self.port.take(), self.inner_port.take()) {
            (Some(host_port), Some(container_port)) => {
                self.port_forwards.insert(
                    0,
                    PortForward {
                        host: "0.0.0.0".to_owned(),
                        host_port,
                        container_port,
                    },
                );
                Ok(())
            }
            (None, None) => Ok(()),
            _ => Err(ConfigError::IncompletePortPair {
                app: self.name.clone(),
            }),
        }
    }
}

/// Strategy for deriving the nightly version core (the part before the
/// timestamp suffix).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionSource {
    /// Most recent version-control tag reachable from the branch.
    #[default]
    GitTag,
    /// Version declared in the project's own manifest (`package.json`).
    Manifest,
}

/// A published port: `host:hostPort:containerPort`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortForward {
    pub host: String,
    pub host_port: u16,
    pub container_port: u16,
}

impl TryFrom<String> for PortForward {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let invalid = || ConfigError::InvalidPortForward {
            value: value.clone(),
        };
        let mut parts = value.split(':');
        let host = parts.next().ok_or_else(invalid)?;
        let host_port = parts.next().ok_or_else(invalid)?;
        let container_port = parts.next().ok_or_else(invalid)?;
        if host.is_empty() || parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self {
            host: host.to_owned(),
            host_port: host_port.parse().map_err(|_| invalid())?,
            container_port: container_port.parse().map_err(|_| invalid())?,
        })
    }
}

impl From<PortForward> for String {
    fn from(p: PortForward) -> String {
        p.to_string()
    }
}

impl fmt::Display for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.host_port, self.container_port)
    }
}

/// A bind mount: `hostPath:containerPath:mode`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

impl TryFrom<String> for VolumeMount {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let invalid = || ConfigError::InvalidVolume {
            value: value.clone(),
        };
        let mut parts = value.split(':');
        let host_path = parts.next().ok_or_else(invalid)?;
        let container_path = parts.next().ok_or_else(invalid)?;
        let mode = parts.next().ok_or_else(invalid)?;
        if host_path.is_empty() || container_path.is_empty() || parts.next().is_some() {
            return Err(invalid());
        }
        let read_only = match mode {
            "ro" => true,
            "rw" => false,
            _ => return Err(invalid()),
        };
        Ok(Self {
            host_path: host_path.to_owned(),
            container_path: container_path.to_owned(),
            read_only,
        })
    }
}

impl From<VolumeMount> for String {
    fn from(v: VolumeMount) -> String {
        v.to_string()
    }
}

impl fmt::Display for VolumeMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.host_path,
            self.container_path,
            if self.read_only { "ro" } else { "rw" }
        )
    }
}

/// SMTP settings for the run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub from: String,
    pub to: Vec<String>,
}

/// Run-level options; every field defaults so `"options"` may be omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,
    /// Extra build-context directory copied into the run root as
    /// `environment/`.
    #[serde(default = "default_env_dir")]
    pub env_dir: PathBuf,
    /// Dependency-install step run before `build_cmd`.
    #[serde(default = "default_install_cmd")]
    pub install_cmd: String,
    /// Attempts per retryable pipeline state.
    #[serde(default = "default_tries")]
    pub tries: u32,
    /// Fixed sleep between attempts, in seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Directory release image archives are saved into. Unset means "leave
    /// the image tagged in the local store".
    #[serde(default)]
    pub image_dir: Option<PathBuf>,
    /// Extra registries the final tag is mirrored to.
    #[serde(default)]
    pub registries: Vec<String>,
    /// Collapse release image layers via export/import.
    #[serde(default = "default_true")]
    pub squash: bool,
    /// Start nightly containers after a successful build.
    #[serde(default = "default_true")]
    pub run_after_build: bool,
    #[serde(default)]
    pub no_cache: bool,
    #[serde(default)]
    pub verbose: bool,
    /// Keep the per-run temporary directory for inspection.
    #[serde(default)]
    pub keep_temp: bool,
    /// Rotate images older than this many days after the build pass.
    #[serde(default)]
    pub rotate_days: Option<i64>,
    #[serde(default = "default_true")]
    pub mail_enabled: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            template_dir: default_template_dir(),
            env_dir: default_env_dir(),
            install_cmd: default_install_cmd(),
            tries: default_tries(),
            retry_delay_secs: default_retry_delay(),
            image_dir: None,
            registries: Vec::new(),
            squash: true,
            run_after_build: true,
            no_cache: false,
            verbose: false,
            keep_temp: false,
            rotate_days: None,
            mail_enabled: true,
        }
    }
}

fn default_dns() -> String {
    "8.8.8.8".to_owned()
}

fn default_branch() -> String {
    "master".to_owned()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("./templates")
}

fn default_env_dir() -> PathBuf {
    PathBuf::from("./environment")
}

fn default_install_cmd() -> String {
    "npm install".to_owned()
}

fn default_tries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    30
}

fn default_true() -> bool {
    true
}
