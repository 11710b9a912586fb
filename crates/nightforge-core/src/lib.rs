//! Core types and configuration for nightforge.
//!
//! This crate defines the JSON configuration schema ([`Config`]), the
//! `<name>_<mode>:<version>` image tag codec ([`ImageTag`]) shared by the
//! build pipeline and the rotation engine, and the per-run report types.

pub mod config;
pub mod error;
pub mod report;
pub mod tag;

pub use config::{AppSpec, Config, MailConfig, PortForward, RunOptions, VersionSource, VolumeMount};
pub use error::{ConfigError, Result};
pub use report::{BuildOutcome, BuildStatus, RunReport};
pub use tag::{ImageTag, Mode};
