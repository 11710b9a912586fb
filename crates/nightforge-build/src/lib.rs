//! The nightforge build core: per-application pipeline, version resolution,
//! templated build manifests, retry policy, and image rotation.
//!
//! Everything that talks to the outside world goes through the
//! [`nightforge_exec::ProcessRunner`] trait, so the whole pipeline runs
//! against mocks in tests.

pub mod pipeline;
pub mod retry;
pub mod rotate;
pub mod stage;
pub mod template;
pub mod version;

pub use pipeline::{BuildPipeline, PipelineError};
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};
pub use rotate::{RotationEngine, RotationError};
pub use stage::{RunRoot, StageError};
pub use template::{TemplateError, TemplateStore};
pub use version::{VersionError, VersionResolver};
