//! External collaborators of nightforge: process execution, the docker CLI,
//! and git. All operations go through the [`ProcessRunner`] trait so the
//! build pipeline and rotation engine can be tested against mocks.

pub mod docker;
pub mod git;
pub mod runner;

pub use docker::{ContainerRecord, DockerClient, DockerError, ImageRecord, RunArgs};
pub use git::{GitClient, GitError};
pub use runner::{ProcessRunner, RealRunner, RunOutput, RunnerError};
