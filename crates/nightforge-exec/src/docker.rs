//! Docker CLI client, parameterized over the runner for testability.
//!
//! Every image and container operation the pipeline and the rotation engine
//! need is a thin wrapper over one docker subcommand; the listing calls use
//! `--format` so their output stays machine-parseable.

use std::collections::BTreeMap;
use std::path::Path;

use nightforge_core::{PortForward, VolumeMount};

use crate::runner::{ProcessRunner, RunOutput, RunnerError};

/// Docker operations client. Borrows the runner so the pipeline can share
/// one runner between docker, git, and prebuild commands.
pub struct DockerClient<'a, R: ProcessRunner> {
    runner: &'a R,
}

impl<'a, R: ProcessRunner> DockerClient<'a, R> {
    pub fn new(runner: &'a R) -> Self {
        Self { runner }
    }

    async fn docker(&self, args: Vec<String>, cwd: Option<&Path>) -> Result<RunOutput, DockerError> {
        Ok(self.runner.run("docker", &args, cwd).await?)
    }

    // ── Preflight ──

    /// Server version, used by `doctor` as a reachability probe.
    pub async fn server_version(&self) -> Result<String, DockerError> {
        let out = self
            .docker(args(["version", "--format", "{{.Server.Version}}"]), None)
            .await?;
        Ok(out.stdout.trim().to_owned())
    }

    // ── Image build and tagging ──

    /// Build an image from a rendered manifest, with the run root as context.
    pub async fn build(
        &self,
        dockerfile: &Path,
        context: &Path,
        tag: &str,
        no_cache: bool,
    ) -> Result<RunOutput, DockerError> {
        let mut a = args(["build", "-t", tag, "--file"]);
        a.push(path_arg(dockerfile)?);
        if no_cache {
            a.push("--no-cache".to_owned());
        }
        a.push(".".to_owned());
        self.docker(a, Some(context)).await
    }

    /// Like [`Self::build`], but streams daemon output to the terminal
    /// instead of capturing it.
    pub async fn build_streaming(
        &self,
        dockerfile: &Path,
        context: &Path,
        tag: &str,
        no_cache: bool,
    ) -> Result<(), DockerError> {
        let mut a = args(["build", "-t", tag, "--file"]);
        a.push(path_arg(dockerfile)?);
        if no_cache {
            a.push("--no-cache".to_owned());
        }
        a.push(".".to_owned());
        self.runner.run_streaming("docker", &a, Some(context)).await?;
        Ok(())
    }

    pub async fn tag(&self, source: &str, target: &str) -> Result<(), DockerError> {
        self.docker(args(["tag", source, target]), None).await?;
        Ok(())
    }

    pub async fn remove_image(&self, reference: &str) -> Result<(), DockerError> {
        self.docker(args(["rmi", reference]), None).await?;
        Ok(())
    }

    /// Save a tagged image to an uncompressed tar archive.
    pub async fn save(&self, reference: &str, dest: &Path) -> Result<(), DockerError> {
        let mut a = args(["save", "-o"]);
        a.push(path_arg(dest)?);
        a.push(reference.to_owned());
        self.docker(a, None).await?;
        Ok(())
    }

    // ── Repack primitives (export + reimport collapses layers) ──

    /// Create a stopped container from an image, returning its id.
    pub async fn create(&self, image: &str) -> Result<String, DockerError> {
        let out = self.docker(args(["create", image]), None).await?;
        let id = out.stdout.trim().to_owned();
        if id.is_empty() {
            return Err(DockerError::UnexpectedOutput {
                detail: "docker create returned no container id".to_owned(),
            });
        }
        Ok(id)
    }

    pub async fn export(&self, container: &str, dest: &Path) -> Result<(), DockerError> {
        let mut a = args(["export", "-o"]);
        a.push(path_arg(dest)?);
        a.push(container.to_owned());
        self.docker(a, None).await?;
        Ok(())
    }

    pub async fn import(&self, archive: &Path, tag: &str) -> Result<(), DockerError> {
        let mut a = args(["import"]);
        a.push(path_arg(archive)?);
        a.push(tag.to_owned());
        self.docker(a, None).await?;
        Ok(())
    }

    // ── Container lifecycle ──

    /// Start a detached container, returning its id.
    pub async fn run_detached(&self, image: &str, run: &RunArgs) -> Result<String, DockerError> {
        let mut a = args(["run", "-d"]);
        a.push(format!("--name={}", run.name));
        a.push(format!("--dns={}", run.dns));
        for forward in &run.ports {
            a.push("-p".to_owned());
            a.push(forward.to_string());
            a.push(format!("--expose={}", forward.container_port));
        }
        for volume in &run.volumes {
            a.push("-v".to_owned());
            a.push(volume.to_string());
        }
        for (key, value) in &run.env {
            a.push("-e".to_owned());
            a.push(format!("{key}={value}"));
        }
        a.push(image.to_owned());
        let out = self.docker(a, None).await?;
        Ok(out.stdout.trim().to_owned())
    }

    pub async fn stop(&self, container: &str) -> Result<(), DockerError> {
        self.docker(args(["stop", container]), None).await?;
        Ok(())
    }

    pub async fn remove_container(&self, container: &str) -> Result<(), DockerError> {
        self.docker(args(["rm", container]), None).await?;
        Ok(())
    }

    // ── Listings ──

    /// All containers, running or not.
    pub async fn list_containers(&self) -> Result<Vec<ContainerRecord>, DockerError> {
        let out = self
            .docker(
                args([
                    "ps",
                    "-a",
                    "--format",
                    "{{.ID}}\t{{.Image}}\t{{.Ports}}\t{{.Status}}",
                ]),
                None,
            )
            .await?;
        Ok(out
            .stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(ContainerRecord::parse_line)
            .collect())
    }

    /// All images in the local store, as repository/tag pairs.
    pub async fn list_images(&self) -> Result<Vec<ImageRecord>, DockerError> {
        let out = self
            .docker(
                args(["images", "--format", "{{.Repository}}\t{{.Tag}}"]),
                None,
            )
            .await?;
        Ok(out
            .stdout
            .lines()
            .filter_map(|line| {
                let (repository, tag) = line.split_once('\t')?;
                Some(ImageRecord {
                    repository: repository.to_owned(),
                    tag: tag.to_owned(),
                })
            })
            .collect())
    }
}

/// Runtime parameters for a deployed nightly container.
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub name: String,
    pub dns: String,
    pub ports: Vec<PortForward>,
    pub volumes: Vec<VolumeMount>,
    pub env: BTreeMap<String, String>,
}

/// One line of the container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub id: String,
    /// Image repository (reference without the tag).
    pub image: String,
    pub image_tag: Option<String>,
    /// First published host port, if any.
    pub host_port: Option<u16>,
    pub status: String,
}

impl ContainerRecord {
    fn parse_line(line: &str) -> Self {
        let mut fields = line.splitn(4, '\t');
        let id = fields.next().unwrap_or_default().to_owned();
        let image_ref = fields.next().unwrap_or_default();
        let ports = fields.next().unwrap_or_default();
        let status = fields.next().unwrap_or_default().to_owned();

        let (image, image_tag) = match image_ref.split_once(':') {
            Some((repo, tag)) => (repo.to_owned(), Some(tag.to_owned())),
            None => (image_ref.to_owned(), None),
        };

        Self {
            id,
            image,
            image_tag,
            host_port: parse_host_port(ports),
            status,
        }
    }
}

/// Extract the host port from a `docker ps` Ports column, e.g.
/// `0.0.0.0:11345->8080/tcp, :::11345->8080/tcp`.
fn parse_host_port(ports: &str) -> Option<u16> {
    let first = ports.split(',').next()?.trim();
    let (published, _) = first.split_once("->")?;
    let (_, port) = published.rsplit_once(':')?;
    port.parse().ok()
}

/// One line of the image listing; decoding into the nightforge tag format
/// is left to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub repository: String,
    pub tag: String,
}

fn args<const N: usize>(a: [&str; N]) -> Vec<String> {
    a.iter().map(|s| (*s).to_owned()).collect()
}

fn path_arg(path: &Path) -> Result<String, DockerError> {
    path.to_str()
        .map(str::to_owned)
        .ok_or_else(|| DockerError::InvalidPath(path.to_path_buf()))
}

#[derive(Debug, thiserror::Error)]
pub enum DockerError {
    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("path is not valid UTF-8: {0}")]
    InvalidPath(std::path::PathBuf),

    #[error("unexpected docker output: {detail}")]
    UnexpectedOutput { detail: String },
}

impl DockerError {
    /// Captured output of the underlying failed command, if any.
    pub fn output(&self) -> &str {
        match self {
            DockerError::Runner(e) => e.output(),
            _ => "",
        }
    }
}
