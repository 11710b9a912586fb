//! The per-application build pipeline.
//!
//! A build moves through a fixed sequence of states: clone, version,
//! prebuild, render, image build, repack, finalize, tag, deliver, cleanup.
//! Clone, version, and render failures are fatal immediately; the states
//! that hit the network or the container daemon get a retry budget that
//! resets at every state boundary. Whatever happens, the pipeline returns a
//! finalized [`BuildOutcome`] so one broken application never aborts the
//! run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use flate2::Compression;
use flate2::write::GzEncoder;
use nightforge_core::config::{AppSpec, RunOptions, VolumeMount};
use nightforge_core::report::{BuildOutcome, RunReport};
use nightforge_core::tag::{ImageTag, Mode, format_timestamp};
use nightforge_exec::{
    DockerClient, DockerError, GitClient, GitError, ProcessRunner, RunArgs, RunOutput, RunnerError,
};

use crate::retry::{RetryPolicy, Sleeper};
use crate::stage::{StageError, copy_tree};
use crate::template::{Context, TemplateError, TemplateStore};
use crate::version::{VersionError, VersionResolver};

const FINALIZE_TEMPLATE: &str = "finalize";

pub struct BuildPipeline<'a, R: ProcessRunner, S: Sleeper> {
    runner: &'a R,
    sleeper: &'a S,
    templates: &'a TemplateStore,
    /// Run root holding clones, rendered manifests, and archives.
    root: &'a Path,
    dns: &'a str,
    options: &'a RunOptions,
}

impl<'a, R: ProcessRunner, S: Sleeper> BuildPipeline<'a, R, S> {
    pub fn new(
        runner: &'a R,
        sleeper: &'a S,
        templates: &'a TemplateStore,
        root: &'a Path,
        dns: &'a str,
        options: &'a RunOptions,
    ) -> Self {
        Self {
            runner,
            sleeper,
            templates,
            root,
            dns,
            options,
        }
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.options.tries,
            Duration::from_secs(self.options.retry_delay_secs),
        )
    }

    /// Run every application in configuration order, skipping the ones not
    /// in `selected` (an empty selection means all). A failed build is
    /// recorded in the report and the remaining applications still run.
    pub async fn run_all(&self, apps: &[AppSpec], selected: &[String]) -> RunReport {
        let mut report = RunReport::default();
        for app in apps {
            if !selected.is_empty() && !selected.contains(&app.name) {
                tracing::info!(app = %app.name, "skipped, not in the requested set");
                continue;
            }
            report.push(self.run(app).await);
        }
        report
    }

    /// Run one application through every state and finalize its outcome.
    pub async fn run(&self, app: &AppSpec) -> BuildOutcome {
        let mut log = String::new();
        let mut version = None;
        let clone_dir = self.root.join(app.image_name());

        tracing::info!(app = %app.name, mode = %app.mode, "pipeline start");
        let result = self.execute(app, &clone_dir, &mut log, &mut version).await;

        // Cleanup runs on both paths.
        if !self.options.keep_temp && clone_dir.exists() {
            if let Err(error) = std::fs::remove_dir_all(&clone_dir) {
                tracing::warn!(app = %app.name, %error, "failed to remove clone");
            }
        }

        match result {
            Ok(tag) => {
                tracing::info!(app = %app.name, %tag, "pipeline succeeded");
                BuildOutcome::succeeded(&app.name, tag, log)
            }
            Err(error) => {
                tracing::error!(app = %app.name, %error, "pipeline failed");
                append_log(&mut log, &error.to_string());
                append_log(&mut log, error.output());
                BuildOutcome::failed(&app.name, version, log)
            }
        }
    }

    async fn execute(
        &self,
        app: &AppSpec,
        clone_dir: &Path,
        log: &mut String,
        version_out: &mut Option<String>,
    ) -> Result<ImageTag, PipelineError> {
        let image_name = app.image_name();
        let docker = DockerClient::new(self.runner);
        let retry = self.retry();

        // Clone
        let git = GitClient::new(self.runner);
        let out = git
            .clone_shallow(&app.repo, &app.branch, clone_dir)
            .await?;
        append_log(log, &out.combined());

        // Version
        let timestamp = format_timestamp(Utc::now());
        let version = VersionResolver::new(self.runner)
            .resolve(app, clone_dir, &timestamp)
            .await?;
        *version_out = Some(version.clone());

        // PreBuild
        let appdir = if let Some(build_cmd) = app.build_cmd.as_deref() {
            let out = retry
                .run(self.sleeper, "prebuild", async || {
                    self.runner
                        .run_shell(&self.options.install_cmd, clone_dir)
                        .await?;
                    self.runner.run_shell(build_cmd, clone_dir).await
                })
                .await?;
            append_log(log, &out.combined());

            match app.build_dir.as_deref() {
                Some(build_dir) => {
                    // Stage the built subtree next to the clone so the
                    // manifest copies only release files, not the checkout.
                    let appdir = format!("{image_name}_build");
                    copy_tree(&clone_dir.join(build_dir), &self.root.join(&appdir))?;
                    appdir
                }
                None => image_name.clone(),
            }
        } else {
            image_name.clone()
        };

        // RenderBuild
        let mut context = Context::new();
        context.insert("name", &app.name);
        context.insert("version", &version);
        context.insert("appdir", &appdir);
        context.insert("env", &app.env);
        context.insert("dns", self.dns);
        context.insert("envdir", "environment");
        context.insert("no_cache", &self.options.no_cache);
        context.insert("verbose", &self.options.verbose);
        let manifest = self.templates.render(&app.docker_template, &context)?;
        let manifest_path = self.root.join(format!("{image_name}.dockerfile"));
        write_file(&manifest_path, &manifest)?;

        // BuildImage
        let stage_ref = format!("{image_name}:stage");
        let out = retry
            .run(self.sleeper, "build", async || {
                self.build_image(&docker, &manifest_path, &stage_ref, self.options.no_cache)
                    .await
            })
            .await?;
        append_log(log, &out.combined());

        // Repack: export + reimport collapses the layer history. Not
        // retried; a failure here leaves no half-built state worth retrying
        // into.
        let mut intermediate = stage_ref;
        if app.mode == Mode::Release && self.options.squash {
            intermediate = self.repack(&docker, &image_name, &intermediate).await?;
        }

        // Finalize
        let mut context = Context::new();
        context.insert("image", &intermediate);
        context.insert("name", &app.name);
        let manifest = self.templates.render(FINALIZE_TEMPLATE, &context)?;
        let manifest_path = self.root.join(format!("{image_name}.finalize.dockerfile"));
        write_file(&manifest_path, &manifest)?;

        let tag = ImageTag::new(&app.name, app.mode, &version);
        let reference = tag.to_string();
        let out = retry
            .run(self.sleeper, "finalize", async || {
                self.build_image(&docker, &manifest_path, &reference, false)
                    .await
            })
            .await?;
        append_log(log, &out.combined());
        docker.remove_image(&intermediate).await?;

        // Tag mirrors
        for registry in &self.options.registries {
            docker
                .tag(&reference, &format!("{registry}/{tag}"))
                .await?;
        }

        // Deliver
        match app.mode {
            Mode::Release => {
                if let Some(image_dir) = &self.options.image_dir {
                    self.archive(&docker, app, &tag, image_dir).await?;
                }
            }
            Mode::Nightly => {
                if self.options.run_after_build {
                    self.replace_container(&docker, app, &tag).await?;
                }
            }
        }

        Ok(tag)
    }

    /// One image build attempt. Verbose runs stream the daemon output to the
    /// terminal instead of capturing it for the report log.
    async fn build_image(
        &self,
        docker: &DockerClient<'a, R>,
        manifest: &Path,
        tag: &str,
        no_cache: bool,
    ) -> Result<RunOutput, DockerError> {
        if self.options.verbose {
            docker
                .build_streaming(manifest, self.root, tag, no_cache)
                .await?;
            Ok(RunOutput::default())
        } else {
            docker.build(manifest, self.root, tag, no_cache).await
        }
    }

    async fn repack(
        &self,
        docker: &DockerClient<'a, R>,
        image_name: &str,
        source: &str,
    ) -> Result<String, PipelineError> {
        let container = docker.create(source).await?;
        let archive = self.root.join(format!("{image_name}.flat.tar"));
        let exported = docker.export(&container, &archive).await;
        // The scratch container goes away even when the export failed.
        docker.remove_container(&container).await?;
        exported?;

        let flat_ref = format!("{image_name}:flat");
        docker.import(&archive, &flat_ref).await?;
        docker.remove_image(source).await?;
        let _ = std::fs::remove_file(&archive);
        Ok(flat_ref)
    }

    /// Save the final image and gzip it into the configured archive
    /// directory as `<name>_<mode>_<version>.tar.gz`.
    async fn archive(
        &self,
        docker: &DockerClient<'a, R>,
        app: &AppSpec,
        tag: &ImageTag,
        image_dir: &Path,
    ) -> Result<(), PipelineError> {
        let plain = self.root.join(format!("{}.tar", app.image_name()));
        docker.save(&tag.to_string(), &plain).await?;

        let dest = image_dir.join(format!("{}_{}_{}.tar.gz", app.name, app.mode, tag.version));
        gzip_file(&plain, &dest)?;
        let _ = std::fs::remove_file(&plain);
        tracing::info!(app = %app.name, archive = %dest.display(), "image archived");
        Ok(())
    }

    /// Stop and remove any container backed by a previous build of this app,
    /// then start the new image detached.
    async fn replace_container(
        &self,
        docker: &DockerClient<'a, R>,
        app: &AppSpec,
        tag: &ImageTag,
    ) -> Result<(), PipelineError> {
        let repository = tag.repository();
        let own_port = app.port_forwards.first().map(|p| p.host_port);

        for container in docker.list_containers().await? {
            if container.image != repository {
                continue;
            }
            // A container publishing a different host port belongs to a
            // sibling deployment of the same image; leave it alone.
            if let (Some(listed), Some(own)) = (container.host_port, own_port)
                && listed != own
            {
                continue;
            }
            tracing::info!(app = %app.name, container = %container.id, "replacing old container");
            docker.stop(&container.id).await?;
            docker.remove_container(&container.id).await?;
        }

        let mut volumes = vec![log_volume(&repository)];
        volumes.extend(app.volumes.iter().cloned());

        let container = docker
            .run_detached(
                &tag.to_string(),
                &RunArgs {
                    name: repository,
                    dns: self.dns.to_owned(),
                    ports: app.port_forwards.clone(),
                    volumes,
                    env: app.env.clone(),
                },
            )
            .await?;
        tracing::info!(app = %app.name, %container, "container started");
        Ok(())
    }
}

/// Every deployed container gets its logs bind-mounted to the host.
fn log_volume(repository: &str) -> VolumeMount {
    VolumeMount {
        host_path: format!("/var/log/{repository}"),
        container_path: "/var/log".to_owned(),
        read_only: false,
    }
}

fn append_log(log: &mut String, chunk: &str) {
    if chunk.is_empty() {
        return;
    }
    if !log.is_empty() && !log.ends_with('\n') {
        log.push('\n');
    }
    log.push_str(chunk);
    log.push('\n');
}

fn write_file(path: &Path, content: &str) -> Result<(), PipelineError> {
    std::fs::write(path, content).map_err(|source| PipelineError::WriteManifest {
        path: path.to_path_buf(),
        source,
    })
}

fn gzip_file(src: &Path, dest: &Path) -> Result<(), PipelineError> {
    let archive_err = |source| PipelineError::Archive {
        path: dest.to_path_buf(),
        source,
    };
    let mut input = std::fs::File::open(src).map_err(archive_err)?;
    let output = std::fs::File::create(dest).map_err(archive_err)?;
    let mut encoder = GzEncoder::new(output, Compression::best());
    std::io::copy(&mut input, &mut encoder).map_err(archive_err)?;
    encoder.finish().map_err(archive_err)?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("failed to write manifest {path}")]
    WriteManifest {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write archive {path}")]
    Archive {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Captured output of the underlying failed command, if any.
    pub fn output(&self) -> &str {
        match self {
            PipelineError::Git(e) => e.output(),
            PipelineError::Version(e) => e.output(),
            PipelineError::Runner(e) => e.output(),
            PipelineError::Docker(e) => e.output(),
            _ => "",
        }
    }
}
