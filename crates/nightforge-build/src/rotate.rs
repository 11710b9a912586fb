//! Rotation of aged build images.
//!
//! Walks the local image store, decodes tags through the shared codec, and
//! removes images whose embedded build timestamp is older than the
//! threshold. Images the pipeline never produced decode to nothing and are
//! skipped, so rotation is safe to run against a store shared with other
//! tooling. The pass is idempotent: a second run right after the first finds
//! nothing left to remove.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use nightforge_core::tag::ImageTag;
use nightforge_exec::{DockerClient, DockerError, ProcessRunner};

pub struct RotationEngine<'a, R: ProcessRunner> {
    runner: &'a R,
}

impl<'a, R: ProcessRunner> RotationEngine<'a, R> {
    pub fn new(runner: &'a R) -> Self {
        Self { runner }
    }

    /// Remove build images older than `max_days`, measured against `now`.
    /// Returns the tags actually removed.
    pub async fn rotate(
        &self,
        max_days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<ImageTag>, RotationError> {
        let docker = DockerClient::new(self.runner);
        let threshold = Duration::days(max_days);

        let in_use: HashSet<(String, String)> = docker
            .list_containers()
            .await?
            .into_iter()
            .filter(|c| c.status.starts_with("Up"))
            .filter_map(|c| Some((c.image, c.image_tag?)))
            .collect();

        let mut removed = Vec::new();
        for image in docker.list_images().await? {
            let Some(tag) = ImageTag::from_repo_tag(&image.repository, &image.tag) else {
                continue;
            };
            let Some(built_at) = tag.build_timestamp() else {
                continue;
            };
            if now - built_at <= threshold {
                continue;
            }
            if in_use.contains(&(image.repository.clone(), image.tag.clone())) {
                tracing::warn!(%tag, "running container on obsolete image, skipping");
                continue;
            }
            match docker.remove_image(&tag.to_string()).await {
                Ok(()) => {
                    tracing::info!(%tag, "removed obsolete image");
                    removed.push(tag);
                }
                // One stubborn image must not stop the pass.
                Err(error) => {
                    tracing::warn!(%tag, %error, "failed to remove obsolete image");
                }
            }
        }

        Ok(removed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    #[error(transparent)]
    Docker(#[from] DockerError),
}
