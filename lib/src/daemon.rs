//! Interacts with the local Docker daemon.

use async_trait::async_trait;
use bollard::{errors::Error as BollardError, query_parameters::CreateImageOptions, Docker};
use color_eyre::eyre::{Context, Result};
use derive_more::Debug;
use futures_lite::StreamExt;
use tracing::{debug, info};

use crate::{
    auth,
    engine::{EngineError, HistoryRecord, HistorySource, ImageEngine, ImageMetadata},
    resolve::ResolvedImage,
    Platform, Reference, Version,
};

/// A connection to the local Docker daemon, which owns the local image store.
///
/// Serves both as the engine that resolves images and as a source of their build history.
#[derive(Debug, Clone)]
pub struct Daemon {
    /// The Docker client for interacting with the daemon
    #[debug(skip)]
    docker: Docker,

    /// Whether pulls present credentials from the local Docker configuration.
    authenticate: bool,
}

#[bon::bon]
impl Daemon {
    /// Connect to the daemon using the local defaults (`DOCKER_HOST` or the platform socket).
    #[builder]
    pub async fn new(
        /// Whether pulls present credentials from the local Docker configuration.
        #[builder(default = true)]
        authenticate: bool,
    ) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().context("connect to Docker daemon")?;

        // Verify Docker daemon is accessible
        let version = docker
            .version()
            .await
            .context("verify Docker daemon connection")?;
        debug!(version = ?version.version, api = ?version.api_version, "connected to daemon");

        Ok(Self {
            docker,
            authenticate,
        })
    }
}

#[async_trait]
impl ImageEngine for Daemon {
    #[tracing::instrument(skip(self, reference), fields(%reference))]
    async fn inspect(&self, reference: &Reference) -> Result<Option<ImageMetadata>, EngineError> {
        let image = match self.docker.inspect_image(&reference.to_string()).await {
            Ok(image) => image,
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(None),
            Err(err) => return Err(classify(err)),
        };

        let id = image
            .id
            .ok_or_else(|| EngineError::Malformed(format!("image {reference} has no id")))?;
        let metadata = ImageMetadata::from_id(&id)?;
        Ok(Some(ImageMetadata {
            created: image.created,
            architecture: image.architecture,
            os: image.os,
            ..metadata
        }))
    }

    #[tracing::instrument(skip(self, reference), fields(%reference))]
    async fn pull(&self, reference: &Reference, platform: Option<&Platform>) -> Result<(), EngineError> {
        let options = pull_options(reference, platform);
        let credentials = if self.authenticate {
            auth::docker_credentials(&reference.host).await
        } else {
            None
        };

        let mut stream = Box::pin(self.docker.create_image(Some(options), None, credentials));
        while let Some(info) = stream.next().await {
            let info = info.map_err(classify)?;
            if let Some(message) = info.error_detail.and_then(|detail| detail.message) {
                return Err(classify_message(message, EngineError::Rejected));
            }
            if let Some(status) = info.status {
                debug!(id = ?info.id, %status, "pull progress");
            }
        }

        info!("pull complete");
        Ok(())
    }
}

#[async_trait]
impl HistorySource for Daemon {
    #[tracing::instrument(skip(self, image), fields(digest = %image.digest))]
    async fn history(&self, image: &ResolvedImage) -> Result<Vec<HistoryRecord>, EngineError> {
        let history = match self.docker.image_history(&image.digest.to_string()).await {
            Ok(history) => history,
            Err(BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            }) => return Err(EngineError::NotFound(message)),
            Err(err) => return Err(classify(err)),
        };

        // The daemon reports the newest step first.
        Ok(history
            .into_iter()
            .rev()
            .map(|item| HistoryRecord {
                created_by: item.created_by,
                empty_layer: item.size == 0,
                created: Some(item.created),
            })
            .collect())
    }
}

/// Pull the exact reference: tags pull by tag, digests pull by digest.
fn pull_options(reference: &Reference, platform: Option<&Platform>) -> CreateImageOptions {
    let (from_image, tag) = match &reference.version {
        Version::Tag(tag) => (reference.name(), Some(tag.clone())),
        Version::Digest(digest) => (format!("{}@{digest}", reference.name()), None),
    };

    CreateImageOptions {
        from_image: Some(from_image),
        tag,
        platform: platform.map(Platform::to_string).unwrap_or_default(),
        ..Default::default()
    }
}

/// Sort a daemon failure by how the resolver should react to it.
fn classify(err: BollardError) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } if status_code >= 500 => classify_message(message, EngineError::Transient),
        BollardError::DockerResponseServerError { message, .. } => {
            classify_message(message, EngineError::Rejected)
        }
        err @ (BollardError::RequestTimeoutError { .. }
        | BollardError::HyperResponseError { .. }
        | BollardError::IOError { .. }) => EngineError::Transient(err.to_string()),
        err => EngineError::Unavailable(err.to_string()),
    }
}

/// The daemon wraps registry failures in free-form messages;
/// recognize the ones that say what actually happened.
fn classify_message(message: String, fallback: fn(String) -> EngineError) -> EngineError {
    let lower = message.to_lowercase();
    let contains_any = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));

    if contains_any(&[
        "not found",
        "manifest unknown",
        "does not exist",
        "no such image",
        "repository name not known",
    ]) {
        EngineError::NotFound(message)
    } else if contains_any(&[
        "timeout",
        "timed out",
        "connection reset",
        "connection refused",
        "unexpected eof",
        "tls handshake",
        "too many requests",
        "temporarily unavailable",
    ]) {
        EngineError::Transient(message)
    } else {
        fallback(message)
    }
}

/// Check whether the Docker daemon is reachable.
pub async fn is_daemon_available() -> bool {
    match Docker::connect_with_local_defaults() {
        Ok(docker) => docker.version().await.is_ok(),
        Err(_) => false,
    }
}
