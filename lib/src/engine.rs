//! The seam between diff requests and the local image engine.
//!
//! The engine owns the image store; this crate only asks it three things:
//! whether an image is present, to pull one, and what its build history is.

use std::str::FromStr;

use async_trait::async_trait;
use derive_more::Display;

use crate::{resolve::ResolvedImage, Digest, Platform, Reference};

/// Identity and metadata of an image present in the engine's store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    /// The image ID, which is the digest of its configuration.
    pub id: Digest,

    /// When the image was created, as reported by the engine.
    pub created: Option<String>,

    /// CPU architecture the image targets.
    pub architecture: Option<String>,

    /// Operating system the image targets.
    pub os: Option<String>,
}

impl ImageMetadata {
    /// Create metadata from an engine-reported image ID.
    pub fn from_id(id: &str) -> Result<Self, EngineError> {
        Digest::from_str(id)
            .map(|id| Self {
                id,
                created: None,
                architecture: None,
                os: None,
            })
            .map_err(|err| EngineError::Malformed(format!("image id {id:?}: {err}")))
    }
}

/// One step in an image's build history, as recorded by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HistoryRecord {
    /// The command that created the step; empty when the engine has nothing recorded.
    pub created_by: String,

    /// Whether the step only changed metadata and produced no filesystem layer.
    pub empty_layer: bool,

    /// Unix timestamp of the step, if known.
    pub created: Option<i64>,
}

impl HistoryRecord {
    /// Create a record for a step that produced a layer.
    pub fn layer(created_by: impl Into<String>) -> Self {
        Self {
            created_by: created_by.into(),
            ..Default::default()
        }
    }

    /// Create a record for a metadata-only step.
    pub fn metadata(created_by: impl Into<String>) -> Self {
        Self {
            created_by: created_by.into(),
            empty_layer: true,
            ..Default::default()
        }
    }
}

/// A failure reported by an engine, classified by how callers should react to it.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum EngineError {
    /// The image or repository does not exist.
    #[display("not found: {_0}")]
    NotFound(String),

    /// A fault that may succeed if retried: timeouts, connection resets, registry 5xx.
    #[display("transient failure: {_0}")]
    Transient(String),

    /// The engine refused the request and will keep refusing it.
    #[display("rejected: {_0}")]
    Rejected(String),

    /// The engine could not be reached or failed unexpectedly.
    #[display("engine unavailable: {_0}")]
    Unavailable(String),

    /// The engine answered with data this crate can't interpret.
    #[display("malformed engine response: {_0}")]
    Malformed(String),
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Whether retrying the operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}

/// Local image presence and materialization.
#[async_trait]
pub trait ImageEngine: Send + Sync {
    /// Look up the image in the local store; `None` when it is absent.
    async fn inspect(&self, reference: &Reference) -> Result<Option<ImageMetadata>, EngineError>;

    /// Pull the exact reference into the local store.
    async fn pull(&self, reference: &Reference, platform: Option<&Platform>) -> Result<(), EngineError>;
}

/// Build history of images already present in the local store.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Report the build history of the image, oldest step first.
    async fn history(&self, image: &ResolvedImage) -> Result<Vec<HistoryRecord>, EngineError>;
}
