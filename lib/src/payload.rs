//! The paired comparison result sent to a rendering client.

use color_eyre::{eyre::Context, Result};
use serde::{Deserialize, Serialize};

use crate::history::ReconstructedDockerfile;

/// One side of a diff: the image as the caller named it, and its reconstructed Dockerfile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDockerfile {
    /// The image reference exactly as the caller supplied it.
    pub name: String,

    /// The reconstructed Dockerfile text.
    pub dockerfile: String,

    /// Whether the Dockerfile is a heuristic reconstruction.
    pub approximate: bool,
}

/// Both sides of a diff.
///
/// A payload always carries both images; a request that fails for either image
/// produces no payload at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffPayload {
    pub image1: ImageDockerfile,
    pub image2: ImageDockerfile,
}

impl DiffPayload {
    /// Render the payload as JSON.
    pub fn render(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serialize payload")
    }

    /// Read a payload rendered by [`DiffPayload::render`].
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("parse payload")
    }
}

/// Pair two reconstructed Dockerfiles with the names they were requested by.
pub fn assemble(
    name1: impl Into<String>,
    dockerfile1: &ReconstructedDockerfile,
    name2: impl Into<String>,
    dockerfile2: &ReconstructedDockerfile,
) -> DiffPayload {
    let side = |name: String, dockerfile: &ReconstructedDockerfile| ImageDockerfile {
        name,
        dockerfile: dockerfile.render(),
        approximate: dockerfile.approximate,
    };

    DiffPayload {
        image1: side(name1.into(), dockerfile1),
        image2: side(name2.into(), dockerfile2),
    }
}
