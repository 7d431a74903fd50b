//! Coordinates a diff request: two resolve-then-extract pipelines joined into one payload.

use std::str::FromStr;

use bon::Builder;
use derive_more::Display;
use serde::Serialize;
use strum::AsRefStr;
use tracing::{info, warn, Instrument};

use crate::{
    history::{Extractor, ReconstructedDockerfile},
    payload::{assemble, DiffPayload},
    resolve::Resolver,
    DiffError, Reference,
};

/// Progress of a diff request.
///
/// A request moves forward through these stages in order,
/// or fails in whichever stage it had reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, strum::Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Resolving,
    Extracting,
    Assembling,
    Completed,
}

/// Which of the two requested images a failure concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, strum::Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Image1,
    Image2,
}

/// A failed diff request.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("{slot} failed while {stage}: {error}")]
pub struct Failure {
    /// The stage the request had reached.
    pub stage: Stage,

    /// The image whose pipeline failed.
    pub slot: Slot,

    /// What went wrong.
    pub error: DiffError,
}

impl std::error::Error for Failure {}

impl Failure {
    fn new(stage: Stage, slot: Slot, error: DiffError) -> Self {
        Self { stage, slot, error }
    }
}

/// Everything a diff request needs, passed explicitly to each request.
///
/// Cloning is cheap; clones share the engine and its pull locks.
#[derive(Debug, Clone, Builder)]
pub struct Context {
    /// Makes sure images are present locally.
    resolver: Resolver,

    /// Reconstructs Dockerfiles from image history.
    extractor: Extractor,
}

impl Context {
    /// Reconstruct and pair the Dockerfiles of two images.
    ///
    /// Both references are validated before either image is touched.
    /// The two images are then resolved and extracted concurrently;
    /// the first failure ends the request and the other pipeline is abandoned.
    #[tracing::instrument(skip(self))]
    pub async fn diff(&self, image1: &str, image2: &str) -> Result<DiffPayload, Failure> {
        info!(stage = %Stage::Received, "diff requested");
        let reference1 = parse(Slot::Image1, image1)?;
        let reference2 = parse(Slot::Image2, image2)?;

        let (dockerfile1, dockerfile2) = tokio::try_join!(
            self.pipeline(Slot::Image1, &reference1),
            self.pipeline(Slot::Image2, &reference2),
        )
        .inspect_err(|failure| warn!(%failure, "diff failed"))?;

        info!(stage = %Stage::Assembling, "both images reconstructed");
        let payload = assemble(image1, &dockerfile1, image2, &dockerfile2);

        info!(stage = %Stage::Completed, "diff complete");
        Ok(payload)
    }

    async fn pipeline(&self, slot: Slot, reference: &Reference) -> Result<ReconstructedDockerfile, Failure> {
        let span = tracing::info_span!("pipeline", %slot, %reference);
        async {
            info!(stage = %Stage::Resolving, "resolving");
            let image = self
                .resolver
                .resolve(reference)
                .await
                .map_err(|error| Failure::new(Stage::Resolving, slot, error))?;

            // Extraction only ever starts once this image is resolved.
            info!(stage = %Stage::Extracting, digest = %image.digest, "extracting");
            self.extractor
                .extract(&image)
                .await
                .map_err(|error| Failure::new(Stage::Extracting, slot, error))
        }
        .instrument(span)
        .await
    }
}

fn parse(slot: Slot, input: &str) -> Result<Reference, Failure> {
    Reference::from_str(input).map_err(|err| {
        let error = DiffError::InvalidReference {
            input: input.to_string(),
            message: err.to_string(),
        };
        Failure::new(Stage::Received, slot, error)
    })
}
