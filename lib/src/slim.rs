//! Reads image history through the `slim xray` report.
//!
//! `slim` inspects the image through the local daemon and reports each
//! instruction of the image stack, which is an alternative to the daemon's
//! own history for images built with tools that record it poorly.

use std::process::Stdio;

use async_tempfile::TempFile;
use async_trait::async_trait;
use bon::Builder;
use color_eyre::{
    eyre::{eyre, Context, Result},
    Section, SectionExt,
};
use serde::Deserialize;
use tap::Pipe;
use tracing::debug;

use crate::{
    engine::{EngineError, HistoryRecord, HistorySource},
    resolve::ResolvedImage,
};

/// Runs `slim xray` against resolved images.
#[derive(Debug, Clone, Builder)]
pub struct Slim {
    /// The `slim` executable; looked up on `PATH` unless a path is given.
    #[builder(into, default = String::from(Slim::DEFAULT_BINARY))]
    binary: String,
}

impl Slim {
    /// The executable used unless configured otherwise.
    pub const DEFAULT_BINARY: &'static str = "slim";

    async fn report(&self, target: &str) -> Result<String> {
        let report = TempFile::new().await.context("create report file")?;
        let path = report.file_path().to_path_buf();

        let output = tokio::process::Command::new(&self.binary)
            .arg("--report")
            .arg(&path)
            .args(["xray", "--target", target, "--changes", "all", "--changes-output", "report"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("run slim")
            .with_section(|| self.binary.clone().header("Binary:"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(eyre!("slim failed with status: {}", output.status))
                .with_section(|| target.to_string().header("Target:"))
                .with_section(|| stderr.header("Stderr:"));
        }

        tokio::fs::read_to_string(&path)
            .await
            .context("read slim report")
            .with_section(|| path.display().to_string().header("Report path:"))
    }
}

#[async_trait]
impl HistorySource for Slim {
    #[tracing::instrument(skip(self, image), fields(reference = %image.reference, digest = %image.digest))]
    async fn history(&self, image: &ResolvedImage) -> Result<Vec<HistoryRecord>, EngineError> {
        // The tag may have moved since the image was resolved; the id cannot.
        let report = self
            .report(&image.digest.to_string())
            .await
            .map_err(|err| EngineError::Unavailable(format!("{err:#}")))?;
        let records = parse_report(&report).map_err(|err| EngineError::Malformed(format!("{err:#}")))?;
        debug!(count = records.len(), "read history from slim report");
        Ok(records)
    }
}

#[derive(Debug, Deserialize)]
struct Report {
    #[serde(default)]
    image_stack: Vec<StackImage>,
}

#[derive(Debug, Deserialize)]
struct StackImage {
    #[serde(default)]
    instructions: Vec<StackInstruction>,
}

#[derive(Debug, Deserialize)]
struct StackInstruction {
    #[serde(default)]
    command_all: String,

    #[serde(default)]
    is_nop: bool,

    #[serde(default)]
    empty_layer: bool,
}

/// Read the history out of a `slim xray` report, base image first.
pub fn parse_report(report: &str) -> Result<Vec<HistoryRecord>> {
    let report = serde_json::from_str::<Report>(report).context("parse slim report")?;
    report
        .image_stack
        .into_iter()
        .flat_map(|image| image.instructions)
        .map(|instruction| HistoryRecord {
            created_by: instruction.command_all,
            empty_layer: instruction.empty_layer || instruction.is_nop,
            created: None,
        })
        .collect::<Vec<_>>()
        .pipe(Ok)
}
