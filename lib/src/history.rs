//! Reconstructs approximate Dockerfiles from image build history.
//!
//! Image history records the command that created each build step, but in a form
//! that depends on the tool that built the image:
//!
//! - The legacy builder records `/bin/sh -c <command>` for `RUN` steps
//!   and `/bin/sh -c #(nop) <INSTRUCTION> ...` for everything else.
//! - BuildKit records the instruction itself (`RUN /bin/sh -c ...`, `COPY . .`)
//!   followed by a trailing `# buildkit` marker.
//! - Build arguments in effect for a `RUN` step are prefixed as `|<count> KEY=VALUE ...`.
//!
//! Reconstruction maps each recorded command to an instruction line using an ordered table
//! of [`Rule`]s. This is a heuristic: build context, stage structure and build arguments
//! are not recoverable from history, so every result is marked approximate.

use std::{path::Path, str::FromStr, sync::Arc};

use bon::Builder;
use color_eyre::{
    eyre::{eyre, Context},
    Result, Section, SectionExt,
};
use derive_more::Debug;
use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumIter, EnumString};
use tap::Pipe;
use tracing::{debug, info};

use crate::{
    engine::{EngineError, HistoryRecord, HistorySource},
    resolve::ResolvedImage,
    DiffError,
};

/// Dockerfile instruction keywords.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, EnumIter, EnumString, strum::Display, Serialize,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Instruction {
    From,
    Run,
    Cmd,
    Label,
    Maintainer,
    Expose,
    Env,
    Add,
    Copy,
    Entrypoint,
    Volume,
    User,
    Workdir,
    Arg,
    Onbuild,
    Stopsignal,
    Healthcheck,
    Shell,
}

/// What to emit for history entries with no discoverable instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsRefStr, EnumIter, EnumString, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LayerPolicy {
    /// Emit `# layer` for entries with no recorded command,
    /// and `# layer: <command>` for entries no rule recognized.
    #[default]
    Comment,

    /// Leave such entries out of the reconstruction.
    Drop,
}

/// One step of an image's build history, in build order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerHistoryEntry {
    /// The instruction the step was recognized as, if any.
    pub instruction: Option<Instruction>,

    /// The instruction line when recognized; otherwise the recorded command.
    pub command: String,

    /// Whether the step only changed metadata.
    pub empty_layer: bool,
}

impl LayerHistoryEntry {
    /// Whether this entry maps to an instruction line.
    pub fn is_emittable(&self) -> bool {
        self.instruction.is_some()
    }
}

/// A best-effort textual approximation of the instructions that built an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconstructedDockerfile {
    /// Instruction lines in build order.
    pub lines: Vec<String>,

    /// Always true: history can't faithfully reproduce the original Dockerfile.
    pub approximate: bool,
}

impl ReconstructedDockerfile {
    /// Render the Dockerfile text, one instruction per line.
    ///
    /// Instructions recorded across several lines are continued with a trailing `\`,
    /// and comments are continued as comments.
    pub fn render(&self) -> String {
        self.lines.iter().map(|line| format!("{}\n", continued(line))).join("")
    }
}

fn continued(line: &str) -> String {
    if line.starts_with('#') {
        return line.lines().join("\n# ");
    }

    let mut rendered = String::with_capacity(line.len());
    for (index, part) in line.lines().enumerate() {
        if index > 0 {
            rendered.push_str(if rendered.ends_with('\\') { "\n" } else { " \\\n" });
        }
        rendered.push_str(part);
    }
    rendered
}

impl std::fmt::Display for ReconstructedDockerfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// A configurable mapping from a recorded command to an instruction line.
///
/// The pattern is a regular expression; when it matches, the matched text is
/// replaced with `replacement`, which may refer to capture groups (`$1`, `${name}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Identifies the rule in logs.
    pub name: String,

    /// Regular expression matched against the normalized command.
    pub pattern: String,

    /// Replacement template producing the instruction line.
    pub replacement: String,
}

impl Rule {
    fn new(name: &str, pattern: &str, replacement: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
        }
    }
}

/// The built-in rule table.
///
/// Order matters: the first matching rule wins.
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule::new(
            "buildkit-run-args",
            r"(?s)^RUN \|\d+ (?:\S+=\S* )*/bin/sh -c (.*)$",
            "RUN $1",
        ),
        Rule::new("buildkit-run-shell", r"(?s)^RUN /bin/sh -c (.*)$", "RUN $1"),
        Rule::new(
            "copy-in",
            r"^(?:/bin/sh -c #\(nop\)\s+)?(ADD|COPY) (\S+) in (\S+)$",
            "$1 $2 $3",
        ),
        Rule::new("nop", r"(?s)^/bin/sh -c #\(nop\)\s+(.*)$", "$1"),
        Rule::new(
            "shell-args",
            r"(?s)^\|\d+ (?:\S+=\S* )*/bin/sh -c (.*)$",
            "RUN $1",
        ),
        Rule::new("shell", r"(?s)^/bin/sh -c (.*)$", "RUN $1"),
        Rule::new(
            "keyword",
            r"(?s)^(FROM|RUN|CMD|LABEL|MAINTAINER|EXPOSE|ENV|ADD|COPY|ENTRYPOINT|VOLUME|USER|WORKDIR|ARG|ONBUILD|STOPSIGNAL|HEALTHCHECK|SHELL)(\s.*)?$",
            "$1$2",
        ),
    ]
}

#[derive(Debug, Clone)]
struct CompiledRule {
    name: String,
    regex: Regex,
    replacement: String,
}

/// A compiled, ordered rule table.
#[derive(Debug, Clone)]
pub struct Rules(Vec<CompiledRule>);

impl Rules {
    /// Compile a rule table. Empty tables are rejected: they would recognize nothing.
    pub fn compile(rules: impl IntoIterator<Item = Rule>) -> Result<Self> {
        let compiled = rules
            .into_iter()
            .map(|rule| {
                Regex::new(&rule.pattern)
                    .with_context(|| format!("compile rule {:?}", rule.name))
                    .with_section(|| rule.pattern.clone().header("Pattern:"))
                    .map(|regex| CompiledRule {
                        name: rule.name,
                        regex,
                        replacement: rule.replacement,
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        if compiled.is_empty() {
            return Err(eyre!("rule table is empty"));
        }
        Ok(Self(compiled))
    }

    /// Parse and compile a rule table from JSON text: an array of
    /// `{"name": ..., "pattern": ..., "replacement": ...}` objects.
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str::<Vec<Rule>>(json)
            .context("parse rules")?
            .pipe(Self::compile)
    }

    /// Load a rule table from a JSON file. The table replaces the built-in one entirely.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .context("read rules file")
            .with_section(|| path.display().to_string().header("Rules file path:"))?;
        Self::parse(&content)
            .with_section(|| path.display().to_string().header("Rules file path:"))
    }

    /// Rewrite a normalized command with the first matching rule.
    pub fn rewrite(&self, command: &str) -> Option<String> {
        self.0.iter().find_map(|rule| {
            if !rule.regex.is_match(command) {
                return None;
            }
            let line = rule.regex.replace(command, rule.replacement.as_str());
            debug!(rule = %rule.name, "matched");
            Some(line.trim().to_string())
        })
    }
}

impl Default for Rules {
    fn default() -> Self {
        Self::compile(default_rules()).expect("built-in rules are valid")
    }
}

/// Trim the command and remove the marker BuildKit appends to it.
fn normalize(created_by: &str) -> &str {
    let trimmed = created_by.trim();
    trimmed
        .strip_suffix("# buildkit")
        .map(str::trim_end)
        .unwrap_or(trimmed)
}

/// Comments must stay on one line.
fn single_line(command: &str) -> String {
    command.split_whitespace().join(" ")
}

/// Reconstructs Dockerfiles from the history of resolved images.
#[derive(Debug, Clone, Builder)]
pub struct Extractor {
    /// Where history is read from.
    #[debug(skip)]
    source: Arc<dyn HistorySource>,

    /// Maps recorded commands to instruction lines.
    #[builder(default)]
    rules: Rules,

    /// What to emit for entries with no discoverable instruction.
    #[builder(default)]
    policy: LayerPolicy,
}

impl Extractor {
    /// Read the image's history and reconstruct its Dockerfile.
    #[tracing::instrument(skip(self, image), fields(reference = %image.reference, digest = %image.digest))]
    pub async fn extract(&self, image: &ResolvedImage) -> Result<ReconstructedDockerfile, DiffError> {
        let records = self.source.history(image).await.map_err(|err| match err {
            EngineError::NotFound(message) => DiffError::NotFound {
                reference: image.reference.to_string(),
                message,
            },
            err => DiffError::internal(format!("read history of {}: {err}", image.reference)),
        })?;

        let dockerfile = self.reconstruct(&records).map_err(|message| DiffError::HistoryUnavailable {
            reference: image.reference.to_string(),
            message,
        })?;
        info!(lines = dockerfile.lines.len(), "reconstructed");
        Ok(dockerfile)
    }

    /// Classify each history record, preserving build order.
    pub fn entries(&self, records: &[HistoryRecord]) -> Vec<LayerHistoryEntry> {
        records
            .iter()
            .map(|record| {
                let command = normalize(&record.created_by);
                let line = self.rules.rewrite(command);
                let instruction = line
                    .as_deref()
                    .and_then(|line| line.split_whitespace().next())
                    .and_then(|keyword| Instruction::from_str(keyword).ok());

                match (instruction, line) {
                    (Some(instruction), Some(line)) => LayerHistoryEntry {
                        instruction: Some(instruction),
                        command: line,
                        empty_layer: record.empty_layer,
                    },
                    _ => LayerHistoryEntry {
                        instruction: None,
                        command: command.to_string(),
                        empty_layer: record.empty_layer,
                    },
                }
            })
            .collect()
    }

    /// Reconstruct a Dockerfile from history records in build order.
    ///
    /// Fails with a description of the problem when the records carry no usable history.
    /// This is a pure function of the records and the configured rules.
    pub fn reconstruct(&self, records: &[HistoryRecord]) -> Result<ReconstructedDockerfile, String> {
        if records.is_empty() {
            return Err(String::from("the image has no history entries"));
        }
        if records.iter().all(|record| normalize(&record.created_by).is_empty()) {
            return Err(String::from("no history entry records a command"));
        }

        let lines = self
            .entries(records)
            .into_iter()
            .filter_map(|entry| match (entry.instruction, self.policy) {
                (Some(_), _) => Some(entry.command),
                (None, LayerPolicy::Drop) => None,
                (None, LayerPolicy::Comment) if entry.command.is_empty() => {
                    Some(String::from("# layer"))
                }
                (None, LayerPolicy::Comment) => {
                    Some(format!("# layer: {}", single_line(&entry.command)))
                }
            })
            .collect();

        Ok(ReconstructedDockerfile {
            lines,
            approximate: true,
        })
    }
}
