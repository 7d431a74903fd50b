//! Core library for `retrace`, a tool for reconstructing and comparing the Dockerfiles of container images.

use bon::Builder;
use color_eyre::{
    eyre::{self, bail, eyre, Context as _},
    Result, Section, SectionExt,
};
use derive_more::derive::Display;
use regex::Regex;
use std::{str::FromStr, sync::LazyLock};
use tap::Pipe;

mod auth;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod history;
pub mod http;
pub mod orchestrate;
pub mod payload;
pub mod resolve;
pub mod slim;

pub use engine::{EngineError, HistoryRecord, HistorySource, ImageEngine, ImageMetadata};
pub use error::{DiffError, ErrorKind};
pub use history::{Extractor, Instruction, LayerHistoryEntry, LayerPolicy, ReconstructedDockerfile, Rule, Rules};
pub use orchestrate::{Context, Failure, Slot, Stage};
pub use payload::{assemble, DiffPayload, ImageDockerfile};
pub use resolve::{ResolvedImage, Resolver};

/// Platform represents the platform a container image is built for.
/// This follows the OCI Image Spec's platform definition while also supporting
/// Docker's platform string format (e.g. "linux/amd64").
///
/// ```
/// # use retrace_lib::Platform;
/// # use std::str::FromStr;
/// let platform = Platform::from_str("linux/amd64").expect("parse platform");
/// assert_eq!(platform.to_string(), "linux/amd64");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct Platform {
    /// Operating system the container runs on (e.g. "linux", "windows").
    #[builder(into)]
    pub os: String,

    /// CPU architecture (e.g. "amd64", "arm64").
    #[builder(into)]
    pub architecture: String,

    /// Variant of the CPU (e.g. "v7" for armv7).
    #[builder(into)]
    pub variant: Option<String>,
}

impl FromStr for Platform {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input_section = || s.to_string().header("Input:");
        let expected_section = || {
            "{os}/{architecture}[/{variant}]"
                .to_string()
                .header("Expected:")
        };

        let parts = s.split('/').collect::<Vec<_>>();
        if parts.iter().any(|part| part.is_empty()) {
            return eyre!("invalid platform format")
                .with_section(input_section)
                .with_section(expected_section)
                .pipe(Err);
        }

        match parts.as_slice() {
            [os, architecture] => Self::builder()
                .os(os.to_string())
                .architecture(architecture.to_string())
                .build()
                .pipe(Ok),
            [os, architecture, variant] => Self::builder()
                .os(os.to_string())
                .architecture(architecture.to_string())
                .variant(variant.to_string())
                .build()
                .pipe(Ok),
            _ => eyre!("invalid platform format")
                .with_section(input_section)
                .with_section(expected_section)
                .pipe(Err),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

/// A content-addressable digest in the format `algorithm:hash`.
///
/// Image IDs reported by the Docker daemon use the same format.
///
/// ```
/// # use std::str::FromStr;
/// let digest = retrace_lib::Digest::from_str("sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4").expect("parse digest");
/// assert_eq!(digest.algorithm, "sha256");
/// assert_eq!(digest.as_hex(), "a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    /// The hashing algorithm used (e.g. "sha256")
    pub algorithm: String,

    /// The raw hash bytes
    pub hash: Vec<u8>,
}

impl Digest {
    /// The SHA256 algorithm
    pub const SHA256: &'static str = "sha256";

    /// The SHA512 algorithm
    pub const SHA512: &'static str = "sha512";

    /// Returns the hash as a hex string
    pub fn as_hex(&self) -> String {
        hex::encode(&self.hash)
    }
}

impl FromStr for Digest {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input_section = || s.to_string().header("Input:");
        let (algorithm, hex) = s.split_once(':').ok_or_else(|| {
            eyre!("invalid digest format: missing algorithm separator ':'")
                .with_section(input_section)
        })?;

        if algorithm.is_empty() {
            bail!("algorithm cannot be empty");
        }
        if hex.is_empty() {
            bail!("hex cannot be empty");
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            hash: hex::decode(hex).map_err(|e| eyre!("invalid hex string: {e}"))?,
        })
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.as_hex())
    }
}

impl From<&Digest> for Digest {
    fn from(digest: &Digest) -> Self {
        digest.clone()
    }
}

/// Version identifier for a container image.
///
/// This can be a named tag or a digest.
///
/// ```
/// # use retrace_lib::Version;
/// assert_eq!(Version::latest().to_string(), "latest");
/// assert_eq!(Version::tag("3.19").to_string(), "3.19");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Version {
    /// A named tag (e.g. "latest", "1.0.0")
    Tag(String),

    /// A digest (e.g. "sha256:123abc...")
    Digest(Digest),
}

impl Version {
    /// Returns the tag for "latest".
    pub fn latest() -> Self {
        Self::Tag(String::from("latest"))
    }

    /// Create a tagged instance.
    pub fn tag(tag: &str) -> Self {
        Self::Tag(tag.to_string())
    }
}

static HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[A-Za-z0-9](?:[A-Za-z0-9.-]*[A-Za-z0-9])?|\[[0-9A-Fa-f:]+\])(?::[0-9]+)?$")
        .expect("host pattern is valid")
});

static COMPONENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").expect("component pattern is valid")
});

static DIGEST_ALGORITHM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[+._-][a-z0-9]+)*$").expect("digest algorithm pattern is valid")
});

static DIGEST_HEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-f0-9]+$").expect("digest hex pattern is valid"));

static TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("tag pattern is valid")
});

/// A parsed container image reference.
///
/// Parsing follows the Docker CLI's normalization rules:
/// references without a registry host are resolved against Docker Hub,
/// single-component Docker Hub repositories live in the `library` namespace,
/// and references without a tag or digest use the `latest` tag.
///
/// ```
/// # use retrace_lib::{Reference, Version};
/// # use std::str::FromStr;
/// let reference = Reference::from_str("alpine:3.19").expect("parse reference");
/// assert_eq!(reference.host, "docker.io");
/// assert_eq!(reference.repository, "library/alpine");
/// assert_eq!(reference.version, Version::tag("3.19"));
///
/// let reference = Reference::from_str("localhost:5000/team/app").expect("parse reference");
/// assert_eq!(reference.host, "localhost:5000");
/// assert_eq!(reference.repository, "team/app");
/// assert_eq!(reference.version, Version::latest());
///
/// assert!(Reference::from_str("alpine 3.19").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct Reference {
    /// Registry host (e.g. "docker.io", "ghcr.io")
    #[builder(into)]
    pub host: String,

    /// Repository name including namespace (e.g. "library/ubuntu", "username/project")
    #[builder(into)]
    pub repository: String,

    /// Version identifier, either a tag or digest
    #[builder(into, default = Version::latest())]
    pub version: Version,
}

impl<S: reference_builder::State> ReferenceBuilder<S> {
    /// Set the reference to a tag version.
    pub fn tag(self, tag: &str) -> ReferenceBuilder<reference_builder::SetVersion<S>>
    where
        S::Version: reference_builder::IsUnset,
    {
        self.version(Version::tag(tag))
    }

    /// Set the reference to a digest version.
    pub fn digest(
        self,
        digest: impl Into<Digest>,
    ) -> ReferenceBuilder<reference_builder::SetVersion<S>>
    where
        S::Version: reference_builder::IsUnset,
    {
        self.version(Version::Digest(digest.into()))
    }
}

impl Reference {
    /// The registry host assumed for references that don't name one.
    pub const DOCKER_HUB: &'static str = "docker.io";

    /// Longest accepted `host/repository` name, matching the Docker CLI.
    pub const MAX_NAME_LENGTH: usize = 255;

    /// The image name without its version, e.g. `docker.io/library/alpine`.
    pub fn name(&self) -> String {
        format!("{}/{}", self.host, self.repository)
    }
}

/// Check a digest against the OCI digest grammar.
///
/// Only registered algorithms are accepted, with their exact encoded length,
/// since the engine refuses anything else as an invalid reference format.
fn check_digest(digest: &str) -> Result<(), &'static str> {
    let (algorithm, hex) = digest
        .split_once(':')
        .ok_or("digest is missing its algorithm")?;
    if !DIGEST_ALGORITHM.is_match(algorithm) {
        return Err("malformed digest algorithm");
    }
    let length = match algorithm {
        Digest::SHA256 => 64,
        Digest::SHA512 => 128,
        _ => return Err("unsupported digest algorithm"),
    };
    if hex.len() != length || !DIGEST_HEX.is_match(hex) {
        return Err("malformed digest hash");
    }
    Ok(())
}

/// The first path component is a registry host if it could not be a repository namespace.
fn looks_like_host(component: &str) -> bool {
    component == "localhost"
        || component.contains('.')
        || component.contains(':')
        || component.chars().any(|c| c.is_ascii_uppercase())
}

impl FromStr for Reference {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input_section = || s.to_string().header("Input:");
        let invalid = |reason: &str| eyre!("invalid reference: {reason}").with_section(input_section);

        if s.is_empty() {
            return Err(invalid("reference is empty"));
        }
        if s.chars().any(char::is_whitespace) {
            return Err(invalid("reference contains whitespace"));
        }

        // Digests contain ':' so they are split off before looking for a tag.
        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) => {
                check_digest(digest).map_err(|reason| invalid(reason))?;
                let digest = Digest::from_str(digest)
                    .context("parse digest")
                    .with_section(input_section)?;
                (name, Some(digest))
            }
            None => (s, None),
        };

        // A colon before the last '/' belongs to a registry port, not a tag.
        let tag_separator = name
            .rfind(':')
            .filter(|&colon| name.rfind('/').map_or(true, |slash| colon > slash));
        let (name, tag) = match tag_separator {
            Some(colon) => (&name[..colon], Some(&name[colon + 1..])),
            None => (name, None),
        };

        let (host, repository) = match name.split_once('/') {
            Some((host, rest)) if looks_like_host(host) => (host, rest.to_string()),
            _ => (Self::DOCKER_HUB, name.to_string()),
        };
        let repository = if host == Self::DOCKER_HUB && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        if !HOST.is_match(host) {
            return Err(invalid("malformed registry host"));
        }
        if let Some(component) = repository.split('/').find(|c| !COMPONENT.is_match(c)) {
            return eyre!("invalid reference: malformed repository component {component:?}")
                .with_section(input_section)
                .pipe(Err);
        }
        if host.len() + 1 + repository.len() > Self::MAX_NAME_LENGTH {
            return Err(invalid("name is too long"));
        }
        if let Some(tag) = tag {
            if !TAG.is_match(tag) {
                return Err(invalid("malformed tag"));
            }
        }

        // When both are present the digest pins the image; the tag is informational only.
        let version = match (digest, tag) {
            (Some(digest), _) => Version::Digest(digest),
            (None, Some(tag)) => Version::tag(tag),
            (None, None) => Version::latest(),
        };

        Ok(Reference {
            host: host.to_string(),
            repository,
            version,
        })
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.host, self.repository)?;
        match &self.version {
            Version::Tag(tag) => write!(f, ":{}", tag),
            Version::Digest(digest) => write!(f, "@{}", digest),
        }
    }
}
