//! Registry credentials from the local Docker configuration.

use std::{collections::HashMap, path::PathBuf, process::Stdio};

use base64::Engine;
use bollard::auth::DockerCredentials;
use color_eyre::{
    eyre::{eyre, Context, OptionExt, Result},
    Section, SectionExt,
};
use serde::Deserialize;
use tap::TapFallible;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Read credentials for the host from the configured Docker credentials, if any.
///
/// Failing to read credentials is not an error: the pull is attempted anonymously.
///
/// Reference:
/// - https://docs.docker.com/reference/cli/docker/login
/// - https://github.com/docker/docker-credential-helpers
pub async fn docker_credentials(host: &str) -> Option<DockerCredentials> {
    match read_credentials(host).await {
        Ok(credentials) => credentials,
        Err(err) => {
            warn!(?err, host, "unable to infer docker auth; pulling anonymously");
            None
        }
    }
}

async fn read_credentials(host: &str) -> Result<Option<DockerCredentials>> {
    let path = homedir()?.join(".docker").join("config.json");
    let config = match tokio::fs::read_to_string(&path).await {
        Ok(config) => config,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .context("read docker config")
                .with_section(|| path.display().to_string().header("Config file path:"))
        }
    };

    serde_json::from_str::<DockerConfig>(&config)
        .context("parse docker config")
        .with_section(|| path.display().to_string().header("Config file path:"))?
        .credentials(host)
        .await
        .tap_ok(|credentials| debug!(host, found = credentials.is_some(), "inferred docker auth"))
}

fn homedir() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or_eyre("get home directory")
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerConfig {
    /// The default credential store.
    ///
    /// The value is the suffix of the program to use (everything after `docker-credential-`).
    creds_store: Option<String>,

    /// Credential helpers per host, named the same way as `creds_store`.
    #[serde(default)]
    cred_helpers: HashMap<String, String>,

    /// Logged in hosts.
    #[serde(default)]
    auths: HashMap<String, DockerAuth>,
}

impl DockerConfig {
    /// Docker Hub credentials are commonly stored under its legacy index URL.
    fn auth_keys(host: &str) -> Vec<&str> {
        if host == crate::Reference::DOCKER_HUB {
            vec![host, "https://index.docker.io/v1/", "index.docker.io"]
        } else {
            vec![host]
        }
    }

    async fn credentials(&self, host: &str) -> Result<Option<DockerCredentials>> {
        for key in Self::auth_keys(host) {
            let Some(auth) = self.auths.get(key) else {
                continue;
            };
            match auth.decode(self, key).await {
                Ok(credentials) => return Ok(Some(credentials)),
                Err(err) => warn!(key, "failed decoding auth: {err:#}"),
            }
        }

        // A helper configured for the host works without an `auths` entry.
        if self.cred_helpers.contains_key(host) {
            return decode_helper(self, host).await.map(Some);
        }

        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DockerAuth {
    /// Base64 encoded `username:password`, stored in plain text.
    Plain { auth: String },

    /// The credentials are stored in a helper.
    Helper {},
}

impl DockerAuth {
    async fn decode(&self, config: &DockerConfig, key: &str) -> Result<DockerCredentials> {
        match self {
            DockerAuth::Plain { auth } => decode_plain(auth, key),
            DockerAuth::Helper {} => decode_helper(config, key).await,
        }
    }
}

fn decode_plain(auth: &str, key: &str) -> Result<DockerCredentials> {
    let auth = base64::engine::general_purpose::STANDARD
        .decode(auth)
        .context("decode base64 auth key")?;
    let auth = String::from_utf8(auth).context("parse auth key as utf-8")?;
    let (username, password) = auth
        .split_once(':')
        .ok_or_eyre("invalid auth key format, expected username:password")?;

    Ok(DockerCredentials {
        username: Some(username.to_string()),
        password: Some(password.to_string()),
        serveraddress: Some(key.to_string()),
        ..Default::default()
    })
}

async fn decode_helper(config: &DockerConfig, host: &str) -> Result<DockerCredentials> {
    let helper = config
        .cred_helpers
        .get(host)
        .or(config.creds_store.as_ref())
        .ok_or_eyre("no helper found for host")?;

    let binary = format!("docker-credential-{helper}");
    let mut exec = tokio::process::Command::new(&binary)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawn docker credential helper")
        .with_section(|| binary.clone().header("Helper binary:"))?;

    if let Some(mut stdin) = exec.stdin.take() {
        stdin
            .write_all(host.as_bytes())
            .await
            .context("write request to helper")?;
        drop(stdin);
    }

    let output = exec.wait_with_output().await.context("run helper")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(eyre!("auth helper failed with status: {}", output.status))
            .with_section(|| binary.clone().header("Helper binary:"))
            .with_section(|| stderr.header("Stderr:"));
    }

    let credential = serde_json::from_slice::<HelperCredential>(&output.stdout)
        .context("decode helper output")
        .with_section(|| binary.header("Helper binary:"))?;

    Ok(DockerCredentials {
        username: Some(credential.username),
        password: Some(credential.secret),
        serveraddress: Some(credential.server_url.unwrap_or_else(|| host.to_string())),
        ..Default::default()
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HelperCredential {
    username: String,
    secret: String,
    #[serde(rename = "ServerURL")]
    server_url: Option<String>,
}
