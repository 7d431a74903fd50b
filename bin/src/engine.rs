use std::{path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use clap::{Parser, ValueEnum};
use color_eyre::eyre::{Context as _, Result};
use retrace_lib::{
    daemon::Daemon, slim::Slim, Context, Extractor, HistorySource, LayerPolicy, Platform, Resolver,
    Rules,
};
use tap::Pipe;
use tracing::info;

/// How images are resolved and their history reconstructed.
#[derive(Debug, Clone, Parser)]
pub struct EngineOptions {
    /// Platform to request when pulling a missing image (e.g. linux/amd64)
    ///
    /// When unset the daemon picks the platform it runs on.
    #[arg(long, env = "RETRACE_PLATFORM", value_parser = Platform::from_str)]
    platform: Option<Platform>,

    /// How many times a pull failing with a transient error is retried
    #[arg(long, env = "RETRACE_PULL_RETRIES", default_value_t = Resolver::DEFAULT_RETRIES)]
    pull_retries: usize,

    /// Milliseconds to wait before the first pull retry; doubles for each retry after it
    #[arg(long, env = "RETRACE_PULL_BACKOFF_MS", default_value = "500")]
    pull_backoff_ms: u64,

    /// Don't present credentials from the local Docker configuration when pulling
    #[arg(long, env = "RETRACE_ANONYMOUS")]
    anonymous: bool,

    /// What to emit for history entries that don't map to an instruction
    #[arg(long, env = "RETRACE_LAYER_POLICY", default_value = "comment", value_parser = LayerPolicy::from_str)]
    layer_policy: LayerPolicy,

    /// JSON file of rules mapping history commands to instructions
    ///
    /// The file holds an array of `{"name", "pattern", "replacement"}` objects
    /// and replaces the built-in rules entirely. Rules are tried in order.
    #[arg(long, env = "RETRACE_RULES")]
    rules: Option<PathBuf>,

    /// Where image history is read from
    #[arg(long, env = "RETRACE_HISTORY_SOURCE", value_enum, default_value = "daemon")]
    history_source: Source,

    /// The `slim` executable used when history is read with slim
    #[arg(long, env = "RETRACE_SLIM_BINARY", default_value = Slim::DEFAULT_BINARY)]
    slim_binary: String,
}

#[derive(Copy, Clone, Debug, Default, ValueEnum)]
pub enum Source {
    /// The Docker daemon's image history
    #[default]
    Daemon,

    /// The `slim xray` report
    Slim,
}

impl EngineOptions {
    /// Connect to the daemon and assemble everything a diff request needs.
    #[tracing::instrument(skip(self))]
    pub async fn context(&self) -> Result<Context> {
        let daemon = Daemon::builder()
            .authenticate(!self.anonymous)
            .build()
            .await
            .context("connect to docker daemon")?
            .pipe(Arc::new);

        let rules = match &self.rules {
            Some(path) => Rules::load(path).await.context("load rules")?,
            None => Rules::default(),
        };

        let source: Arc<dyn HistorySource> = match self.history_source {
            Source::Daemon => daemon.clone(),
            Source::Slim => Arc::new(Slim::builder().binary(self.slim_binary.as_str()).build()),
        };
        info!(source = ?self.history_source, policy = %self.layer_policy, "configured history");

        let resolver = Resolver::builder()
            .engine(daemon)
            .maybe_platform(self.platform.clone())
            .retries(self.pull_retries)
            .backoff(Duration::from_millis(self.pull_backoff_ms))
            .build();
        let extractor = Extractor::builder()
            .source(source)
            .rules(rules)
            .policy(self.layer_policy)
            .build();

        Ok(Context::builder()
            .resolver(resolver)
            .extractor(extractor)
            .build())
    }
}
