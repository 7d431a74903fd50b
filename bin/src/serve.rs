use std::{path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    eyre::{bail, Context, Result},
    Section, SectionExt,
};
use derive_more::Display;
use retrace_lib::http::router;
use tap::Pipe;
use tracing::{debug, info, warn};

use crate::engine::EngineOptions;

/// The socket Docker Desktop proxies extension backend requests to.
const DEFAULT_SOCKET: &str = "/run/guest-services/backend.sock";

#[derive(Debug, Parser)]
pub struct Options {
    /// Where to listen for requests
    ///
    /// Either a Unix socket path (optionally prefixed with `unix://`)
    /// or a TCP address prefixed with `tcp://` (e.g. tcp://127.0.0.1:8080).
    /// A stale socket file left at the path is removed before binding.
    #[arg(long, alias = "socket", env = "RETRACE_LISTEN", default_value = DEFAULT_SOCKET, value_parser = Listen::from_str)]
    listen: Listen,

    /// Seconds a diff request may run before it is abandoned
    #[arg(long, env = "RETRACE_REQUEST_TIMEOUT_SECS", default_value = "600")]
    request_timeout_secs: u64,

    #[clap(flatten)]
    engine: EngineOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Listen {
    #[display("unix://{}", _0.display())]
    Unix(PathBuf),

    #[display("tcp://{_0}")]
    Tcp(String),
}

impl FromStr for Listen {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let listen = if let Some(address) = s.strip_prefix("tcp://") {
            Listen::Tcp(address.to_string())
        } else {
            s.strip_prefix("unix://")
                .unwrap_or(s)
                .pipe(PathBuf::from)
                .pipe(Listen::Unix)
        };

        let empty = match &listen {
            Listen::Tcp(address) => address.is_empty(),
            Listen::Unix(path) => path.as_os_str().is_empty(),
        };
        if empty {
            bail!("listen address is empty");
        }
        Ok(listen)
    }
}

#[tracing::instrument]
pub async fn main(opts: Options) -> Result<()> {
    let context = opts.engine.context().await?.pipe(Arc::new);
    let timeout = Duration::from_secs(opts.request_timeout_secs);
    let app = router(context, timeout);

    match opts.listen {
        Listen::Tcp(address) => {
            let listener = tokio::net::TcpListener::bind(&address)
                .await
                .context("bind tcp listener")
                .with_section(|| address.clone().header("Address:"))?;
            info!(%address, ?timeout, "listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown())
                .await
                .context("serve requests")?;
        }
        #[cfg(unix)]
        Listen::Unix(path) => {
            remove_socket(&path).await?;
            let listener = tokio::net::UnixListener::bind(&path)
                .context("bind unix socket")
                .with_section(|| path.display().to_string().header("Socket path:"))?;
            info!(path = %path.display(), ?timeout, "listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown())
                .await
                .context("serve requests")?;
            remove_socket(&path).await?;
        }
        #[cfg(not(unix))]
        Listen::Unix(path) => {
            bail!("unix sockets are not supported on this platform: {}", path.display())
        }
    }

    info!("server stopped");
    Ok(())
}

#[cfg(unix)]
async fn remove_socket(path: &std::path::Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "removed socket file");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err)
            .context("remove stale socket")
            .with_section(|| path.display().to_string().header("Socket path:")),
    }
}

async fn shutdown() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(?err, "unable to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
