use clap::Parser;
use color_eyre::eyre::{Context, Result};
use tracing::info;

use crate::engine::EngineOptions;

#[derive(Debug, Parser)]
pub struct Options {
    /// The first image (e.g. alpine:3.18)
    image1: String,

    /// The second image (e.g. alpine:3.19)
    image2: String,

    #[clap(flatten)]
    engine: EngineOptions,
}

#[tracing::instrument]
pub async fn main(opts: Options) -> Result<()> {
    let context = opts.engine.context().await?;
    let payload = context.diff(&opts.image1, &opts.image2).await?;
    info!("reconstructed both images");

    let rendered = payload.render().context("render payload")?;
    println!("{rendered}");

    Ok(())
}
