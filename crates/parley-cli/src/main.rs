mod bootstrap_helpers;
mod cli_args;
mod replay;
mod roster;

use anyhow::{Context, Result};
use clap::Parser;

use crate::bootstrap_helpers::init_tracing;
use crate::cli_args::Cli;
use crate::replay::run_replay;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let summary = run_replay(&cli).await?;
    let rendered =
        serde_json::to_string_pretty(&summary).context("failed to encode replay summary")?;
    println!("{rendered}");
    Ok(())
}
