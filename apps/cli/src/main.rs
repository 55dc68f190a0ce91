//! bbqscan CLI: grocery leaflet product extraction and grill classification.
//!
//! Reads leaflet pages, extracts and cross-validates the advertised products,
//! classifies them into grill categories, and writes CSV result tables.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
