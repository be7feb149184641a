// Declare the modules
pub mod annotate;
pub mod api;
pub mod capture;
pub mod chat;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod image_data;
pub mod models;
pub mod region;
pub mod state;
pub mod storage;

use clap::Parser;

pub use chat::{ConversationAssembler, OutgoingMessage, TurnEvent, TurnOutcome, TurnStatus};
pub use error::{ConnectorError, TurnError};

/// Entry point for the `screenai` binary.
pub async fn run() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let cli = cli::Cli::parse();
    log::debug!("Running command: {:?}", cli.command);
    cli::run(cli).await
}
