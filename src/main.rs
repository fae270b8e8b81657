mod agent;
mod cli;
mod command;
mod config;
mod context;
mod dataset;
mod error;
mod llm;
mod logger;
mod prompts;
mod replay;
mod reward;
mod runner;
mod sandbox;
mod scoring;
mod task;
mod tools;
mod trajectory;

use anyhow::Result;
use tracing::{error, info};

fn main() -> Result<()> {
    logger::init()?;
    info!(args = ?std::env::args().collect::<Vec<_>>(), "agentbox start");

    match cli::run() {
        Ok(result) => {
            info!("agentbox finished successfully");
            Ok(result)
        }
        Err(err) => {
            error!(error = ?err, "agentbox failed");
            Err(err)
        }
    }
}
