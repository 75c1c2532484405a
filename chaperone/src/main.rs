mod admin;
mod codec;
mod config;
mod health;
mod k8s;
mod logging;
mod orchestrator;
mod process;
mod reload;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let config = config::Config::parse();

    if let Err(err) = orchestrator::run(config).await {
        tracing::error!(target: "chaperone", %err, "chaperone exiting with an error");
        std::process::exit(1);
    }

    Ok(())
}
