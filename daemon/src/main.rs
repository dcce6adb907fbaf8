mod cli;
mod events;
mod modbus;
mod regulator;
mod service;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    service::run(cli::Args::parse()).await
}
