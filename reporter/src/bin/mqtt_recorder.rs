use clap::Parser;

use regulator_reporter::recorder::{self, Args};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    recorder::run(Args::parse()).await
}
