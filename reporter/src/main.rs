#[tokio::main]
async fn main() -> anyhow::Result<()> {
    regulator_reporter::reporter::run().await
}
