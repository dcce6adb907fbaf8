#[tokio::main]
async fn main() -> anyhow::Result<()> {
    regulator_reporter::publisher::run().await
}
