#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ada::cli::run().await
}
