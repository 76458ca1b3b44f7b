use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    racksync::run().await
}
