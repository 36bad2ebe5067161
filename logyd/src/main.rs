use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    logyd::cli::execute().await
}
