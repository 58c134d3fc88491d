use portcullis::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    init_tracing(&config);

    let state = AppState::connect(config).await?;
    Server::new(state).serve().await?;

    Ok(())
}
