use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Connect and bring the schema up to date. Pool sizing comes from
/// configuration: replicas hosting thousands of channels need more
/// connections than a single-host deployment.
#[tracing::instrument(skip(url, max_connections), err)]
pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;
    tracing::info!(max_connections, "postgres pool ready");

    sqlx::migrate!().run(&pool).await?;
    tracing::info!("schema migrations applied");

    Ok(pool)
}
