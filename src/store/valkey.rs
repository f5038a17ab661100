use fred::prelude::*;

/// Clustered-connection pool for the registry, relay pub/sub, and the
/// redis lease backend. `pool_size` is configuration-driven: the control
/// plane wants a handful of connections, a lease poller needs almost none.
#[tracing::instrument(skip(url, pool_size), err)]
pub async fn connect(url: &str, pool_size: usize) -> anyhow::Result<fred::clients::Pool> {
    let config = fred::types::config::Config::from_url(url)?;
    let pool = fred::clients::Pool::new(config, None, None, None, pool_size)?;
    pool.init().await?;

    tracing::info!(pool_size, "valkey pool ready");
    Ok(pool)
}
