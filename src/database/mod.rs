use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::info;

use crate::config::settings::DatabaseSettings;

/// One pooled connection per writer plus headroom for startup loads.
const MAX_CONNECTIONS: u32 = 12;

pub async fn init_pool(config: &DatabaseSettings) -> Result<PgPool, sqlx::Error> {
    let options = PgConnectOptions::new()
        .host(&config.host)
        .username(&config.user)
        .password(&config.password)
        .database(&config.name);

    info!(host = %config.host, user = %config.user, db = %config.name, "connecting to lease database");
    PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
}

/// Creates the lease table on first start; subsequent starts are no-ops.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS zc_lease4 (
            address BIGINT NOT NULL UNIQUE,
            state INT NOT NULL DEFAULT 0,
            valid_life_time BIGINT NOT NULL DEFAULT 0,
            client_id TEXT NOT NULL DEFAULT '',
            subnet_id BIGINT NOT NULL,
            expire TIMESTAMPTZ NOT NULL,
            host_name TEXT NOT NULL DEFAULT '',
            mac TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS zc_lease4_subnet_id ON zc_lease4 (subnet_id)")
        .execute(pool)
        .await?;

    Ok(())
}
