use std::sync::Arc;

use conduit_control::{config::ControlConfig, routes, state::AppState};
use conduit_db::DbStore;
use sea_orm_migration::MigratorTrait;

async fn init_store() -> anyhow::Result<DbStore> {
    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL is required"))?;
    let db = conduit_db::connect(&database_url).await?;

    // Idempotent.
    conduit_migration::Migrator::up(&db, None).await?;
    Ok(DbStore::new(db))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "install ctrl-c handler");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ControlConfig::from_env()?;
    let addr = config.listen_addr;
    let store = Arc::new(init_store().await?);
    let state = AppState::new(config, store)?;

    let app = routes::router(state.clone());
    tracing::info!(%addr, replica_id = %state.config.replica_id, "conduit-control HTTP listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutting down");
            shutdown.cancel();
        })
        .await?;

    state.close().await;
    Ok(())
}
