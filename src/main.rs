use std::sync::Arc;

use tokio::sync::watch;

mod backoff;
mod config;
mod error;
mod functions;
mod schema;
mod services;
mod store;

use backoff::RetryConfig;
use config::Config;
use functions::{AppState, Dispatcher, Outbound, RetryScheduler};
use services::{AiService, DeliveryClient, GraphClient, RealAiService};
use store::{MemoryPendingStore, PendingStore, PgPendingStore};

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn PendingStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgPendingStore::connect(url, RetryConfig::STORE_CONNECT).await?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, pending replies are kept in memory only");
            Ok(Arc::new(MemoryPendingStore::new()))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    if config.identity.page_id.is_none() {
        tracing::warn!("BOT_PAGE_ID not set, only the webhook entry id identifies the page's own posts");
    }

    let store = open_store(&config).await?;
    let client: Arc<dyn DeliveryClient> = Arc::new(GraphClient::new(config.graph.clone())?);
    let ai: Arc<dyn AiService> = Arc::new(RealAiService::new(&config.ai)?);

    let dispatcher = Arc::new(Dispatcher::new(
        ai,
        Outbound::new(client.clone(), store.clone()),
        config.identity.clone(),
        config.location_template.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = RetryScheduler::new(client, store.clone(), config.retry.clone());
    let retry_task = tokio::spawn(scheduler.run(shutdown_rx));

    let app = functions::router(AppState::new(config.verify_token.clone(), dispatcher));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(port = config.port, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_tx.send(true).ok();
    if let Err(e) = retry_task.await {
        tracing::error!(error = %e, "retry scheduler task failed");
    }
    store.close().await;
    Ok(())
}
