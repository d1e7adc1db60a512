//! Registration Service
//!
//! REST API for device registration + background consumer forwarding them to ingestion

use anyhow::{Context, Result};
use registration_service::{
    create_router, queue, AppState, Config, HttpIngestionClient, IngestionConsumer,
    RegistrationStore,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "registration_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    info!("Starting Registration Service");
    info!("Data directory: {}", config.data_dir.display());
    info!("Topic: {}", config.topic);
    info!("Ingestion endpoint: {}", config.consumer.ingestion_endpoint);

    let store = Arc::new(RegistrationStore::new(config.devices_dir()));

    // One backend for the whole process
    let queue = queue::connect(&config.queue)
        .await
        .context("Failed to initialize queue backend")?;

    let cancel = CancellationToken::new();

    let consumer_handle = if config.consumer_enabled {
        let client = HttpIngestionClient::new(
            config.consumer.ingestion_endpoint.clone(),
            config.consumer.ingestion_timeout,
        )
        .context("Failed to create ingestion client")?;

        let consumer = IngestionConsumer::new(
            store.clone(),
            queue.clone(),
            Arc::new(client),
            config.topic.clone(),
            &config.consumer,
        );

        let cancel = cancel.clone();
        Some(tokio::spawn(async move { consumer.run(cancel).await }))
    } else {
        info!("Consumer disabled; API only");
        None
    };

    let state = AppState::new(store, queue, config.topic.clone());
    let app = create_router(state);

    let addr = config.api_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    info!("Registration Service API running on http://{}", addr);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.cancel();
        })
        .await
        .context("Server error")?;

    // Let an in-flight delivery finish
    cancel.cancel();
    if let Some(handle) = consumer_handle {
        handle.await.context("Consumer task panicked")?;
    }

    Ok(())
}
