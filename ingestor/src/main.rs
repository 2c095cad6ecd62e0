use anyhow::Context;
use axum::{routing::get, Router};
use sensor_ingestor::accounts::AccountService;
use sensor_ingestor::auth::CredentialService;
use sensor_ingestor::config::{Config, StorageBackend};
use sensor_ingestor::db::{make_pool, PgStore};
use sensor_ingestor::ingest::Pipeline;
use sensor_ingestor::memory::MemoryStore;
use sensor_ingestor::metrics;
use sensor_ingestor::mqtt::{run_mqtt, MqttSettings};
use sensor_ingestor::query::QueryGateway;
use sensor_ingestor::registry::DeviceRegistry;
use sensor_ingestor::rest::{self, AppState};
use sensor_ingestor::store::SharedStore;
use sensor_ingestor::validate::Validator;
use sensor_ingestor::workers::{spawn_workers, WorkerSettings};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let config = Config::from_env().context("invalid configuration")?;

    info!("Starting sensor ingestor");
    info!("MQTT broker: {}:{} topic {}", config.mqtt_broker, config.mqtt_port, config.mqtt_topic);
    info!("HTTP server: {}", config.http_addr);
    info!("Unregistered device policy: {:?}", config.unregistered_policy);

    metrics::init_metrics().context("failed to register metrics")?;

    let store: SharedStore = match config.storage_backend {
        StorageBackend::Postgres => {
            info!("Database: {}", config.database_url.split('@').last().unwrap_or("***"));
            let pool = make_pool(&config.database_url, config.storage_timeout)
                .await
                .context("failed to connect to database")?;
            Arc::new(PgStore::new(pool, config.storage_timeout))
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage, data is lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    let credentials = CredentialService::new(config.jwt_key.clone(), config.token_ttl_hours);
    if config.jwt_key.is_none() {
        warn!("JWT_KEY is not set, login and registration will fail to issue tokens");
    }

    let mut registry = DeviceRegistry::new(store.clone(), config.unregistered_policy);
    if config.device_cache {
        registry = registry.with_cache_capacity(config.device_cache_capacity);
    }
    let registry = Arc::new(registry);

    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        registry.clone(),
        Validator::default(),
    ));

    let (dispatcher, worker_handles) = spawn_workers(
        pipeline,
        WorkerSettings {
            workers: config.ingest_workers,
            channel_capacity: config.channel_capacity,
            max_batch: config.batch_size,
            max_wait_ms: config.batch_timeout_ms,
        },
    );

    let mqtt_settings = MqttSettings {
        broker: config.mqtt_broker.clone(),
        port: config.mqtt_port,
        client_id: format!("{}-{}", config.mqtt_client_prefix, uuid::Uuid::new_v4()),
        topic: config.mqtt_topic.clone(),
    };
    let mut mqtt_handle = tokio::spawn(async move {
        if let Err(e) = run_mqtt(mqtt_settings, dispatcher).await {
            error!("MQTT task failed: {}", e);
        }
    });

    // Build HTTP app with REST API and metrics endpoint
    let state = AppState {
        accounts: Arc::new(AccountService::new(store.clone(), credentials)),
        registry,
        query: QueryGateway::new(store),
    };
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(state));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    let mut server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = &mut mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = &mut server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    // Stopping the consumer drops the dispatcher, which lets workers flush
    // their buffers and exit.
    mqtt_handle.abort();
    server_handle.abort();

    let drain = async {
        for handle in worker_handles {
            if let Err(e) = handle.await {
                error!("Ingestion worker failed: {}", e);
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Workers did not finish within {:?}", SHUTDOWN_GRACE);
    }

    info!("Shutting down");
    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
