//! Worker binary: polls the durable queue and drives run executions.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use drover::connections::{StoreTaskCompletionService, StoredCredentialResolver};
use drover::store::CoordinatorStore;
use drover::telemetry::TracingEventSink;
use drover::worker::WorkerConfig;
use drover::{
    Config, ExecuteDriver, HttpEndpointGateway, LoggingNotifier, PostgresStore, PreprocessDriver,
    QueueWorker, YieldCoordinator,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;

    let store = Arc::new(PostgresStore::connect(&config.database_url).await?);
    store.migrate().await?;
    let store: Arc<dyn CoordinatorStore> = store;

    let gateway = Arc::new(HttpEndpointGateway::new(config.endpoint_timeout)?);
    let yields = Arc::new(YieldCoordinator::new(store.clone()));
    let telemetry = Arc::new(TracingEventSink);

    let preprocess = Arc::new(PreprocessDriver::new(store.clone(), gateway.clone()));
    let execute = Arc::new(ExecuteDriver::new(
        store.clone(),
        gateway,
        Arc::new(StoredCredentialResolver),
        Arc::new(StoreTaskCompletionService::new(store.clone())),
        telemetry,
        yields,
        config.accept_deprecated_resume,
    ));

    let worker = QueueWorker::start(
        WorkerConfig {
            poll_interval: config.poll_interval,
            batch_size: config.batch_size,
            max_concurrent: config.max_concurrent,
            ..WorkerConfig::default()
        },
        store,
        preprocess,
        execute,
        Arc::new(LoggingNotifier),
    );

    info!("drover worker started");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    worker.shutdown().await;
    Ok(())
}
