use blob_persistor::{config::PersistorConfig, http_service::PersistorService};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("blob_persistor=debug".parse()?)
                .add_directive("aws_sdk=warn".parse()?)
                .add_directive("async_nats=info".parse()?),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Starting blob persistor");
    debug!(
        "Environment: PERSISTOR_SOURCE={}, PERSISTOR_STORAGE={}, FUNC_TO_INVOKE={}",
        std::env::var("PERSISTOR_SOURCE").unwrap_or_else(|_| "not set".to_string()),
        std::env::var("PERSISTOR_STORAGE").unwrap_or_else(|_| "not set".to_string()),
        std::env::var("FUNC_TO_INVOKE").unwrap_or_else(|_| "not set".to_string())
    );

    let config = PersistorConfig::from_env()?;
    let service = PersistorService::new(config).await?;
    info!("Persistor service initialized successfully");

    service.run().await?;
    Ok(())
}
