use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::{
    application::{
        capture::CaptureService,
        invoker::Invoker,
        worker_pool::{RunRequest, WorkerPool},
    },
    config::{PersistorConfig, SourceConfig, StorageConfig, MAX_WORKERS},
    domain::{
        error::PersistorError,
        models::{InvocationRequest, Message},
        ports::{BlobStore, FunctionClient, SourceConnector},
    },
    infrastructure::{
        fs_store::FsBlobStore, http_function_client::HttpFunctionClient, jetstream_source::JetStreamConnector,
        s3_store::S3BlobStore, sqs_source::SqsConnector,
    },
};

impl PersistorError {
    fn status_code(&self) -> StatusCode {
        match self {
            PersistorError::Config(_) => StatusCode::BAD_REQUEST,
            PersistorError::SourceUnavailable(_) | PersistorError::FunctionRequest(_) => StatusCode::BAD_GATEWAY,
            PersistorError::PullTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PersistorError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status_code(), body).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct PersistParams {
    #[serde(rename = "N")]
    workers: Option<usize>,
    batch_store_size: Option<usize>,
    once: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct InvokeParams {
    #[serde(rename = "N")]
    calls: Option<usize>,
    #[serde(rename = "N_per_func")]
    workers_per_call: Option<usize>,
    batch_store_size: Option<usize>,
}

/// Wires the configured source, store and function client behind the HTTP entry points.
pub struct PersistorService {
    listen_addr: String,
    pool: Arc<WorkerPool>,
    capture: CaptureService,
    invoker: Option<Invoker>,
}

impl PersistorService {
    pub async fn new(config: PersistorConfig) -> Result<Self, PersistorError> {
        debug!("Initializing persistor service");

        let needs_aws = matches!(config.source, SourceConfig::Sqs { .. }) || config.storage == StorageConfig::S3;
        let aws_config = if needs_aws {
            debug!("Loading AWS configuration");
            let mut builder = aws_config::defaults(aws_config::BehaviorVersion::latest());
            if let Some(endpoint_url) = &config.aws_endpoint_url {
                info!("Using custom AWS endpoint: {}", endpoint_url);
                builder = builder.endpoint_url(endpoint_url);
            }
            let aws_config = builder.load().await;
            debug!("AWS region: {:?}", aws_config.region());
            Some(aws_config)
        } else {
            None
        };

        let connector: Arc<dyn SourceConnector> = match (&config.source, &aws_config) {
            (SourceConfig::Sqs { queue_url }, Some(aws)) => {
                info!("Using SQS queue: {}", queue_url);
                Arc::new(SqsConnector::new(aws_sdk_sqs::Client::new(aws), queue_url.clone()))
            }
            (SourceConfig::JetStream { url, stream, consumer_group }, _) => {
                info!("Using JetStream stream {} at {}", stream, url);
                Arc::new(JetStreamConnector::new(url.clone(), stream.clone(), consumer_group.clone()))
            }
            (SourceConfig::Sqs { .. }, None) => {
                return Err(PersistorError::Config("SQS source without AWS configuration".to_string()))
            }
        };

        let store: Arc<dyn BlobStore> = match (&config.storage, &aws_config) {
            (StorageConfig::S3, Some(aws)) => {
                let mut s3_config = aws_sdk_s3::config::Builder::from(aws);
                // Path-style addressing for local S3 endpoints.
                if config.aws_endpoint_url.is_some() {
                    s3_config = s3_config.force_path_style(true);
                }
                info!("Storing to S3 bucket {}", config.container);
                Arc::new(S3BlobStore::new(aws_sdk_s3::Client::from_conf(s3_config.build())))
            }
            (StorageConfig::Filesystem { root }, _) => {
                info!("Storing to {}/{}", root.display(), config.container);
                Arc::new(FsBlobStore::new(root.clone()))
            }
            (StorageConfig::S3, None) => {
                return Err(PersistorError::Config("S3 storage without AWS configuration".to_string()))
            }
        };

        let client: Option<Arc<dyn FunctionClient>> = match &config.function_url {
            Some(url) => {
                info!("Invoker calls {}", url);
                Some(Arc::new(HttpFunctionClient::new(url.clone())?))
            }
            None => None,
        };

        debug!("Persistor service initialization complete");
        Ok(Self::with_components(&config, connector, store, client))
    }

    /// Builds the service around already constructed capabilities.
    pub fn with_components(
        config: &PersistorConfig,
        connector: Arc<dyn SourceConnector>,
        store: Arc<dyn BlobStore>,
        client: Option<Arc<dyn FunctionClient>>,
    ) -> Self {
        Self {
            listen_addr: config.listen_addr.clone(),
            pool: Arc::new(WorkerPool::from_config(config, connector, store.clone())),
            capture: CaptureService::from_config(config, store),
            invoker: client.map(|client| Invoker::new(client, config.invoker_settings())),
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/api/persist", get(persist))
            .route("/api/invoke", get(invoke))
            .route("/api/capture", post(capture))
            .route("/health", get(|| async { "ok" }))
            .with_state(Arc::new(self))
    }

    pub async fn run(self) -> Result<(), PersistorError> {
        let listener = TcpListener::bind(&self.listen_addr).await.map_err(|e| {
            error!("Failed to bind {}: {}", self.listen_addr, e);
            PersistorError::Config(format!("Cannot listen on {}: {}", self.listen_addr, e))
        })?;
        info!("🚀 Listening on {}", self.listen_addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| PersistorError::Config(format!("HTTP server failed: {}", e)))
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn persist(
    State(service): State<Arc<PersistorService>>,
    Query(params): Query<PersistParams>,
) -> Result<Response, PersistorError> {
    let request = RunRequest {
        workers: params.workers,
        max_batch_size: params.batch_store_size,
        once: params.once.unwrap_or(false),
    };

    // A detached task keeps running when the caller stops waiting.
    let pool = service.pool.clone();
    let summary = match tokio::spawn(async move { pool.run(request).await }).await {
        Ok(summary) => summary,
        Err(e) => {
            error!("Invocation task failed: {}", e);
            return Ok((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response());
        }
    };

    let status = if summary.all_succeeded() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(summary)).into_response())
}

async fn invoke(
    State(service): State<Arc<PersistorService>>,
    Query(params): Query<InvokeParams>,
) -> Result<Response, PersistorError> {
    let invoker = service.invoker.as_ref().ok_or_else(|| {
        PersistorError::Config("No function to invoke given (FUNC_TO_INVOKE is not set)".to_string())
    })?;

    let request = InvocationRequest {
        workers_per_call: params.workers_per_call.unwrap_or(1).clamp(1, MAX_WORKERS),
        batch_store_size: params.batch_store_size,
        once: true,
    };
    let summary = invoker.invoke(params.calls.unwrap_or(1), request).await;

    let status = if summary.failed == 0 {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(summary)).into_response())
}

async fn capture(
    State(service): State<Arc<PersistorService>>,
    Json(messages): Json<Vec<Message>>,
) -> Result<Response, PersistorError> {
    let count = messages.len();
    let report = service.capture.capture(messages).await?;
    let body = serde_json::json!({
        "messages_persisted": count,
        "blob": report.map(|r| r.target.path()),
    });
    Ok(Json(body).into_response())
}
