use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::domain::{
    error::PersistorError,
    models::{FunctionResponse, InvocationRequest},
    ports::FunctionClient,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Calls the persist endpoint of another instance over HTTP.
///
/// Requests carry no overall timeout: the invoker stops waiting on its own, and the
/// request is left to finish so the remote side keeps running.
pub struct HttpFunctionClient {
    client: Client,
    url: String,
}

impl HttpFunctionClient {
    pub fn new(url: impl Into<String>) -> Result<Self, PersistorError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| PersistorError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

fn query(request: &InvocationRequest) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("N", request.workers_per_call.to_string()),
        ("once", request.once.to_string()),
    ];
    if let Some(size) = request.batch_store_size {
        query.push(("batch_store_size", size.to_string()));
    }
    query
}

#[async_trait]
impl FunctionClient for HttpFunctionClient {
    async fn invoke(&self, request: &InvocationRequest) -> Result<FunctionResponse, PersistorError> {
        debug!("GET {} {:?}", self.url, request);
        let response = self
            .client
            .get(&self.url)
            .query(&query(request))
            .send()
            .await
            .map_err(|e| PersistorError::FunctionRequest(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| PersistorError::FunctionRequest(e.to_string()))?;
        Ok(FunctionResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    #[tokio::test]
    async fn sends_worker_count_and_batch_size() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/persist")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("N".into(), "2".into()),
                Matcher::UrlEncoded("once".into(), "true".into()),
                Matcher::UrlEncoded("batch_store_size".into(), "50".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"workers":2,"succeeded":2,"failed":0,"messages_persisted":7,"outcomes":[]}"#)
            .expect(1)
            .create_async()
            .await;

        let client = HttpFunctionClient::new(format!("{}/api/persist", server.url())).unwrap();
        let response = client
            .invoke(&InvocationRequest {
                workers_per_call: 2,
                batch_store_size: Some(50),
                once: true,
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert!(response.is_success());
        assert!(response.body.contains("\"messages_persisted\":7"));
    }

    #[tokio::test]
    async fn error_status_is_returned_not_raised() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/persist")
            .match_query(Matcher::Any)
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let client = HttpFunctionClient::new(format!("{}/api/persist", server.url())).unwrap();
        let response = client.invoke(&InvocationRequest::default()).await.unwrap();

        assert_eq!(response.status, 500);
        assert_eq!(response.body, "boom");
    }

    #[tokio::test]
    async fn unreachable_function_is_a_request_error() {
        let client = HttpFunctionClient::new("http://127.0.0.1:1/api/persist").unwrap();
        let result = client.invoke(&InvocationRequest::default()).await;

        assert!(matches!(result, Err(PersistorError::FunctionRequest(_))));
    }
}
