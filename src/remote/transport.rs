use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Method;

/// What the core hands to the request executor.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: String,
    pub method: Method,
    pub body: Option<String>,
    pub credential: String,
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Executes one authenticated request. An `Err` means the service was not
/// reached; HTTP failures come back as a response with their status.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("ZSESSIONID", &request.credential);

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder
            .send()
            .await
            .with_context(|| format!("{} {} failed", request.method, request.url))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.context("Failed to read response body")?;

        Ok(TransportResponse { status, body })
    }
}
