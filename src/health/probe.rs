//! Single-service health probes.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::trace;

use crate::config::ServiceConfig;
use crate::error::{GatehouseError, Result};

/// Why a backend was judged unhealthy.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("service '{0}' not configured")]
    NotConfigured(String),

    #[error("health request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("health check failed with status {0}")]
    UnexpectedStatus(u16),

    #[error("health check timed out after {0:?}")]
    Timeout(Duration),

    #[error("health probe panicked")]
    Panicked,
}

/// Checks whether one backend service is healthy.
#[async_trait]
pub trait ServiceProber: Send + Sync {
    /// Probe the named service, returning `Ok(())` when it is healthy.
    async fn probe(&self, service: &str) -> std::result::Result<(), ProbeError>;
}

/// Probes services by issuing `GET {url}{health_endpoint}` and expecting 200.
pub struct HttpProber {
    client: reqwest::Client,
    services: BTreeMap<String, ServiceConfig>,
}

impl HttpProber {
    pub fn new(services: BTreeMap<String, ServiceConfig>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GatehouseError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, services })
    }
}

#[async_trait]
impl ServiceProber for HttpProber {
    async fn probe(&self, service: &str) -> std::result::Result<(), ProbeError> {
        let config = self
            .services
            .get(service)
            .ok_or_else(|| ProbeError::NotConfigured(service.to_string()))?;

        let url = config.health_url();
        trace!(service = %service, url = %url, "Probing service");

        let response = self
            .client
            .get(&url)
            .timeout(config.timeout())
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(ProbeError::UnexpectedStatus(status.as_u16())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve a fixed HTTP status line to every connection.
    async fn serve_status(status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    status
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });

        format!("http://{}", addr)
    }

    fn service(url: String) -> ServiceConfig {
        ServiceConfig {
            url,
            health_endpoint: "/health".to_string(),
            timeout_secs: 2,
        }
    }

    #[tokio::test]
    async fn test_healthy_service() {
        let url = serve_status("200 OK").await;
        let prober = HttpProber::new(BTreeMap::from([("iam".to_string(), service(url))])).unwrap();

        assert!(prober.probe("iam").await.is_ok());
    }

    #[tokio::test]
    async fn test_non_200_is_unhealthy() {
        let url = serve_status("503 Service Unavailable").await;
        let prober = HttpProber::new(BTreeMap::from([("iam".to_string(), service(url))])).unwrap();

        let err = prober.probe("iam").await.unwrap_err();
        assert!(matches!(err, ProbeError::UnexpectedStatus(503)));
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        // Bind and drop to get a port nothing listens on
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let prober = HttpProber::new(BTreeMap::from([(
            "tenant".to_string(),
            service(format!("http://{}", addr)),
        )]))
        .unwrap();

        let err = prober.probe("tenant").await.unwrap_err();
        assert!(matches!(err, ProbeError::Request(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_service() {
        let prober = HttpProber::new(BTreeMap::new()).unwrap();
        let err = prober.probe("missing").await.unwrap_err();
        assert!(matches!(err, ProbeError::NotConfigured(name) if name == "missing"));
    }
}
