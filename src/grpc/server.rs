//! gRPC server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tonic::transport::Server;
use tracing::{error, info};

use super::admission::AdmissionServiceImpl;
use super::health::HealthServiceImpl;
use super::proto::gatehouse::v1::admission_service_server::AdmissionServiceServer;
use super::proto::gatehouse::v1::health_service_server::HealthServiceServer;
use crate::error::{GatehouseError, Result};
use crate::health::HealthSupervisor;
use crate::metrics::GatehouseMetrics;
use crate::ratelimit::RateLimiter;

/// gRPC server for the admission and health services.
pub struct GrpcServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Rate limiter, absent when rate limiting is disabled
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    supervisor: HealthSupervisor,
    /// Registry served by `HealthService/Metrics`
    metrics: Option<Arc<GatehouseMetrics>>,
}

impl GrpcServer {
    /// Create a server that only answers health queries.
    pub fn new(addr: SocketAddr, supervisor: HealthSupervisor) -> Self {
        Self {
            addr,
            rate_limiter: None,
            supervisor,
            metrics: None,
        }
    }

    /// Also serve admission decisions from the given limiter.
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Export the given registry over `HealthService/Metrics`.
    pub fn with_metrics(mut self, metrics: Arc<GatehouseMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let admission = self
            .rate_limiter
            .map(|limiter| AdmissionServiceServer::new(AdmissionServiceImpl::new(limiter)));

        info!(
            addr = %self.addr,
            admission = admission.is_some(),
            "Starting gRPC server with graceful shutdown"
        );

        let mut health = HealthServiceImpl::new(self.supervisor);
        if let Some(metrics) = self.metrics {
            health = health.with_metrics(metrics);
        }

        Server::builder()
            .add_service(HealthServiceServer::new(health))
            .add_optional_service(admission)
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                GatehouseError::Grpc(e)
            })
    }
}
