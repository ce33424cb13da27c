//! Health service implementation.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, error, instrument};

use super::proto::gatehouse::v1 as pb;
use super::proto::gatehouse::v1::health_service_server::HealthService;
use super::timestamp;
use crate::error::GatehouseError;
use crate::health::HealthSupervisor;
use crate::metrics::GatehouseMetrics;

/// Implementation of the HealthService gRPC interface.
///
/// Everything except `ServiceHealth` answers from the supervisor's cached
/// snapshot and never probes a backend.
pub struct HealthServiceImpl {
    supervisor: HealthSupervisor,
    metrics: Option<Arc<GatehouseMetrics>>,
}

impl HealthServiceImpl {
    pub fn new(supervisor: HealthSupervisor) -> Self {
        Self {
            supervisor,
            metrics: None,
        }
    }

    /// Serve `Metrics` from the given registry.
    pub fn with_metrics(mut self, metrics: Arc<GatehouseMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[tonic::async_trait]
impl HealthService for HealthServiceImpl {
    async fn liveness(
        &self,
        _request: Request<pb::LivenessRequest>,
    ) -> Result<Response<pb::LivenessResponse>, Status> {
        let report = self.supervisor.liveness();
        Ok(Response::new(pb::LivenessResponse {
            status: report.status.to_string(),
            service: report.service.to_string(),
            version: report.version.to_string(),
            timestamp: Some(timestamp(report.timestamp)),
        }))
    }

    #[instrument(skip(self, _request))]
    async fn readiness(
        &self,
        _request: Request<pb::ReadinessRequest>,
    ) -> Result<Response<pb::ReadinessResponse>, Status> {
        let report = self.supervisor.readiness();

        let mut components: std::collections::HashMap<String, String> = report
            .components
            .iter()
            .map(|(name, state)| (name.clone(), state.to_string()))
            .collect();
        components.insert("health_check".to_string(), report.sweep.as_str().to_string());

        debug!(ready = report.ready, sweep = report.sweep.as_str(), "Readiness evaluated");

        Ok(Response::new(pb::ReadinessResponse {
            ready: report.ready,
            status: report.status.to_string(),
            status_code: u32::from(report.status_code()),
            components,
            last_check: report.last_check.map(timestamp),
            timestamp: Some(timestamp(report.timestamp)),
        }))
    }

    #[instrument(skip(self, request), fields(service = %request.get_ref().service))]
    async fn service_health(
        &self,
        request: Request<pb::ServiceHealthRequest>,
    ) -> Result<Response<pb::ServiceHealthResponse>, Status> {
        let req = request.into_inner();
        if req.service.is_empty() {
            return Err(Status::invalid_argument("service is required"));
        }

        let report = self
            .supervisor
            .check_service(&req.service)
            .await
            .map_err(|e| match e {
                GatehouseError::ServiceNotFound(name) => {
                    Status::not_found(format!("service '{}' not found", name))
                }
                other => Status::internal(other.to_string()),
            })?;

        Ok(Response::new(pb::ServiceHealthResponse {
            service: report.service.clone(),
            healthy: report.healthy,
            status: report.status().to_string(),
            status_code: u32::from(report.status_code()),
            error: report.error.clone().unwrap_or_default(),
            timestamp: Some(timestamp(report.timestamp)),
        }))
    }

    async fn services_status(
        &self,
        _request: Request<pb::ServicesStatusRequest>,
    ) -> Result<Response<pb::ServicesStatusResponse>, Status> {
        let report = self.supervisor.services_status();

        let services = report
            .services
            .iter()
            .map(|(name, status)| {
                (
                    name.clone(),
                    pb::ServiceEntry {
                        status: status.state.to_string(),
                        checked_at: status.checked_at.map(timestamp),
                    },
                )
            })
            .collect();

        Ok(Response::new(pb::ServicesStatusResponse {
            services,
            total: report.total as u32,
            healthy: report.healthy as u32,
            unhealthy: report.unhealthy as u32,
            last_check: report.last_check.map(timestamp),
            timestamp: Some(timestamp(report.timestamp)),
        }))
    }

    async fn metrics(
        &self,
        _request: Request<pb::MetricsRequest>,
    ) -> Result<Response<pb::MetricsResponse>, Status> {
        let text = match &self.metrics {
            Some(metrics) => metrics.encode().map_err(|e| {
                error!(error = %e, "Failed to encode metrics");
                Status::internal(e.to_string())
            })?,
            None => String::new(),
        };

        Ok(Response::new(pb::MetricsResponse { text }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{ProbeError, ServiceProber, SupervisorConfig};
    use crate::ratelimit::KeyKind;
    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    /// Healthy unless the service name starts with "down".
    struct NameProber;

    #[async_trait]
    impl ServiceProber for NameProber {
        async fn probe(&self, service: &str) -> std::result::Result<(), ProbeError> {
            if service.starts_with("down") {
                Err(ProbeError::UnexpectedStatus(503))
            } else {
                Ok(())
            }
        }
    }

    fn service(names: &[&str]) -> HealthServiceImpl {
        let supervisor = HealthSupervisor::new(
            names.iter().copied(),
            Arc::new(NameProber),
            SupervisorConfig::default(),
        );
        HealthServiceImpl::new(supervisor)
    }

    #[tokio::test]
    async fn test_liveness() {
        let response = assert_ok!(
            service(&[]).liveness(Request::new(pb::LivenessRequest {})).await
        )
        .into_inner();
        assert_eq!(response.status, "alive");
        assert_eq!(response.service, "gatehouse");
        assert!(response.timestamp.is_some());
    }

    #[tokio::test]
    async fn test_readiness_before_and_after_sweep() {
        let service = service(&["iam", "tenant"]);

        let response = assert_ok!(
            service.readiness(Request::new(pb::ReadinessRequest {})).await
        )
        .into_inner();
        assert!(!response.ready);
        assert_eq!(response.status_code, 503);
        assert_eq!(response.components["health_check"], "never");
        assert_eq!(response.components["iam"], "unknown");
        assert!(response.last_check.is_none());

        service.supervisor.sweep_once().await;

        let response = assert_ok!(
            service.readiness(Request::new(pb::ReadinessRequest {})).await
        )
        .into_inner();
        assert!(response.ready);
        assert_eq!(response.status, "ready");
        assert_eq!(response.status_code, 200);
        assert_eq!(response.components["health_check"], "current");
        assert_eq!(response.components["tenant"], "healthy");
        assert!(response.last_check.is_some());
    }

    #[tokio::test]
    async fn test_service_health() {
        let service = service(&["iam", "down-tenant"]);

        let request = Request::new(pb::ServiceHealthRequest {
            service: "down-tenant".to_string(),
        });
        let response = assert_ok!(service.service_health(request).await).into_inner();
        assert!(!response.healthy);
        assert_eq!(response.status, "unhealthy");
        assert_eq!(response.status_code, 503);
        assert!(!response.error.is_empty());

        let request = Request::new(pb::ServiceHealthRequest {
            service: "billing".to_string(),
        });
        let status = assert_err!(service.service_health(request).await);
        assert_eq!(status.code(), tonic::Code::NotFound);

        let request = Request::new(pb::ServiceHealthRequest {
            service: String::new(),
        });
        let status = assert_err!(service.service_health(request).await);
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_services_status() {
        let service = service(&["iam", "project", "down-tenant"]);
        service.supervisor.sweep_once().await;

        let response = assert_ok!(
            service
                .services_status(Request::new(pb::ServicesStatusRequest {}))
                .await
        )
        .into_inner();
        assert_eq!(response.total, 3);
        assert_eq!(response.healthy, 2);
        assert_eq!(response.unhealthy, 1);
        assert_eq!(response.services["down-tenant"].status, "unhealthy");
        assert!(response.services["iam"].checked_at.is_some());
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let metrics = Arc::new(GatehouseMetrics::new().unwrap());
        let supervisor = HealthSupervisor::new(
            ["iam", "down-tenant"],
            Arc::new(NameProber),
            SupervisorConfig::default(),
        )
        .with_metrics(metrics.clone());
        let service = HealthServiceImpl::new(supervisor).with_metrics(metrics.clone());

        metrics.record_decision(KeyKind::Ip, false);
        service.supervisor.sweep_once().await;

        let response = assert_ok!(service.metrics(Request::new(pb::MetricsRequest {})).await)
            .into_inner();
        assert!(response.text.contains("gatehouse_rate_limit_blocks_total{key_type=\"ip\"} 1"));
        assert!(response.text.contains("gatehouse_service_health{service=\"iam\"} 1"));
        assert!(response.text.contains("gatehouse_service_health{service=\"down-tenant\"} 0"));
    }

    #[tokio::test]
    async fn test_metrics_without_registry_is_empty() {
        let response = assert_ok!(
            service(&["iam"]).metrics(Request::new(pb::MetricsRequest {})).await
        )
        .into_inner();
        assert!(response.text.is_empty());
    }
}
