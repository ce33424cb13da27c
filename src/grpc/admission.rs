//! Admission service implementation.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::proto::gatehouse::v1 as pb;
use super::proto::gatehouse::v1::admission_service_server::AdmissionService;
use super::{duration, timestamp};
use crate::error::GatehouseError;
use crate::ratelimit::{KeyKind, RateLimitInfo, RateLimitKey, RateLimiter};

/// Implementation of the AdmissionService gRPC interface.
pub struct AdmissionServiceImpl<R: RateLimiter + ?Sized> {
    /// The rate limiter instance
    rate_limiter: Arc<R>,
}

impl<R: RateLimiter + ?Sized> AdmissionServiceImpl<R> {
    /// Create a new AdmissionServiceImpl with the given rate limiter.
    pub fn new(rate_limiter: Arc<R>) -> Self {
        Self { rate_limiter }
    }
}

fn to_key(key: &pb::RateLimitKey) -> Result<RateLimitKey, Status> {
    let kind = match pb::KeyKind::try_from(key.kind) {
        Ok(pb::KeyKind::Ip) => KeyKind::Ip,
        Ok(pb::KeyKind::User) => KeyKind::User,
        Ok(pb::KeyKind::Endpoint) => KeyKind::Endpoint,
        Ok(pb::KeyKind::Unspecified) | Err(_) => {
            return Err(Status::invalid_argument(format!(
                "unsupported key kind {}",
                key.kind
            )));
        }
    };

    let parsed = match kind {
        KeyKind::Ip => RateLimitKey::ip(key.value.as_str()),
        _ => RateLimitKey::new(kind, key.value.as_str()),
    };
    parsed.map_err(|e| Status::invalid_argument(e.to_string()))
}

fn from_key(key: &RateLimitKey) -> pb::RateLimitKey {
    let kind = match key.kind() {
        KeyKind::Ip => pb::KeyKind::Ip,
        KeyKind::User => pb::KeyKind::User,
        KeyKind::Endpoint => pb::KeyKind::Endpoint,
    };
    pb::RateLimitKey {
        kind: kind.into(),
        value: key.value().to_string(),
    }
}

fn to_quota(info: &RateLimitInfo) -> pb::Quota {
    pb::Quota {
        allowed: info.allowed,
        limit: info.limit,
        remaining: info.remaining,
        reset_time: Some(timestamp(info.reset_time)),
        retry_after: info.retry_after.map(duration),
    }
}

fn to_headers(info: &RateLimitInfo) -> Vec<pb::Header> {
    info.headers()
        .into_iter()
        .map(|(name, value)| pb::Header {
            name: name.to_string(),
            value,
        })
        .collect()
}

fn store_status(error: GatehouseError) -> Status {
    match error {
        GatehouseError::InvalidKey(msg) => Status::invalid_argument(msg),
        other => Status::unavailable(other.to_string()),
    }
}

#[tonic::async_trait]
impl<R: RateLimiter + ?Sized + 'static> AdmissionService for AdmissionServiceImpl<R> {
    /// Decide whether a request may proceed.
    ///
    /// Keys are consumed in order and checking stops at the first key that
    /// is over its limit, so later keys are not charged for a denied request.
    #[instrument(
        skip(self, request),
        fields(
            key_count = request.get_ref().keys.len(),
            hits_addend = request.get_ref().hits_addend
        )
    )]
    async fn should_admit(
        &self,
        request: Request<pb::AdmitRequest>,
    ) -> Result<Response<pb::AdmitResponse>, Status> {
        let req = request.into_inner();

        if req.keys.is_empty() {
            warn!("Received admission request with no keys");
            return Err(Status::invalid_argument("at least one key is required"));
        }

        // Validate every key before consuming any quota
        let keys = req
            .keys
            .iter()
            .map(to_key)
            .collect::<Result<Vec<_>, Status>>()?;

        // Get the number of hits to add (default to 1 if not specified)
        let hits = if req.hits_addend == 0 { 1 } else { req.hits_addend };

        let mut denied = None;
        for key in &keys {
            if !self.rate_limiter.allow_n(key, hits).await {
                denied = Some(key);
                break;
            }
        }

        let mut response = pb::AdmitResponse {
            allowed: denied.is_none(),
            denied_key: denied.map(from_key),
            quota: None,
            response_headers: Vec::new(),
        };

        if req.include_quota {
            // The deciding key is the denied one, or the last one checked
            let deciding = denied.or_else(|| keys.last());
            if let Some(key) = deciding {
                match self.rate_limiter.rate_limit_info(key).await {
                    Ok(info) => {
                        response.response_headers = to_headers(&info);
                        response.quota = Some(to_quota(&info));
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to read quota for response");
                    }
                }
            }
        }

        match denied {
            Some(key) => info!(key = %key, "Request denied"),
            None => debug!(keys = keys.len(), "Request admitted"),
        }

        Ok(Response::new(response))
    }

    /// Report the current quota for a key without consuming any of it.
    #[instrument(skip(self, request))]
    async fn get_quota(
        &self,
        request: Request<pb::QuotaRequest>,
    ) -> Result<Response<pb::QuotaResponse>, Status> {
        let req = request.into_inner();

        let key = req
            .key
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("key is required"))
            .and_then(to_key)?;

        let info = self
            .rate_limiter
            .rate_limit_info(&key)
            .await
            .map_err(|e| {
                warn!(key = %key, error = %e, "Failed to read quota");
                store_status(e)
            })?;

        debug!(key = %key, remaining = info.remaining, limit = info.limit, "Quota read");

        Ok(Response::new(pb::QuotaResponse {
            response_headers: to_headers(&info),
            quota: Some(to_quota(&info)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::ratelimit::{
        CounterKey, CounterStore, FixedWindowLimiter, Rate, TokenBucketLimiter,
    };
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn key(kind: pb::KeyKind, value: &str) -> pb::RateLimitKey {
        pb::RateLimitKey {
            kind: kind.into(),
            value: value.to_string(),
        }
    }

    /// Two requests per hour, so nothing refills during a test.
    fn service() -> AdmissionServiceImpl<TokenBucketLimiter> {
        let limiter = TokenBucketLimiter::new(Rate::new(2, Duration::from_secs(3600)), 2);
        AdmissionServiceImpl::new(Arc::new(limiter))
    }

    fn admit(keys: Vec<pb::RateLimitKey>, include_quota: bool) -> Request<pb::AdmitRequest> {
        Request::new(pb::AdmitRequest {
            keys,
            hits_addend: 0,
            include_quota,
        })
    }

    #[tokio::test]
    async fn test_empty_keys_rejected() {
        let result = service().should_admit(admit(vec![], false)).await;
        let status = assert_err!(result);
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_unspecified_kind_rejected() {
        let request = admit(vec![key(pb::KeyKind::Unspecified, "10.0.0.1")], false);
        let status = assert_err!(service().should_admit(request).await);
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_malformed_value_rejected_without_consuming() {
        let service = service();
        let request = admit(
            vec![key(pb::KeyKind::Ip, "10.0.0.1"), key(pb::KeyKind::User, "bad user")],
            false,
        );
        let status = assert_err!(service.should_admit(request).await);
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        // The valid key before the bad one was not charged
        let ip = RateLimitKey::ip("10.0.0.1").unwrap();
        assert_eq!(service.rate_limiter.tracked_keys(), 0);
        assert!(service.rate_limiter.allow_n(&ip, 2).await);
    }

    #[tokio::test]
    async fn test_admits_until_limit() {
        let service = service();

        for _ in 0..2 {
            let request = admit(vec![key(pb::KeyKind::Ip, "10.0.0.1")], false);
            let response = assert_ok!(service.should_admit(request).await).into_inner();
            assert!(response.allowed);
            assert!(response.denied_key.is_none());
            assert!(response.quota.is_none());
        }

        let request = admit(vec![key(pb::KeyKind::Ip, "10.0.0.1")], true);
        let response = assert_ok!(service.should_admit(request).await).into_inner();
        assert!(!response.allowed);
        assert_eq!(response.denied_key, Some(key(pb::KeyKind::Ip, "10.0.0.1")));

        let quota = response.quota.unwrap();
        assert!(!quota.allowed);
        assert_eq!(quota.limit, 2);
        assert_eq!(quota.remaining, 0);
        assert!(quota.retry_after.is_some());
        assert!(response
            .response_headers
            .iter()
            .any(|h| h.name == "Retry-After"));
    }

    #[tokio::test]
    async fn test_stops_at_first_denial() {
        let service = service();
        let ip = RateLimitKey::ip("10.0.0.1").unwrap();
        assert!(service.rate_limiter.allow_n(&ip, 2).await);

        let request = admit(
            vec![key(pb::KeyKind::Ip, "10.0.0.1"), key(pb::KeyKind::User, "alice")],
            false,
        );
        let response = assert_ok!(service.should_admit(request).await).into_inner();
        assert!(!response.allowed);
        assert_eq!(response.denied_key.unwrap().kind, i32::from(pb::KeyKind::Ip));

        // The user key was never reached
        let user = RateLimitKey::user("alice").unwrap();
        let info = service.rate_limiter.rate_limit_info(&user).await.unwrap();
        assert_eq!(info.remaining, 2);
    }

    #[tokio::test]
    async fn test_quota_reports_last_key_when_admitted() {
        let service = service();
        let request = admit(
            vec![key(pb::KeyKind::Ip, "10.0.0.1"), key(pb::KeyKind::User, "alice")],
            true,
        );

        let response = assert_ok!(service.should_admit(request).await).into_inner();
        assert!(response.allowed);
        let quota = response.quota.unwrap();
        assert!(quota.allowed);
        assert_eq!(quota.remaining, 1);
        assert!(quota.retry_after.is_none());
        let names: Vec<_> = response.response_headers.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["X-RateLimit-Limit", "X-RateLimit-Remaining", "X-RateLimit-Reset"]
        );
    }

    #[tokio::test]
    async fn test_get_quota_does_not_consume() {
        let service = service();
        let request = || {
            Request::new(pb::QuotaRequest {
                key: Some(key(pb::KeyKind::Endpoint, "/api/v1/projects")),
            })
        };

        for _ in 0..3 {
            let response = assert_ok!(service.get_quota(request()).await).into_inner();
            let quota = response.quota.unwrap();
            assert_eq!(quota.remaining, 2);
            assert!(quota.allowed);
        }
    }

    #[tokio::test]
    async fn test_get_quota_requires_key() {
        let status = assert_err!(service().get_quota(Request::new(pb::QuotaRequest { key: None })).await);
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    struct UnreachableStore;

    #[async_trait]
    impl CounterStore for UnreachableStore {
        async fn incr_with_expiry(&self, _: &CounterKey, _: u64, _: Duration) -> Result<u64> {
            Err(GatehouseError::StoreTimeout(Duration::from_millis(1)))
        }

        async fn get(&self, _: &CounterKey) -> Result<Option<u64>> {
            Err(GatehouseError::StoreTimeout(Duration::from_millis(1)))
        }
    }

    #[tokio::test]
    async fn test_store_failure() {
        let limiter = FixedWindowLimiter::new(Arc::new(UnreachableStore), Rate::per_second(1.0), 1);
        let service = AdmissionServiceImpl::new(Arc::new(limiter) as Arc<dyn RateLimiter>);

        // Quota reads surface the outage
        let request = Request::new(pb::QuotaRequest {
            key: Some(key(pb::KeyKind::User, "alice")),
        });
        let status = assert_err!(service.get_quota(request).await);
        assert_eq!(status.code(), tonic::Code::Unavailable);

        // Admission fails open and omits the quota
        let request = admit(vec![key(pb::KeyKind::User, "alice")], true);
        let response = assert_ok!(service.should_admit(request).await).into_inner();
        assert!(response.allowed);
        assert!(response.quota.is_none());
    }
}
