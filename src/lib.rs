//! Gatehouse - Admission Control and Backend Health Supervision
//!
//! This crate implements the two stateful pieces of an API gateway: per-key
//! rate limiting (a Redis-backed fixed window shared by every gateway instance,
//! or an in-process token bucket) and a background supervisor that keeps a
//! cached health verdict for each backend service. Both are exposed over gRPC.

pub mod config;
pub mod error;
pub mod grpc;
pub mod health;
pub mod metrics;
pub mod ratelimit;
