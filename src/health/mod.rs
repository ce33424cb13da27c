//! Backend health supervision and readiness reporting.

mod probe;
mod snapshot;
mod supervisor;

pub use probe::{HttpProber, ProbeError, ServiceProber};
pub use snapshot::{
    HealthSnapshot, LivenessReport, ReadinessReport, ServiceHealthReport, ServiceHealthStatus,
    ServiceState, ServicesStatusReport, SweepFreshness, SweepStamp, SERVICE_NAME,
};
pub use supervisor::{HealthSupervisor, SupervisorConfig};
