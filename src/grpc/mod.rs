//! gRPC surface for admission decisions and health reporting.

mod admission;
mod health;
mod server;

pub use admission::AdmissionServiceImpl;
pub use health::HealthServiceImpl;
pub use server::GrpcServer;

// Include the generated protobuf code
pub mod proto {
    pub mod gatehouse {
        pub mod v1 {
            tonic::include_proto!("gatehouse.v1");
        }
    }
}

// Re-export commonly used types
pub use proto::gatehouse::v1::{
    admission_service_server::AdmissionServiceServer, health_service_server::HealthServiceServer,
    AdmitRequest, AdmitResponse, QuotaRequest, QuotaResponse,
};

use chrono::{DateTime, Utc};

fn timestamp(at: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: at.timestamp(),
        nanos: at.timestamp_subsec_nanos() as i32,
    }
}

fn duration(d: std::time::Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}
