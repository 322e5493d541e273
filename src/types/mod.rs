//! RPC message types and the generated service stubs

pub mod messages;

pub use messages::{HealthRequest, HealthResponse, HealthStatus, PredictRequest, PredictResponse};

/// Client and server stubs for `model.PredictionService`, generated by `build.rs`.
pub mod rpc {
    include!(concat!(env!("OUT_DIR"), "/model.PredictionService.rs"));
}
