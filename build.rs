//! Generates the `model.PredictionService` client and server stubs.
//!
//! The message types are hand-written `prost` structs in `src/types/messages.rs`,
//! so no `protoc` is needed at build time.

use tonic_build::manual::{Builder, Method, Service};

fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(input)
        .output_type(output)
        .codec_path("tonic::codec::ProstCodec")
        .build()
}

fn main() {
    let service = Service::builder()
        .name("PredictionService")
        .package("model")
        .method(unary(
            "health",
            "Health",
            "crate::types::HealthRequest",
            "crate::types::HealthResponse",
        ))
        .method(unary(
            "predict",
            "Predict",
            "crate::types::PredictRequest",
            "crate::types::PredictResponse",
        ))
        .build();

    Builder::new().compile(&[service]);
    println!("cargo:rerun-if-changed=build.rs");
}
