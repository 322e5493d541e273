//! Wire messages of the `model.PredictionService` RPC surface.
//!
//! Field tags follow `proto/model.proto`.

/// Empty liveness probe.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthResponse {
    /// Serving status, always `"ok"` when the model is loaded
    #[prost(string, tag = "1")]
    pub status: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub model_version: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PredictRequest {
    /// Ordered feature vector; length must match the model's input dimension
    #[prost(float, repeated, tag = "1")]
    pub features: ::prost::alloc::vec::Vec<f32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PredictResponse {
    /// Predicted class label
    #[prost(string, tag = "1")]
    pub prediction: ::prost::alloc::string::String,
    /// Highest class probability, in `[0, 1]`
    #[prost(float, tag = "2")]
    pub confidence: f32,
    #[prost(string, tag = "3")]
    pub model_version: ::prost::alloc::string::String,
}

/// Serving status reported by `Health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "ok",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_predict_request_wire_format() {
        let request = PredictRequest {
            features: vec![5.1, 3.5, 1.4, 0.2],
        };

        let bytes = request.encode_to_vec();
        // tag 1, length-delimited, 4 packed floats
        assert_eq!(&bytes[..2], &[0x0a, 16]);
        assert_eq!(PredictRequest::decode(bytes.as_slice()).unwrap(), request);
    }

    #[test]
    fn test_field_tags_match_schema() {
        assert!(HealthRequest {}.encode_to_vec().is_empty());

        let health = HealthResponse {
            status: "ok".into(),
            model_version: "v1".into(),
        };
        // status = 1, model_version = 2, both length-delimited
        assert_eq!(health.encode_to_vec(), b"\x0a\x02ok\x12\x02v1".to_vec());

        let predict = PredictResponse {
            prediction: "1".into(),
            confidence: 0.5,
            model_version: "v".into(),
        };
        let mut expected = b"\x0a\x011".to_vec();
        // confidence = 2, fixed32
        expected.push(0x15);
        expected.extend_from_slice(&0.5f32.to_le_bytes());
        // model_version = 3
        expected.extend_from_slice(b"\x1a\x01v");
        assert_eq!(predict.encode_to_vec(), expected);
    }

    #[test]
    fn test_health_status_label() {
        assert_eq!(HealthStatus::Ok.as_str(), "ok");
    }
}
