//! Load Generator
//!
//! Drives a running prediction service with random Iris-range predictions,
//! optionally mixing in invalid (empty) requests to exercise error metrics.
//!
//! Usage: `load_generator [endpoint] [duration_secs] [rps] [error_rate_pct] [--add-delay]`
//!
//! `--add-delay` holds each request back for 0.5-2.0s before sending it, to
//! spread calls out and drive latency alerts.

use prediction_service::types::rpc::prediction_service_client::PredictionServiceClient;
use prediction_service::types::{HealthRequest, PredictRequest};
use rand::Rng;
use std::time::{Duration, Instant};
use tonic::transport::Channel;
use tracing::{info, warn};

/// Random request generator
struct RequestGenerator {
    rng: rand::rngs::ThreadRng,
    error_rate: f64,
    add_delay: bool,
}

impl RequestGenerator {
    fn new(error_rate: f64, add_delay: bool) -> Self {
        Self {
            rng: rand::thread_rng(),
            error_rate,
            add_delay,
        }
    }

    fn delay(&mut self) -> Option<Duration> {
        self.add_delay
            .then(|| Duration::from_secs_f64(self.rng.gen_range(0.5..2.0)))
    }

    /// Features within the ranges of the Iris measurements, or an empty
    /// vector with probability `error_rate`
    fn generate(&mut self) -> PredictRequest {
        if self.rng.gen_bool(self.error_rate) {
            return PredictRequest { features: vec![] };
        }

        PredictRequest {
            features: vec![
                self.rng.gen_range(4.0..8.0),
                self.rng.gen_range(2.0..4.5),
                self.rng.gen_range(1.0..7.0),
                self.rng.gen_range(0.1..2.5),
            ],
        }
    }
}

#[derive(Default)]
struct Totals {
    total: u64,
    success: u64,
    failed: u64,
}

impl Totals {
    fn error_rate(&self) -> f64 {
        if self.total > 0 {
            (self.failed as f64 / self.total as f64) * 100.0
        } else {
            0.0
        }
    }
}

/// Error percentage in `[0, 100]`; unparsable or non-finite input means 0
fn error_rate_pct(arg: Option<&str>) -> f64 {
    arg.and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(0.0, 100.0))
        .unwrap_or(0.0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("load_generator=info".parse()?),
        )
        .init();

    // Parse arguments
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let add_delay = args.iter().any(|a| a == "--add-delay");
    args.retain(|a| a != "--add-delay");

    let endpoint = args
        .first()
        .cloned()
        .unwrap_or_else(|| "http://localhost:50051".to_string());
    let duration_secs: u64 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(60);
    let rps: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(10);
    let error_pct = error_rate_pct(args.get(3).map(String::as_str));

    info!(
        endpoint = %endpoint,
        duration_secs = duration_secs,
        rps = rps,
        error_rate_pct = error_pct,
        add_delay = add_delay,
        "Starting load generator"
    );

    let mut client = PredictionServiceClient::connect(endpoint.clone()).await?;

    let health = client.health(HealthRequest {}).await?.into_inner();
    info!(
        status = %health.status,
        model_version = %health.model_version,
        "Service is healthy"
    );

    let mut generator = RequestGenerator::new(error_pct / 100.0, add_delay);
    let mut totals = Totals::default();
    let started = Instant::now();

    while started.elapsed() < Duration::from_secs(duration_secs) {
        let batch_started = Instant::now();

        let batch: Vec<_> = (0..rps)
            .map(|_| send(client.clone(), generator.generate(), generator.delay()))
            .collect();

        for ok in futures::future::join_all(batch).await {
            totals.total += 1;
            if ok {
                totals.success += 1;
            } else {
                totals.failed += 1;
            }
        }

        if let Some(rest) = Duration::from_secs(1).checked_sub(batch_started.elapsed()) {
            tokio::time::sleep(rest).await;
        }

        info!(
            elapsed_secs = started.elapsed().as_secs(),
            total = totals.total,
            success = totals.success,
            failed = totals.failed,
            "Error rate {:.1}%",
            totals.error_rate()
        );
    }

    info!(
        total = totals.total,
        success = totals.success,
        failed = totals.failed,
        "Load generation completed, error rate {:.2}%",
        totals.error_rate()
    );

    Ok(())
}

async fn send(
    mut client: PredictionServiceClient<Channel>,
    request: PredictRequest,
    delay: Option<Duration>,
) -> bool {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    match client.predict(request).await {
        Ok(response) => {
            let response = response.into_inner();
            tracing::debug!(
                prediction = %response.prediction,
                confidence = response.confidence,
                "Prediction"
            );
            true
        }
        Err(status) => {
            warn!(code = ?status.code(), message = %status.message(), "Prediction failed");
            false
        }
    }
}
