//! Pull-based metrics exposition listener.
//!
//! Serves `GET /metrics` in the Prometheus text format on its own OS thread
//! with a dedicated single-threaded runtime, so scrapes and RPC traffic never
//! compete for the same executor. Failures here are logged and never end the
//! process.

use crate::metrics::ServiceMetrics;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info, warn};

pub const METRICS_ROUTE: &str = "/metrics";

/// Bound but not yet serving exposition listener
pub struct MetricsListener {
    listener: TcpListener,
    metrics: Arc<ServiceMetrics>,
}

impl MetricsListener {
    /// Bind the listening socket without starting to serve
    pub fn bind(addr: SocketAddr, metrics: Arc<ServiceMetrics>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .with_context(|| format!("Failed to bind metrics listener on {}", addr))?;
        listener
            .set_nonblocking(true)
            .context("Failed to configure metrics listener")?;
        Ok(Self { listener, metrics })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Start serving on a background thread.
    ///
    /// The returned handle does not need to be joined; the thread lives until
    /// the process exits.
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("metrics-exposition".to_string())
            .spawn(move || {
                if let Err(e) = self.run() {
                    error!(error = %format!("{:#}", e), "Metrics exposition listener stopped");
                }
            })
            .context("Failed to spawn metrics exposition thread")
    }

    fn run(self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build metrics runtime")?;

        runtime.block_on(async move {
            let addr = self.listener.local_addr()?;
            let listener = tokio::net::TcpListener::from_std(self.listener)?;
            info!(addr = %addr, route = METRICS_ROUTE, "Metrics exposition listening");

            axum::serve(listener, router(self.metrics))
                .await
                .context("Metrics exposition server failed")?;
            Ok::<_, anyhow::Error>(())
        })
    }
}

/// Router with the single scrape route; anything else is 404
pub fn router(metrics: Arc<ServiceMetrics>) -> Router {
    Router::new()
        .route(METRICS_ROUTE, get(render_metrics))
        .fallback(not_found)
        .with_state(metrics)
}

async fn render_metrics(State(metrics): State<Arc<ServiceMetrics>>) -> Response {
    match metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to render metrics").into_response()
        }
    }
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metrics::RpcMethod;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Minimal HTTP/1.1 GET returning (status code, body)
    pub(crate) async fn http_get(addr: SocketAddr, path: &str) -> (u16, String) {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, addr
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let raw = String::from_utf8(raw).unwrap();

        let status = raw
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .unwrap();
        let body = raw
            .split_once("\r\n\r\n")
            .map(|(_, body)| body.to_string())
            .unwrap_or_default();
        (status, body)
    }

    fn spawn_listener() -> (SocketAddr, Arc<ServiceMetrics>) {
        let metrics = Arc::new(ServiceMetrics::new().unwrap());
        let listener =
            MetricsListener::bind("127.0.0.1:0".parse().unwrap(), metrics.clone()).unwrap();
        let addr = listener.local_addr().unwrap();
        listener.spawn().unwrap();
        (addr, metrics)
    }

    #[tokio::test]
    async fn test_scrape_metrics_route() {
        let (addr, metrics) = spawn_listener();
        metrics.set_model_info("v1.0.0", "models/model.json");
        metrics.record_call(RpcMethod::Health, None, Duration::from_millis(2));

        let (status, body) = http_get(addr, METRICS_ROUTE).await;

        assert_eq!(status, 200);
        assert!(body.contains("prediction_requests_total"));
        assert!(body.contains("version=\"v1.0.0\""));
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let (addr, _metrics) = spawn_listener();

        let (status, _) = http_get(addr, "/healthz").await;
        assert_eq!(status, 404);

        let (status, _) = http_get(addr, "/").await;
        assert_eq!(status, 404);
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let metrics = Arc::new(ServiceMetrics::new().unwrap());
        let first = MetricsListener::bind("127.0.0.1:0".parse().unwrap(), metrics.clone()).unwrap();
        let addr = first.local_addr().unwrap();

        assert!(MetricsListener::bind(addr, metrics).is_err());
    }
}
