//! Startup sequencing: model, metrics, exposition listener, RPC dispatcher

use crate::config::AppConfig;
use crate::exposition::MetricsListener;
use crate::metrics::ServiceMetrics;
use crate::models::ModelHandle;
use crate::server::{self, Dispatcher};
use crate::service::PredictionService;
use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Fully constructed service that has not opened any socket yet
pub struct Application {
    config: AppConfig,
    service: Arc<PredictionService>,
}

impl Application {
    /// Load the model and prepare the metrics registry.
    ///
    /// A missing or corrupt artifact fails here, before any listener exists.
    pub fn build(config: AppConfig) -> Result<Self> {
        let model = ModelHandle::load(&config.model.path, &config.model.version)
            .context("Failed to load model")?;

        let metrics = Arc::new(ServiceMetrics::new().context("Failed to create metrics registry")?);
        metrics.set_model_info(model.version(), &model.path().display().to_string());

        let service = Arc::new(PredictionService::new(Arc::new(model), metrics));
        Ok(Self { config, service })
    }

    pub fn service(&self) -> &Arc<PredictionService> {
        &self.service
    }

    /// Bind both listeners.
    ///
    /// The exposition listener is best effort: if it cannot bind, the error is
    /// logged and the service runs without it.
    pub async fn bind(self) -> Result<BoundApplication> {
        let metrics_addr = self.config.metrics_addr();
        let exposition = match MetricsListener::bind(metrics_addr, self.service.metrics().clone()) {
            Ok(listener) => Some(listener),
            Err(e) => {
                error!(
                    addr = %metrics_addr,
                    error = %format!("{:#}", e),
                    "Metrics exposition disabled"
                );
                None
            }
        };

        let rpc_addr = self.config.rpc_addr();
        let rpc = TcpListener::bind(rpc_addr)
            .await
            .with_context(|| format!("Failed to bind gRPC listener on {}", rpc_addr))?;

        let dispatcher = Dispatcher::new(self.service.clone(), self.config.server.workers);

        Ok(BoundApplication {
            rpc,
            exposition,
            dispatcher,
        })
    }
}

/// Application with its sockets bound, ready to serve
pub struct BoundApplication {
    rpc: TcpListener,
    exposition: Option<MetricsListener>,
    dispatcher: Dispatcher,
}

impl BoundApplication {
    pub fn rpc_addr(&self) -> Result<SocketAddr> {
        Ok(self.rpc.local_addr()?)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.exposition
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// Start the exposition thread, then serve RPCs until `shutdown` resolves.
    ///
    /// The exposition thread is detached and not waited on.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        if let Some(exposition) = self.exposition {
            if let Err(e) = exposition.spawn() {
                error!(error = %format!("{:#}", e), "Metrics exposition disabled");
            }
        } else {
            info!("Serving without metrics exposition");
        }

        server::serve(self.dispatcher, self.rpc, shutdown).await
    }
}
