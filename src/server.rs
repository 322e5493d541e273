//! gRPC dispatcher for the prediction service.
//!
//! Every inbound call waits for a permit from a fixed-size semaphore and then
//! runs on tokio's blocking pool, so at most `workers` calls execute at once
//! and the rest queue in arrival order of permit requests.

use crate::error::PredictionError;
use crate::metrics::{AbandonOnDrop, CallAbandoned, RpcMethod};
use crate::service::PredictionService;
use crate::types::rpc::prediction_service_server::{
    PredictionService as PredictionRpc, PredictionServiceServer,
};
use crate::types::{HealthRequest, HealthResponse, PredictRequest, PredictResponse};
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{error, info, info_span, Instrument, Span};
use uuid::Uuid;

/// Bounded worker pool in front of [`PredictionService`]
#[derive(Clone)]
pub struct Dispatcher {
    service: Arc<PredictionService>,
    workers: Arc<Semaphore>,
    pool_size: usize,
}

impl Dispatcher {
    pub fn new(service: Arc<PredictionService>, workers: usize) -> Self {
        Self {
            service,
            workers: Arc::new(Semaphore::new(workers)),
            pool_size: workers,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Workers currently free
    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Run `op` on a pool worker once one is free.
    ///
    /// If this future is dropped before the worker returns (client deadline,
    /// cancelled stream), the call is flagged as abandoned and the worker
    /// records it as aborted rather than successful.
    async fn dispatch<T, F>(&self, method: RpcMethod, op: F) -> Result<T, Status>
    where
        T: Send + 'static,
        F: FnOnce(&PredictionService, &CallAbandoned) -> Result<T, PredictionError>
            + Send
            + 'static,
    {
        let abandoned = CallAbandoned::default();
        let guard = AbandonOnDrop::new(abandoned.clone());

        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Status::unavailable("worker pool is closed"))?;

        let service = self.service.clone();
        let span = Span::current();
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            span.in_scope(|| op(service.as_ref(), &abandoned))
        })
        .await;
        guard.disarm();

        match joined {
            Ok(result) => result.map_err(Status::from),
            Err(e) => {
                // The call's recorder already counted the failure while unwinding
                error!(method = method.as_str(), error = %e, "Worker task failed");
                Err(PredictionError::WorkerPanic(e.to_string()).to_status())
            }
        }
    }
}

fn call_span(method: RpcMethod) -> Span {
    info_span!("rpc", method = method.as_str(), request_id = %Uuid::new_v4())
}

#[tonic::async_trait]
impl PredictionRpc for Dispatcher {
    async fn health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        let call = self.dispatch(RpcMethod::Health, |service, abandoned| {
            service.health_for(abandoned)
        });
        call.instrument(call_span(RpcMethod::Health))
            .await
            .map(Response::new)
    }

    async fn predict(
        &self,
        request: Request<PredictRequest>,
    ) -> Result<Response<PredictResponse>, Status> {
        let request = request.into_inner();
        let call = self.dispatch(RpcMethod::Predict, move |service, abandoned| {
            service.predict_for(&request, abandoned)
        });
        call.instrument(call_span(RpcMethod::Predict))
            .await
            .map(Response::new)
    }
}

/// Serve `dispatcher` on `listener` until `shutdown` resolves, then drain
/// in-flight calls.
pub async fn serve<F>(dispatcher: Dispatcher, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let addr = listener.local_addr()?;
    info!(
        addr = %addr,
        workers = dispatcher.pool_size(),
        "gRPC server listening"
    );

    Server::builder()
        .add_service(PredictionServiceServer::new(dispatcher))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
        .context("gRPC server failed")?;

    info!("gRPC server stopped");
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for interrupt signal");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Received interrupt, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, InferenceError};
    use crate::metrics::{Outcome, ServiceMetrics};
    use crate::models::{Classifier, ModelHandle};
    use crate::service::tests::{iris_service, VERSION};
    use crate::types::rpc::prediction_service_client::PredictionServiceClient;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn dispatcher(workers: usize) -> Dispatcher {
        Dispatcher::new(Arc::new(iris_service()), workers)
    }

    /// Answers correctly, but only after `delay`
    struct SlowClassifier {
        delay: Duration,
    }

    impl Classifier for SlowClassifier {
        fn kind(&self) -> &'static str {
            "slow"
        }

        fn input_dim(&self) -> Option<usize> {
            None
        }

        fn classify(&self, _features: &[f32]) -> Result<String, InferenceError> {
            std::thread::sleep(self.delay);
            Ok("late".to_string())
        }

        fn class_probabilities(&self, _features: &[f32]) -> Result<Vec<f64>, InferenceError> {
            Ok(vec![0.1, 0.9])
        }
    }

    fn slow_dispatcher(delay: Duration) -> Dispatcher {
        let model = ModelHandle::new(Arc::new(SlowClassifier { delay }), VERSION, "slow");
        let service =
            PredictionService::new(Arc::new(model), Arc::new(ServiceMetrics::new().unwrap()));
        Dispatcher::new(Arc::new(service), 2)
    }

    /// Poll until `done` holds; worker threads finish after the caller gave up
    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..300 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 3s");
    }

    fn predict_request(features: &[f32]) -> Request<PredictRequest> {
        Request::new(PredictRequest {
            features: features.to_vec(),
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_health_through_dispatcher() {
        let dispatcher = dispatcher(2);

        let response = dispatcher
            .health(Request::new(HealthRequest {}))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.status, "ok");
        assert_eq!(response.model_version, VERSION);
        assert_eq!(dispatcher.available_workers(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_health_calls() {
        let dispatcher = dispatcher(4);
        let metrics = dispatcher.service.metrics().clone();

        let calls: Vec<_> = (0..50)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { dispatcher.health(Request::new(HealthRequest {})).await })
            })
            .collect();

        for call in futures::future::join_all(calls).await {
            let response = call.unwrap().unwrap().into_inner();
            assert_eq!(response.status, "ok");
            assert_eq!(response.model_version, VERSION);
        }

        assert_eq!(metrics.request_count(RpcMethod::Health, Outcome::Success), 50);
        assert_eq!(metrics.request_count(RpcMethod::Health, Outcome::Error), 0);
        assert_eq!(metrics.latency_count(RpcMethod::Health), 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_call_is_recorded_as_aborted() {
        let dispatcher = slow_dispatcher(Duration::from_millis(300));
        let metrics = dispatcher.service.metrics().clone();

        let timed_out = tokio::time::timeout(
            Duration::from_millis(50),
            dispatcher.predict(predict_request(&[1.0, 2.0])),
        )
        .await;
        assert!(timed_out.is_err());

        wait_until(|| metrics.latency_count(RpcMethod::Predict) == 1).await;
        assert_eq!(metrics.request_count(RpcMethod::Predict, Outcome::Success), 0);
        assert_eq!(metrics.request_count(RpcMethod::Predict, Outcome::Error), 1);
        assert_eq!(metrics.error_count(RpcMethod::Predict, ErrorKind::Aborted), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_client_deadline_is_recorded_as_aborted() {
        let dispatcher = slow_dispatcher(Duration::from_millis(300));
        let metrics = dispatcher.service.metrics().clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(dispatcher, listener, async move {
            let _ = stop_rx.await;
        }));

        let mut client = PredictionServiceClient::connect(format!("http://{}", addr))
            .await
            .unwrap();
        let mut request = predict_request(&[1.0, 2.0]);
        request.set_timeout(Duration::from_millis(50));

        assert!(client.predict(request).await.is_err());

        wait_until(|| metrics.latency_count(RpcMethod::Predict) == 1).await;
        assert_eq!(metrics.request_count(RpcMethod::Predict, Outcome::Success), 0);
        assert_eq!(metrics.error_count(RpcMethod::Predict, ErrorKind::Aborted), 1);

        // A call that meets its deadline still counts as a success
        let mut request = predict_request(&[1.0, 2.0]);
        request.set_timeout(Duration::from_secs(5));
        let response = client.predict(request).await.unwrap().into_inner();
        assert_eq!(response.prediction, "late");
        assert_eq!(metrics.request_count(RpcMethod::Predict, Outcome::Success), 1);

        drop(client);
        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_error_mapping_at_boundary() {
        let dispatcher = dispatcher(2);

        let status = dispatcher.predict(predict_request(&[])).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(status.message(), "Features array is empty");

        let status = dispatcher
            .predict(predict_request(&[1.0, 2.0, 3.0]))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_predictions_lose_no_updates() {
        let dispatcher = dispatcher(3);
        let metrics = dispatcher.service.metrics().clone();

        let calls: Vec<_> = (0..100)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    dispatcher
                        .predict(predict_request(&[5.1, 3.5, 1.4, 0.2]))
                        .await
                })
            })
            .collect();

        for call in futures::future::join_all(calls).await {
            let response = call.unwrap().unwrap().into_inner();
            assert!((0.0..=1.0).contains(&response.confidence));
            assert_eq!(response.model_version, VERSION);
        }

        assert_eq!(metrics.request_count(RpcMethod::Predict, Outcome::Success), 100);
        assert_eq!(metrics.request_count(RpcMethod::Predict, Outcome::Error), 0);
        assert_eq!(metrics.latency_count(RpcMethod::Predict), 100);
        assert_eq!(metrics.inference_count(), 100);
        assert_eq!(
            metrics.error_count(RpcMethod::Predict, ErrorKind::EmptyFeatures),
            0
        );
        assert_eq!(dispatcher.available_workers(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_saturated_pool_queues_calls() {
        let dispatcher = dispatcher(1);

        // Hold the only worker; the call must wait rather than fail
        let held = dispatcher.workers.clone().acquire_owned().await.unwrap();
        let pending = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.health(Request::new(HealthRequest {})).await }
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        drop(held);
        let response = pending.await.unwrap().unwrap().into_inner();
        assert_eq!(response.status, "ok");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_closed_pool_is_unavailable() {
        let dispatcher = dispatcher(1);
        dispatcher.workers.close();

        let status = dispatcher
            .health(Request::new(HealthRequest {}))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }
}
