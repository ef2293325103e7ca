//! Tracing and metrics setup for the broker service.
//!
//! Installs a `tracing` subscriber (env filter plus fmt layer) and a Prometheus
//! recorder, and serves `/metrics`, `/live`, `/ready` and a `/channels`
//! diagnostics route over HTTP. In tests the recorder is installed once and
//! reused, and subscriber installation tolerates an existing global.
use axum::{Json, Router, routing::get};
use herald_broker::Broker;
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
#[cfg(test)]
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(test)]
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global tracing subscriber and metrics recorder.
///
/// `RUST_LOG` controls filtering; the default is `info`.
pub fn init_observability(service_name: &str) -> PrometheusHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();
    init_subscriber(tracing_subscriber::registry().with(filter).with(fmt_layer));
    tracing::debug!(service = service_name, "observability initialized");

    install_metrics_recorder()
}

/// HTTP routes for metrics, probes and channel diagnostics.
pub fn router(handle: PrometheusHandle, broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/metrics", get(move || async move { handle.render() }))
        .route("/live", get(|| async { "ok" }))
        .route("/ready", get(|| async { "ok" }))
        .route(
            "/channels",
            get(move || async move { Json(broker.channel_infos()) }),
        )
}

/// Serves [`router`] on `addr` until the listener fails.
pub async fn serve_metrics(
    handle: PrometheusHandle,
    broker: Arc<Broker>,
    addr: SocketAddr,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "metrics listener started");
    axum::serve(listener, router(handle, broker).into_make_service()).await
}

// Panics if a recorder is already installed outside tests.
fn install_metrics_recorder() -> PrometheusHandle {
    #[cfg(test)]
    {
        if let Some(handle) = METRICS_HANDLE.get() {
            return handle.clone();
        }
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("install metrics recorder");
        let _ = METRICS_HANDLE.set(handle.clone());
        handle
    }
    #[cfg(not(test))]
    {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("install metrics recorder")
    }
}

fn init_subscriber<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    #[cfg(test)]
    {
        let _ = subscriber.try_init();
    }
    #[cfg(not(test))]
    {
        subscriber.init();
    }
}
