//! Prometheus metrics endpoint.
//!
//! Exposes the engine's internal events over HTTP for scraping, plus a
//! health endpoint for liveness probes.

use axum::{routing::get, Extension, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, error};

use crate::config::MetricsConfig;
use crate::error::{AddressParseSnafu, MetricsError, PrometheusInitSnafu};

/// Install the Prometheus recorder and start the scrape endpoint.
///
/// Does nothing when metrics are disabled in the config. The endpoint
/// serves `/metrics` (Prometheus text format) and `/health` (200 OK).
pub fn init(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        debug!("Metrics disabled");
        return Ok(());
    }

    let addr: SocketAddr = config.address.parse().context(AddressParseSnafu)?;
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    tokio::spawn(serve_scrapes(addr, handle));
    debug!("Metrics endpoint listening on http://{}/metrics", addr);

    Ok(())
}

async fn serve_scrapes(addr: SocketAddr, handle: PrometheusHandle) {
    let app = Router::new()
        .route(
            "/metrics",
            get(|Extension(handle): Extension<PrometheusHandle>| async move { handle.render() }),
        )
        .route("/health", get(|| async { "ok\n" }))
        .layer(Extension(handle));

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind metrics endpoint to {}: {}", addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!("Metrics endpoint error: {}", e);
    }
}
