use crate::{handlers, state::AppState};
use axum::{
    routing::{get, post},
    Router,
};
use pulse_core::{config::ApiConfig, PulseError, Result};
use std::{future::Future, net::SocketAddr};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/v1/stats", get(handlers::get_stats))
        .route("/api/v1/anomalies", get(handlers::get_anomalies))
        .route("/api/v1/detect", post(handlers::force_detection))
        .route("/api/v1/metrics", post(handlers::ingest_metrics))
        .route("/api/v1/alerts/test", post(handlers::test_alerts))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

pub struct ApiServer {
    app: Router,
    addr: SocketAddr,
}

impl ApiServer {
    pub fn new(config: &ApiConfig, state: AppState) -> Result<Self> {
        let addr: SocketAddr = config.bind.parse().map_err(|e| {
            PulseError::Configuration(format!("Invalid api.bind {:?}: {}", config.bind, e))
        })?;

        Ok(Self {
            app: router(state),
            addr,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!("API server listening on {}", self.addr);

        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("API server stopped");
        Ok(())
    }
}
