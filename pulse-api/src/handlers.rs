use crate::{state::AppState, AnomalyQueryParams, ApiResponse, ApiResult, HealthStatus};
use axum::{
    extract::{Query, State},
    Json,
};
use pulse_core::{Anomaly, MetricEvent};
use pulse_engine::{AnomalyQuery, EngineStats};
use std::collections::BTreeMap;
use tracing::info;

pub async fn health_check(State(state): State<AppState>) -> ApiResult<HealthStatus> {
    let stats = state.engine.stats().await;
    let status = HealthStatus {
        status: if stats.running { "ok" } else { "stopped" }.to_string(),
        running: stats.running,
        uptime_secs: stats.uptime_secs,
    };
    Ok(Json(ApiResponse::success(status)))
}

pub async fn get_stats(State(state): State<AppState>) -> ApiResult<EngineStats> {
    Ok(Json(ApiResponse::success(state.engine.stats().await)))
}

pub async fn get_anomalies(
    State(state): State<AppState>,
    Query(params): Query<AnomalyQueryParams>,
) -> ApiResult<Vec<Anomaly>> {
    let query = AnomalyQuery::try_from(params)?;
    Ok(Json(ApiResponse::success(
        state.engine.get_recent_anomalies(&query),
    )))
}

pub async fn force_detection(State(state): State<AppState>) -> ApiResult<Vec<Anomaly>> {
    info!("Forced detection requested");
    let anomalies = state.engine.force_detection().await?;
    Ok(Json(ApiResponse::success(anomalies)))
}

/// Pushes a batch straight into the pipeline and returns what it raised.
pub async fn ingest_metrics(
    State(state): State<AppState>,
    Json(batch): Json<Vec<MetricEvent>>,
) -> ApiResult<Vec<Anomaly>> {
    let anomalies = state.engine.process_metrics(&batch).await;
    Ok(Json(ApiResponse::success(anomalies)))
}

pub async fn test_alerts(State(state): State<AppState>) -> ApiResult<BTreeMap<String, bool>> {
    Ok(Json(ApiResponse::success(state.engine.test_alerts().await)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use pulse_anomaly::build_detectors;
    use pulse_core::{
        config::EngineConfig, model::fields, storage::InMemoryStore, AnomalyKind,
        MetricEventBuilder, Severity,
    };
    use pulse_engine::AnomalyEngine;
    use pulse_notifier::AlertManager;
    use std::sync::Arc;

    fn state() -> AppState {
        let config = EngineConfig::default();
        let engine = AnomalyEngine::new(
            config.clone(),
            Arc::new(InMemoryStore::new(config.storage.clone())),
            build_detectors(&config.detectors),
            Arc::new(AlertManager::new(Severity::Medium)),
        );
        AppState::new(Arc::new(engine))
    }

    fn missed(validator: &str, height: u64) -> MetricEvent {
        MetricEventBuilder::vote()
            .at(1_000 * height as i64)
            .with_field(fields::VALIDATOR, validator)
            .with_field(fields::HEIGHT, height)
            .with_field(fields::SIGNED, false)
            .build()
    }

    #[tokio::test]
    async fn test_ingest_then_query_anomalies() {
        let state = state();
        let batch = (1..=3).map(|h| missed("V1", h)).collect();

        let Json(ingested) = ingest_metrics(State(state.clone()), Json(batch)).await.unwrap();
        assert_eq!(ingested.data.unwrap().len(), 1);

        let params = AnomalyQueryParams {
            anomaly_type: Some("validator_downtime".to_string()),
            limit: Some(5),
            ..AnomalyQueryParams::default()
        };
        let Json(response) = get_anomalies(State(state), Query(params)).await.unwrap();
        assert!(response.success);
        let anomalies = response.data.unwrap();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::ValidatorDowntime);
    }

    #[tokio::test]
    async fn test_bad_filter_is_a_bad_request() {
        let params = AnomalyQueryParams {
            severity: Some("catastrophic".to_string()),
            ..AnomalyQueryParams::default()
        };
        let err = get_anomalies(State(state()), Query(params)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_reports_stopped_engine() {
        let Json(response) = health_check(State(state())).await.unwrap();
        let health = response.data.unwrap();
        assert_eq!(health.status, "stopped");
        assert!(!health.running);
    }

    #[tokio::test]
    async fn test_stats_and_force_detection() {
        let state = state();
        let Json(detected) = force_detection(State(state.clone())).await.unwrap();
        assert!(detected.data.unwrap().is_empty());

        let Json(stats) = get_stats(State(state)).await.unwrap();
        let stats = stats.data.unwrap();
        assert_eq!(stats.batches_processed, 1);
        assert_eq!(stats.detectors.len(), 3);
    }
}
