use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::FutureExt;
use ingestor_actors::buffer::SharedBuffer;
use ingestor_actors::health::Verdict;
use ingestor_actors::metrics::{IngestMetricsSnapshot, SharedMetrics};
use ingestor_actors::monitor::SharedMonitor;
use serde::Serialize;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tracing::error;

/// Probe surface of the service.
#[derive(Clone)]
pub struct Api {
    monitor: SharedMonitor,
    metrics: SharedMetrics,
    buffer: SharedBuffer,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    #[serde(flatten)]
    pub snapshot: IngestMetricsSnapshot,
    pub buffered: usize,
}

impl Api {
    pub fn new(monitor: SharedMonitor, metrics: SharedMetrics, buffer: SharedBuffer) -> Self {
        Self {
            monitor,
            metrics,
            buffer,
        }
    }

    pub async fn serve(
        self,
        bind_address: &str,
        shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        let addr: SocketAddr = bind_address.parse()?;
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Starting API server on {}", addr);
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown.map(|v| {
                _ = v.inspect_err(|_err| error!("shutdown receive error"));
            }))
            .await?;
        Ok(())
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/check", post(check))
            .route("/status", get(status))
            .route("/metrics", get(metrics))
            .layer(CorsLayer::permissive())
            .with_state(self.clone())
    }
}

fn verdict_response(verdict: &Verdict) -> (StatusCode, Json<Verdict>) {
    let code =
        StatusCode::from_u16(verdict.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (code, Json(verdict.clone()))
}

/// Runs one monitor cycle and answers with its verdict.
async fn check(State(state): State<Api>) -> impl IntoResponse {
    let verdict = state.monitor.run_cycle().await;
    verdict_response(&verdict)
}

async fn status(State(state): State<Api>) -> impl IntoResponse {
    match state.monitor.last_verdict() {
        Some(verdict) => Ok(verdict_response(&verdict)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "no monitor cycle has run yet".to_string(),
            }),
        )),
    }
}

async fn metrics(State(state): State<Api>) -> impl IntoResponse {
    Json(MetricsResponse {
        snapshot: state.metrics.snapshot(),
        buffered: state.buffer.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingestor_actors::health::{GapCounts, HealthStatus};

    fn verdict(status: HealthStatus) -> Verdict {
        Verdict {
            status,
            reasons: Vec::new(),
            checked_at: std::time::SystemTime::UNIX_EPOCH.into(),
            latest_sequence_number: Some(7),
            latest_age_seconds: Some(3),
            record_count: Some(7),
            min_sequence_number: Some(1),
            max_sequence_number: Some(7),
            gaps: GapCounts::default(),
            error: None,
        }
    }

    #[test]
    fn test_verdict_status_codes() {
        assert_eq!(
            verdict_response(&verdict(HealthStatus::Healthy)).0,
            StatusCode::OK
        );
        assert_eq!(
            verdict_response(&verdict(HealthStatus::Degraded)).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            verdict_response(&verdict(HealthStatus::ScanFailed)).0,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_metrics_response_is_flat() {
        let response = MetricsResponse {
            snapshot: IngestMetricsSnapshot::default(),
            buffered: 4,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["buffered"], 4);
        assert_eq!(json["records_written"], 0);
    }
}
