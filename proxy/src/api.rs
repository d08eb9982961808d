use crate::error::Result;
use crate::flusher::{FlushReport, Flusher};
use axum::{
    Router,
    extract::{Json, State},
    response::IntoResponse,
    routing::{get, post},
};
use ipmeter_common::BandwidthLedger;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

/// Read-only view of the ledger plus a manual flush trigger.
pub struct ApiServer {
    api_addr: String,
    ledger: Arc<BandwidthLedger>,
    flusher: Arc<Flusher>,
}

#[derive(Clone)]
struct AppState {
    ledger: Arc<BandwidthLedger>,
    flusher: Arc<Flusher>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct BandwidthStats {
    ip: String,
    kilobytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct BandwidthStatsResponse {
    stats: Vec<BandwidthStats>,
}

impl ApiServer {
    pub fn new(api_addr: String, ledger: Arc<BandwidthLedger>, flusher: Arc<Flusher>) -> Self {
        Self {
            api_addr,
            ledger,
            flusher,
        }
    }

    fn router(&self) -> Router {
        let app_state = AppState {
            ledger: self.ledger.clone(),
            flusher: self.flusher.clone(),
        };

        Router::new()
            .route("/health", get(health_check))
            .route("/api/stats/bandwidth", get(get_bandwidth_stats))
            .route("/api/flush", post(flush_now))
            .layer(TraceLayer::new_for_http())
            .with_state(app_state)
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let app = self.router();

        info!("Starting API server on {}", self.api_addr);

        let listener = tokio::net::TcpListener::bind(&self.api_addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        Ok(())
    }
}

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_bandwidth_stats(State(state): State<AppState>) -> impl IntoResponse {
    let mut stats: Vec<BandwidthStats> = state
        .ledger
        .snapshot()
        .into_iter()
        .map(|(ip, kilobytes)| BandwidthStats { ip, kilobytes })
        .collect();
    stats.sort_by(|a, b| a.ip.cmp(&b.ip));

    Json(BandwidthStatsResponse { stats })
}

#[instrument(skip(state))]
async fn flush_now(State(state): State<AppState>) -> Json<FlushReport> {
    info!("API: Manual flush requested");
    Json(state.flusher.flush_once().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    fn api_with(store: Arc<MemoryStore>) -> (Arc<BandwidthLedger>, ApiServer) {
        let ledger = Arc::new(BandwidthLedger::new());
        let flusher = Arc::new(Flusher::new(
            ledger.clone(),
            store,
            Duration::from_secs(3600),
        ));
        let api = ApiServer::new("127.0.0.1:0".to_string(), ledger.clone(), flusher);
        (ledger, api)
    }

    async fn send(api: &ApiServer, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = api
            .router()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_version() {
        let (_ledger, api) = api_with(Arc::new(MemoryStore::default()));

        let (status, body) = send(&api, "GET", "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn bandwidth_stats_are_sorted_by_ip() {
        let (ledger, api) = api_with(Arc::new(MemoryStore::default()));
        ledger.add("198.51.100.1", 7);
        ledger.ensure_entry("10.0.0.1");
        ledger.add("203.0.113.5", 200);

        let (status, body) = send(&api, "GET", "/api/stats/bandwidth").await;

        assert_eq!(status, StatusCode::OK);
        let stats = body["stats"].as_array().unwrap();
        let ips: Vec<&str> = stats.iter().map(|s| s["ip"].as_str().unwrap()).collect();
        assert_eq!(ips, vec!["10.0.0.1", "198.51.100.1", "203.0.113.5"]);
        assert_eq!(stats[0]["kilobytes"], 0);
        assert_eq!(stats[2]["kilobytes"], 200);
    }

    #[tokio::test]
    async fn manual_flush_writes_store_and_returns_report() {
        let store = Arc::new(MemoryStore::default());
        store.add_user("a@example.com", &["203.0.113.5"]);
        let (ledger, api) = api_with(store.clone());
        ledger.add("203.0.113.5", 42);

        let (status, body) = send(&api, "POST", "/api/flush").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ips_flushed"], 1);
        assert_eq!(body["users_updated"], 1);
        assert_eq!(body["failures"], 0);
        assert_eq!(store.ip_bandwidth("203.0.113.5"), Some(42));
        assert_eq!(store.user_bandwidth("a@example.com"), Some(42));
    }

    #[tokio::test]
    async fn stats_endpoint_rejects_writes() {
        let (_ledger, api) = api_with(Arc::new(MemoryStore::default()));

        let response = api
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/stats/bandwidth")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
