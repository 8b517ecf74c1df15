//! Axum JSON surface for triggering calculation runs and diagnostics.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use emc_pipeline::{CalculationPipeline, DiagnosticsReporter, EntryOutcome};
use emc_store::EntryStore;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use uuid::Uuid;

pub const CRATE_NAME: &str = "emc-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<CalculationPipeline>,
    pub entries: Arc<dyn EntryStore>,
}

impl AppState {
    pub fn new(pipeline: Arc<CalculationPipeline>, entries: Arc<dyn EntryStore>) -> Self {
        Self { pipeline, entries }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    pub company_id: Uuid,
    #[serde(default)]
    pub entry_ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResponse {
    pub processed: usize,
    pub calculated: usize,
    pub results: Vec<EntryOutcome>,
    pub errors: Vec<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/calculations/run", post(run_handler))
        .route("/diagnostics/{company_id}", get(diagnostics_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("EMC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> Response {
    let summary = match state
        .pipeline
        .run(request.company_id, request.entry_ids.as_deref())
        .await
    {
        Ok(summary) => summary,
        Err(err) => return server_error(err.to_string()),
    };

    Json(RunResponse {
        processed: summary.processed,
        calculated: summary.calculated,
        results: summary.results,
        errors: summary.errors,
    })
    .into_response()
}

async fn diagnostics_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(company_id): AxumPath<Uuid>,
) -> Response {
    let reporter = DiagnosticsReporter::new(state.entries.clone());
    match reporter.report(company_id).await {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => server_error(err.to_string()),
    }
}

fn server_error(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::NaiveDate;
    use emc_core::{EmissionEntry, MatchStatus, Scope};
    use emc_store::{
        BatchEstimateOutcome, EstimateError, EstimationRequest, EstimationResult, Estimator,
        MemoryStore, ProviderActivityData, ProviderFactor, ProviderGases,
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct StubEstimator;

    #[async_trait]
    impl Estimator for StubEstimator {
        async fn estimate_batch(
            &self,
            _run_id: Uuid,
            requests: &[EstimationRequest],
        ) -> Result<BatchEstimateOutcome, EstimateError> {
            Ok(BatchEstimateOutcome {
                results: requests
                    .iter()
                    .map(|_| {
                        Some(EstimationResult {
                            co2e: 12.5,
                            co2e_unit: "kg".to_string(),
                            emission_factor: ProviderFactor {
                                id: None,
                                name: "Stub factor".to_string(),
                                source: "TEST".to_string(),
                                region: "GLOBAL".to_string(),
                                category: "Test".to_string(),
                                year: Some(2025),
                                activity_id: "stub".to_string(),
                            },
                            constituent_gases: ProviderGases::default(),
                            activity_data: ProviderActivityData {
                                activity_value: 1.0,
                                activity_unit: "kWh".to_string(),
                            },
                        })
                    })
                    .collect(),
                errors: Vec::new(),
            })
        }

        fn data_version(&self) -> &str {
            "^21"
        }
    }

    fn entry(company_id: Uuid, category: &str, scope: Scope, unit: &str) -> EmissionEntry {
        EmissionEntry {
            id: Uuid::new_v4(),
            company_id,
            date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            category: category.to_string(),
            description: None,
            quantity: 10.0,
            unit: unit.to_string(),
            scope,
            match_status: MatchStatus::Pending,
        }
    }

    fn test_state(store: Arc<MemoryStore>) -> AppState {
        let pipeline = Arc::new(CalculationPipeline::new(
            store.clone(),
            store.clone(),
            Arc::new(StubEstimator),
            100,
        ));
        AppState::new(pipeline, store)
    }

    #[tokio::test]
    async fn run_endpoint_returns_summary_json() {
        let store = Arc::new(MemoryStore::new());
        let company = Uuid::new_v4();
        store
            .insert_entry(entry(company, "Electricity", Scope::PurchasedEnergy, "kWh"))
            .await;
        store
            .insert_entry(entry(company, "Office snacks", Scope::ValueChain, "kg"))
            .await;

        let app = app(test_state(store));
        let body = serde_json::json!({ "company_id": company }).to_string();
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/calculations/run")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["processed"], 2);
        assert_eq!(value["calculated"], 1);
        assert_eq!(value["results"].as_array().unwrap().len(), 2);
        assert_eq!(value["errors"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn run_endpoint_rejects_malformed_body() {
        let store = Arc::new(MemoryStore::new());
        let app = app(test_state(store));

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/calculations/run")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"company_id": "not-a-uuid"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn diagnostics_endpoint_lists_flagged_entries() {
        let store = Arc::new(MemoryStore::new());
        let company = Uuid::new_v4();
        let snacks = entry(company, "Office snacks", Scope::ValueChain, "kg");
        store.insert_entry(snacks.clone()).await;
        store
            .set_match_status(snacks.id, MatchStatus::Unmatched)
            .await
            .unwrap();

        let app = app(test_state(store));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/diagnostics/{company}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("Office snacks"));
        assert!(text.contains("kg"));
    }

    #[tokio::test]
    async fn diagnostics_endpoint_rejects_bad_uuid() {
        let store = Arc::new(MemoryStore::new());
        let app = app(test_state(store));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/diagnostics/not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn health_endpoint_is_ok() {
        let store = Arc::new(MemoryStore::new());
        let app = app(test_state(store));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
