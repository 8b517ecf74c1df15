//! Entry/calculation persistence + estimation provider HTTP client.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use emc_core::{
    ActivityData, Calculation, EmissionEntry, FactorMetadata, GasBreakdown, MatchStatus, Parameter,
    Scope,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "emc-store";

// ---------------------------------------------------------------------------
// Provider wire contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmissionFactorSelector {
    pub activity_id: String,
    pub data_version: String,
}

/// One item of the provider batch request. `parameters` carries exactly
/// `{ <parameter>: quantity, <parameter>_unit: unit }` for the descriptor's
/// parameter dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimationRequest {
    pub emission_factor: EmissionFactorSelector,
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

impl EstimationRequest {
    pub fn new(
        activity_id: impl Into<String>,
        data_version: impl Into<String>,
        parameter: Parameter,
        quantity: f64,
        unit: &str,
    ) -> Self {
        let mut parameters = serde_json::Map::new();
        parameters.insert(parameter.as_str().to_string(), json!(quantity));
        parameters.insert(format!("{}_unit", parameter.as_str()), json!(unit));
        Self {
            emission_factor: EmissionFactorSelector {
                activity_id: activity_id.into(),
                data_version: data_version.into(),
            },
            parameters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderFactor {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub source: String,
    pub region: String,
    pub category: String,
    #[serde(default)]
    pub year: Option<i32>,
    pub activity_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ProviderGases {
    pub co2: Option<f64>,
    pub ch4: Option<f64>,
    pub n2o: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderActivityData {
    pub activity_value: f64,
    pub activity_unit: String,
}

/// Successful per-item estimate as returned by the batch endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimationResult {
    pub co2e: f64,
    pub co2e_unit: String,
    pub emission_factor: ProviderFactor,
    #[serde(default)]
    pub constituent_gases: ProviderGases,
    pub activity_data: ProviderActivityData,
}

#[derive(Debug, Deserialize)]
struct BatchResponseBody {
    results: Vec<Option<BatchResponseItem>>,
}

// The provider reports per-item failures inline instead of failing the whole
// batch; an item is either an estimate or an error object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BatchResponseItem {
    Ok(Box<EstimationResult>),
    Err(ProviderItemError),
}

#[derive(Debug, Deserialize)]
struct ProviderItemError {
    error: String,
    #[serde(default)]
    message: Option<String>,
}

/// Result of one batch call: positionally aligned per-item results plus any
/// per-item provider error strings. `results.len()` always equals the
/// request count; a `None` means the provider returned nothing for that item.
#[derive(Debug, Clone, Default)]
pub struct BatchEstimateOutcome {
    pub results: Vec<Option<EstimationResult>>,
    pub errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Error classification + retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EstimateError {
    #[error("provider rejected the request: http {status}: {body}")]
    Client { status: u16, body: String },
    #[error("provider failure: http {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed provider response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_transport_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// Estimation client
// ---------------------------------------------------------------------------

/// Everything the client needs, injected at construction. The bearer
/// credential is never read from ambient state at call time.
#[derive(Debug, Clone)]
pub struct EstimationConfig {
    pub api_base: String,
    pub api_key: String,
    pub data_version: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl EstimationConfig {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: api_key.into(),
            data_version: "^21".to_string(),
            timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Seam between the orchestrator and the provider; lets tests substitute a
/// scripted estimator for the HTTP client.
#[async_trait]
pub trait Estimator: Send + Sync {
    async fn estimate_batch(
        &self,
        run_id: Uuid,
        requests: &[EstimationRequest],
    ) -> Result<BatchEstimateOutcome, EstimateError>;

    fn data_version(&self) -> &str;
}

#[derive(Debug)]
pub struct EstimationClient {
    client: reqwest::Client,
    config: EstimationConfig,
}

impl EstimationClient {
    pub fn new(config: EstimationConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    fn batch_url(&self) -> String {
        format!(
            "{}/data/v1/estimate/batch",
            self.config.api_base.trim_end_matches('/')
        )
    }

    async fn post_batch(
        &self,
        requests: &[EstimationRequest],
    ) -> Result<BatchResponseBody, EstimateError> {
        let url = self.batch_url();
        let mut last_transport_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.config.backoff.max_retries {
            let resp_result = self
                .client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(requests)
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp
                            .json::<BatchResponseBody>()
                            .await
                            .map_err(|e| EstimateError::Decode(e.to_string()));
                    }

                    let body = resp.text().await.unwrap_or_default();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retrying provider batch call");
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(if status.is_client_error() {
                        EstimateError::Client {
                            status: status.as_u16(),
                            body,
                        }
                    } else {
                        EstimateError::Provider {
                            status: status.as_u16(),
                            body,
                        }
                    });
                }
                Err(err) => {
                    if classify_transport_error(&err) == RetryDisposition::Retryable
                        && attempt < self.config.backoff.max_retries
                    {
                        last_transport_error = Some(err);
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(EstimateError::Transport(err));
                }
            }
        }

        Err(EstimateError::Transport(
            last_transport_error.expect("retry loop captures a transport error"),
        ))
    }
}

#[async_trait]
impl Estimator for EstimationClient {
    async fn estimate_batch(
        &self,
        run_id: Uuid,
        requests: &[EstimationRequest],
    ) -> Result<BatchEstimateOutcome, EstimateError> {
        if requests.is_empty() {
            return Ok(BatchEstimateOutcome::default());
        }

        let span = info_span!("estimate_batch", %run_id, items = requests.len());
        let _guard = span.enter();

        let body = self.post_batch(requests).await?;
        let mut outcome = BatchEstimateOutcome::default();
        for item in body.results {
            match item {
                Some(BatchResponseItem::Ok(result)) => outcome.results.push(Some(*result)),
                Some(BatchResponseItem::Err(err)) => {
                    outcome
                        .errors
                        .push(err.message.unwrap_or(err.error));
                    outcome.results.push(None);
                }
                None => outcome.results.push(None),
            }
        }

        // Positional integrity: index i of requests must correspond to index
        // i of results even when the provider answers short or long.
        if outcome.results.len() != requests.len() {
            warn!(
                requested = requests.len(),
                returned = outcome.results.len(),
                "provider batch length mismatch"
            );
            outcome.results.resize(requests.len(), None);
        }

        Ok(outcome)
    }

    fn data_version(&self) -> &str {
        &self.config.data_version
    }
}

// ---------------------------------------------------------------------------
// Store traits
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Entries for a company with no persisted calculation, ordered by id,
    /// starting strictly after `cursor`, at most `page_size` rows.
    async fn fetch_uncalculated(
        &self,
        company_id: Uuid,
        cursor: Option<Uuid>,
        page_size: usize,
    ) -> Result<Vec<EmissionEntry>, StoreError>;

    async fn fetch_by_ids(
        &self,
        company_id: Uuid,
        entry_ids: &[Uuid],
    ) -> Result<Vec<EmissionEntry>, StoreError>;

    async fn fetch_by_status(
        &self,
        company_id: Uuid,
        statuses: &[MatchStatus],
    ) -> Result<Vec<EmissionEntry>, StoreError>;

    /// The pipeline's only legitimate mutation of an entry.
    async fn set_match_status(
        &self,
        entry_id: Uuid,
        status: MatchStatus,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CalculationStore: Send + Sync {
    /// Idempotent full-row replace keyed by `entry_id`.
    async fn upsert(&self, calculation: &Calculation) -> Result<(), StoreError>;

    async fn get_by_entry(&self, entry_id: Uuid) -> Result<Option<Calculation>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Backend for tests and local runs. Entries iterate in id order, which is
/// what makes the pagination cursor stable.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: tokio::sync::Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: BTreeMap<Uuid, EmissionEntry>,
    calculations: HashMap<Uuid, Calculation>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_entry(&self, entry: EmissionEntry) {
        self.inner.lock().await.entries.insert(entry.id, entry);
    }

    pub async fn entry(&self, entry_id: Uuid) -> Option<EmissionEntry> {
        self.inner.lock().await.entries.get(&entry_id).cloned()
    }

    pub async fn calculation_count(&self) -> usize {
        self.inner.lock().await.calculations.len()
    }
}

#[async_trait]
impl EntryStore for MemoryStore {
    async fn fetch_uncalculated(
        &self,
        company_id: Uuid,
        cursor: Option<Uuid>,
        page_size: usize,
    ) -> Result<Vec<EmissionEntry>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .values()
            .filter(|e| e.company_id == company_id)
            .filter(|e| !inner.calculations.contains_key(&e.id))
            .filter(|e| cursor.map_or(true, |c| e.id > c))
            .take(page_size)
            .cloned()
            .collect())
    }

    async fn fetch_by_ids(
        &self,
        company_id: Uuid,
        entry_ids: &[Uuid],
    ) -> Result<Vec<EmissionEntry>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .values()
            .filter(|e| e.company_id == company_id && entry_ids.contains(&e.id))
            .cloned()
            .collect())
    }

    async fn fetch_by_status(
        &self,
        company_id: Uuid,
        statuses: &[MatchStatus],
    ) -> Result<Vec<EmissionEntry>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .values()
            .filter(|e| e.company_id == company_id && statuses.contains(&e.match_status))
            .cloned()
            .collect())
    }

    async fn set_match_status(
        &self,
        entry_id: Uuid,
        status: MatchStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.entries.get_mut(&entry_id) {
            Some(entry) => {
                entry.match_status = status;
                Ok(())
            }
            None => Err(StoreError::Message(format!("no entry {entry_id}"))),
        }
    }
}

#[async_trait]
impl CalculationStore for MemoryStore {
    async fn upsert(&self, calculation: &Calculation) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .calculations
            .insert(calculation.entry_id, calculation.clone());
        Ok(())
    }

    async fn get_by_entry(&self, entry_id: Uuid) -> Result<Option<Calculation>, StoreError> {
        Ok(self.inner.lock().await.calculations.get(&entry_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_match_status(raw: &str) -> Result<MatchStatus, StoreError> {
    match raw {
        "pending" => Ok(MatchStatus::Pending),
        "matched" => Ok(MatchStatus::Matched),
        "unmatched" => Ok(MatchStatus::Unmatched),
        "error" => Ok(MatchStatus::Error),
        other => Err(StoreError::Message(format!("unknown match_status {other:?}"))),
    }
}

fn parse_scope(raw: i16) -> Result<Scope, StoreError> {
    u8::try_from(raw)
        .ok()
        .and_then(|n| Scope::try_from(n).ok())
        .ok_or_else(|| StoreError::Message(format!("scope out of range: {raw}")))
}

fn entry_from_row(row: &sqlx::postgres::PgRow) -> Result<EmissionEntry, StoreError> {
    let status: String = row.try_get("match_status")?;
    let scope: i16 = row.try_get("scope")?;
    Ok(EmissionEntry {
        id: row.try_get("id")?,
        company_id: row.try_get("company_id")?,
        date: row.try_get("date")?,
        category: row.try_get("category")?,
        description: row.try_get("description")?,
        quantity: row.try_get("quantity")?,
        unit: row.try_get("unit")?,
        scope: parse_scope(scope)?,
        match_status: parse_match_status(&status)?,
    })
}

fn calculation_from_row(row: &sqlx::postgres::PgRow) -> Result<Calculation, StoreError> {
    let scope: i16 = row.try_get("scope")?;
    Ok(Calculation {
        id: row.try_get("id")?,
        entry_id: row.try_get("entry_id")?,
        company_id: row.try_get("company_id")?,
        total_emissions: row.try_get("total_emissions")?,
        emissions_unit: row.try_get("emissions_unit")?,
        scope: parse_scope(scope)?,
        factor: FactorMetadata {
            name: row.try_get("factor_name")?,
            source: row.try_get("factor_source")?,
            region: row.try_get("factor_region")?,
            category: row.try_get("factor_category")?,
            year: row.try_get("factor_year")?,
            activity_id: row.try_get("factor_activity_id")?,
        },
        gases: GasBreakdown {
            co2: row.try_get("co2")?,
            ch4: row.try_get("ch4")?,
            n2o: row.try_get("n2o")?,
        },
        activity_data: ActivityData {
            value: row.try_get("activity_value")?,
            unit: row.try_get("activity_unit")?,
        },
        request_params: row.try_get("request_params")?,
        calculated_at: row.try_get::<DateTime<Utc>, _>("calculated_at")?,
    })
}

const ENTRY_COLUMNS: &str =
    "e.id, e.company_id, e.date, e.category, e.description, e.quantity, e.unit, e.scope, e.match_status";

#[async_trait]
impl EntryStore for PgStore {
    async fn fetch_uncalculated(
        &self,
        company_id: Uuid,
        cursor: Option<Uuid>,
        page_size: usize,
    ) -> Result<Vec<EmissionEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
              FROM emission_entries e
              LEFT JOIN calculations c ON c.entry_id = e.id
             WHERE e.company_id = $1
               AND c.id IS NULL
               AND ($2::uuid IS NULL OR e.id > $2)
             ORDER BY e.id
             LIMIT $3
            "#
        ))
        .bind(company_id)
        .bind(cursor)
        .bind(page_size as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn fetch_by_ids(
        &self,
        company_id: Uuid,
        entry_ids: &[Uuid],
    ) -> Result<Vec<EmissionEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
              FROM emission_entries e
             WHERE e.company_id = $1
               AND e.id = ANY($2)
             ORDER BY e.id
            "#
        ))
        .bind(company_id)
        .bind(entry_ids)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn fetch_by_status(
        &self,
        company_id: Uuid,
        statuses: &[MatchStatus],
    ) -> Result<Vec<EmissionEntry>, StoreError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENTRY_COLUMNS}
              FROM emission_entries e
             WHERE e.company_id = $1
               AND e.match_status = ANY($2)
             ORDER BY e.id
            "#
        ))
        .bind(company_id)
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn set_match_status(
        &self,
        entry_id: Uuid,
        status: MatchStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE emission_entries
               SET match_status = $2
             WHERE id = $1
            "#,
        )
        .bind(entry_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Message(format!("no entry {entry_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl CalculationStore for PgStore {
    async fn upsert(&self, calculation: &Calculation) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO calculations (
                id, entry_id, company_id, total_emissions, emissions_unit, scope,
                factor_name, factor_source, factor_region, factor_category,
                factor_year, factor_activity_id, co2, ch4, n2o,
                activity_value, activity_unit, request_params, calculated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (entry_id) DO UPDATE SET
                id = EXCLUDED.id,
                company_id = EXCLUDED.company_id,
                total_emissions = EXCLUDED.total_emissions,
                emissions_unit = EXCLUDED.emissions_unit,
                scope = EXCLUDED.scope,
                factor_name = EXCLUDED.factor_name,
                factor_source = EXCLUDED.factor_source,
                factor_region = EXCLUDED.factor_region,
                factor_category = EXCLUDED.factor_category,
                factor_year = EXCLUDED.factor_year,
                factor_activity_id = EXCLUDED.factor_activity_id,
                co2 = EXCLUDED.co2,
                ch4 = EXCLUDED.ch4,
                n2o = EXCLUDED.n2o,
                activity_value = EXCLUDED.activity_value,
                activity_unit = EXCLUDED.activity_unit,
                request_params = EXCLUDED.request_params,
                calculated_at = EXCLUDED.calculated_at
            "#,
        )
        .bind(calculation.id)
        .bind(calculation.entry_id)
        .bind(calculation.company_id)
        .bind(calculation.total_emissions)
        .bind(&calculation.emissions_unit)
        .bind(calculation.scope.as_u8() as i16)
        .bind(&calculation.factor.name)
        .bind(&calculation.factor.source)
        .bind(&calculation.factor.region)
        .bind(&calculation.factor.category)
        .bind(calculation.factor.year)
        .bind(&calculation.factor.activity_id)
        .bind(calculation.gases.co2)
        .bind(calculation.gases.ch4)
        .bind(calculation.gases.n2o)
        .bind(calculation.activity_data.value)
        .bind(&calculation.activity_data.unit)
        .bind(&calculation.request_params)
        .bind(calculation.calculated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_by_entry(&self, entry_id: Uuid) -> Result<Option<Calculation>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, entry_id, company_id, total_emissions, emissions_unit, scope,
                   factor_name, factor_source, factor_region, factor_category,
                   factor_year, factor_activity_id, co2, ch4, n2o,
                   activity_value, activity_unit, request_params, calculated_at
              FROM calculations
             WHERE entry_id = $1
            "#,
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(calculation_from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn entry(company_id: Uuid, category: &str) -> EmissionEntry {
        EmissionEntry {
            id: Uuid::new_v4(),
            company_id,
            date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            category: category.to_string(),
            description: None,
            quantity: 10.0,
            unit: "kWh".to_string(),
            scope: Scope::PurchasedEnergy,
            match_status: MatchStatus::Pending,
        }
    }

    fn calculation_for(entry: &EmissionEntry, total: f64) -> Calculation {
        Calculation {
            id: Uuid::new_v4(),
            entry_id: entry.id,
            company_id: entry.company_id,
            total_emissions: total,
            emissions_unit: "kg".to_string(),
            scope: entry.scope,
            factor: FactorMetadata {
                name: "Grid mix".to_string(),
                source: "TEST".to_string(),
                region: "GLOBAL".to_string(),
                category: "Electricity".to_string(),
                year: Some(2025),
                activity_id: "electricity-supply_grid-source_residual_mix".to_string(),
            },
            gases: GasBreakdown::default(),
            activity_data: ActivityData {
                value: entry.quantity,
                unit: entry.unit.clone(),
            },
            request_params: serde_json::json!({}),
            calculated_at: Utc::now(),
        }
    }

    #[test]
    fn request_parameters_carry_value_and_unit_keys() {
        let req = EstimationRequest::new(
            "electricity-supply_grid-source_residual_mix",
            "^21",
            Parameter::Energy,
            1000.0,
            "kWh",
        );
        assert_eq!(req.parameters.get("energy"), Some(&json!(1000.0)));
        assert_eq!(req.parameters.get("energy_unit"), Some(&json!("kWh")));
        assert_eq!(req.parameters.len(), 2);
    }

    #[test]
    fn batch_response_decodes_results_nulls_and_item_errors() {
        let body: BatchResponseBody = serde_json::from_str(
            r#"{
                "results": [
                    {
                        "co2e": 42.5,
                        "co2e_unit": "kg",
                        "emission_factor": {
                            "id": "ef-1",
                            "name": "Grid mix",
                            "source": "BEIS",
                            "region": "GB",
                            "category": "Electricity",
                            "year": 2025,
                            "activity_id": "electricity-supply_grid-source_residual_mix"
                        },
                        "constituent_gases": {"co2": 42.0, "ch4": null, "n2o": 0.1},
                        "activity_data": {"activity_value": 1000.0, "activity_unit": "kWh"}
                    },
                    null,
                    {"error": "bad_request", "message": "no factor for activity"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(body.results.len(), 3);
        assert!(matches!(body.results[0], Some(BatchResponseItem::Ok(_))));
        assert!(body.results[1].is_none());
        assert!(matches!(body.results[2], Some(BatchResponseItem::Err(_))));
    }

    #[test]
    fn status_classification_retries_only_transient_failures() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn memory_upsert_replaces_by_entry_id() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        let e = entry(company, "Electricity");
        store.insert_entry(e.clone()).await;

        let first = calculation_for(&e, 10.0);
        let second = calculation_for(&e, 99.0);
        CalculationStore::upsert(&store, &first).await.unwrap();
        CalculationStore::upsert(&store, &second).await.unwrap();

        assert_eq!(store.calculation_count().await, 1);
        let stored = store.get_by_entry(e.id).await.unwrap().unwrap();
        assert_eq!(stored.total_emissions, 99.0);
        assert_eq!(stored.id, second.id);
    }

    #[tokio::test]
    async fn memory_fetch_uncalculated_skips_calculated_and_honors_cursor() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        let mut entries: Vec<EmissionEntry> =
            (0..5).map(|_| entry(company, "Electricity")).collect();
        entries.sort_by_key(|e| e.id);
        for e in &entries {
            store.insert_entry(e.clone()).await;
        }
        // Another company's entry never shows up.
        store.insert_entry(entry(Uuid::new_v4(), "Diesel")).await;

        CalculationStore::upsert(&store, &calculation_for(&entries[0], 1.0))
            .await
            .unwrap();

        let page = store.fetch_uncalculated(company, None, 10).await.unwrap();
        assert_eq!(page.len(), 4);
        assert!(page.iter().all(|e| e.id != entries[0].id));

        let short = store.fetch_uncalculated(company, None, 2).await.unwrap();
        assert_eq!(short.len(), 2);

        let after = store
            .fetch_uncalculated(company, Some(short[1].id), 10)
            .await
            .unwrap();
        assert_eq!(after.len(), 2);
        assert!(after.iter().all(|e| e.id > short[1].id));
    }

    #[tokio::test]
    async fn memory_set_match_status_on_missing_entry_fails() {
        let store = MemoryStore::new();
        let err = store
            .set_match_status(Uuid::new_v4(), MatchStatus::Matched)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Message(_)));
    }
}
