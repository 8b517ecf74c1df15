//! Batch calculation orchestration: fetch, classify, estimate, persist.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use emc_core::{
    ActivityData, ActivityDescriptor, Calculation, DiagnosticLogEntry, EmissionEntry,
    FactorMetadata, GasBreakdown, MatchStatus, Severity,
};
use emc_store::{
    BackoffPolicy, CalculationStore, EntryStore, EstimationConfig, EstimationRequest,
    EstimationResult, Estimator, StoreError,
};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "emc-pipeline";

pub const NO_RESULT_REASON: &str = "provider returned no result";

/// Env-driven pipeline configuration with defaults, assembled once at the
/// binary edge.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub page_size: usize,
    pub api_base: String,
    pub api_key: String,
    pub data_version: String,
    pub http_timeout_secs: u64,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            page_size: std::env::var("EMC_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            api_base: std::env::var("ESTIMATE_API_BASE")
                .unwrap_or_else(|_| "https://api.climatiq.io".to_string()),
            api_key: std::env::var("ESTIMATE_API_KEY").unwrap_or_default(),
            data_version: std::env::var("ESTIMATE_DATA_VERSION")
                .unwrap_or_else(|_| "^21".to_string()),
            http_timeout_secs: std::env::var("EMC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }

    pub fn estimation_config(&self) -> EstimationConfig {
        EstimationConfig {
            api_base: self.api_base.clone(),
            api_key: self.api_key.clone(),
            data_version: self.data_version.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Per-entry line of the run summary, shaped for the invocation surface.
#[derive(Debug, Clone, Serialize)]
pub struct EntryOutcome {
    pub entry_id: Uuid,
    pub category: String,
    pub emissions: Option<f64>,
    pub emissions_unit: Option<String>,
    pub source: Option<String>,
    pub success: bool,
}

impl EntryOutcome {
    fn success(entry: &EmissionEntry, calculation: &Calculation) -> Self {
        Self {
            entry_id: entry.id,
            category: entry.category.clone(),
            emissions: Some(calculation.total_emissions),
            emissions_unit: Some(calculation.emissions_unit.clone()),
            source: Some(calculation.factor.source.clone()),
            success: true,
        }
    }

    fn failure(entry: &EmissionEntry) -> Self {
        Self {
            entry_id: entry.id,
            category: entry.category.clone(),
            emissions: None,
            emissions_unit: None,
            source: None,
            success: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: usize,
    pub calculated: usize,
    pub results: Vec<EntryOutcome>,
    pub errors: Vec<String>,
}

/// Outcome of aligning one batch result back to its source entry.
#[derive(Debug, Clone)]
pub struct ReconciledOutcome {
    pub entry: EmissionEntry,
    pub success: bool,
    pub calculation: Option<Calculation>,
    pub reason: Option<String>,
}

/// Walks the three positionally-aligned lists. A missing result at index `i`
/// becomes a soft failure at `i` and never disturbs index `i + 1`.
pub fn reconcile(
    entries: &[EmissionEntry],
    requests: &[EstimationRequest],
    results: &[Option<EstimationResult>],
    calculated_at: DateTime<Utc>,
) -> Vec<ReconciledOutcome> {
    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| match results.get(i).and_then(|r| r.as_ref()) {
            Some(result) => ReconciledOutcome {
                entry: entry.clone(),
                success: true,
                calculation: Some(calculation_from_result(
                    entry,
                    requests.get(i),
                    result,
                    calculated_at,
                )),
                reason: None,
            },
            None => ReconciledOutcome {
                entry: entry.clone(),
                success: false,
                calculation: None,
                reason: Some(NO_RESULT_REASON.to_string()),
            },
        })
        .collect()
}

fn calculation_from_result(
    entry: &EmissionEntry,
    request: Option<&EstimationRequest>,
    result: &EstimationResult,
    calculated_at: DateTime<Utc>,
) -> Calculation {
    let request_params = request
        .and_then(|r| serde_json::to_value(r).ok())
        .unwrap_or(serde_json::Value::Null);
    Calculation {
        id: Uuid::new_v4(),
        entry_id: entry.id,
        company_id: entry.company_id,
        total_emissions: result.co2e,
        emissions_unit: result.co2e_unit.clone(),
        scope: entry.scope,
        factor: FactorMetadata {
            name: result.emission_factor.name.clone(),
            source: result.emission_factor.source.clone(),
            region: result.emission_factor.region.clone(),
            category: result.emission_factor.category.clone(),
            year: result.emission_factor.year,
            activity_id: result.emission_factor.activity_id.clone(),
        },
        gases: GasBreakdown {
            co2: result.constituent_gases.co2,
            ch4: result.constituent_gases.ch4,
            n2o: result.constituent_gases.n2o,
        },
        activity_data: ActivityData {
            value: result.activity_data.activity_value,
            unit: result.activity_data.activity_unit.clone(),
        },
        request_params,
        calculated_at,
    }
}

/// Cursor-paginated driver over entry pages. Each page goes through
/// classify, one batch estimate call, reconcile, and persist; per-entry
/// failures never abort the run, and a provider-level call failure only
/// aborts the current page.
pub struct CalculationPipeline {
    entries: Arc<dyn EntryStore>,
    calculations: Arc<dyn CalculationStore>,
    estimator: Arc<dyn Estimator>,
    page_size: usize,
    cancelled: Arc<AtomicBool>,
}

impl CalculationPipeline {
    pub fn new(
        entries: Arc<dyn EntryStore>,
        calculations: Arc<dyn CalculationStore>,
        estimator: Arc<dyn Estimator>,
        page_size: usize,
    ) -> Self {
        Self {
            entries,
            calculations,
            estimator,
            page_size: page_size.max(1),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag a caller can set to stop the run after the current page.
    /// A page that already started persisting always runs to completion.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub async fn run(
        &self,
        company_id: Uuid,
        entry_ids: Option<&[Uuid]>,
    ) -> Result<RunSummary, StoreError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, %company_id, explicit_ids = entry_ids.is_some(), "starting calculation run");

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            processed: 0,
            calculated: 0,
            results: Vec::new(),
            errors: Vec::new(),
        };

        let mut cursor: Option<Uuid> = None;
        loop {
            if self.cancelled.load(Ordering::Relaxed) {
                warn!(%run_id, "run cancelled; no further pages will be fetched");
                break;
            }

            let page = match entry_ids {
                Some(ids) => self.entries.fetch_by_ids(company_id, ids).await?,
                None => {
                    self.entries
                        .fetch_uncalculated(company_id, cursor, self.page_size)
                        .await?
                }
            };
            if page.is_empty() {
                break;
            }
            let short_page = page.len() < self.page_size;
            cursor = page.last().map(|e| e.id);

            self.process_page(&page, &mut summary).await;

            // Explicit ids are a single page; cursor pagination ends on the
            // first short page.
            if entry_ids.is_some() || short_page {
                break;
            }
        }

        summary.finished_at = Utc::now();
        info!(
            %run_id,
            processed = summary.processed,
            calculated = summary.calculated,
            errors = summary.errors.len(),
            "calculation run finished"
        );
        Ok(summary)
    }

    async fn process_page(&self, page: &[EmissionEntry], summary: &mut RunSummary) {
        summary.processed += page.len();

        // CLASSIFY: misses are finalized immediately, without a round trip.
        let mut classified: Vec<(EmissionEntry, ActivityDescriptor)> = Vec::new();
        for entry in page {
            match emc_classify::classify(entry) {
                Some(descriptor) => classified.push((entry.clone(), descriptor)),
                None => {
                    self.mark(entry, MatchStatus::Unmatched, summary).await;
                    summary.results.push(EntryOutcome::failure(entry));
                }
            }
        }
        if classified.is_empty() {
            return;
        }

        // ESTIMATE: one batch call per page.
        let requests = emc_classify::build_batch(&classified, self.estimator.data_version());
        let outcome = match self.estimator.estimate_batch(summary.run_id, &requests).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // The whole call failed; the page's batched entries become
                // `error` so diagnostics can tell this apart from a miss.
                summary.errors.push(err.to_string());
                for (entry, _) in &classified {
                    self.mark(entry, MatchStatus::Error, summary).await;
                    summary.results.push(EntryOutcome::failure(entry));
                }
                return;
            }
        };
        summary.errors.extend(outcome.errors.iter().cloned());

        // PERSIST: upsert before status update, per entry.
        let batched: Vec<EmissionEntry> = classified.into_iter().map(|(e, _)| e).collect();
        let reconciled = reconcile(&batched, &requests, &outcome.results, Utc::now());
        for item in reconciled {
            match item.calculation {
                Some(calculation) => match self.calculations.upsert(&calculation).await {
                    Ok(()) => {
                        self.mark(&item.entry, MatchStatus::Matched, summary).await;
                        summary.calculated += 1;
                        summary
                            .results
                            .push(EntryOutcome::success(&item.entry, &calculation));
                    }
                    Err(err) => {
                        // Never advance to `matched` past a failed write; the
                        // entry keeps its current status.
                        summary
                            .errors
                            .push(format!("entry {}: {}", item.entry.id, err));
                        summary.results.push(EntryOutcome::failure(&item.entry));
                    }
                },
                None => {
                    warn!(
                        entry_id = %item.entry.id,
                        reason = item.reason.as_deref().unwrap_or_default(),
                        "entry not calculated"
                    );
                    self.mark(&item.entry, MatchStatus::Unmatched, summary).await;
                    summary.results.push(EntryOutcome::failure(&item.entry));
                }
            }
        }
    }

    async fn mark(&self, entry: &EmissionEntry, status: MatchStatus, summary: &mut RunSummary) {
        if let Err(err) = self.entries.set_match_status(entry.id, status).await {
            summary.errors.push(format!("entry {}: {}", entry.id, err));
        }
    }
}

/// On-demand operator view over persisted match state, independent of any
/// single run.
pub struct DiagnosticsReporter {
    entries: Arc<dyn EntryStore>,
}

impl DiagnosticsReporter {
    pub fn new(entries: Arc<dyn EntryStore>) -> Self {
        Self { entries }
    }

    pub async fn report(&self, company_id: Uuid) -> Result<Vec<DiagnosticLogEntry>, StoreError> {
        let flagged = self
            .entries
            .fetch_by_status(company_id, &[MatchStatus::Unmatched, MatchStatus::Error])
            .await?;
        Ok(flagged.iter().map(describe_entry).collect())
    }
}

fn describe_entry(entry: &EmissionEntry) -> DiagnosticLogEntry {
    match entry.match_status {
        MatchStatus::Error => DiagnosticLogEntry {
            severity: Severity::Error,
            message: format!(
                "estimation failed for entry {} (\"{}\", {} {}, scope {}); classification succeeded",
                entry.id,
                entry.category,
                entry.quantity,
                entry.unit,
                entry.scope.as_u8()
            ),
        },
        _ => DiagnosticLogEntry {
            severity: Severity::Warning,
            message: format!(
                "no classification rule matched entry {} (\"{}\", {} {}, scope {})",
                entry.id,
                entry.category,
                entry.quantity,
                entry.unit,
                entry.scope.as_u8()
            ),
        },
    }
}
