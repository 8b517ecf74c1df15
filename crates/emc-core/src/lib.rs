//! Core domain model for the emission calculation pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "emc-core";

/// GHG Protocol scope of a reported activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Scope {
    Direct,
    PurchasedEnergy,
    ValueChain,
}

impl Scope {
    pub fn as_u8(self) -> u8 {
        match self {
            Scope::Direct => 1,
            Scope::PurchasedEnergy => 2,
            Scope::ValueChain => 3,
        }
    }
}

impl TryFrom<u8> for Scope {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Scope::Direct),
            2 => Ok(Scope::PurchasedEnergy),
            3 => Ok(Scope::ValueChain),
            other => Err(format!("scope must be 1, 2 or 3, got {other}")),
        }
    }
}

impl From<Scope> for u8 {
    fn from(scope: Scope) -> u8 {
        scope.as_u8()
    }
}

/// Per-entry matching state, mutated only by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    #[default]
    Pending,
    Matched,
    Unmatched,
    Error,
}

impl MatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::Pending => "pending",
            MatchStatus::Matched => "matched",
            MatchStatus::Unmatched => "unmatched",
            MatchStatus::Error => "error",
        }
    }
}

/// One reported activity record as read from the entry store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionEntry {
    pub id: Uuid,
    pub company_id: Uuid,
    pub date: NaiveDate,
    pub category: String,
    pub description: Option<String>,
    pub quantity: f64,
    pub unit: String,
    pub scope: Scope,
    #[serde(default)]
    pub match_status: MatchStatus,
}

/// Quantities are validated upstream of the classifier; zero is a valid
/// amount, negative and non-finite values are not.
pub fn quantity_is_valid(quantity: f64) -> bool {
    quantity.is_finite() && quantity >= 0.0
}

/// Quantity dimension understood by the estimation provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parameter {
    Energy,
    Distance,
    Fuel,
    Weight,
    Money,
}

impl Parameter {
    pub fn as_str(self) -> &'static str {
        match self {
            Parameter::Energy => "energy",
            Parameter::Distance => "distance",
            Parameter::Fuel => "fuel",
            Parameter::Weight => "weight",
            Parameter::Money => "money",
        }
    }
}

/// Classifier output: the provider factor key plus the parameter/unit pairing
/// the provider expects for it. The classifier owns that pairing contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityDescriptor {
    pub activity_id: String,
    pub parameter: Parameter,
    pub unit: String,
}

/// Emission factor metadata echoed back by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorMetadata {
    pub name: String,
    pub source: String,
    pub region: String,
    pub category: String,
    pub year: Option<i32>,
    pub activity_id: String,
}

/// Constituent-gas breakdown; the provider omits gases it cannot attribute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct GasBreakdown {
    pub co2: Option<f64>,
    pub ch4: Option<f64>,
    pub n2o: Option<f64>,
}

/// The quantity and unit the provider actually applied the factor to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityData {
    pub value: f64,
    pub unit: String,
}

/// Estimation result for exactly one entry. At most one row exists per
/// `entry_id`; re-running a calculation replaces the prior row in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calculation {
    pub id: Uuid,
    pub entry_id: Uuid,
    pub company_id: Uuid,
    pub total_emissions: f64,
    pub emissions_unit: String,
    pub scope: Scope,
    pub factor: FactorMetadata,
    pub gases: GasBreakdown,
    pub activity_data: ActivityData,
    /// Exact request sent to the provider, kept for audit.
    pub request_params: serde_json::Value,
    pub calculated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Operator-facing diagnostic line for an unmatched or errored entry.
/// Generated on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticLogEntry {
    pub severity: Severity,
    pub message: String,
}
