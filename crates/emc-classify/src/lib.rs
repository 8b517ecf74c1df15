//! Scope-aware rule classification + estimation batch building.

use emc_core::{ActivityDescriptor, EmissionEntry, Parameter, Scope};
use emc_store::EstimationRequest;

pub const CRATE_NAME: &str = "emc-classify";

/// One classification rule. Rules are evaluated in table order within a
/// scope; the first rule whose keyword appears in the lowercased
/// category+description text wins.
#[derive(Debug, Clone, Copy)]
struct Rule {
    scope: Scope,
    keywords: &'static [&'static str],
    activity_id: &'static str,
    parameter: Parameter,
    default_unit: &'static str,
    /// `(token, provider_unit)`: if the entry's unit string contains the
    /// token, the rule emits the provider unit instead of the default.
    unit_overrides: &'static [(&'static str, &'static str)],
}

impl Rule {
    fn descriptor_for(&self, entry_unit_lower: &str) -> ActivityDescriptor {
        let unit = self
            .unit_overrides
            .iter()
            .find(|(token, _)| entry_unit_lower.contains(token))
            .map(|(_, provider_unit)| *provider_unit)
            .unwrap_or(self.default_unit);
        ActivityDescriptor {
            activity_id: self.activity_id.to_string(),
            parameter: self.parameter,
            unit: unit.to_string(),
        }
    }
}

// Table order is the priority order. Scope 1 fuel rules come before the
// vehicle rule so "Diesel for company vehicles" resolves as diesel.
const RULES: &[Rule] = &[
    // Scope 1: direct emissions.
    Rule {
        scope: Scope::Direct,
        keywords: &["diesel"],
        activity_id: "fuel_combustion-fossil_diesel",
        parameter: Parameter::Fuel,
        default_unit: "L",
        unit_overrides: &[("gal", "gal")],
    },
    Rule {
        scope: Scope::Direct,
        keywords: &["petrol", "gasoline"],
        activity_id: "fuel_combustion-fossil_petrol",
        parameter: Parameter::Fuel,
        default_unit: "L",
        unit_overrides: &[("gal", "gal")],
    },
    Rule {
        scope: Scope::Direct,
        keywords: &["natural gas", "stationary combustion", "boiler"],
        activity_id: "fuel_combustion-fossil_natural_gas",
        parameter: Parameter::Energy,
        default_unit: "kWh",
        unit_overrides: &[("mj", "MJ")],
    },
    Rule {
        scope: Scope::Direct,
        keywords: &["company vehicle", "vehicle", "fleet", "car"],
        activity_id: "passenger_vehicle-vehicle_type_car-fuel_source_na",
        parameter: Parameter::Distance,
        default_unit: "km",
        unit_overrides: &[("mi", "mi")],
    },
    // Scope 2: purchased energy.
    Rule {
        scope: Scope::PurchasedEnergy,
        keywords: &["electricity", "electric"],
        activity_id: "electricity-supply_grid-source_residual_mix",
        parameter: Parameter::Energy,
        default_unit: "kWh",
        unit_overrides: &[("mwh", "MWh")],
    },
    Rule {
        scope: Scope::PurchasedEnergy,
        keywords: &["heat", "steam", "district heating"],
        activity_id: "heat_and_steam-type_purchased",
        parameter: Parameter::Energy,
        default_unit: "kWh",
        unit_overrides: &[("mj", "MJ")],
    },
    // Scope 3: value chain.
    Rule {
        scope: Scope::ValueChain,
        keywords: &["flight", "air travel", "airfare"],
        activity_id: "passenger_flight-route_type_international-class_na",
        parameter: Parameter::Distance,
        default_unit: "km",
        unit_overrides: &[("mi", "mi")],
    },
    Rule {
        scope: Scope::ValueChain,
        keywords: &["commut", "train", "rail", "bus"],
        activity_id: "passenger_train-route_type_commuter-fuel_source_na",
        parameter: Parameter::Distance,
        default_unit: "km",
        unit_overrides: &[("mi", "mi")],
    },
    Rule {
        scope: Scope::ValueChain,
        keywords: &["waste", "garbage", "landfill"],
        activity_id: "waste_type_mixed-disposal_method_landfill",
        parameter: Parameter::Weight,
        default_unit: "kg",
        unit_overrides: &[("tonne", "t"), ("ton", "t")],
    },
    Rule {
        scope: Scope::ValueChain,
        keywords: &["purchased goods", "goods", "services", "procurement"],
        activity_id: "consumer_goods-type_general",
        parameter: Parameter::Money,
        default_unit: "usd",
        unit_overrides: &[("eur", "eur"), ("gbp", "gbp")],
    },
];

/// Pure, deterministic classification of one entry. Returns `None` when no
/// scope-specific rule matches; there is deliberately no generic fallback, so
/// a miss surfaces as `unmatched` instead of a wrong-but-successful guess.
pub fn classify(entry: &EmissionEntry) -> Option<ActivityDescriptor> {
    let haystack = match entry.description.as_deref() {
        Some(description) => format!("{} {}", entry.category, description).to_lowercase(),
        None => entry.category.to_lowercase(),
    };
    let unit = entry.unit.to_lowercase();

    RULES
        .iter()
        .filter(|rule| rule.scope == entry.scope)
        .find(|rule| rule.keywords.iter().any(|k| haystack.contains(k)))
        .map(|rule| rule.descriptor_for(&unit))
}

/// One estimation request per classified entry, positionally aligned with
/// the input slice. Unclassified entries never reach this function.
pub fn build_batch(
    classified: &[(EmissionEntry, ActivityDescriptor)],
    data_version: &str,
) -> Vec<EstimationRequest> {
    classified
        .iter()
        .map(|(entry, descriptor)| {
            EstimationRequest::new(
                descriptor.activity_id.clone(),
                data_version,
                descriptor.parameter,
                entry.quantity,
                &descriptor.unit,
            )
        })
        .collect()
}
