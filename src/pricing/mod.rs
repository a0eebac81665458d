//! LLM pricing/impact calculator: converts `(provider, model, token counts)` into
//! cost, energy, and carbon telemetry, driven by a versioned, hot-reloadable JSON
//! pricing table.
//!
//! Grounded on `tests/.../llm_service/test_pricing_calculator_coverage.py` (CIRISAgent),
//! which exercises the real (unretrieved) `PricingCalculator` implementation thoroughly
//! enough to reconstruct its field names, defaults, and resolution order. Unit scale is
//! resolved in `SPEC_FULL.md` §4.3: `input_cost`/`output_cost` are cents per million
//! tokens, uniformly.
//!
//! ## Rust Learning Notes:
//!
//! ### `RwLock<Arc<T>>` for hot-reloadable config
//! `PricingCalculator` can be read from many call sites concurrently while an
//! operator reloads the pricing table underneath it. Wrapping the config in
//! `Arc` means a reader clones a cheap reference-counted pointer while holding
//! the lock only long enough to do that clone (see `current()`), then reads
//! the snapshot lock-free. A reload swaps in a whole new `Arc` atomically
//! under a brief write lock, so in-flight readers keep their own snapshot
//! instead of observing a half-updated table.
//!
//! ### `BTreeMap` vs `HashMap`
//! Most maps in this module are `HashMap` because nothing depends on their
//! iteration order. `PricingConfig::providers` is the exception — see its
//! field doc below.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_PRICING_JSON: &str = include_str!("default_pricing.json");

#[derive(Error, Debug)]
pub enum PricingError {
    #[error("invalid pricing config: {0}")]
    Invalid(String),
    #[error("failed to parse pricing config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Cents per million input tokens.
    pub input_cost: f64,
    /// Cents per million output tokens.
    pub output_cost: f64,
    pub context_window: u64,
    pub active: bool,
    pub deprecated: bool,
    pub effective_date: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub provider_specific: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub display_name: String,
    #[serde(default)]
    pub base_url: Option<String>,
    pub models: HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnergyEstimates {
    pub model_patterns: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarbonIntensity {
    pub global_average_g_co2_per_kwh: f64,
    #[serde(default)]
    pub regions: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentalFactors {
    pub energy_estimates: EnergyEstimates,
    pub carbon_intensity: CarbonIntensity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackPricing {
    pub unknown_model: ModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PricingMetadata {
    #[serde(default)]
    pub update_frequency: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub units: Option<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub schema_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    pub version: String,
    pub last_updated: String,
    #[serde(default)]
    pub metadata: PricingMetadata,
    /// A `BTreeMap` rather than a `HashMap`: resolution below scans this table
    /// looking for a model id, and that scan must be deterministic across
    /// process restarts (SPEC_FULL.md "first match wins, deterministic
    /// ordering"), which `HashMap`'s randomized iteration order cannot give us.
    pub providers: BTreeMap<String, ProviderConfig>,
    pub environmental_factors: EnvironmentalFactors,
    pub fallback_pricing: FallbackPricing,
}

impl PricingConfig {
    pub fn parse_and_validate(raw: &str) -> Result<Self, PricingError> {
        let config: PricingConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), PricingError> {
        let parts: Vec<&str> = self.version.split('.').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.parse::<u64>().is_err()) {
            return Err(PricingError::Invalid(format!(
                "version '{}' is not strict MAJOR.MINOR.PATCH semver",
                self.version
            )));
        }
        NaiveDate::parse_from_str(&self.last_updated, "%Y-%m-%d")
            .map_err(|_| PricingError::Invalid(format!("last_updated '{}' is not YYYY-MM-DD", self.last_updated)))?;

        for (provider_id, provider) in &self.providers {
            for (model_id, model) in &provider.models {
                validate_model(provider_id, model_id, model)?;
            }
        }
        validate_model("fallback_pricing", "unknown_model", &self.fallback_pricing.unknown_model)?;
        Ok(())
    }
}

fn validate_model(provider_id: &str, model_id: &str, model: &ModelConfig) -> Result<(), PricingError> {
    if model.input_cost < 0.0 || model.output_cost < 0.0 {
        return Err(PricingError::Invalid(format!(
            "{provider_id}/{model_id}: costs must be non-negative"
        )));
    }
    if model.context_window == 0 {
        return Err(PricingError::Invalid(format!(
            "{provider_id}/{model_id}: context_window must be positive"
        )));
    }
    NaiveDate::parse_from_str(&model.effective_date, "%Y-%m-%d").map_err(|_| {
        PricingError::Invalid(format!(
            "{provider_id}/{model_id}: effective_date '{}' is not YYYY-MM-DD",
            model.effective_date
        ))
    })?;
    Ok(())
}

impl Default for PricingConfig {
    fn default() -> Self {
        PricingConfig::parse_and_validate(DEFAULT_PRICING_JSON)
            .expect("bundled default pricing table must be valid")
    }
}

/// Fully populated cost/energy/carbon tuple for one LLM call.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResourceUsage {
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub tokens_used: u64,
    pub cost_cents: f64,
    pub carbon_grams: f64,
    pub energy_kwh: f64,
    pub model_used: String,
}

/// Which step of the model-resolution order produced a lookup, surfaced for
/// operational introspection (`get_model_info`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResolutionStep {
    ExactInNamedProvider,
    ExactCrossProvider,
    PatternMatch,
    Fallback,
}

/// Deterministic pattern-match table, most-specific prefix first. Order matters:
/// `gpt-4o-mini` must be checked before `gpt-4o`.
const MODEL_PATTERNS: &[&str] = &[
    "gpt-4o-mini",
    "gpt-4o",
    "gpt-4-turbo",
    "gpt-3.5-turbo",
    "claude-3-opus",
    "claude-3-sonnet",
    "claude-3-haiku",
    "llama-3.1-405b",
    "llama-3.1-70b",
    "llama-4-maverick-17b",
];

/// `config` is the concrete `RwLock<Arc<T>>` from the module-level notes above:
/// the lock only ever guards a pointer swap, never the pricing table itself.
pub struct PricingCalculator {
    config: RwLock<Arc<PricingConfig>>,
}

impl PricingCalculator {
    pub fn new(config: PricingConfig) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(PricingConfig::default())
    }

    fn current(&self) -> Arc<PricingConfig> {
        self.config.read().unwrap().clone()
    }

    /// Atomically replaces the cached pricing table. The new table is parsed and
    /// validated before the swap, so a bad reload never affects in-flight calls.
    pub fn reload_pricing_config(&self, raw: &str) -> Result<(), PricingError> {
        let parsed = PricingConfig::parse_and_validate(raw)?;
        *self.config.write().unwrap() = Arc::new(parsed);
        Ok(())
    }

    fn resolve_model(
        &self,
        config: &PricingConfig,
        model_name: &str,
        provider_name: Option<&str>,
    ) -> (ModelConfig, ResolutionStep, String) {
        if let Some(provider_name) = provider_name {
            if let Some(provider) = config.providers.get(provider_name) {
                if let Some(model) = provider.models.get(model_name) {
                    return (model.clone(), ResolutionStep::ExactInNamedProvider, provider_name.to_string());
                }
            }
        }

        for (pid, provider) in &config.providers {
            if let Some(model) = provider.models.get(model_name) {
                return (model.clone(), ResolutionStep::ExactCrossProvider, pid.clone());
            }
        }

        let model_lower = model_name.to_lowercase();
        for pattern in MODEL_PATTERNS {
            if model_lower.contains(pattern) {
                for (pid, provider) in &config.providers {
                    if let Some(model) = provider.models.get(*pattern) {
                        return (model.clone(), ResolutionStep::PatternMatch, pid.clone());
                    }
                }
            }
        }

        (
            config.fallback_pricing.unknown_model.clone(),
            ResolutionStep::Fallback,
            "fallback".to_string(),
        )
    }

    pub fn get_model_config(&self, model_name: &str, provider_name: Option<&str>) -> ModelConfig {
        let config = self.current();
        self.resolve_model(&config, model_name, provider_name).0
    }

    pub fn get_model_info(&self, model_name: &str, provider_name: Option<&str>) -> (ModelConfig, ResolutionStep, String) {
        let config = self.current();
        self.resolve_model(&config, model_name, provider_name)
    }

    fn calculate_energy_consumption(&self, config: &PricingConfig, model_name: &str, total_tokens: u64) -> f64 {
        let model_lower = model_name.to_lowercase();
        let kwh_per_1k = config
            .environmental_factors
            .energy_estimates
            .model_patterns
            .iter()
            .find(|(pattern, _)| *pattern != "default" && *pattern != "unknown" && model_lower.contains(pattern.as_str()))
            .map(|(_, kwh)| *kwh)
            .or_else(|| config.environmental_factors.energy_estimates.model_patterns.get("default").copied())
            .unwrap_or(0.005);

        (total_tokens as f64 / 1000.0) * kwh_per_1k
    }

    fn calculate_carbon_emissions(&self, config: &PricingConfig, energy_kwh: f64, region: Option<&str>) -> f64 {
        let intensity = region
            .and_then(|r| config.environmental_factors.carbon_intensity.regions.get(r))
            .copied()
            .unwrap_or(config.environmental_factors.carbon_intensity.global_average_g_co2_per_kwh);
        energy_kwh * intensity
    }

    /// Primary entry point: resolves the model, computes cost/energy/carbon, and
    /// returns a fully populated [`ResourceUsage`].
    pub fn calculate_cost_and_impact(
        &self,
        model_name: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        provider_name: Option<&str>,
        region: Option<&str>,
    ) -> ResourceUsage {
        let config = self.current();
        let (model, _, _) = self.resolve_model(&config, model_name, provider_name);
        let total_tokens = prompt_tokens + completion_tokens;

        let cost_cents = (model.input_cost * prompt_tokens as f64 / 1_000_000.0)
            + (model.output_cost * completion_tokens as f64 / 1_000_000.0);
        let energy_kwh = self.calculate_energy_consumption(&config, model_name, total_tokens);
        let carbon_grams = self.calculate_carbon_emissions(&config, energy_kwh, region);

        ResourceUsage {
            tokens_input: prompt_tokens,
            tokens_output: completion_tokens,
            tokens_used: total_tokens,
            cost_cents,
            carbon_grams,
            energy_kwh,
            model_used: model_name.to_string(),
        }
    }

    /// `(provider, model)` pairs, optionally restricted to active models.
    pub fn list_available_models(&self, active_only: bool, provider_name: Option<&str>) -> Vec<(String, String)> {
        let config = self.current();
        let mut out = Vec::new();
        for (pid, provider) in &config.providers {
            if let Some(filter) = provider_name {
                if filter != pid {
                    continue;
                }
            }
            for (model_id, model) in &provider.models {
                if active_only && !model.active {
                    continue;
                }
                out.push((pid.clone(), model_id.clone()));
            }
        }
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_tokens_yield_zero_cost_energy_carbon() {
        let calc = PricingCalculator::with_defaults();
        let usage = calc.calculate_cost_and_impact("gpt-4o", 0, 0, None, None);
        assert_eq!(usage.cost_cents, 0.0);
        assert_eq!(usage.energy_kwh, 0.0);
        assert_eq!(usage.carbon_grams, 0.0);
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let calc = PricingCalculator::with_defaults();
        let a = calc.calculate_cost_and_impact("gpt-4o-mini", 1000, 500, Some("openai"), Some("us"));
        let b = calc.calculate_cost_and_impact("gpt-4o-mini", 1000, 500, Some("openai"), Some("us"));
        assert_eq!(a, b);
    }

    #[test]
    fn exact_named_provider_lookup_wins() {
        let calc = PricingCalculator::with_defaults();
        let usage = calc.calculate_cost_and_impact("gpt-4o", 1_000_000, 0, Some("openai"), None);
        assert!((usage.cost_cents - 250.0).abs() < 1e-9);
    }

    #[test]
    fn pattern_match_resolves_versioned_model_name() {
        let calc = PricingCalculator::with_defaults();
        let usage = calc.calculate_cost_and_impact("gpt-4o-mini-2024-07-18", 1_000_000, 0, None, None);
        assert!((usage.cost_cents - 15.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_falls_back() {
        let calc = PricingCalculator::with_defaults();
        let usage = calc.calculate_cost_and_impact("some-unreleased-model", 1_000_000, 0, None, None);
        assert!((usage.cost_cents - 500.0).abs() < 1e-9);
    }

    #[test]
    fn region_specific_carbon_intensity_is_used() {
        let calc = PricingCalculator::with_defaults();
        let us = calc.calculate_cost_and_impact("gpt-4o", 1000, 1000, Some("openai"), Some("us"));
        let eu = calc.calculate_cost_and_impact("gpt-4o", 1000, 1000, Some("openai"), Some("eu"));
        assert!(us.carbon_grams > eu.carbon_grams);
    }

    #[test]
    fn reload_replaces_config_atomically() {
        let calc = PricingCalculator::with_defaults();
        let before = calc.calculate_cost_and_impact("gpt-4o", 1_000_000, 0, Some("openai"), None);

        let mut config: serde_json::Value = serde_json::from_str(DEFAULT_PRICING_JSON).unwrap();
        config["providers"]["openai"]["models"]["gpt-4o"]["input_cost"] = serde_json::json!(1.0);
        calc.reload_pricing_config(&config.to_string()).unwrap();

        let after = calc.calculate_cost_and_impact("gpt-4o", 1_000_000, 0, Some("openai"), None);
        assert_ne!(before.cost_cents, after.cost_cents);
        assert!((after.cost_cents - 1.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_reload_is_rejected_and_leaves_old_config_intact() {
        let calc = PricingCalculator::with_defaults();
        let before = calc.calculate_cost_and_impact("gpt-4o", 1_000_000, 0, Some("openai"), None);
        let err = calc.reload_pricing_config("{ not valid json");
        assert!(err.is_err());
        let after = calc.calculate_cost_and_impact("gpt-4o", 1_000_000, 0, Some("openai"), None);
        assert_eq!(before, after);
    }

    #[test]
    fn deprecated_models_are_still_priced() {
        let calc = PricingCalculator::with_defaults();
        let usage = calc.calculate_cost_and_impact("gpt-3.5-turbo", 1_000_000, 0, Some("openai"), None);
        assert!(usage.cost_cents > 0.0);
    }
}
