//! LLM call orchestration: multi-provider failover, distribution strategies, and
//! telemetry emission.
//!
//! Grounded on `ciris_engine.logic.buses.llm_bus.LLMBus` (CIRISAgent): priority
//! grouping, the four distribution strategies, the 5s per-attempt timeout, and the
//! `llm.*` telemetry metric names are ported one-to-one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::circuit_breaker::CircuitBreakerError;
use crate::pricing::{PricingCalculator, ResourceUsage};
use crate::registry::{Priority, ProviderErrorKind, ServiceProvider, ServiceRegistry, ServiceType};
use crate::types::{LlmCallResponse, StructuredLlmRequest};

const LLM_CALL_TIMEOUT: Duration = Duration::from_secs(5);
const CALL_LLM_STRUCTURED_CAPABILITY: &str = "call_llm_structured";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DistributionStrategy {
    RoundRobin,
    LatencyBased,
    Random,
    LeastLoaded,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceMetrics {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_latency_ms: u64,
    pub last_request_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub consecutive_failures: u64,
}

impl ServiceMetrics {
    pub fn average_latency_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.total_requests as f64
        }
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }
}

#[derive(Error, Debug)]
pub enum LlmBusError {
    #[error("circuit breaker open: {0}")]
    CircuitOpen(#[from] CircuitBreakerError),
    #[error("all {tried} LLM service(s) failed; last error: {last_error}")]
    AllLlmServicesFailed { tried: usize, last_error: String },
    #[error("LLM call timed out")]
    LlmTimeout,
    #[error("no LLM service available")]
    LlmServiceUnavailable,
    #[error("context length exceeded")]
    ContextLengthExceeded,
    #[error("content filter blocked the request")]
    ContentFilterBlocked,
}

/// Fire-and-forget telemetry sink. Failures are logged and dropped, never
/// propagated to the caller (SPEC_FULL.md §5 "Resource policy").
pub trait TelemetrySink: Send + Sync {
    fn record_metric(&self, name: &str, value: f64, handler_name: Option<&str>);
}

pub struct NullTelemetrySink;
impl TelemetrySink for NullTelemetrySink {
    fn record_metric(&self, _name: &str, _value: f64, _handler_name: Option<&str>) {}
}

pub struct LlmBus {
    registry: Arc<ServiceRegistry>,
    pricing: Arc<PricingCalculator>,
    telemetry: Arc<dyn TelemetrySink>,
    distribution_strategy: DistributionStrategy,
    metrics: DashMap<String, ServiceMetrics>,
    round_robin_indices: DashMap<Priority, AtomicUsize>,
}

impl LlmBus {
    pub fn new(registry: Arc<ServiceRegistry>, pricing: Arc<PricingCalculator>, distribution_strategy: DistributionStrategy) -> Self {
        Self {
            registry,
            pricing,
            telemetry: Arc::new(NullTelemetrySink),
            distribution_strategy,
            metrics: DashMap::new(),
            round_robin_indices: DashMap::new(),
        }
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    /// Shared calculator handed to this bus at construction, exposed so
    /// orchestration code can register providers against the same instance
    /// a hot reload (`reload_pricing_config`) will affect uniformly.
    pub fn pricing(&self) -> &Arc<PricingCalculator> {
        &self.pricing
    }

    fn record_metric(&self, name: &str, value: f64, handler_name: &str) {
        self.telemetry.record_metric(name, value, Some(handler_name));
    }

    fn select_within_group<'a>(&self, group: &'a [ServiceProvider]) -> &'a ServiceProvider {
        match self.distribution_strategy {
            DistributionStrategy::RoundRobin => {
                let priority = group[0].priority;
                let counter = self
                    .round_robin_indices
                    .entry(priority)
                    .or_insert_with(|| AtomicUsize::new(0));
                let idx = counter.fetch_add(1, Ordering::Relaxed);
                &group[idx % group.len()]
            }
            DistributionStrategy::LatencyBased => {
                // Any provider with zero observed requests is warm-up priority.
                if let Some(unwarmed) = group.iter().find(|p| {
                    self.metrics.get(&p.name).map(|m| m.total_requests == 0).unwrap_or(true)
                }) {
                    return unwarmed;
                }
                group
                    .iter()
                    .min_by(|a, b| {
                        let la = self.metrics.get(&a.name).map(|m| m.average_latency_ms()).unwrap_or(0.0);
                        let lb = self.metrics.get(&b.name).map(|m| m.average_latency_ms()).unwrap_or(0.0);
                        la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .unwrap()
            }
            DistributionStrategy::Random => group.choose(&mut rand::thread_rng()).unwrap(),
            DistributionStrategy::LeastLoaded => group
                .iter()
                .min_by_key(|p| self.metrics.get(&p.name).map(|m| m.total_requests).unwrap_or(0))
                .unwrap(),
        }
    }

    /// Restricts candidates to domain matches when any exist (falling through to
    /// the full candidate set otherwise), then groups by effective priority. The
    /// domain filter is exclusive rather than a tiebreaker: a matching NORMAL
    /// provider must win over a non-matching CRITICAL one, which no priority
    /// boost bounded at HIGH could ever achieve. Surviving matches still get a
    /// one-step boost (bounded at HIGH) so that among several domain matches,
    /// a lower-tier one is pulled closer to the providers it was filtered
    /// alongside.
    fn group_by_effective_priority(candidates: Vec<ServiceProvider>, domain: Option<&str>) -> Vec<(Priority, Vec<ServiceProvider>)> {
        let matching: Vec<ServiceProvider> = match domain {
            Some(d) => candidates
                .iter()
                .filter(|c| c.metadata.get("domain").map(|v| v == d).unwrap_or(false))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        let filtered_to_domain = !matching.is_empty();
        let pool = if filtered_to_domain { matching } else { candidates };

        let mut groups: Vec<(Priority, Vec<ServiceProvider>)> = Vec::new();
        for provider in pool {
            let effective_priority = if filtered_to_domain { provider.priority.step_up() } else { provider.priority };

            match groups.iter_mut().find(|(p, _)| *p == effective_priority) {
                Some((_, v)) => v.push(provider),
                None => groups.push((effective_priority, vec![provider])),
            }
        }
        groups.sort_by_key(|(p, _)| *p);
        groups
    }

    fn touch_metrics_on_success(&self, name: &str, latency: Duration) {
        let mut entry = self.metrics.entry(name.to_string()).or_default();
        entry.total_requests += 1;
        entry.total_latency_ms += latency.as_millis() as u64;
        entry.last_request_time = Some(Utc::now());
        entry.consecutive_failures = 0;
    }

    fn touch_metrics_on_failure(&self, name: &str) {
        let mut entry = self.metrics.entry(name.to_string()).or_default();
        entry.total_requests += 1;
        entry.failed_requests += 1;
        entry.consecutive_failures += 1;
        entry.last_failure_time = Some(Utc::now());
    }

    /// Primary operation: structured LLM call with failover across priority groups.
    pub async fn call_structured(
        &self,
        request: StructuredLlmRequest,
        handler_name: &str,
        domain: Option<&str>,
    ) -> Result<(LlmCallResponse, ResourceUsage), LlmBusError> {
        let candidates = self
            .registry
            .get_services(ServiceType::Llm, &[CALL_LLM_STRUCTURED_CAPABILITY.to_string()], None)
            .await;

        if candidates.is_empty() {
            return Err(LlmBusError::LlmServiceUnavailable);
        }

        let groups = Self::group_by_effective_priority(candidates, domain);

        let mut last_error: Option<String> = None;
        let mut tried = 0usize;
        let mut logged_failure_for: std::collections::HashSet<String> = std::collections::HashSet::new();

        for (_priority, mut group) in groups {
            while !group.is_empty() {
                let provider = self.select_within_group(&group).clone();
                group.retain(|p| p.name != provider.name);

                if !provider.circuit_breaker.is_available() {
                    continue;
                }

                tried += 1;
                let start = Instant::now();
                let llm = provider.instance.as_llm().expect("LLM service_type must carry an Llm instance");

                let call = tokio::time::timeout(LLM_CALL_TIMEOUT, llm.call_llm_structured(&request)).await;

                match call {
                    Ok(Ok((response, usage))) => {
                        let latency = start.elapsed();
                        provider.circuit_breaker.record_success();
                        self.touch_metrics_on_success(&provider.name, latency);

                        self.record_metric("llm.tokens.total", usage.tokens_used as f64, handler_name);
                        self.record_metric("llm.tokens.input", usage.tokens_input as f64, handler_name);
                        self.record_metric("llm.tokens.output", usage.tokens_output as f64, handler_name);
                        self.record_metric("llm.cost.cents", usage.cost_cents, handler_name);
                        self.record_metric("llm.environmental.carbon_grams", usage.carbon_grams, handler_name);
                        self.record_metric("llm.environmental.energy_kwh", usage.energy_kwh, handler_name);
                        self.record_metric("llm.latency.ms", latency.as_millis() as f64, handler_name);

                        return Ok((response, usage));
                    }
                    Ok(Err(call_error)) => {
                        let counts_against_breaker =
                            !matches!(call_error.kind, ProviderErrorKind::Throttled | ProviderErrorKind::Validation);
                        if counts_against_breaker {
                            provider.circuit_breaker.record_failure();
                            self.touch_metrics_on_failure(&provider.name);
                        }

                        if logged_failure_for.insert(provider.name.clone()) {
                            error!(provider = %provider.name, error = %call_error.message, "LLM provider call failed");
                        } else {
                            warn!(provider = %provider.name, error = %call_error.message, "LLM provider call failed again");
                        }

                        match call_error.kind {
                            ProviderErrorKind::ContextLengthExceeded => return Err(LlmBusError::ContextLengthExceeded),
                            ProviderErrorKind::ContentFilterBlocked => return Err(LlmBusError::ContentFilterBlocked),
                            ProviderErrorKind::Validation => return Err(LlmBusError::AllLlmServicesFailed {
                                tried,
                                last_error: call_error.message,
                            }),
                            _ => {
                                last_error = Some(call_error.message);
                            }
                        }
                    }
                    Err(_elapsed) => {
                        provider.circuit_breaker.record_failure();
                        self.touch_metrics_on_failure(&provider.name);
                        warn!(provider = %provider.name, "LLM provider call timed out after {:?}", LLM_CALL_TIMEOUT);
                        last_error = Some("first-token timeout exceeded".to_string());
                    }
                }
            }
        }

        if tried == 0 {
            return Err(LlmBusError::LlmServiceUnavailable);
        }

        Err(LlmBusError::AllLlmServicesFailed {
            tried,
            last_error: last_error.unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    pub fn get_available_models(&self) -> Vec<String> {
        let mut all = std::collections::HashSet::new();
        for provider in self.registry.get_services_by_type(ServiceType::Llm) {
            if let Some(llm) = provider.instance.as_llm() {
                all.extend(llm.get_available_models());
            }
        }
        all.into_iter().collect()
    }

    pub fn get_service_stats(&self) -> HashMap<String, ServiceMetrics> {
        self.metrics.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }

    /// Test-only: clears all circuit breaker state for every registered LLM provider.
    pub fn clear_circuit_breakers(&self) {
        warn!("clear_circuit_breakers called: this bypasses resilience state and must only be used in tests");
        for provider in self.registry.get_services_by_type(ServiceType::Llm) {
            provider.circuit_breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::registry::{
        BaseProvider, LlmCallError, LlmProviderService, ProviderInstance, ProviderKind, SelectionStrategy,
    };
    use async_trait::async_trait;
    use std::collections::HashSet;

    struct ScriptedProvider {
        fail: bool,
        model: &'static str,
    }

    #[async_trait]
    impl BaseProvider for ScriptedProvider {
        fn get_capabilities(&self) -> HashSet<String> {
            [CALL_LLM_STRUCTURED_CAPABILITY.to_string()].into_iter().collect()
        }
    }

    #[async_trait]
    impl LlmProviderService for ScriptedProvider {
        async fn call_llm_structured(
            &self,
            _request: &StructuredLlmRequest,
        ) -> Result<(LlmCallResponse, ResourceUsage), LlmCallError> {
            if self.fail {
                Err(LlmCallError {
                    kind: ProviderErrorKind::Transient,
                    message: "simulated failure".to_string(),
                })
            } else {
                Ok((
                    LlmCallResponse {
                        content: "ok".to_string(),
                        model: self.model.to_string(),
                        prompt_tokens: 10,
                        completion_tokens: 5,
                    },
                    ResourceUsage {
                        tokens_input: 10,
                        tokens_output: 5,
                        tokens_used: 15,
                        cost_cents: 0.01,
                        carbon_grams: 0.1,
                        energy_kwh: 0.001,
                        model_used: self.model.to_string(),
                    },
                ))
            }
        }
        fn get_available_models(&self) -> Vec<String> {
            vec![self.model.to_string()]
        }
    }

    struct CountingFailingProvider {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BaseProvider for CountingFailingProvider {
        fn get_capabilities(&self) -> HashSet<String> {
            [CALL_LLM_STRUCTURED_CAPABILITY.to_string()].into_iter().collect()
        }
    }

    #[async_trait]
    impl LlmProviderService for CountingFailingProvider {
        async fn call_llm_structured(
            &self,
            _request: &StructuredLlmRequest,
        ) -> Result<(LlmCallResponse, ResourceUsage), LlmCallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(LlmCallError { kind: ProviderErrorKind::Transient, message: "simulated failure".to_string() })
        }
        fn get_available_models(&self) -> Vec<String> {
            vec!["counting".to_string()]
        }
    }

    fn make_bus() -> (Arc<ServiceRegistry>, LlmBus) {
        let registry = Arc::new(ServiceRegistry::new());
        let pricing = Arc::new(PricingCalculator::with_defaults());
        let bus = LlmBus::new(registry.clone(), pricing, DistributionStrategy::RoundRobin);
        (registry, bus)
    }

    #[tokio::test]
    async fn failover_to_second_provider_on_first_failure() {
        let (registry, bus) = make_bus();
        registry
            .register_service(
                ServiceType::Llm,
                "High",
                ProviderInstance::Llm(Arc::new(ScriptedProvider { fail: true, model: "fails" })),
                Priority::High,
                0,
                vec![CALL_LLM_STRUCTURED_CAPABILITY.to_string()],
                HashMap::new(),
                SelectionStrategy::Fallback,
                Some(ProviderKind::Mock),
                None,
            )
            .unwrap();
        registry
            .register_service(
                ServiceType::Llm,
                "Normal",
                ProviderInstance::Llm(Arc::new(ScriptedProvider { fail: false, model: "succeeds" })),
                Priority::Normal,
                0,
                vec![CALL_LLM_STRUCTURED_CAPABILITY.to_string()],
                HashMap::new(),
                SelectionStrategy::Fallback,
                Some(ProviderKind::Mock),
                None,
            )
            .unwrap();

        let request = StructuredLlmRequest {
            messages: vec![],
            max_tokens: Some(100),
            temperature: Some(0.0),
        };
        let (response, _usage) = bus.call_structured(request, "handler", None).await.unwrap();
        assert_eq!(response.model, "succeeds");

        let stats = bus.get_service_stats();
        assert_eq!(stats.get("High_1").unwrap().failed_requests, 1);
    }

    #[tokio::test]
    async fn domain_match_boosts_provider_above_a_non_matching_one() {
        let (registry, bus) = make_bus();
        registry
            .register_service(
                ServiceType::Llm,
                "General",
                ProviderInstance::Llm(Arc::new(ScriptedProvider { fail: false, model: "general" })),
                Priority::Critical,
                0,
                vec![CALL_LLM_STRUCTURED_CAPABILITY.to_string()],
                HashMap::new(),
                SelectionStrategy::Fallback,
                Some(ProviderKind::Mock),
                None,
            )
            .unwrap();
        let mut medical_metadata = HashMap::new();
        medical_metadata.insert("domain".to_string(), "medical".to_string());
        registry
            .register_service(
                ServiceType::Llm,
                "Medical",
                ProviderInstance::Llm(Arc::new(ScriptedProvider { fail: false, model: "medical" })),
                Priority::Normal,
                0,
                vec![CALL_LLM_STRUCTURED_CAPABILITY.to_string()],
                medical_metadata,
                SelectionStrategy::Fallback,
                Some(ProviderKind::Mock),
                None,
            )
            .unwrap();

        let request = StructuredLlmRequest { messages: vec![], max_tokens: None, temperature: None };
        let (response, _usage) = bus.call_structured(request.clone(), "handler", Some("medical")).await.unwrap();
        assert_eq!(response.model, "medical");

        let (response, _usage) = bus.call_structured(request, "handler", None).await.unwrap();
        assert_eq!(response.model, "general");
    }

    #[tokio::test]
    async fn all_providers_failing_raises_composite_error() {
        let (registry, bus) = make_bus();
        registry
            .register_service(
                ServiceType::Llm,
                "Only",
                ProviderInstance::Llm(Arc::new(ScriptedProvider { fail: true, model: "x" })),
                Priority::Normal,
                0,
                vec![CALL_LLM_STRUCTURED_CAPABILITY.to_string()],
                HashMap::new(),
                SelectionStrategy::Fallback,
                Some(ProviderKind::Mock),
                None,
            )
            .unwrap();

        let request = StructuredLlmRequest {
            messages: vec![],
            max_tokens: None,
            temperature: None,
        };
        let err = bus.call_structured(request, "handler", None).await.unwrap_err();
        assert!(matches!(err, LlmBusError::AllLlmServicesFailed { tried: 1, .. }));
    }

    #[tokio::test]
    async fn circuit_breaker_trips_after_threshold_and_then_fails_fast() {
        let (registry, bus) = make_bus();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .register_service(
                ServiceType::Llm,
                "Flaky",
                ProviderInstance::Llm(Arc::new(CountingFailingProvider { calls: calls.clone() })),
                Priority::Normal,
                0,
                vec![CALL_LLM_STRUCTURED_CAPABILITY.to_string()],
                HashMap::new(),
                SelectionStrategy::Fallback,
                Some(ProviderKind::Mock),
                Some(CircuitBreakerConfig { failure_threshold: 3, recovery_timeout_seconds: 60.0, success_threshold: 2, timeout_duration_seconds: 30.0 }),
            )
            .unwrap();

        let request = StructuredLlmRequest { messages: vec![], max_tokens: None, temperature: None };
        for _ in 0..3 {
            let err = bus.call_structured(request.clone(), "handler", None).await.unwrap_err();
            assert!(matches!(err, LlmBusError::AllLlmServicesFailed { .. }));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Fourth call: breaker is open, the only candidate is skipped without a
        // call, so the composite error path sees zero tried and surfaces
        // unavailability rather than a failure tally.
        let err = bus.call_structured(request, "handler", None).await.unwrap_err();
        assert!(matches!(err, LlmBusError::LlmServiceUnavailable));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
