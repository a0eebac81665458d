//! Service registry: registers providers by service type, priority, and capability,
//! owns their circuit breakers, and enforces LLM mock/real isolation.
//!
//! Grounded on `ciris_engine.logic.registries.base.ServiceRegistry`, reconstructed from
//! `tests/logic/registries/test_registry_complexity.py` (CIRISAgent) since the real
//! `base.py` source was not retrieved. Per `SPEC_FULL.md` §9 "Design Notes", the
//! original's duck-typed `Any` instance is replaced here with an explicit
//! [`ProviderInstance`] enum of per-service-type trait objects, and the original's
//! class-name-sniffing mock detection is replaced with an explicit [`ProviderKind`]
//! supplied at registration (metadata-based detection is kept alongside it so
//! dynamically-loaded adapters that only carry metadata are still covered).
//!
//! ## Rust Learning Notes:
//!
//! ### `Arc<dyn Trait>` instead of duck typing
//! The Python original stores providers as `Any` and finds out at call time
//! whether an object happens to have a `get_guidance` method. Rust has no
//! runtime method probing, so [`ProviderInstance`] makes the per-service-type
//! contract explicit: one variant per service type, each holding an
//! `Arc<dyn SomeProviderService>` trait object. `Arc` rather than `Box`
//! because the same provider is cloned out to every bus that looks it up —
//! cloning an `Arc` is a refcount bump, not a copy of the underlying adapter.
//!
//! ### `RwLock<HashMap<...>>` for the service table
//! Lookups (`get_provider`, health checks) vastly outnumber registrations, so
//! [`ServiceRegistry`] keeps its tables behind `RwLock` rather than `Mutex`:
//! many readers can walk the provider list for a service type concurrently,
//! and only `register_service` needs the exclusive write half. The counters
//! in [`RegistryCounters`] are plain atomics instead of living inside a lock,
//! since they're updated far more often than the tables they describe.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::pricing::ResourceUsage;
use crate::types::{
    DeferralRequest, FetchedMessage, GuidanceContext, GuidanceRequest, GuidanceResponse, LlmCallResponse,
    MemoryNode, StructuredLlmRequest, ToolExecutionResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ServiceType {
    Llm,
    Memory,
    Communication,
    Tool,
    WiseAuthority,
    RuntimeControl,
    Audit,
    Telemetry,
    Config,
    Time,
    Secrets,
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Promotes to `High`, the ceiling for a domain-match boost (SPEC_FULL.md
    /// §4.6). `Critical` and `High` are unaffected — this never demotes.
    pub fn step_up(self) -> Self {
        match self {
            Priority::Low | Priority::Normal => Priority::High,
            Priority::High | Priority::Critical => self,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SelectionStrategy {
    Fallback,
    RoundRobin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProviderKind {
    Mock,
    Real,
}

/// Minimal contract shared by every provider, regardless of service type.
#[async_trait]
pub trait BaseProvider: Send + Sync {
    async fn is_healthy(&self) -> bool {
        true
    }
    fn get_capabilities(&self) -> HashSet<String>;
}

#[derive(Debug, Clone)]
pub struct ProviderError(pub String);

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for ProviderError {}

/// Whether an error counts against the circuit breaker. Rate-limit/429 responses
/// are throttling, not unhealthiness (SPEC_FULL.md §4.6 "Security").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Throttled,
    Transient,
    Validation,
    ContextLengthExceeded,
    ContentFilterBlocked,
}

#[derive(Debug, Clone)]
pub struct LlmCallError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

#[async_trait]
pub trait LlmProviderService: BaseProvider {
    async fn call_llm_structured(
        &self,
        request: &StructuredLlmRequest,
    ) -> Result<(LlmCallResponse, ResourceUsage), LlmCallError>;
    fn get_available_models(&self) -> Vec<String>;
}

#[async_trait]
pub trait WiseAuthorityProviderService: BaseProvider {
    async fn send_deferral(&self, _request: &DeferralRequest) -> Result<bool, ProviderError> {
        Ok(false)
    }
    async fn get_guidance(&self, _request: &GuidanceRequest) -> Result<GuidanceResponse, ProviderError> {
        Err(ProviderError("get_guidance not supported".to_string()))
    }
    async fn fetch_guidance(&self, _context: &GuidanceContext) -> Result<Option<String>, ProviderError> {
        Ok(None)
    }
    fn supports_send_deferral(&self) -> bool {
        false
    }
    fn supports_get_guidance(&self) -> bool {
        false
    }
}

#[async_trait]
pub trait CommunicationProviderService: BaseProvider {
    async fn send_message(
        &self,
        handler: &str,
        channel_id: &str,
        content: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<bool, ProviderError>;
    async fn fetch_messages(
        &self,
        channel_id: &str,
        limit: usize,
        adapter_hint: Option<&str>,
    ) -> Result<Vec<FetchedMessage>, ProviderError>;
}

#[async_trait]
pub trait MemoryProviderService: BaseProvider {
    async fn memorize(&self, node: &MemoryNode) -> Result<bool, ProviderError>;
    async fn recall(&self, node_id: &str) -> Result<Option<MemoryNode>, ProviderError>;
    async fn forget(&self, node_id: &str) -> Result<bool, ProviderError>;
}

#[async_trait]
pub trait ToolProviderService: BaseProvider {
    fn list_tools(&self) -> Vec<String>;
    async fn execute_tool(&self, tool_name: &str, args: &HashMap<String, String>) -> Result<ToolExecutionResult, ProviderError>;
}

#[async_trait]
pub trait RuntimeControlProviderService: BaseProvider {
    async fn pause(&self) -> Result<bool, ProviderError>;
    async fn resume(&self) -> Result<bool, ProviderError>;
    async fn single_step(&self) -> Result<bool, ProviderError>;
    async fn queue_depth(&self) -> u64;
}

#[async_trait]
pub trait GenericProviderService: BaseProvider {}

/// Minimal read surface needed by buses that look up runtime configuration
/// (e.g. WiseBus's agent-tier resolution). Full config-service semantics are
/// out of scope; this is the narrow slice other components depend on.
#[async_trait]
pub trait ConfigProviderService: BaseProvider {
    async fn get_string(&self, key: &str) -> Option<String>;
}

/// Type-erased, per-service-type provider handle. Buses downcast to the concrete
/// trait they expect for their own service type.
///
/// Each variant wraps an `Arc<dyn Trait>` rather than a generic parameter: a
/// generic `ServiceProvider<T>` would force every bus and the registry itself
/// to be generic over the provider type too, and a single registry needs to
/// hold LLM, memory, and tool providers side by side in one collection. The
/// enum trades that compile-time genericity for a runtime `match` in the
/// `as_*` accessors below.
#[derive(Clone)]
pub enum ProviderInstance {
    Llm(Arc<dyn LlmProviderService>),
    WiseAuthority(Arc<dyn WiseAuthorityProviderService>),
    Communication(Arc<dyn CommunicationProviderService>),
    Memory(Arc<dyn MemoryProviderService>),
    Tool(Arc<dyn ToolProviderService>),
    RuntimeControl(Arc<dyn RuntimeControlProviderService>),
    Generic(Arc<dyn GenericProviderService>),
    Config(Arc<dyn ConfigProviderService>),
}

impl ProviderInstance {
    async fn is_healthy(&self) -> bool {
        match self {
            ProviderInstance::Llm(p) => p.is_healthy().await,
            ProviderInstance::WiseAuthority(p) => p.is_healthy().await,
            ProviderInstance::Communication(p) => p.is_healthy().await,
            ProviderInstance::Memory(p) => p.is_healthy().await,
            ProviderInstance::Tool(p) => p.is_healthy().await,
            ProviderInstance::RuntimeControl(p) => p.is_healthy().await,
            ProviderInstance::Generic(p) => p.is_healthy().await,
            ProviderInstance::Config(p) => p.is_healthy().await,
        }
    }

    pub fn as_llm(&self) -> Option<Arc<dyn LlmProviderService>> {
        match self {
            ProviderInstance::Llm(p) => Some(p.clone()),
            _ => None,
        }
    }

    pub fn as_wise_authority(&self) -> Option<Arc<dyn WiseAuthorityProviderService>> {
        match self {
            ProviderInstance::WiseAuthority(p) => Some(p.clone()),
            _ => None,
        }
    }

    pub fn as_communication(&self) -> Option<Arc<dyn CommunicationProviderService>> {
        match self {
            ProviderInstance::Communication(p) => Some(p.clone()),
            _ => None,
        }
    }

    pub fn as_memory(&self) -> Option<Arc<dyn MemoryProviderService>> {
        match self {
            ProviderInstance::Memory(p) => Some(p.clone()),
            _ => None,
        }
    }

    pub fn as_tool(&self) -> Option<Arc<dyn ToolProviderService>> {
        match self {
            ProviderInstance::Tool(p) => Some(p.clone()),
            _ => None,
        }
    }

    pub fn as_runtime_control(&self) -> Option<Arc<dyn RuntimeControlProviderService>> {
        match self {
            ProviderInstance::RuntimeControl(p) => Some(p.clone()),
            _ => None,
        }
    }

    pub fn as_config(&self) -> Option<Arc<dyn ConfigProviderService>> {
        match self {
            ProviderInstance::Config(p) => Some(p.clone()),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct ServiceProvider {
    pub name: String,
    pub service_type: ServiceType,
    pub instance: ProviderInstance,
    pub priority: Priority,
    pub priority_group: i32,
    pub capabilities: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub strategy: SelectionStrategy,
    pub provider_kind: Option<ProviderKind>,
    pub circuit_breaker: Arc<CircuitBreaker>,
}

impl ServiceProvider {
    fn is_mock(&self) -> bool {
        self.provider_kind == Some(ProviderKind::Mock)
            || self.metadata.get("provider").map(|p| p == "mock").unwrap_or(false)
    }
}

#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    #[error(
        "SECURITY VIOLATION: attempted to mix mock and real LLM providers in the same registry. \
         Existing provider '{existing_name}' is {existing_kind}, new provider '{new_name}' is {new_kind}."
    )]
    MockRealMixing {
        existing_name: String,
        existing_kind: &'static str,
        new_name: String,
        new_kind: &'static str,
    },
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct RegistryMetrics {
    pub total_providers: u64,
    pub service_type_count: u64,
    pub breaker_count: u64,
    pub open_breakers: u64,
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub health_check_failures: u64,
    pub max_open_breakers_seen: u64,
}

#[derive(Default)]
struct RegistryCounters {
    registrations_total: AtomicU64,
    lookups: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    health_check_failures: AtomicU64,
    max_open_breakers_seen: AtomicU64,
}

pub struct ServiceRegistry {
    services: RwLock<HashMap<ServiceType, Vec<ServiceProvider>>>,
    circuit_breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    round_robin_indices: RwLock<HashMap<(ServiceType, i32), AtomicUsize>>,
    /// Kept outside the `RwLock`s above: these are incremented on nearly
    /// every lookup, and bumping an atomic doesn't need to contend with
    /// readers walking `services`.
    counters: RegistryCounters,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::too_many_arguments)]
impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            circuit_breakers: RwLock::new(HashMap::new()),
            round_robin_indices: RwLock::new(HashMap::new()),
            counters: RegistryCounters::default(),
        }
    }

    /// Registers a provider and returns its unique name. `name_hint` plays the role
    /// of the original's "class name" component; callers typically pass the provider
    /// type's short name (e.g. `"OpenAiLlmProvider"`).
    pub fn register_service(
        &self,
        service_type: ServiceType,
        name_hint: &str,
        instance: ProviderInstance,
        priority: Priority,
        priority_group: i32,
        capabilities: Vec<String>,
        metadata: HashMap<String, String>,
        strategy: SelectionStrategy,
        provider_kind: Option<ProviderKind>,
        circuit_breaker_config: Option<CircuitBreakerConfig>,
    ) -> Result<String, RegistryError> {
        let mut services = self.services.write().unwrap();
        let existing = services.entry(service_type).or_default();

        let name = format!("{name_hint}_{}", existing.len() + 1);

        let candidate = ServiceProvider {
            name: name.clone(),
            service_type,
            instance,
            priority,
            priority_group,
            capabilities,
            metadata,
            strategy,
            provider_kind,
            circuit_breaker: Arc::new(CircuitBreaker::new(
                name.clone(),
                circuit_breaker_config.unwrap_or_default(),
            )),
        };

        if service_type == ServiceType::Llm {
            let candidate_is_mock = candidate.is_mock();
            if let Some(existing_llm) = existing.first() {
                let existing_is_mock = existing_llm.is_mock();
                if existing_is_mock != candidate_is_mock || (!existing_is_mock && !candidate_is_mock) {
                    // Either a mock/real mismatch, or two "real" registrations:
                    // both are rejected (SPEC_FULL.md §9 resolved Open Question).
                    return Err(RegistryError::MockRealMixing {
                        existing_name: existing_llm.name.clone(),
                        existing_kind: if existing_is_mock { "mock" } else { "real" },
                        new_name: candidate.name.clone(),
                        new_kind: if candidate_is_mock { "mock" } else { "real" },
                    });
                }
            }
        }

        self.circuit_breakers
            .write()
            .unwrap()
            .insert(name.clone(), candidate.circuit_breaker.clone());

        existing.push(candidate);
        existing.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.priority_group.cmp(&b.priority_group)));

        self.counters.registrations_total.fetch_add(1, Ordering::Relaxed);
        Ok(name)
    }

    pub fn unregister(&self, name: &str) {
        let mut services = self.services.write().unwrap();
        for providers in services.values_mut() {
            providers.retain(|p| p.name != name);
        }
        self.circuit_breakers.write().unwrap().remove(name);
    }

    fn has_required_capabilities(provider: &ServiceProvider, required: &[String]) -> bool {
        required.iter().all(|req| provider.capabilities.iter().any(|c| c == req))
    }

    /// Finds one eligible provider's instance for `service_type`, following the
    /// provider's own `strategy`. Accounts lookups/hits/misses as a side effect.
    pub async fn get_service(
        &self,
        _handler_name: &str,
        service_type: ServiceType,
        required_capabilities: &[String],
    ) -> Option<ProviderInstance> {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);

        let candidates: Vec<ServiceProvider> = {
            let services = self.services.read().unwrap();
            services.get(&service_type).cloned().unwrap_or_default()
        };

        if candidates.is_empty() {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let mut eligible_by_group: Vec<(i32, Vec<&ServiceProvider>)> = Vec::new();
        for provider in &candidates {
            if !Self::has_required_capabilities(provider, required_capabilities) {
                continue;
            }
            if !provider.circuit_breaker.is_available() {
                continue;
            }
            if !provider.instance.is_healthy().await {
                self.counters.health_check_failures.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match eligible_by_group.iter_mut().find(|(g, _)| *g == provider.priority_group) {
                Some((_, v)) => v.push(provider),
                None => eligible_by_group.push((provider.priority_group, vec![provider])),
            }
        }

        for (group, group_providers) in eligible_by_group {
            if group_providers.is_empty() {
                continue;
            }
            let selected = match group_providers[0].strategy {
                SelectionStrategy::Fallback => group_providers[0],
                SelectionStrategy::RoundRobin => {
                    let key = (service_type, group);
                    let idx = {
                        let indices = self.round_robin_indices.read().unwrap();
                        if let Some(counter) = indices.get(&key) {
                            counter.fetch_add(1, Ordering::Relaxed)
                        } else {
                            drop(indices);
                            let mut indices = self.round_robin_indices.write().unwrap();
                            let counter = indices.entry(key).or_insert_with(|| AtomicUsize::new(0));
                            counter.fetch_add(1, Ordering::Relaxed)
                        }
                    };
                    group_providers[idx % group_providers.len()]
                }
            };
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Some(selected.instance.clone());
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// All eligible providers across all priority groups, in priority order,
    /// capped at `limit`. Used by wise-bus fan-out and telemetry collectors.
    pub async fn get_services(
        &self,
        service_type: ServiceType,
        required_capabilities: &[String],
        limit: Option<usize>,
    ) -> Vec<ServiceProvider> {
        let candidates: Vec<ServiceProvider> = {
            let services = self.services.read().unwrap();
            services.get(&service_type).cloned().unwrap_or_default()
        };

        let mut out = Vec::new();
        for provider in candidates {
            if !Self::has_required_capabilities(&provider, required_capabilities) {
                continue;
            }
            if !provider.circuit_breaker.is_available() {
                continue;
            }
            if !provider.instance.is_healthy().await {
                continue;
            }
            out.push(provider);
            if let Some(limit) = limit {
                if out.len() >= limit {
                    break;
                }
            }
        }
        out
    }

    pub fn get_services_by_type(&self, service_type: ServiceType) -> Vec<ServiceProvider> {
        self.services.read().unwrap().get(&service_type).cloned().unwrap_or_default()
    }

    pub fn get_circuit_breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.circuit_breakers.read().unwrap().get(name).cloned()
    }

    pub fn metrics(&self) -> RegistryMetrics {
        let services = self.services.read().unwrap();
        let total_providers: u64 = services.values().map(|v| v.len() as u64).sum();
        let breakers = self.circuit_breakers.read().unwrap();
        let open_breakers = breakers
            .values()
            .filter(|cb| cb.state() == crate::circuit_breaker::CircuitState::Open)
            .count() as u64;

        let prev_max = self.counters.max_open_breakers_seen.load(Ordering::Relaxed);
        if open_breakers > prev_max {
            self.counters.max_open_breakers_seen.store(open_breakers, Ordering::Relaxed);
        }

        let lookups = self.counters.lookups.load(Ordering::Relaxed);
        let hits = self.counters.hits.load(Ordering::Relaxed);

        RegistryMetrics {
            total_providers,
            service_type_count: services.keys().count() as u64,
            breaker_count: breakers.len() as u64,
            open_breakers,
            lookups,
            hits,
            misses: self.counters.misses.load(Ordering::Relaxed),
            hit_rate: hits as f64 / lookups.max(1) as f64,
            health_check_failures: self.counters.health_check_failures.load(Ordering::Relaxed),
            max_open_breakers_seen: self.counters.max_open_breakers_seen.load(Ordering::Relaxed).max(open_breakers),
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    pub struct StubProvider {
        pub healthy: bool,
        pub capabilities: HashSet<String>,
    }

    #[async_trait]
    impl BaseProvider for StubProvider {
        async fn is_healthy(&self) -> bool {
            self.healthy
        }
        fn get_capabilities(&self) -> HashSet<String> {
            self.capabilities.clone()
        }
    }

    #[async_trait]
    impl LlmProviderService for StubProvider {
        async fn call_llm_structured(
            &self,
            _request: &StructuredLlmRequest,
        ) -> Result<(LlmCallResponse, ResourceUsage), LlmCallError> {
            Err(LlmCallError {
                kind: ProviderErrorKind::Transient,
                message: "stub provider does not serve calls".to_string(),
            })
        }
        fn get_available_models(&self) -> Vec<String> {
            vec![]
        }
    }
    #[async_trait]
    impl GenericProviderService for StubProvider {}

    pub fn llm_stub(healthy: bool) -> ProviderInstance {
        ProviderInstance::Llm(Arc::new(StubProvider {
            healthy,
            capabilities: HashSet::new(),
        }))
    }

    pub fn generic_stub() -> ProviderInstance {
        ProviderInstance::Generic(Arc::new(StubProvider {
            healthy: true,
            capabilities: HashSet::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn register_then_discover_by_type() {
        let registry = ServiceRegistry::new();
        registry
            .register_service(
                ServiceType::Memory,
                "MockMemory",
                generic_stub(),
                Priority::Normal,
                0,
                vec![],
                HashMap::new(),
                SelectionStrategy::Fallback,
                None,
                None,
            )
            .unwrap();

        assert_eq!(registry.get_services_by_type(ServiceType::Memory).len(), 1);
    }

    #[test]
    fn provider_names_are_unique() {
        let registry = ServiceRegistry::new();
        let n1 = registry
            .register_service(
                ServiceType::Memory,
                "Mem",
                generic_stub(),
                Priority::Normal,
                0,
                vec![],
                HashMap::new(),
                SelectionStrategy::Fallback,
                None,
                None,
            )
            .unwrap();
        let n2 = registry
            .register_service(
                ServiceType::Memory,
                "Mem",
                generic_stub(),
                Priority::Normal,
                0,
                vec![],
                HashMap::new(),
                SelectionStrategy::Fallback,
                None,
                None,
            )
            .unwrap();
        assert_ne!(n1, n2);
    }

    #[test]
    fn mixing_mock_and_real_llm_is_rejected() {
        let registry = ServiceRegistry::new();
        registry
            .register_service(
                ServiceType::Llm,
                "RealLlm",
                llm_stub(true),
                Priority::Normal,
                0,
                vec![],
                HashMap::new(),
                SelectionStrategy::Fallback,
                Some(ProviderKind::Real),
                None,
            )
            .unwrap();

        let err = registry.register_service(
            ServiceType::Llm,
            "MockLlm",
            llm_stub(true),
            Priority::Normal,
            0,
            vec![],
            HashMap::new(),
            SelectionStrategy::Fallback,
            Some(ProviderKind::Mock),
            None,
        );
        assert!(err.is_err());
    }

    #[test]
    fn second_real_llm_provider_is_also_rejected() {
        let registry = ServiceRegistry::new();
        registry
            .register_service(
                ServiceType::Llm,
                "Real1",
                llm_stub(true),
                Priority::Normal,
                0,
                vec![],
                HashMap::new(),
                SelectionStrategy::Fallback,
                Some(ProviderKind::Real),
                None,
            )
            .unwrap();
        let err = registry.register_service(
            ServiceType::Llm,
            "Real2",
            llm_stub(true),
            Priority::Normal,
            0,
            vec![],
            HashMap::new(),
            SelectionStrategy::Fallback,
            Some(ProviderKind::Real),
            None,
        );
        assert!(err.is_err());
    }

    #[test]
    fn multiple_mock_llm_providers_are_allowed() {
        let registry = ServiceRegistry::new();
        registry
            .register_service(
                ServiceType::Llm,
                "Mock1",
                llm_stub(true),
                Priority::Normal,
                0,
                vec![],
                HashMap::new(),
                SelectionStrategy::Fallback,
                Some(ProviderKind::Mock),
                None,
            )
            .unwrap();
        registry
            .register_service(
                ServiceType::Llm,
                "Mock2",
                llm_stub(true),
                Priority::Normal,
                0,
                vec![],
                HashMap::new(),
                SelectionStrategy::Fallback,
                Some(ProviderKind::Mock),
                None,
            )
            .unwrap();
        assert_eq!(registry.get_services_by_type(ServiceType::Llm).len(), 2);
    }

    #[tokio::test]
    async fn get_service_on_unknown_type_returns_none_and_counts_miss() {
        let registry = ServiceRegistry::new();
        let result = registry.get_service("h", ServiceType::Audit, &[]).await;
        assert!(result.is_none());
        assert_eq!(registry.metrics().misses, 1);
    }

    #[test]
    fn step_up_promotes_to_high_but_never_demotes_critical() {
        assert_eq!(Priority::Low.step_up(), Priority::High);
        assert_eq!(Priority::Normal.step_up(), Priority::High);
        assert_eq!(Priority::High.step_up(), Priority::High);
        assert_eq!(Priority::Critical.step_up(), Priority::Critical);
    }

    #[tokio::test]
    async fn providers_sorted_by_priority_then_group() {
        let registry = ServiceRegistry::new();
        registry
            .register_service(
                ServiceType::Memory,
                "Low",
                generic_stub(),
                Priority::Low,
                0,
                vec![],
                HashMap::new(),
                SelectionStrategy::Fallback,
                None,
                None,
            )
            .unwrap();
        registry
            .register_service(
                ServiceType::Memory,
                "Critical",
                generic_stub(),
                Priority::Critical,
                0,
                vec![],
                HashMap::new(),
                SelectionStrategy::Fallback,
                None,
                None,
            )
            .unwrap();
        let providers = registry.get_services_by_type(ServiceType::Memory);
        assert_eq!(providers[0].priority, Priority::Critical);
        assert_eq!(providers[1].priority, Priority::Low);
    }
}
