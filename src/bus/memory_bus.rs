//! Thin typed facade routing memorize/recall/forget to the best memory provider.
//!
//! Grounded on `ciris_engine.logic.buses.memory_bus.MemoryBus` (CIRISAgent).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::registry::{ServiceRegistry, ServiceType};
use crate::types::MemoryNode;

#[derive(Error, Debug)]
pub enum MemoryBusError {
    #[error("no memory provider available")]
    Unavailable,
    #[error("provider error: {0}")]
    Provider(String),
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct MemoryBusTelemetry {
    pub provider_count: u64,
    pub total_nodes: u64,
    pub query_count: u64,
    pub cache_hit_rate: f64,
    pub healthy: bool,
    pub error: Option<String>,
}

pub struct MemoryBus {
    registry: Arc<ServiceRegistry>,
    memorize_count: AtomicU64,
    recall_count: AtomicU64,
    recall_hits: AtomicU64,
    forget_count: AtomicU64,
}

impl MemoryBus {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            memorize_count: AtomicU64::new(0),
            recall_count: AtomicU64::new(0),
            recall_hits: AtomicU64::new(0),
            forget_count: AtomicU64::new(0),
        }
    }

    async fn best_provider(&self) -> Result<crate::registry::ServiceProvider, MemoryBusError> {
        let candidates = self.registry.get_services(ServiceType::Memory, &[], Some(1)).await;
        candidates.into_iter().next().ok_or(MemoryBusError::Unavailable)
    }

    pub async fn memorize(&self, node: &MemoryNode) -> Result<bool, MemoryBusError> {
        let provider = self.best_provider().await?;
        let service = provider.instance.as_memory().ok_or(MemoryBusError::Unavailable)?;

        match service.memorize(node).await {
            Ok(ok) => {
                provider.circuit_breaker.record_success();
                self.memorize_count.fetch_add(1, Ordering::Relaxed);
                Ok(ok)
            }
            Err(e) => {
                provider.circuit_breaker.record_failure();
                warn!(provider = %provider.name, error = %e, "memorize failed");
                Err(MemoryBusError::Provider(e.to_string()))
            }
        }
    }

    pub async fn recall(&self, node_id: &str) -> Result<Option<MemoryNode>, MemoryBusError> {
        let provider = self.best_provider().await?;
        let service = provider.instance.as_memory().ok_or(MemoryBusError::Unavailable)?;

        match service.recall(node_id).await {
            Ok(result) => {
                provider.circuit_breaker.record_success();
                self.recall_count.fetch_add(1, Ordering::Relaxed);
                if result.is_some() {
                    self.recall_hits.fetch_add(1, Ordering::Relaxed);
                }
                Ok(result)
            }
            Err(e) => {
                provider.circuit_breaker.record_failure();
                Err(MemoryBusError::Provider(e.to_string()))
            }
        }
    }

    pub async fn forget(&self, node_id: &str) -> Result<bool, MemoryBusError> {
        let provider = self.best_provider().await?;
        let service = provider.instance.as_memory().ok_or(MemoryBusError::Unavailable)?;

        match service.forget(node_id).await {
            Ok(ok) => {
                provider.circuit_breaker.record_success();
                self.forget_count.fetch_add(1, Ordering::Relaxed);
                Ok(ok)
            }
            Err(e) => {
                provider.circuit_breaker.record_failure();
                Err(MemoryBusError::Provider(e.to_string()))
            }
        }
    }

    pub fn collect_telemetry(&self) -> MemoryBusTelemetry {
        let count = self.registry.get_services_by_type(ServiceType::Memory).len() as u64;
        let recall_count = self.recall_count.load(Ordering::Relaxed);
        let recall_hits = self.recall_hits.load(Ordering::Relaxed);

        MemoryBusTelemetry {
            provider_count: count,
            total_nodes: self.memorize_count.load(Ordering::Relaxed),
            query_count: recall_count + self.forget_count.load(Ordering::Relaxed),
            cache_hit_rate: if recall_count == 0 { 0.0 } else { recall_hits as f64 / recall_count as f64 },
            healthy: count > 0,
            error: if count == 0 { Some("no memory providers registered".to_string()) } else { None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recall_without_providers_is_unavailable() {
        let registry = Arc::new(ServiceRegistry::new());
        let bus = MemoryBus::new(registry);
        let err = bus.recall("node-1").await.unwrap_err();
        assert!(matches!(err, MemoryBusError::Unavailable));
    }

    #[test]
    fn telemetry_hit_rate_is_zero_with_no_queries() {
        let registry = Arc::new(ServiceRegistry::new());
        let bus = MemoryBus::new(registry);
        assert_eq!(bus.collect_telemetry().cache_hit_rate, 0.0);
    }
}
