//! Thin typed facade routing communication operations to the registry.
//!
//! Grounded on `ciris_engine.logic.buses.communication_bus.CommunicationBus`
//! (CIRISAgent). Failures surface directly to the caller; there are no
//! retries inside the bus (SPEC_FULL.md §4.8).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::registry::{ServiceRegistry, ServiceType};
use crate::types::FetchedMessage;

const SEND_MESSAGE_CAPABILITY: &str = "send_message";

#[derive(Error, Debug)]
pub enum CommunicationBusError {
    #[error("no communication provider available")]
    Unavailable,
    #[error("provider error: {0}")]
    Provider(String),
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct CommunicationBusTelemetry {
    pub provider_count: u64,
    pub failed_count: u64,
    pub processed_count: u64,
    pub healthy: bool,
    pub error: Option<String>,
}

pub struct CommunicationBus {
    registry: Arc<ServiceRegistry>,
    processed_count: AtomicU64,
    failed_count: AtomicU64,
}

impl CommunicationBus {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            processed_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
        }
    }

    pub async fn send_message(
        &self,
        handler: &str,
        channel_id: &str,
        content: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<bool, CommunicationBusError> {
        let candidates = self
            .registry
            .get_services(ServiceType::Communication, &[SEND_MESSAGE_CAPABILITY.to_string()], Some(1))
            .await;
        let Some(provider) = candidates.first() else {
            return Err(CommunicationBusError::Unavailable);
        };
        let Some(service) = provider.instance.as_communication() else {
            return Err(CommunicationBusError::Unavailable);
        };

        match service.send_message(handler, channel_id, content, metadata).await {
            Ok(sent) => {
                provider.circuit_breaker.record_success();
                self.processed_count.fetch_add(1, Ordering::Relaxed);
                Ok(sent)
            }
            Err(e) => {
                provider.circuit_breaker.record_failure();
                self.failed_count.fetch_add(1, Ordering::Relaxed);
                warn!(provider = %provider.name, error = %e, "send_message failed");
                Err(CommunicationBusError::Provider(e.to_string()))
            }
        }
    }

    pub async fn fetch_messages(
        &self,
        channel_id: &str,
        limit: usize,
        adapter_hint: Option<&str>,
    ) -> Result<Vec<FetchedMessage>, CommunicationBusError> {
        let candidates = self.registry.get_services(ServiceType::Communication, &[], Some(1)).await;
        let Some(provider) = candidates.first() else {
            return Err(CommunicationBusError::Unavailable);
        };
        let Some(service) = provider.instance.as_communication() else {
            return Err(CommunicationBusError::Unavailable);
        };

        match service.fetch_messages(channel_id, limit, adapter_hint).await {
            Ok(messages) => {
                provider.circuit_breaker.record_success();
                self.processed_count.fetch_add(1, Ordering::Relaxed);
                Ok(messages)
            }
            Err(e) => {
                provider.circuit_breaker.record_failure();
                self.failed_count.fetch_add(1, Ordering::Relaxed);
                Err(CommunicationBusError::Provider(e.to_string()))
            }
        }
    }

    pub fn collect_telemetry(&self) -> CommunicationBusTelemetry {
        let count = self.registry.get_services_by_type(ServiceType::Communication).len() as u64;
        CommunicationBusTelemetry {
            provider_count: count,
            failed_count: self.failed_count.load(Ordering::Relaxed),
            processed_count: self.processed_count.load(Ordering::Relaxed),
            healthy: count > 0,
            error: if count == 0 { Some("no communication providers registered".to_string()) } else { None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_message_without_providers_is_unavailable() {
        let registry = Arc::new(ServiceRegistry::new());
        let bus = CommunicationBus::new(registry);
        let err = bus.send_message("handler", "chan", "hi", &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, CommunicationBusError::Unavailable));
    }

    #[test]
    fn telemetry_reports_unhealthy_with_no_providers() {
        let registry = Arc::new(ServiceRegistry::new());
        let bus = CommunicationBus::new(registry);
        let telemetry = bus.collect_telemetry();
        assert!(!telemetry.healthy);
        assert!(telemetry.error.is_some());
    }
}
