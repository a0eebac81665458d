//! Thin typed facade for pausing/resuming/stepping the agent processor.
//!
//! Grounded on `ciris_engine.logic.buses.runtime_control_bus.RuntimeControlBus`
//! (CIRISAgent). Used only by control-plane callers, never handler code.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::registry::{ServiceRegistry, ServiceType};

#[derive(Error, Debug)]
pub enum RuntimeControlBusError {
    #[error("no runtime-control provider available")]
    Unavailable,
    #[error("provider error: {0}")]
    Provider(String),
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct RuntimeControlBusTelemetry {
    pub provider_count: u64,
    pub queue_depth: u64,
    pub healthy: bool,
    pub error: Option<String>,
}

pub struct RuntimeControlBus {
    registry: Arc<ServiceRegistry>,
}

impl RuntimeControlBus {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }

    async fn best_provider(&self) -> Result<crate::registry::ServiceProvider, RuntimeControlBusError> {
        let candidates = self.registry.get_services(ServiceType::RuntimeControl, &[], Some(1)).await;
        candidates.into_iter().next().ok_or(RuntimeControlBusError::Unavailable)
    }

    pub async fn pause(&self) -> Result<bool, RuntimeControlBusError> {
        let provider = self.best_provider().await?;
        let service = provider.instance.as_runtime_control().ok_or(RuntimeControlBusError::Unavailable)?;
        service.pause().await.map_err(|e| RuntimeControlBusError::Provider(e.to_string()))
    }

    pub async fn resume(&self) -> Result<bool, RuntimeControlBusError> {
        let provider = self.best_provider().await?;
        let service = provider.instance.as_runtime_control().ok_or(RuntimeControlBusError::Unavailable)?;
        service.resume().await.map_err(|e| RuntimeControlBusError::Provider(e.to_string()))
    }

    pub async fn single_step(&self) -> Result<bool, RuntimeControlBusError> {
        let provider = self.best_provider().await?;
        let service = provider.instance.as_runtime_control().ok_or(RuntimeControlBusError::Unavailable)?;
        service.single_step().await.map_err(|e| RuntimeControlBusError::Provider(e.to_string()))
    }

    pub async fn queue_depth(&self) -> Option<u64> {
        let provider = self.best_provider().await.ok()?;
        let service = provider.instance.as_runtime_control()?;
        Some(service.queue_depth().await)
    }

    pub async fn collect_telemetry(&self) -> RuntimeControlBusTelemetry {
        let count = self.registry.get_services_by_type(ServiceType::RuntimeControl).len() as u64;
        let queue_depth = self.queue_depth().await.unwrap_or(0);

        RuntimeControlBusTelemetry {
            provider_count: count,
            queue_depth,
            healthy: count > 0,
            error: if count == 0 { Some("no runtime-control providers registered".to_string()) } else { None },
        }
    }
}
