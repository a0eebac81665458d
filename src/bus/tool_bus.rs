//! Thin typed facade for tool enumeration and execution.
//!
//! Grounded on `ciris_engine.logic.buses.tool_bus.ToolBus` (CIRISAgent). Per
//! SPEC_FULL.md §9 resolved Open Question, `total_tools` telemetry is the size
//! of the **union** of every provider's tool-name set, not a sum — a sum
//! double-counts tools offered by more than one provider.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::registry::{ServiceRegistry, ServiceType};
use crate::types::ToolExecutionResult;

#[derive(Error, Debug)]
pub enum ToolBusError {
    #[error("no tool provider exposes '{0}'")]
    NoProviderForTool(String),
    #[error("provider error: {0}")]
    Provider(String),
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ToolBusTelemetry {
    pub provider_count: u64,
    pub total_tools: u64,
    pub failed_count: u64,
    pub processed_count: u64,
    pub healthy: bool,
    pub error: Option<String>,
}

pub struct ToolBus {
    registry: Arc<ServiceRegistry>,
    processed_count: AtomicU64,
    failed_count: AtomicU64,
}

impl ToolBus {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            processed_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
        }
    }

    pub fn list_tools(&self) -> Vec<String> {
        let mut union = HashSet::new();
        for provider in self.registry.get_services_by_type(ServiceType::Tool) {
            if let Some(tools) = provider.instance.as_tool() {
                union.extend(tools.list_tools());
            }
        }
        union.into_iter().collect()
    }

    pub async fn execute_tool(
        &self,
        tool_name: &str,
        args: &std::collections::HashMap<String, String>,
    ) -> Result<ToolExecutionResult, ToolBusError> {
        let providers = self.registry.get_services_by_type(ServiceType::Tool);
        let provider = providers
            .into_iter()
            .find(|p| p.instance.as_tool().map(|t| t.list_tools().contains(&tool_name.to_string())).unwrap_or(false))
            .ok_or_else(|| ToolBusError::NoProviderForTool(tool_name.to_string()))?;

        if !provider.circuit_breaker.is_available() {
            return Err(ToolBusError::NoProviderForTool(tool_name.to_string()));
        }

        let service = provider.instance.as_tool().ok_or_else(|| ToolBusError::NoProviderForTool(tool_name.to_string()))?;

        match service.execute_tool(tool_name, args).await {
            Ok(result) => {
                provider.circuit_breaker.record_success();
                self.processed_count.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Err(e) => {
                provider.circuit_breaker.record_failure();
                self.failed_count.fetch_add(1, Ordering::Relaxed);
                warn!(provider = %provider.name, tool = %tool_name, error = %e, "execute_tool failed");
                Err(ToolBusError::Provider(e.to_string()))
            }
        }
    }

    pub fn collect_telemetry(&self) -> ToolBusTelemetry {
        let providers = self.registry.get_services_by_type(ServiceType::Tool);
        let mut union = HashSet::new();
        for provider in &providers {
            if let Some(tools) = provider.instance.as_tool() {
                union.extend(tools.list_tools());
            }
        }

        ToolBusTelemetry {
            provider_count: providers.len() as u64,
            total_tools: union.len() as u64,
            failed_count: self.failed_count.load(Ordering::Relaxed),
            processed_count: self.processed_count.load(Ordering::Relaxed),
            healthy: !providers.is_empty(),
            error: if providers.is_empty() { Some("no tool providers registered".to_string()) } else { None },
        }
    }
}
