//! Observer credit gate: contract boundary consulted before a message becomes
//! a task.
//!
//! Grounded on SPEC_FULL.md §4.10. The observer's own message-to-task pipeline
//! is out of scope for this crate; only the `CreditProvider` contract and its
//! default pass-through behavior live here.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::CreditCheckResult;

#[derive(Error, Debug)]
pub enum CreditGateError {
    #[error("credit denied: {0}")]
    CreditDenied(String),
    #[error("credit check failed: {0}")]
    CreditCheckFailed(String),
}

#[async_trait]
pub trait CreditProvider: Send + Sync {
    async fn check_credit(&self, account: &str, context: &str) -> Result<CreditCheckResult, CreditGateError>;
}

/// Consults the configured provider, if any. With no provider configured,
/// every check passes — the gate is purely additive and never blocks a
/// deployment that doesn't opt in.
pub struct CreditGate {
    provider: Option<Arc<dyn CreditProvider>>,
}

impl CreditGate {
    pub fn new(provider: Option<Arc<dyn CreditProvider>>) -> Self {
        Self { provider }
    }

    pub fn disabled() -> Self {
        Self { provider: None }
    }

    pub async fn check(&self, account: &str, context: &str) -> Result<(), CreditGateError> {
        let Some(provider) = &self.provider else {
            return Ok(());
        };

        let result = provider.check_credit(account, context).await?;
        if result.has_credit {
            Ok(())
        } else {
            Err(CreditGateError::CreditDenied(
                result.reason.unwrap_or_else(|| "no reason given".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysDeny;
    #[async_trait]
    impl CreditProvider for AlwaysDeny {
        async fn check_credit(&self, _account: &str, _context: &str) -> Result<CreditCheckResult, CreditGateError> {
            Ok(CreditCheckResult { has_credit: false, reason: Some("out of credit".to_string()) })
        }
    }

    struct AlwaysFail;
    #[async_trait]
    impl CreditProvider for AlwaysFail {
        async fn check_credit(&self, _account: &str, _context: &str) -> Result<CreditCheckResult, CreditGateError> {
            Err(CreditGateError::CreditCheckFailed("upstream unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn no_provider_configured_always_passes() {
        let gate = CreditGate::disabled();
        assert!(gate.check("acct-1", "ctx").await.is_ok());
    }

    #[tokio::test]
    async fn denial_surfaces_as_credit_denied() {
        let gate = CreditGate::new(Some(Arc::new(AlwaysDeny)));
        let err = gate.check("acct-1", "ctx").await.unwrap_err();
        assert!(matches!(err, CreditGateError::CreditDenied(_)));
    }

    #[tokio::test]
    async fn provider_error_surfaces_as_credit_check_failed() {
        let gate = CreditGate::new(Some(Arc::new(AlwaysFail)));
        let err = gate.check("acct-1", "ctx").await.unwrap_err();
        assert!(matches!(err, CreditGateError::CreditCheckFailed(_)));
    }
}
