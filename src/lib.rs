//! Multi-provider service routing and resilience fabric for an autonomous
//! agent runtime.
//!
//! A handler never talks to a provider directly: it calls a typed operation on
//! one of the six buses ([`bus::LlmBus`], [`bus::WiseBus`],
//! [`bus::CommunicationBus`], [`bus::MemoryBus`], [`bus::ToolBus`],
//! [`bus::RuntimeControlBus`]), which asks the [`registry::ServiceRegistry`]
//! for eligible providers, checks their [`circuit_breaker::CircuitBreaker`],
//! invokes the call, and records the outcome.

pub mod bus;
pub mod circuit_breaker;
pub mod config;
pub mod observer;
pub mod policy;
pub mod pricing;
pub mod providers;
pub mod registry;
pub mod types;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Aggregates every subsystem's error type so call sites can use a single
/// `Result<T>` throughout while still matching on the precise variant.
#[derive(Error, Debug)]
pub enum BusError {
    #[error(transparent)]
    CircuitBreaker(#[from] circuit_breaker::CircuitBreakerError),

    #[error(transparent)]
    Registry(#[from] registry::RegistryError),

    #[error(transparent)]
    Policy(#[from] policy::PolicyError),

    #[error(transparent)]
    Pricing(#[from] pricing::PricingError),

    #[error(transparent)]
    Llm(#[from] bus::LlmBusError),

    #[error(transparent)]
    WiseAuthority(#[from] bus::WiseBusError),

    #[error(transparent)]
    Communication(#[from] bus::CommunicationBusError),

    #[error(transparent)]
    Memory(#[from] bus::MemoryBusError),

    #[error(transparent)]
    Tool(#[from] bus::ToolBusError),

    #[error(transparent)]
    RuntimeControl(#[from] bus::RuntimeControlBusError),

    #[error(transparent)]
    CreditGate(#[from] observer::CreditGateError),

    #[error("configuration error: {0}")]
    Configuration(#[from] ::config::ConfigError),
}

pub type Result<T> = std::result::Result<T, BusError>;

/// Installs a `tracing` subscriber reading `RUST_LOG` (default `info`),
/// matching SPEC_FULL.md §10.1's span-per-message / log-level discipline.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
