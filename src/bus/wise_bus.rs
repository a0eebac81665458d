//! Guidance fan-out, deferral broadcast, and prohibition enforcement for
//! wise-authority providers.
//!
//! Grounded on `ciris_engine.logic.buses.wise_bus.WiseBus` (CIRISAgent). The
//! confidence-based arbitration and agent-tier caching are ported from the same
//! module's `request_guidance`/`get_agent_tier`.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, warn};

use crate::policy::{self, PolicyError, ProhibitionTelemetry};
use crate::registry::{ServiceRegistry, ServiceType};
use crate::types::{DeferralContext, DeferralRequest, GuidanceContext, GuidanceRequest, GuidanceResponse, WisdomAdvice};

const FAN_OUT_CAP: usize = 5;
const DEFAULT_GUIDANCE_TIMEOUT: Duration = Duration::from_secs(5);
const AGENT_TIER_CONFIG_KEY: &str = "agent.tier";

#[derive(Error, Debug)]
pub enum WiseBusError {
    #[error(transparent)]
    Prohibited(#[from] PolicyError),
    #[error("no wise-authority providers registered")]
    NoProviders,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WiseBusTelemetry {
    pub provider_count: u64,
    pub failed_count: u64,
    pub processed_count: u64,
    pub capability_blocks: u64,
    pub healthy: bool,
    pub prohibition: ProhibitionTelemetry,
}

pub struct WiseBus {
    registry: Arc<ServiceRegistry>,
    agent_tier_cache: AtomicU8, // 0 = unresolved, sentinel bit at MSB not needed since tiers are 1-5
    agent_tier_resolved: std::sync::atomic::AtomicBool,
    processed_count: AtomicU64,
    failed_count: AtomicU64,
}

impl WiseBus {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            agent_tier_cache: AtomicU8::new(1),
            agent_tier_resolved: std::sync::atomic::AtomicBool::new(false),
            processed_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
        }
    }

    /// Resolves the agent's authority tier. Defaults to 1; looks up a
    /// registered CONFIG-typed service on first call only and caches the
    /// result for the bus's lifetime.
    pub async fn get_agent_tier(&self) -> u8 {
        if self.agent_tier_resolved.load(Ordering::Acquire) {
            return self.agent_tier_cache.load(Ordering::Relaxed);
        }

        let mut tier = 1u8;
        let config_providers = self.registry.get_services(ServiceType::Config, &[], Some(1)).await;
        if let Some(provider) = config_providers.first() {
            if let Some(config) = provider.instance.as_config() {
                if let Some(raw) = config.get_string(AGENT_TIER_CONFIG_KEY).await {
                    match raw.trim().parse::<u8>() {
                        Ok(parsed) => tier = parsed,
                        Err(_) => warn!(value = %raw, "agent.tier config value is not an integer, defaulting to tier 1"),
                    }
                }
            }
        }

        self.agent_tier_cache.store(tier, Ordering::Relaxed);
        self.agent_tier_resolved.store(true, Ordering::Release);
        tier
    }

    /// Broadcasts a deferral to every wise-authority provider exposing
    /// `send_deferral`. Result is the logical OR of per-provider outcomes.
    pub async fn send_deferral(&self, context: &DeferralContext, _handler_name: &str) -> bool {
        let defer_until = match context.defer_until.as_deref() {
            None => Utc::now() + ChronoDuration::hours(1),
            Some(raw) => match DateTime::parse_from_rfc3339(raw) {
                Ok(parsed) => parsed.with_timezone(&Utc),
                Err(e) => {
                    warn!(defer_until = raw, error = %e, "send_deferral: defer_until is not valid ISO-8601, deferring to now");
                    Utc::now()
                }
            },
        };

        let request = DeferralRequest {
            task_id: context.task_id.clone(),
            thought_id: context.thought_id.clone(),
            reason: context.reason.clone(),
            defer_until,
            context: context.metadata.clone(),
        };

        let providers = self.registry.get_services_by_type(ServiceType::WiseAuthority);
        if providers.is_empty() {
            warn!("send_deferral: no wise-authority providers registered");
            return false;
        }

        let futures = providers.iter().filter_map(|provider| {
            let wa = provider.instance.as_wise_authority()?;
            if !wa.supports_send_deferral() {
                return None;
            }
            let request = request.clone();
            let breaker = provider.circuit_breaker.clone();
            Some(async move {
                if !breaker.is_available() {
                    return false;
                }
                match wa.send_deferral(&request).await {
                    Ok(accepted) => {
                        if accepted {
                            breaker.record_success();
                        }
                        accepted
                    }
                    Err(e) => {
                        breaker.record_failure();
                        warn!(error = %e, "send_deferral failed on one provider");
                        false
                    }
                }
            })
        });

        let results = join_all(futures).await;
        self.processed_count.fetch_add(1, Ordering::Relaxed);
        results.into_iter().any(|accepted| accepted)
    }

    /// Thin wrapper: builds a synthetic deferral context for a review request.
    pub async fn request_review(&self, review_type: &str, review_data: &str, handler_name: &str) -> bool {
        let context = DeferralContext {
            task_id: format!("review:{review_type}"),
            thought_id: String::new(),
            reason: review_data.to_string(),
            defer_until: None,
            metadata: std::collections::HashMap::new(),
        };
        self.send_deferral(&context, handler_name).await
    }

    /// Single-provider fetch, first eligible.
    pub async fn fetch_guidance(&self, context: &GuidanceContext, _handler_name: &str) -> Option<String> {
        let providers = self.registry.get_services(ServiceType::WiseAuthority, &[], Some(1)).await;
        let provider = providers.first()?;
        let wa = provider.instance.as_wise_authority()?;
        match wa.fetch_guidance(context).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "fetch_guidance failed");
                None
            }
        }
    }

    /// Main guidance operation: policy enforcement, bounded fan-out, and
    /// confidence-based arbitration across responders.
    pub async fn request_guidance(&self, request: GuidanceRequest, agent_tier: u8) -> Result<GuidanceResponse, WiseBusError> {
        if let Some(capability) = request.capability.as_deref() {
            policy::validate(Some(capability), agent_tier)?;
        }

        let required = request
            .capability
            .as_ref()
            .map(|c| vec![c.clone()])
            .unwrap_or_default();
        let providers = self.registry.get_services(ServiceType::WiseAuthority, &required, Some(FAN_OUT_CAP)).await;

        if providers.is_empty() {
            self.failed_count.fetch_add(1, Ordering::Relaxed);
            return Ok(GuidanceResponse {
                selected_option: None,
                custom_guidance: None,
                reasoning: "no wise-authority providers responded".to_string(),
                wa_id: "none".to_string(),
                signature: String::new(),
                advice: vec![],
            });
        }

        let context = GuidanceContext {
            thought_id: String::new(),
            task_id: String::new(),
            question: request.context.clone(),
        };

        // Each provider gets its own deadline against the shared timeout rather
        // than one timeout around the whole join: a provider that answers
        // before the deadline keeps its response even if a slower sibling is
        // still in flight when the deadline hits and gets dropped.
        let futures = providers.iter().map(|provider| {
            let wa = provider.instance.as_wise_authority();
            let request = request.clone();
            let context = context.clone();
            let name = provider.name.clone();
            let call = async move {
                let wa = wa?;
                if wa.supports_get_guidance() {
                    match wa.get_guidance(&request).await {
                        Ok(response) => Some(response),
                        Err(e) => {
                            debug!(provider = %name, error = %e, "get_guidance failed");
                            None
                        }
                    }
                } else {
                    match wa.fetch_guidance(&context).await {
                        Ok(Some(text)) => Some(GuidanceResponse {
                            selected_option: None,
                            custom_guidance: Some(text),
                            reasoning: "adapted from legacy fetch_guidance".to_string(),
                            wa_id: name,
                            signature: String::new(),
                            advice: vec![],
                        }),
                        _ => None,
                    }
                }
            };
            let provider_name = provider.name.clone();
            async move {
                match tokio::time::timeout(DEFAULT_GUIDANCE_TIMEOUT, call).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(provider = %provider_name, "request_guidance: provider did not respond within the deadline, dropping it");
                        None
                    }
                }
            }
        });

        let responses: Vec<GuidanceResponse> = join_all(futures).await.into_iter().flatten().collect();

        self.processed_count.fetch_add(1, Ordering::Relaxed);
        Ok(Self::arbitrate(responses))
    }

    fn max_confidence(response: &GuidanceResponse) -> f64 {
        response.advice.iter().map(|a| a.confidence).fold(0.0, f64::max)
    }

    fn arbitrate(mut responses: Vec<GuidanceResponse>) -> GuidanceResponse {
        match responses.len() {
            0 => GuidanceResponse {
                selected_option: None,
                custom_guidance: None,
                reasoning: "no providers responded".to_string(),
                wa_id: "none".to_string(),
                signature: String::new(),
                advice: vec![],
            },
            1 => responses.remove(0),
            n => {
                let winner_idx = (0..n)
                    .max_by(|&a, &b| {
                        Self::max_confidence(&responses[a])
                            .partial_cmp(&Self::max_confidence(&responses[b]))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .unwrap();

                let winner_confidence = Self::max_confidence(&responses[winner_idx]);
                let all_advice: Vec<WisdomAdvice> = responses.iter().flat_map(|r| r.advice.clone()).collect();

                let mut winner = responses.remove(winner_idx);
                winner.advice = all_advice;
                winner.reasoning = format!(
                    "{} (selected with {:.2} confidence from {} providers)",
                    winner.reasoning, winner_confidence, n
                );
                winner
            }
        }
    }

    pub async fn collect_telemetry(&self) -> WiseBusTelemetry {
        let providers = self.registry.get_services_by_type(ServiceType::WiseAuthority);
        let prohibition = policy::collect_telemetry();

        let capability_blocks = (prohibition.total_prohibited + prohibition.total_community) as u64;

        WiseBusTelemetry {
            provider_count: providers.len() as u64,
            failed_count: self.failed_count.load(Ordering::Relaxed),
            processed_count: self.processed_count.load(Ordering::Relaxed),
            capability_blocks,
            healthy: !providers.is_empty(),
            prohibition,
        }
    }
}
