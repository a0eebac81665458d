//! Capability prohibition engine: classifies capability strings into categories and
//! severities, and enforces the medical-domain shortcut used by the wise-authority bus.
//!
//! Grounded on `ciris_engine.logic.buses.prohibitions` and reconstructed from
//! `tests/test_prohibition_system.py` (CIRISAgent), since the retrieved `prohibitions.py`
//! source was a stub containing only the severity enum.

use std::collections::HashMap;

use lazy_static::lazy_static;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProhibitionSeverity {
    NeverAllowed,
    RequiresSeparateModule,
    TierRestricted,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("PROHIBITED: {category} capabilities blocked. Capability '{capability}' requires a separate licensed module.")]
    RequiresSeparateModule { capability: String, category: String },

    #[error("ABSOLUTELY PROHIBITED: {category} capabilities are never allowed. Capability '{capability}' cannot be dispatched.")]
    NeverAllowed { capability: String, category: String },

    #[error("TIER RESTRICTED: '{capability}' ({category}) requires Tier 4-5, agent is Tier {agent_tier}.")]
    TierRestricted {
        capability: String,
        category: String,
        agent_tier: u8,
    },
}

lazy_static! {
    /// Categories whose capabilities must never be dispatched, at any tier.
    pub static ref NEVER_ALLOWED_CAPABILITIES: HashMap<&'static str, &'static [&'static str]> = {
        let mut m = HashMap::new();
        m.insert("WEAPONS_HARMFUL", &[
            "weapon_design", "explosive_synthesis", "chemical_weapons", "biological_weapons",
            "nuclear_weapons", "weapon", "explosive", "munitions",
        ][..]);
        m.insert("MASS_SURVEILLANCE", &[
            "mass_surveillance", "bulk_collection", "population_tracking",
        ][..]);
        m.insert("CYBER_OFFENSIVE", &[
            "cyber_offensive", "malware_development", "exploit_development", "ddos_attack", "unauthorized_access",
        ][..]);
        m.insert("ELECTION_INTERFERENCE", &[
            "election_interference", "voter_suppression", "ballot_manipulation",
        ][..]);
        m.insert("AUTONOMOUS_DECEPTION", &[
            "autonomous_deception", "impersonation_ai", "sockpuppet_operation",
        ][..]);
        m.insert("HAZARDOUS_MATERIALS", &[
            "hazardous_materials_synthesis", "toxin_production", "pathogen_engineering",
        ][..]);
        m.insert("DISCRIMINATION", &[
            "discriminatory_profiling", "protected_class_targeting",
        ][..]);
        m.insert("MANIPULATION_COERCION", &[
            "subliminal_messaging", "gaslighting", "brainwashing", "coercive_control", "psychological_manipulation",
        ][..]);
        m.insert("DECEPTION_FRAUD", &[
            "deceptive_fraud", "identity_theft_facilitation", "phishing_generation",
        ][..]);
        m.insert("BIOMETRIC_INFERENCE", &[
            "biometric_inference", "covert_facial_recognition", "gait_identification",
        ][..]);
        m
    };

    /// Categories that are blocked here but legitimately exist in a separately
    /// licensed module outside this system.
    pub static ref LEGITIMATE_MODULE_CAPABILITIES: HashMap<&'static str, &'static [&'static str]> = {
        let mut m = HashMap::new();
        m.insert("MEDICAL", &[
            "diagnosis", "treatment", "prescription", "medical_advice", "medical_diagnosis", "clinical_assessment",
        ][..]);
        m.insert("FINANCIAL", &[
            "investment_advice", "trading_signals", "portfolio_management", "tax_advice",
        ][..]);
        m.insert("LEGAL", &[
            "legal_advice", "contract_drafting", "litigation_strategy",
        ][..]);
        m.insert("HOME_SECURITY", &[
            "home_security_control", "lock_override", "alarm_disable",
        ][..]);
        m.insert("IDENTITY_VERIFICATION", &[
            "identity_verification", "kyc_processing",
        ][..]);
        m.insert("RESEARCH", &[
            "human_subject_research", "clinical_trial_design",
        ][..]);
        m.insert("INFRASTRUCTURE_CONTROL", &[
            "power_grid_control", "water_treatment_control", "industrial_control_override",
        ][..]);
        m
    };

    /// Tier-restricted community-moderation categories. Stored without the
    /// `COMMUNITY_` prefix; callers use [`get_capability_category`], which adds it.
    pub static ref COMMUNITY_MODERATION_CAPABILITIES: HashMap<&'static str, &'static [&'static str]> = {
        let mut m = HashMap::new();
        m.insert("CRISIS_ESCALATION", &[
            "notify_moderators", "escalate_to_admin", "flag_for_review",
        ][..]);
        m.insert("PATTERN_DETECTION", &[
            "identify_harm_patterns", "detect_coordinated_behavior", "flag_suspicious_activity",
        ][..]);
        m.insert("PROTECTIVE_ROUTING", &[
            "connect_crisis_resources", "route_to_support", "provide_safety_resources",
        ][..]);
        m
    };

    static ref CATEGORY_SEVERITY: HashMap<&'static str, ProhibitionSeverity> = {
        let mut m = HashMap::new();
        for category in NEVER_ALLOWED_CAPABILITIES.keys() {
            m.insert(*category, ProhibitionSeverity::NeverAllowed);
        }
        for category in LEGITIMATE_MODULE_CAPABILITIES.keys() {
            m.insert(*category, ProhibitionSeverity::RequiresSeparateModule);
        }
        for category in COMMUNITY_MODERATION_CAPABILITIES.keys() {
            let leaked: &'static str = Box::leak(format!("COMMUNITY_{category}").into_boxed_str());
            m.insert(leaked, ProhibitionSeverity::TierRestricted);
        }
        m
    };
}

/// Case-insensitive substring match of `capability` against every known category's
/// token set. Returns the owning category name, or `None` if nothing matches.
pub fn get_capability_category(capability: &str) -> Option<String> {
    let cap_lower = capability.to_lowercase();
    for (category, tokens) in NEVER_ALLOWED_CAPABILITIES.iter() {
        if tokens.iter().any(|t| cap_lower.contains(t)) {
            return Some((*category).to_string());
        }
    }
    for (category, tokens) in LEGITIMATE_MODULE_CAPABILITIES.iter() {
        if tokens.iter().any(|t| cap_lower.contains(t)) {
            return Some((*category).to_string());
        }
    }
    for (category, tokens) in COMMUNITY_MODERATION_CAPABILITIES.iter() {
        if tokens.iter().any(|t| cap_lower.contains(t)) {
            return Some(format!("COMMUNITY_{category}"));
        }
    }
    None
}

pub fn get_prohibition_severity(category: &str) -> Option<ProhibitionSeverity> {
    CATEGORY_SEVERITY.get(category).copied()
}

const MEDICAL_TOKENS: &[&str] = &[
    "domain:medical", "domain:health", "domain:triage", "domain:diagnosis", "domain:treatment",
    "domain:prescription", "domain:patient", "domain:clinical", "domain:symptom", "domain:disease",
    "domain:medication", "domain:therapy", "domain:condition", "domain:disorder",
    "modality:medical", "provider:medical",
    "clinical", "symptom", "disease", "medication", "therapy", "triage", "diagnosis", "treatment",
    "prescription", "patient", "health", "medical", "condition", "disorder",
];

/// The wise-authority bus's medical-domain shortcut: blocks any capability string
/// containing a medical token, independent of the general category tables above.
pub fn is_medical_shortcut_blocked(capability: &str) -> bool {
    let cap_lower = capability.to_lowercase();
    MEDICAL_TOKENS.iter().any(|t| cap_lower.contains(t))
}

/// Validate a capability string against the prohibition tables for a given agent
/// tier. Absent/empty capabilities always pass; unknown capabilities always pass.
pub fn validate(capability: Option<&str>, agent_tier: u8) -> Result<(), PolicyError> {
    let Some(capability) = capability.filter(|c| !c.is_empty()) else {
        return Ok(());
    };

    if is_medical_shortcut_blocked(capability) {
        return Err(PolicyError::RequiresSeparateModule {
            capability: capability.to_string(),
            category: "MEDICAL".to_string(),
        });
    }

    let Some(category) = get_capability_category(capability) else {
        return Ok(());
    };
    let severity = get_prohibition_severity(&category)
        .expect("every category returned by get_capability_category has a severity");

    match severity {
        ProhibitionSeverity::NeverAllowed => Err(PolicyError::NeverAllowed {
            capability: capability.to_string(),
            category,
        }),
        ProhibitionSeverity::RequiresSeparateModule => Err(PolicyError::RequiresSeparateModule {
            capability: capability.to_string(),
            category,
        }),
        ProhibitionSeverity::TierRestricted => {
            if agent_tier >= 4 {
                Ok(())
            } else {
                Err(PolicyError::TierRestricted {
                    capability: capability.to_string(),
                    category,
                    agent_tier,
                })
            }
        }
    }
}

/// Operational introspection used by `WiseBus::collect_telemetry`.
#[derive(Debug, Clone, Serialize)]
pub struct ProhibitionTelemetry {
    pub prohibited_capabilities: HashMap<String, usize>,
    pub total_prohibited: usize,
    pub community_capabilities: HashMap<String, usize>,
    pub total_community: usize,
}

pub fn collect_telemetry() -> ProhibitionTelemetry {
    let mut prohibited_capabilities = HashMap::new();
    let mut total_prohibited = 0;
    for (category, tokens) in NEVER_ALLOWED_CAPABILITIES.iter() {
        prohibited_capabilities.insert(category.to_lowercase(), tokens.len());
        total_prohibited += tokens.len();
    }
    for (category, tokens) in LEGITIMATE_MODULE_CAPABILITIES.iter() {
        prohibited_capabilities.insert(category.to_lowercase(), tokens.len());
        total_prohibited += tokens.len();
    }

    let mut community_capabilities = HashMap::new();
    let mut total_community = 0;
    for (category, tokens) in COMMUNITY_MODERATION_CAPABILITIES.iter() {
        community_capabilities.insert(category.to_lowercase(), tokens.len());
        total_community += tokens.len();
    }

    ProhibitionTelemetry {
        prohibited_capabilities,
        total_prohibited,
        community_capabilities,
        total_community,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn medical_capabilities_are_detected() {
        assert_eq!(get_capability_category("diagnosis").as_deref(), Some("MEDICAL"));
        assert_eq!(get_capability_category("prescription").as_deref(), Some("MEDICAL"));
    }

    #[test]
    fn weapons_are_never_allowed_at_any_tier() {
        for category in NEVER_ALLOWED_CAPABILITIES.keys() {
            let severity = get_prohibition_severity(category).unwrap();
            assert_eq!(severity, ProhibitionSeverity::NeverAllowed);
        }
        for tier in 1..=5u8 {
            assert!(validate(Some("weapon_design"), tier).is_err());
        }
    }

    #[test]
    fn community_moderation_is_tier_gated() {
        for tier in 1..=3u8 {
            assert!(validate(Some("notify_moderators"), tier).is_err());
        }
        for tier in 4..=5u8 {
            assert!(validate(Some("notify_moderators"), tier).is_ok());
        }
    }

    #[test]
    fn harmless_capability_always_passes() {
        assert!(validate(Some("general_conversation"), 1).is_ok());
        assert!(validate(None, 1).is_ok());
    }

    #[test]
    fn medical_shortcut_triggers_before_category_lookup() {
        assert!(is_medical_shortcut_blocked("domain:medical"));
        assert!(is_medical_shortcut_blocked("DOMAIN:MEDICAL"));
        assert!(validate(Some("domain:medical"), 5).is_err());
    }

    #[test]
    fn no_capability_token_appears_in_more_than_one_category() {
        let mut seen = std::collections::HashSet::new();
        for tokens in NEVER_ALLOWED_CAPABILITIES.values().chain(LEGITIMATE_MODULE_CAPABILITIES.values()) {
            for token in tokens.iter() {
                assert!(seen.insert(*token), "duplicate capability token: {token}");
            }
        }
        for tokens in COMMUNITY_MODERATION_CAPABILITIES.values() {
            for token in tokens.iter() {
                assert!(seen.insert(*token), "duplicate capability token: {token}");
            }
        }
    }

    #[test]
    fn telemetry_reports_nonzero_counts() {
        let telemetry = collect_telemetry();
        assert!(telemetry.total_prohibited > 0);
        assert!(telemetry.total_community > 0);
        assert!(telemetry.prohibited_capabilities.contains_key("medical"));
        assert!(telemetry.community_capabilities.contains_key("crisis_escalation"));
    }
}
