//! Access validation: the hot path.
//!
//! ```text
//! creator? ──yes──► grant "creator access"                (no cache, no store)
//!    │no
//! cache.lookup(provider, patient, type) ──hit──► evaluate(snapshot, level, now)
//!    │miss
//! begin_fill ─► store.active_for_pair ──err/timeout──► deny "store unavailable"
//!    │ok                                              (never cached)
//! snapshot ─► cache.insert ─► evaluate(snapshot, level, now)
//!    │
//!    └──► audit ACCESS_GRANTED | ACCESS_DENIED (best effort) ─► decision
//! ```
//!
//! The store query is the only suspension point besides the audit append, and
//! it is bounded by the store timeout. Validation never returns an error: every
//! failure mode produces a denied decision.

use std::sync::Arc;

use consentd_core::decision::evaluate;
use consentd_core::token::validate_id;
use consentd_core::{
    AccessDecision, AccessLevel, AuditDetails, AuditEntryInput, AuditEventType, Clock,
    ConsentResult, ConsentSnapshot, DecisionSource, DenialReason, ResourceType,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::audit_log::{AuditLog, AuditOutcome};
use crate::cache::{CacheKey, DecisionCache};
use crate::metrics::GateMetrics;
use crate::store::ConsentStore;

/// An access check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    /// The requesting provider.
    pub provider_id: String,
    /// The patient whose records are requested.
    pub patient_id: String,
    /// The requested record category.
    pub resource_type: ResourceType,
    /// The requested level.
    pub access_level: AccessLevel,
    /// The provider that created the record, when checking a specific record.
    pub record_creator_id: Option<String>,
}

impl AccessRequest {
    /// Creates a request after checking the ids.
    ///
    /// # Errors
    ///
    /// Returns [`consentd_core::ConsentError::Validation`] for empty or
    /// overlong ids.
    pub fn new(
        provider_id: impl Into<String>,
        patient_id: impl Into<String>,
        resource_type: ResourceType,
        access_level: AccessLevel,
    ) -> ConsentResult<Self> {
        let provider_id = provider_id.into();
        let patient_id = patient_id.into();
        validate_id("provider_id", &provider_id)?;
        validate_id("patient_id", &patient_id)?;
        Ok(Self {
            provider_id,
            patient_id,
            resource_type,
            access_level,
            record_creator_id: None,
        })
    }

    /// Names the record's creator.
    #[must_use]
    pub fn created_by(mut self, creator_id: impl Into<String>) -> Self {
        self.record_creator_id = Some(creator_id.into());
        self
    }

    fn cache_key(&self) -> CacheKey {
        CacheKey::new(
            self.provider_id.clone(),
            self.patient_id.clone(),
            self.resource_type,
        )
    }
}

/// Answers access checks and records every answer.
#[derive(Debug)]
pub struct AccessValidator {
    store: ConsentStore,
    cache: Arc<DecisionCache>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    metrics: Option<GateMetrics>,
}

impl AccessValidator {
    /// Creates a validator.
    #[must_use]
    pub fn new(
        store: ConsentStore,
        cache: Arc<DecisionCache>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cache,
            audit,
            clock,
            metrics: None,
        }
    }

    /// Attaches metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: GateMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Decides `request` and appends exactly one `ACCESS_GRANTED` or
    /// `ACCESS_DENIED` entry.
    pub async fn validate_access(&self, request: &AccessRequest) -> AccessDecision {
        let (decision, source) = self.decide(request).await;
        debug!(
            provider_id = %request.provider_id,
            patient_id = %request.patient_id,
            resource_type = %request.resource_type,
            access_level = %request.access_level,
            granted = decision.granted,
            reason = %decision.reason,
            ?source,
            "access decided"
        );

        if let Some(metrics) = &self.metrics {
            let reason = decision.denial.map_or("granted", |d| d.label());
            metrics.access_decision(decision.granted, reason);
        }
        self.record(request, &decision, source).await;
        decision
    }

    async fn decide(&self, request: &AccessRequest) -> (AccessDecision, DecisionSource) {
        if request.record_creator_id.as_deref() == Some(request.provider_id.as_str()) {
            return (AccessDecision::creator_access(), DecisionSource::Creator);
        }

        let key = request.cache_key();
        if let Some(snapshot) = self.cache.lookup(&key).await {
            self.count_lookup(true);
            let decision = evaluate(&snapshot, request.access_level, self.clock.now());
            return (decision, DecisionSource::Cache);
        }
        self.count_lookup(false);

        let ticket = self.cache.begin_fill().await;
        let tokens = match self
            .store
            .active_for_pair(&request.patient_id, &request.provider_id)
            .await
        {
            Ok(tokens) => tokens,
            Err(err) => {
                warn!(
                    provider_id = %request.provider_id,
                    patient_id = %request.patient_id,
                    error = %err,
                    "consent store unavailable, denying access"
                );
                return (
                    AccessDecision::denied(DenialReason::StoreUnavailable),
                    DecisionSource::FailClosed,
                );
            },
        };

        let now = self.clock.now();
        let snapshot = ConsentSnapshot::from_tokens(tokens.iter(), request.resource_type, now);
        let decision = evaluate(&snapshot, request.access_level, now);
        if !self.cache.insert(key, snapshot, ticket).await {
            debug!(provider_id = %request.provider_id, "decision not cached");
        }
        (decision, DecisionSource::Store)
    }

    fn count_lookup(&self, hit: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.cache_lookup(hit);
        }
    }

    async fn record(
        &self,
        request: &AccessRequest,
        decision: &AccessDecision,
        source: DecisionSource,
    ) {
        let event_type = if decision.granted {
            AuditEventType::AccessGranted
        } else {
            AuditEventType::AccessDenied
        };
        let mut input = AuditEntryInput::new(
            event_type,
            request.provider_id.clone(),
            AuditDetails::AccessDecision {
                provider_id: request.provider_id.clone(),
                resource_type: request.resource_type,
                access_level: request.access_level,
                matched_token_id: decision.matched_token_id.clone(),
                reason: decision.reason.clone(),
                denial: decision.denial,
                source,
            },
        )
        .with_subject(request.patient_id.clone());
        if let Some(token_id) = &decision.matched_token_id {
            input = input.with_resource(token_id.clone());
        }
        // A failed append never changes the decision.
        if let AuditOutcome::Degraded { reason } = self.audit.append_best_effort(input).await {
            warn!(
                provider_id = %request.provider_id,
                patient_id = %request.patient_id,
                granted = decision.granted,
                reason = %reason,
                "access decision returned without audit entry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use consentd_core::decision::CREATOR_ACCESS_REASON;
    use consentd_core::{AuditFilter, ManualClock};

    use super::*;
    use crate::cache::DecisionCacheConfig;
    use crate::ledger::{InMemoryLedger, consent_fn};

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn validator() -> (Arc<InMemoryLedger>, Arc<AuditLog>, AccessValidator) {
        let ledger = Arc::new(InMemoryLedger::new());
        let clock = Arc::new(ManualClock::new(start()));
        let timeout = Duration::from_secs(1);
        let store = ConsentStore::new(ledger.clone(), timeout);
        let cache = Arc::new(DecisionCache::new(DecisionCacheConfig::default(), clock.clone()));
        let audit = Arc::new(AuditLog::new(ledger.clone(), clock.clone(), timeout));
        let validator = AccessValidator::new(store, cache, audit.clone(), clock);
        (ledger, audit, validator)
    }

    fn request() -> AccessRequest {
        AccessRequest::new("doc-1", "pat-1", ResourceType::Diagnosis, AccessLevel::Read).unwrap()
    }

    #[test]
    fn request_rejects_empty_ids() {
        assert!(AccessRequest::new("", "pat-1", ResourceType::Imaging, AccessLevel::Read).is_err());
    }

    #[tokio::test]
    async fn creator_access_skips_cache_and_store() {
        let (ledger, audit, validator) = validator();
        let decision = validator.validate_access(&request().created_by("doc-1")).await;
        assert!(decision.granted);
        assert_eq!(decision.reason, CREATOR_ACCESS_REASON);
        assert_eq!(ledger.query_count(consent_fn::QUERY_ACTIVE), 0);

        let page = audit.query(&AuditFilter::default(), 1, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.entries[0].event_type, AuditEventType::AccessGranted);
    }

    #[tokio::test]
    async fn other_creator_does_not_grant() {
        let (_, _, validator) = validator();
        let decision = validator.validate_access(&request().created_by("doc-2")).await;
        assert_eq!(decision.denial, Some(DenialReason::NoActiveConsent));
    }

    #[tokio::test]
    async fn denial_is_cached_until_invalidated() {
        let (ledger, _, validator) = validator();
        validator.validate_access(&request()).await;
        validator.validate_access(&request()).await;
        assert_eq!(ledger.query_count(consent_fn::QUERY_ACTIVE), 1);
    }

    #[tokio::test]
    async fn store_failure_is_not_cached() {
        let (ledger, _, validator) = validator();
        ledger.fail_queries(true);
        let decision = validator.validate_access(&request()).await;
        assert_eq!(decision.denial, Some(DenialReason::StoreUnavailable));

        ledger.fail_queries(false);
        let decision = validator.validate_access(&request()).await;
        assert_eq!(decision.denial, Some(DenialReason::NoActiveConsent));
        assert_eq!(ledger.query_count(consent_fn::QUERY_ACTIVE), 2);
    }

    #[tokio::test]
    async fn audit_failure_does_not_change_the_decision() {
        let (ledger, _, validator) = validator();
        ledger.fail_contract(crate::ledger::AUDIT_CONTRACT, true);
        let decision = validator.validate_access(&request().created_by("doc-1")).await;
        assert!(decision.granted);
    }

    #[tokio::test]
    async fn lost_denial_audit_is_counted() {
        let ledger = Arc::new(InMemoryLedger::new());
        let clock = Arc::new(ManualClock::new(start()));
        let metrics = GateMetrics::standalone().unwrap();
        let timeout = Duration::from_secs(1);
        let audit = AuditLog::new(ledger.clone(), clock.clone(), timeout)
            .with_metrics(metrics.clone());
        let cache = Arc::new(DecisionCache::new(DecisionCacheConfig::default(), clock.clone()));
        let validator = AccessValidator::new(
            ConsentStore::new(ledger.clone(), timeout),
            cache,
            Arc::new(audit),
            clock,
        );

        ledger.fail_contract(crate::ledger::AUDIT_CONTRACT, true);
        let decision = validator.validate_access(&request()).await;
        assert_eq!(decision.denial, Some(DenialReason::NoActiveConsent));
        assert_eq!(metrics.audit_write_failures("ACCESS_DENIED"), 1);
        assert_eq!(ledger.audit_len(), 0);
    }
}
