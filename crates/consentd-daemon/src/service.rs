//! Consent service: the operations calling layers invoke.
//!
//! `ConsentService` wires the registry, validator, cache and audit log over a
//! single ledger client and enforces the role rules of each operation. HTTP
//! routing and session authentication sit outside; callers pass an already
//! authenticated [`Principal`].
//!
//! | Operation | Allowed roles |
//! |---|---|
//! | grant, revoke, bulk revoke | patient (acting for themselves) |
//! | access a record | provider |
//! | query audit trail, statistics | auditor, admin |
//! | patient consents | the patient, auditor, admin |
//! | provider consents | the provider, auditor, admin |
//!
//! The service owns the decision cache's sweep task: [`ConsentService::start`]
//! spawns it and [`ConsentService::shutdown`] stops it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use consentd_core::signing::{KeyDirectory, SignatureVerifier, Signer};
use consentd_core::{
    AccessDecision, AccessLevel, AuditDetails, AuditEntryInput, AuditEventType, AuditFilter,
    AuditPage, AuditStatistics, Clock, ConfigError, ConsentError, ConsentResult, ConsentToken,
    Expiration, GateConfig, Permission, ResourceType, SystemClock,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::audit_log::{AuditLog, AuditOutcome, PageLimits};
use crate::cache::{DecisionCache, DecisionCacheConfig, SweeperHandle};
use crate::ledger::LedgerClient;
use crate::metrics::{GateMetrics, MetricsError};
use crate::registry::{
    BulkRevocationItem, ConsentRegistry, GrantReceipt, GrantRequest, RevocationResult,
    RevokeRequest, SignatureCheck,
};
use crate::store::ConsentStore;
use crate::validator::{AccessRequest, AccessValidator};

// =============================================================================
// Principals
// =============================================================================

/// Role of an authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// A patient.
    Patient,
    /// A healthcare provider.
    Provider,
    /// A compliance auditor.
    Auditor,
    /// An administrator.
    Admin,
}

impl Role {
    /// Returns the role's wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Patient => "patient",
            Self::Provider => "provider",
            Self::Auditor => "auditor",
            Self::Admin => "admin",
        }
    }

    const fn is_oversight(self) -> bool {
        matches!(self, Self::Auditor | Self::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    /// The caller's id.
    pub id: String,
    /// The caller's role.
    pub role: Role,
}

impl Principal {
    /// Creates a principal.
    #[must_use]
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    fn require(&self, allowed: &[Role], operation: &str) -> ConsentResult<()> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(ConsentError::authorization(
                &self.id,
                format!("role {} may not {operation}", self.role),
            ))
        }
    }
}

/// A specific medical record being opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRef {
    /// The record's id.
    pub record_id: String,
    /// The patient the record belongs to.
    pub patient_id: String,
    /// The record's category.
    pub resource_type: ResourceType,
    /// The provider that created the record.
    pub creator_id: String,
}

// =============================================================================
// Builder
// =============================================================================

/// Errors assembling a [`ConsentService`].
#[derive(Debug, Error)]
pub enum BuildError {
    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Metrics could not be registered.
    #[error(transparent)]
    Metrics(#[from] MetricsError),

    /// Signature verification is enabled but no verifier was supplied.
    #[error("signatures.verify is set but no signature verifier was provided")]
    MissingVerifier,
}

/// Builder for [`ConsentService`].
#[derive(Debug)]
pub struct ConsentServiceBuilder {
    ledger: Arc<dyn LedgerClient>,
    config: GateConfig,
    clock: Arc<dyn Clock>,
    metrics: Option<GateMetrics>,
    signer: Option<Arc<dyn Signer>>,
    signature_check: Option<SignatureCheck>,
}

impl ConsentServiceBuilder {
    /// Uses `config` instead of the defaults.
    #[must_use]
    pub fn config(mut self, config: GateConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `clock` instead of the system clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Records metrics into `metrics` instead of a private registry.
    #[must_use]
    pub fn metrics(mut self, metrics: GateMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Signs audit entries that carry no actor signature.
    #[must_use]
    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Supplies the verifier used when `signatures.verify` is set.
    #[must_use]
    pub fn verifier(
        mut self,
        verifier: Arc<dyn SignatureVerifier>,
        keys: Arc<dyn KeyDirectory>,
    ) -> Self {
        self.signature_check = Some(SignatureCheck::new(verifier, keys));
        self
    }

    /// Assembles the service.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] if the configuration is invalid, metrics cannot
    /// be registered, or verification is enabled without a verifier.
    pub fn build(self) -> Result<ConsentService, BuildError> {
        self.config.validate()?;
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => GateMetrics::standalone()?,
        };
        let signature_check = if self.config.signatures.verify {
            Some(self.signature_check.ok_or(BuildError::MissingVerifier)?)
        } else {
            None
        };

        let store = ConsentStore::new(self.ledger.clone(), self.config.store.timeout())
            .with_metrics(metrics.clone());
        let cache = Arc::new(DecisionCache::new(
            DecisionCacheConfig::from(&self.config.cache),
            self.clock.clone(),
        ));
        let mut audit = AuditLog::new(self.ledger, self.clock.clone(), self.config.store.timeout())
            .with_limits(PageLimits::from(&self.config.audit))
            .with_metrics(metrics.clone());
        if let Some(signer) = self.signer {
            audit = audit.with_signer(signer);
        }
        let audit = Arc::new(audit);

        let mut registry =
            ConsentRegistry::new(store.clone(), cache.clone(), audit.clone(), self.clock.clone())
                .with_metrics(metrics.clone());
        if let Some(check) = signature_check {
            registry = registry.with_signature_check(check);
        }
        let validator = AccessValidator::new(store, cache.clone(), audit.clone(), self.clock)
            .with_metrics(metrics.clone());

        Ok(ConsentService {
            registry,
            validator,
            audit,
            cache,
            metrics,
            sweep_interval: self.config.cache.sweep_interval(),
            sweeper: Mutex::new(None),
        })
    }
}

// =============================================================================
// ConsentService
// =============================================================================

/// The consent and audit gate.
#[derive(Debug)]
pub struct ConsentService {
    registry: ConsentRegistry,
    validator: AccessValidator,
    audit: Arc<AuditLog>,
    cache: Arc<DecisionCache>,
    metrics: GateMetrics,
    sweep_interval: Duration,
    sweeper: Mutex<Option<SweeperHandle>>,
}

const OVERSIGHT: &[Role] = &[Role::Auditor, Role::Admin];

impl ConsentService {
    /// Starts building a service over `ledger`.
    #[must_use]
    pub fn builder(ledger: Arc<dyn LedgerClient>) -> ConsentServiceBuilder {
        ConsentServiceBuilder {
            ledger,
            config: GateConfig::default(),
            clock: Arc::new(SystemClock),
            metrics: None,
            signer: None,
            signature_check: None,
        }
    }

    /// Spawns the cache sweep. Idempotent.
    pub async fn start(&self) {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_none() {
            *sweeper = Some(self.cache.spawn_sweeper(self.sweep_interval));
            info!(interval_secs = self.sweep_interval.as_secs(), "decision cache sweeper started");
        }
    }

    /// Stops the cache sweep and waits for it to exit. Idempotent.
    pub async fn shutdown(&self) {
        let handle = self.sweeper.lock().await.take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }

    /// Returns `true` while the sweep task is running.
    pub async fn is_running(&self) -> bool {
        self.sweeper
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Returns the metrics handle.
    #[must_use]
    pub const fn metrics(&self) -> &GateMetrics {
        &self.metrics
    }

    /// Returns the decision cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<DecisionCache> {
        &self.cache
    }

    /// Grants consent on behalf of the calling patient.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Authorization`] unless the caller is a patient,
    /// otherwise as [`ConsentRegistry::grant`].
    pub async fn grant(
        &self,
        principal: &Principal,
        provider_id: &str,
        permissions: Vec<Permission>,
        expiration: Expiration,
        patient_signature: &str,
    ) -> ConsentResult<GrantReceipt> {
        principal.require(&[Role::Patient], "grant consent")?;
        self.registry
            .grant(GrantRequest {
                patient_id: principal.id.clone(),
                provider_id: provider_id.to_string(),
                permissions,
                expiration,
                patient_signature: patient_signature.to_string(),
            })
            .await
    }

    /// Revokes one of the calling patient's tokens.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Authorization`] unless the caller is a patient,
    /// otherwise as [`ConsentRegistry::revoke`].
    pub async fn revoke(
        &self,
        principal: &Principal,
        token_id: &str,
        patient_signature: &str,
        reason: Option<String>,
    ) -> ConsentResult<RevocationResult> {
        principal.require(&[Role::Patient], "revoke consent")?;
        self.registry
            .revoke(RevokeRequest {
                token_id: token_id.to_string(),
                requester_id: principal.id.clone(),
                patient_signature: patient_signature.to_string(),
                reason,
            })
            .await
    }

    /// Revokes several of the calling patient's tokens.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Authorization`] unless the caller is a patient,
    /// otherwise as [`ConsentRegistry::bulk_revoke`].
    pub async fn bulk_revoke(
        &self,
        principal: &Principal,
        token_ids: Vec<String>,
        patient_signature: &str,
        reason: Option<String>,
    ) -> ConsentResult<Vec<BulkRevocationItem>> {
        principal.require(&[Role::Patient], "revoke consent")?;
        self.registry
            .bulk_revoke(token_ids, &principal.id, patient_signature, reason)
            .await
    }

    /// Decides an access check. Never fails; see [`AccessValidator`].
    pub async fn validate_access(&self, request: &AccessRequest) -> AccessDecision {
        self.validator.validate_access(request).await
    }

    /// Gates a provider opening a specific record.
    ///
    /// Validates access and, when granted, appends `RECORD_ACCESSED`.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Authorization`] unless the caller is a
    /// provider, and [`ConsentError::Validation`] for malformed ids. A denial
    /// is returned as a decision, not an error.
    pub async fn access_record(
        &self,
        principal: &Principal,
        record: &RecordRef,
        access_level: AccessLevel,
    ) -> ConsentResult<AccessDecision> {
        principal.require(&[Role::Provider], "access records")?;
        consentd_core::token::validate_id("record_id", &record.record_id)?;
        let request = AccessRequest::new(
            principal.id.clone(),
            record.patient_id.clone(),
            record.resource_type,
            access_level,
        )?
        .created_by(record.creator_id.clone());

        let decision = self.validator.validate_access(&request).await;
        if decision.granted {
            let input = AuditEntryInput::new(
                AuditEventType::RecordAccessed,
                principal.id.clone(),
                AuditDetails::RecordAccessed {
                    record_id: record.record_id.clone(),
                    resource_type: record.resource_type,
                    access_level,
                    matched_token_id: decision.matched_token_id.clone(),
                },
            )
            .with_subject(record.patient_id.clone())
            .with_resource(record.record_id.clone());
            if let AuditOutcome::Degraded { reason } = self.audit.append_best_effort(input).await {
                tracing::debug!(
                    record_id = %record.record_id,
                    reason = %reason,
                    "record access audit degraded"
                );
            }
        }
        Ok(decision)
    }

    /// Queries the audit trail.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Authorization`] unless the caller is an auditor
    /// or admin, otherwise as [`AuditLog::query`].
    pub async fn query_audit(
        &self,
        principal: &Principal,
        filter: &AuditFilter,
        page: usize,
        limit: usize,
    ) -> ConsentResult<AuditPage> {
        principal.require(OVERSIGHT, "query the audit trail")?;
        self.audit.query(filter, page, limit).await
    }

    /// Aggregates the audit trail over `[from, to)`.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Authorization`] unless the caller is an auditor
    /// or admin, otherwise as [`AuditLog::statistics`].
    pub async fn audit_statistics(
        &self,
        principal: &Principal,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> ConsentResult<AuditStatistics> {
        principal.require(OVERSIGHT, "read audit statistics")?;
        self.audit.statistics(from, to).await
    }

    /// Lists a patient's tokens.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Authorization`] unless the caller is that
    /// patient, an auditor or an admin.
    pub async fn patient_consents(
        &self,
        principal: &Principal,
        patient_id: &str,
    ) -> ConsentResult<Vec<ConsentToken>> {
        let is_self = principal.role == Role::Patient && principal.id == patient_id;
        if !is_self && !principal.role.is_oversight() {
            return Err(ConsentError::authorization(
                &principal.id,
                "may only list own consents",
            ));
        }
        self.registry.patient_consents(patient_id).await
    }

    /// Lists the tokens granted to a provider.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Authorization`] unless the caller is that
    /// provider, an auditor or an admin.
    pub async fn provider_consents(
        &self,
        principal: &Principal,
        provider_id: &str,
    ) -> ConsentResult<Vec<ConsentToken>> {
        let is_self = principal.role == Role::Provider && principal.id == provider_id;
        if !is_self && !principal.role.is_oversight() {
            return Err(ConsentError::authorization(
                &principal.id,
                "may only list own consents",
            ));
        }
        self.registry.provider_consents(provider_id).await
    }
}
