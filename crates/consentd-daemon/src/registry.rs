//! Consent registry: the only writer of consent token state.
//!
//! # Operation order
//!
//! ```text
//! grant:   validate ─► verify signature ─► store.create ─► cache.invalidate_pair ─► audit
//! revoke:  validate ─► lock(token) ─► store.get ─► owner check ─► verify signature
//!              ─► [already inactive? return] ─► store.update ─► cache.invalidate_pair ─► audit
//! ```
//!
//! Validation and authorization failures abort before any side effect. A
//! failed store write aborts with [`ConsentError::StoreUnavailable`] and skips
//! invalidation and audit. A failed audit append after a successful store
//! write is reported as [`AuditOutcome::Degraded`]; the operation still
//! happened.
//!
//! # Same-token linearizability
//!
//! Revokes of one token id serialize on a per-token async lock held across
//! the read-check-write, so of two racing revokes exactly one performs the
//! transition and emits `CONSENT_REVOKED`; the other observes the revoked
//! token and reports [`RevocationStatus::AlreadyInactive`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use consentd_core::signing::{
    KeyDirectory, SignatureVerifier, bulk_revoke_message, grant_message, revoke_message,
};
use consentd_core::token::{validate_id, validate_reason, validate_signature};
use consentd_core::{
    AuditDetails, AuditEntryInput, AuditEventType, Clock, ConsentError, ConsentResult,
    ConsentToken, Expiration, Permission, PermissionSet,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit_log::{AuditLog, AuditOutcome};
use crate::cache::DecisionCache;
use crate::metrics::GateMetrics;
use crate::store::ConsentStore;

/// Prefix of every consent token id.
pub const TOKEN_ID_PREFIX: &str = "CONSENT-";

/// Maximum number of token ids in one bulk revoke.
pub const MAX_BULK_REVOKE: usize = 100;

/// Dead per-token lock slots are pruned once the map grows past this size.
const TOKEN_LOCK_PRUNE_THRESHOLD: usize = 1_024;

// =============================================================================
// Requests and results
// =============================================================================

/// A patient's request to grant consent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRequest {
    /// The granting patient.
    pub patient_id: String,
    /// The receiving provider.
    pub provider_id: String,
    /// Requested permissions, in display order.
    pub permissions: Vec<Permission>,
    /// When the grant lapses.
    pub expiration: Expiration,
    /// Patient signature over [`grant_message`].
    pub patient_signature: String,
}

/// The outcome of a successful grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantReceipt {
    /// The persisted token.
    pub token: ConsentToken,
    /// Whether `CONSENT_GRANTED` was recorded.
    pub audit: AuditOutcome,
}

/// A request to revoke one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokeRequest {
    /// The token to revoke.
    pub token_id: String,
    /// The principal asking; must own the token.
    pub requester_id: String,
    /// Patient signature over [`revoke_message`].
    pub patient_signature: String,
    /// Free-text reason.
    pub reason: Option<String>,
}

/// What a revoke did to the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RevocationStatus {
    /// This call revoked the token.
    Revoked {
        /// When the revocation took effect.
        revoked_at: DateTime<Utc>,
    },
    /// The token was already revoked or expired; nothing changed.
    AlreadyInactive,
}

/// The outcome of a successful revoke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationResult {
    /// The token.
    pub token_id: String,
    /// What happened.
    pub status: RevocationStatus,
    /// Whether `CONSENT_REVOKED` was recorded; `None` if nothing changed.
    pub audit: Option<AuditOutcome>,
}

impl RevocationResult {
    /// Returns `true` if this call performed the revocation.
    #[must_use]
    pub const fn revoked(&self) -> bool {
        matches!(self.status, RevocationStatus::Revoked { .. })
    }
}

/// One item of a bulk revoke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkRevocationItem {
    /// The token id as supplied.
    pub token_id: String,
    /// The per-token result.
    pub result: ConsentResult<RevocationResult>,
}

// =============================================================================
// Signature checks
// =============================================================================

/// Verifies patient signatures through the external signer/verifier.
#[derive(Debug, Clone)]
pub struct SignatureCheck {
    verifier: Arc<dyn SignatureVerifier>,
    keys: Arc<dyn KeyDirectory>,
}

impl SignatureCheck {
    /// Creates a check backed by `verifier` and `keys`.
    #[must_use]
    pub fn new(verifier: Arc<dyn SignatureVerifier>, keys: Arc<dyn KeyDirectory>) -> Self {
        Self { verifier, keys }
    }

    /// Verifies `signature` over `message` under `principal_id`'s key.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Authorization`] if the principal has no key or
    /// the signature does not verify.
    pub fn verify(&self, principal_id: &str, signature: &str, message: &[u8]) -> ConsentResult<()> {
        let key = self.keys.public_key(principal_id).ok_or_else(|| {
            ConsentError::authorization(principal_id, "no registered public key")
        })?;
        if self.verifier.verify(signature, message, &key) {
            Ok(())
        } else {
            Err(ConsentError::authorization(principal_id, "signature verification failed"))
        }
    }
}

// =============================================================================
// ConsentRegistry
// =============================================================================

/// Grants and revokes consent.
#[derive(Debug)]
pub struct ConsentRegistry {
    store: ConsentStore,
    cache: Arc<DecisionCache>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    signatures: Option<SignatureCheck>,
    metrics: Option<GateMetrics>,
    token_locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl ConsentRegistry {
    /// Creates a registry.
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
            signatures: None,
            metrics: None,
            token_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Enables patient signature verification.
    #[must_use]
    pub fn with_signature_check(mut self, check: SignatureCheck) -> Self {
        self.signatures = Some(check);
        self
    }

    /// Attaches metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: GateMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn count(&self, operation: &str, status: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.consent_operation(operation, status);
        }
    }

    fn verify(
        &self,
        principal_id: &str,
        signature: &str,
        message: impl FnOnce() -> Vec<u8>,
    ) -> ConsentResult<()> {
        match &self.signatures {
            Some(check) => check.verify(principal_id, signature, &message()),
            None => Ok(()),
        }
    }

    fn token_lock(&self, token_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.token_locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = locks.get(token_id).and_then(Weak::upgrade) {
            return lock;
        }
        if locks.len() >= TOKEN_LOCK_PRUNE_THRESHOLD {
            locks.retain(|_, slot| slot.strong_count() > 0);
        }
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(token_id.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Grants consent.
    ///
    /// # Errors
    ///
    /// - [`ConsentError::Validation`] for malformed ids, an empty or invalid
    ///   permission list, a missing signature, a self-grant or an expiration
    ///   that is not in the future
    /// - [`ConsentError::Authorization`] if signature verification is enabled
    ///   and fails
    /// - [`ConsentError::StoreUnavailable`] if the store write fails
    pub async fn grant(&self, request: GrantRequest) -> ConsentResult<GrantReceipt> {
        let result = self.grant_inner(request).await;
        self.count("grant", if result.is_ok() { "ok" } else { "error" });
        result
    }

    async fn grant_inner(&self, request: GrantRequest) -> ConsentResult<GrantReceipt> {
        let GrantRequest {
            patient_id,
            provider_id,
            permissions,
            expiration,
            patient_signature,
        } = request;

        validate_id("patient_id", &patient_id)?;
        validate_id("provider_id", &provider_id)?;
        validate_signature("patient_signature", &patient_signature)?;
        if patient_id == provider_id {
            return Err(ConsentError::validation(
                "provider_id",
                "a patient cannot grant consent to themselves",
            ));
        }
        let permissions = PermissionSet::new(permissions)?;
        let now = self.clock.now();
        if let Expiration::At(at) = expiration {
            if at <= now {
                return Err(ConsentError::validation(
                    "expiration",
                    "expiration must be in the future",
                ));
            }
        }
        self.verify(&patient_id, &patient_signature, || {
            grant_message(&patient_id, &provider_id, permissions.as_slice(), &expiration)
        })?;

        let token = ConsentToken::new(
            format!("{TOKEN_ID_PREFIX}{}", Uuid::new_v4()),
            patient_id,
            provider_id,
            permissions,
            expiration,
            now,
            patient_signature,
        );
        self.store.create(&token).await?;
        self.cache
            .invalidate_pair(&token.provider_id, &token.patient_id)
            .await;

        let audit = self
            .audit
            .append_best_effort(
                AuditEntryInput::new(
                    AuditEventType::ConsentGranted,
                    token.patient_id.clone(),
                    AuditDetails::ConsentGranted {
                        token_id: token.token_id.clone(),
                        provider_id: token.provider_id.clone(),
                        permissions: token.permissions.as_slice().to_vec(),
                        expiration: token.expiration,
                    },
                )
                .with_subject(token.patient_id.clone())
                .with_resource(token.token_id.clone())
                .with_actor_signature(token.signature.clone()),
            )
            .await;

        info!(
            token_id = %token.token_id,
            patient_id = %token.patient_id,
            provider_id = %token.provider_id,
            permissions = token.permissions.len(),
            "consent granted"
        );
        Ok(GrantReceipt { token, audit })
    }

    /// Revokes one token.
    ///
    /// Revoking a token that is already revoked or expired succeeds with
    /// [`RevocationStatus::AlreadyInactive`] and records nothing.
    ///
    /// # Errors
    ///
    /// - [`ConsentError::Validation`] for malformed input
    /// - [`ConsentError::NotFound`] if the token does not exist
    /// - [`ConsentError::Authorization`] if the requester does not own the
    ///   token or the signature does not verify
    /// - [`ConsentError::StoreUnavailable`] if the store fails
    pub async fn revoke(&self, request: RevokeRequest) -> ConsentResult<RevocationResult> {
        let result = self.revoke_checked(request).await;
        self.count("revoke", revoke_status(&result));
        result
    }

    async fn revoke_checked(&self, request: RevokeRequest) -> ConsentResult<RevocationResult> {
        validate_id("token_id", &request.token_id)?;
        validate_id("requester_id", &request.requester_id)?;
        validate_signature("patient_signature", &request.patient_signature)?;
        validate_reason(request.reason.as_deref())?;
        self.revoke_one(
            &request.token_id,
            &request.requester_id,
            &request.patient_signature,
            request.reason,
            true,
        )
        .await
    }

    async fn revoke_one(
        &self,
        token_id: &str,
        requester_id: &str,
        patient_signature: &str,
        reason: Option<String>,
        verify_signature: bool,
    ) -> ConsentResult<RevocationResult> {
        let lock = self.token_lock(token_id);
        let _guard = lock.lock().await;

        let mut token = self
            .store
            .get(token_id)
            .await?
            .ok_or_else(|| ConsentError::not_found("consent token", token_id))?;
        if token.patient_id != requester_id {
            return Err(ConsentError::authorization(
                requester_id,
                format!("not the owner of consent token {token_id}"),
            ));
        }
        if verify_signature {
            self.verify(requester_id, patient_signature, || {
                revoke_message(token_id, &token.patient_id)
            })?;
        }

        let now = self.clock.now();
        if !token.is_valid_at(now) {
            info!(token_id, validity = ?token.validity_at(now), "consent already inactive");
            return Ok(RevocationResult {
                token_id: token_id.to_string(),
                status: RevocationStatus::AlreadyInactive,
                audit: None,
            });
        }

        token.revoke(now, reason.clone());
        self.store.update(&token).await?;
        self.cache
            .invalidate_pair(&token.provider_id, &token.patient_id)
            .await;

        let audit = self
            .audit
            .append_best_effort(
                AuditEntryInput::new(
                    AuditEventType::ConsentRevoked,
                    requester_id,
                    AuditDetails::ConsentRevoked {
                        token_id: token.token_id.clone(),
                        provider_id: token.provider_id.clone(),
                        reason,
                    },
                )
                .with_subject(token.patient_id.clone())
                .with_resource(token.token_id.clone())
                .with_actor_signature(patient_signature),
            )
            .await;

        info!(token_id, provider_id = %token.provider_id, "consent revoked");
        Ok(RevocationResult {
            token_id: token_id.to_string(),
            status: RevocationStatus::Revoked { revoked_at: now },
            audit: Some(audit),
        })
    }

    /// Revokes several tokens under one signature.
    ///
    /// The signature covers [`bulk_revoke_message`] over the whole list and
    /// is checked once. Each id is then revoked independently; a failure on
    /// one id does not affect the others. Duplicate ids are revoked once and
    /// reported once.
    ///
    /// # Errors
    ///
    /// Fails as a whole only for malformed input (an empty list, more than
    /// [`MAX_BULK_REVOKE`] ids, a missing signature or an overlong reason) or
    /// a failed signature check.
    pub async fn bulk_revoke(
        &self,
        token_ids: Vec<String>,
        requester_id: &str,
        patient_signature: &str,
        reason: Option<String>,
    ) -> ConsentResult<Vec<BulkRevocationItem>> {
        validate_id("requester_id", requester_id)?;
        validate_signature("patient_signature", patient_signature)?;
        validate_reason(reason.as_deref())?;
        if token_ids.is_empty() {
            return Err(ConsentError::validation("token_ids", "must not be empty"));
        }
        if token_ids.len() > MAX_BULK_REVOKE {
            return Err(ConsentError::validation(
                "token_ids",
                format!("at most {MAX_BULK_REVOKE} tokens per request"),
            ));
        }
        self.verify(requester_id, patient_signature, || {
            bulk_revoke_message(&token_ids, requester_id)
        })?;

        let mut seen = std::collections::HashSet::new();
        let mut items = Vec::with_capacity(token_ids.len());
        for token_id in token_ids {
            if !seen.insert(token_id.clone()) {
                continue;
            }
            let result = match validate_id("token_id", &token_id) {
                Ok(()) => {
                    self.revoke_one(
                        &token_id,
                        requester_id,
                        patient_signature,
                        reason.clone(),
                        false,
                    )
                    .await
                },
                Err(e) => Err(e),
            };
            self.count("revoke", revoke_status(&result));
            if let Err(e) = &result {
                warn!(token_id = %token_id, error = %e, "bulk revoke item failed");
            }
            items.push(BulkRevocationItem { token_id, result });
        }
        Ok(items)
    }

    /// Lists every token a patient granted, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::StoreUnavailable`] if the store fails.
    pub async fn patient_consents(&self, patient_id: &str) -> ConsentResult<Vec<ConsentToken>> {
        validate_id("patient_id", patient_id)?;
        let mut tokens = self.store.by_patient(patient_id).await?;
        newest_first(&mut tokens);
        Ok(tokens)
    }

    /// Lists every token granted to a provider, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::StoreUnavailable`] if the store fails.
    pub async fn provider_consents(&self, provider_id: &str) -> ConsentResult<Vec<ConsentToken>> {
        validate_id("provider_id", provider_id)?;
        let mut tokens = self.store.by_provider(provider_id).await?;
        newest_first(&mut tokens);
        Ok(tokens)
    }
}

fn revoke_status(result: &ConsentResult<RevocationResult>) -> &'static str {
    match result {
        Ok(r) if r.revoked() => "ok",
        Ok(_) => "already_inactive",
        Err(_) => "error",
    }
}

fn newest_first(tokens: &mut [ConsentToken]) {
    tokens.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.token_id.cmp(&a.token_id))
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use consentd_core::{AccessLevel, ErrorKind, ManualClock, ResourceType};

    use super::*;
    use crate::cache::DecisionCacheConfig;
    use crate::ledger::InMemoryLedger;

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    struct Fixture {
        ledger: Arc<InMemoryLedger>,
        clock: Arc<ManualClock>,
        registry: ConsentRegistry,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(InMemoryLedger::new());
        let clock = Arc::new(ManualClock::new(start()));
        let timeout = Duration::from_secs(1);
        let store = ConsentStore::new(ledger.clone(), timeout);
        let cache = Arc::new(DecisionCache::new(DecisionCacheConfig::default(), clock.clone()));
        let audit = Arc::new(AuditLog::new(ledger.clone(), clock.clone(), timeout));
        let registry = ConsentRegistry::new(store, cache, audit, clock.clone());
        Fixture {
            ledger,
            clock,
            registry,
        }
    }

    fn grant_request(provider: &str) -> GrantRequest {
        GrantRequest {
            patient_id: "pat-1".to_string(),
            provider_id: provider.to_string(),
            permissions: vec![Permission::new(ResourceType::LabResult, AccessLevel::Read)],
            expiration: Expiration::Never,
            patient_signature: "sig".to_string(),
        }
    }

    fn revoke_request(token_id: &str, requester: &str) -> RevokeRequest {
        RevokeRequest {
            token_id: token_id.to_string(),
            requester_id: requester.to_string(),
            patient_signature: "sig".to_string(),
            reason: Some("changed provider".to_string()),
        }
    }

    #[tokio::test]
    async fn grant_rejects_invalid_input_without_side_effects() {
        let f = fixture();
        let cases = [
            GrantRequest {
                permissions: Vec::new(),
                ..grant_request("doc-1")
            },
            GrantRequest {
                patient_signature: String::new(),
                ..grant_request("doc-1")
            },
            grant_request("pat-1"),
            GrantRequest {
                expiration: Expiration::At(start()),
                ..grant_request("doc-1")
            },
        ];
        for request in cases {
            let err = f.registry.grant(request).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        assert_eq!(f.ledger.submit_count(crate::ledger::consent_fn::CREATE), 0);
        assert_eq!(f.ledger.audit_len(), 0);
    }

    #[tokio::test]
    async fn store_failure_aborts_grant_before_audit() {
        let f = fixture();
        f.ledger.fail_submits(true);
        let err = f.registry.grant(grant_request("doc-1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
        f.ledger.fail_submits(false);
        assert_eq!(f.ledger.audit_len(), 0);
    }

    #[tokio::test]
    async fn revoke_requires_owner_and_existing_token() {
        let f = fixture();
        let receipt = f.registry.grant(grant_request("doc-1")).await.unwrap();

        let err = f
            .registry
            .revoke(revoke_request(&receipt.token.token_id, "pat-2"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        let err = f
            .registry
            .revoke(revoke_request("CONSENT-missing", "pat-1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn revoking_an_expired_token_is_already_inactive() {
        let f = fixture();
        let receipt = f
            .registry
            .grant(GrantRequest {
                expiration: Expiration::At(start() + chrono::TimeDelta::seconds(10)),
                ..grant_request("doc-1")
            })
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(11));

        let result = f
            .registry
            .revoke(revoke_request(&receipt.token.token_id, "pat-1"))
            .await
            .unwrap();
        assert_eq!(result.status, RevocationStatus::AlreadyInactive);
        assert!(result.audit.is_none());
        assert_eq!(f.ledger.submit_count(crate::ledger::consent_fn::UPDATE), 0);
    }

    #[tokio::test]
    async fn listings_are_newest_first() {
        let f = fixture();
        let first = f.registry.grant(grant_request("doc-1")).await.unwrap();
        f.clock.advance(Duration::from_secs(1));
        let second = f.registry.grant(grant_request("doc-2")).await.unwrap();

        let tokens = f.registry.patient_consents("pat-1").await.unwrap();
        let ids: Vec<_> = tokens.iter().map(|t| t.token_id.as_str()).collect();
        assert_eq!(ids, [second.token.token_id.as_str(), first.token.token_id.as_str()]);

        let tokens = f.registry.provider_consents("doc-1").await.unwrap();
        assert_eq!(tokens.len(), 1);
    }

    #[tokio::test]
    async fn bulk_revoke_bounds_its_input() {
        let f = fixture();
        let err = f
            .registry
            .bulk_revoke(Vec::new(), "pat-1", "sig", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let too_many = (0..=MAX_BULK_REVOKE).map(|i| format!("tok-{i}")).collect();
        let err = f
            .registry
            .bulk_revoke(too_many, "pat-1", "sig", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn token_locks_are_shared_while_held() {
        let f = fixture();
        let a = f.registry.token_lock("tok-1");
        let b = f.registry.token_lock("tok-1");
        assert!(Arc::ptr_eq(&a, &b));
        drop((a, b));
        let c = f.registry.token_lock("tok-1");
        assert_eq!(Arc::strong_count(&c), 1);
    }
}
