//! Access decisions and the pure evaluator behind them.
//!
//! # Snapshot / evaluate split
//!
//! ```text
//! store query ──> ConsentSnapshot::from_tokens(tokens, resource_type, now)
//!                        │
//!                        ├──> DecisionCache (keyed by provider, patient, type)
//!                        │
//!                        v
//!            evaluate(&snapshot, access_level, now) ──> AccessDecision
//! ```
//!
//! The snapshot records *what the store said* about one (provider, patient,
//! resource type) triple: which tokens cover that type, at which levels, and
//! until when. It never records a verdict. [`evaluate`] re-derives the verdict
//! from expirations every time it runs, so a snapshot served from cache can
//! never grant access through a token that has expired since it was cached.
//! Because the snapshot keeps every granted level, one cache entry answers
//! both read and write checks.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::permission::{AccessLevel, ResourceType};
use crate::token::{ConsentToken, Expiration, TokenValidity};

/// Reason string for the creator short-circuit.
pub const CREATOR_ACCESS_REASON: &str = "creator access";

/// Reason string for a decision granted through a consent token.
pub const CONSENT_GRANTED_REASON: &str = "active consent";

/// Why an access request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// No active, unrevoked token exists for the pair.
    NoActiveConsent,
    /// The only relevant tokens are past their expiration.
    ConsentExpired,
    /// Valid tokens exist, but none mentions the resource type.
    ResourceTypeNotCovered,
    /// A valid token covers the resource type, but not at the requested level.
    AccessLevelNotCovered,
    /// The store could not be consulted; denied fail-closed.
    StoreUnavailable,
}

impl DenialReason {
    /// Returns the human-readable reason string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NoActiveConsent => "no active consent",
            Self::ConsentExpired => "consent expired",
            Self::ResourceTypeNotCovered => "resource type not covered",
            Self::AccessLevelNotCovered => "access level not covered",
            Self::StoreUnavailable => "store unavailable",
        }
    }

    /// Returns a compact label for metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::NoActiveConsent => "no_active_consent",
            Self::ConsentExpired => "consent_expired",
            Self::ResourceTypeNotCovered => "resource_type_not_covered",
            Self::AccessLevelNotCovered => "access_level_not_covered",
            Self::StoreUnavailable => "store_unavailable",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The answer to "may this provider access this patient's records?".
///
/// Decisions are ephemeral; their occurrence is recorded through the audit
/// log, never persisted directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    /// Whether access is permitted.
    pub granted: bool,
    /// The token that authorized access, if granted through consent.
    pub matched_token_id: Option<String>,
    /// Human-readable justification.
    pub reason: String,
    /// Structured denial reason, if denied.
    pub denial: Option<DenialReason>,
}

impl AccessDecision {
    /// A grant through the given token.
    #[must_use]
    pub fn granted_by(token_id: impl Into<String>) -> Self {
        Self {
            granted: true,
            matched_token_id: Some(token_id.into()),
            reason: CONSENT_GRANTED_REASON.to_string(),
            denial: None,
        }
    }

    /// A grant because the requester created the record.
    #[must_use]
    pub fn creator_access() -> Self {
        Self {
            granted: true,
            matched_token_id: None,
            reason: CREATOR_ACCESS_REASON.to_string(),
            denial: None,
        }
    }

    /// A denial.
    #[must_use]
    pub fn denied(reason: DenialReason) -> Self {
        Self {
            granted: false,
            matched_token_id: None,
            reason: reason.as_str().to_string(),
            denial: Some(reason),
        }
    }
}

/// A token that mentions the snapshot's resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoveringGrant {
    /// The covering token.
    pub token_id: String,
    /// Levels granted for the resource type.
    pub levels: Vec<AccessLevel>,
    /// The token's expiration.
    pub expiration: Expiration,
}

/// What the store reported about one (provider, patient, resource type).
///
/// Only active, unrevoked tokens are included; revoked tokens contribute
/// nothing. Expired tokens are kept so the evaluator can tell "expired" apart
/// from "never granted".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentSnapshot {
    /// The resource type this snapshot describes.
    pub resource_type: ResourceType,
    /// Tokens mentioning `resource_type`, in store order.
    pub covering: Vec<CoveringGrant>,
    /// Expirations of the pair's other unrevoked tokens.
    pub others: Vec<Expiration>,
}

impl ConsentSnapshot {
    /// An empty snapshot: the pair holds no unrevoked tokens.
    #[must_use]
    pub const fn empty(resource_type: ResourceType) -> Self {
        Self {
            resource_type,
            covering: Vec::new(),
            others: Vec::new(),
        }
    }

    /// Summarizes the tokens of one (provider, patient) pair.
    ///
    /// Tokens that are revoked at `now` are skipped. Tokens that are merely
    /// expired are kept.
    #[must_use]
    pub fn from_tokens<'a, I>(tokens: I, resource_type: ResourceType, now: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = &'a ConsentToken>,
    {
        let mut snapshot = Self::empty(resource_type);
        for token in tokens {
            if token.validity_at(now) == TokenValidity::Revoked {
                continue;
            }
            if token.permissions.mentions(resource_type) {
                snapshot.covering.push(CoveringGrant {
                    token_id: token.token_id.clone(),
                    levels: token.permissions.levels_for(resource_type),
                    expiration: token.expiration,
                });
            } else {
                snapshot.others.push(token.expiration);
            }
        }
        snapshot
    }

    /// Returns `true` if the snapshot holds no tokens at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.covering.is_empty() && self.others.is_empty()
    }

    /// Returns the earliest expiration among the snapshot's tokens.
    #[must_use]
    pub fn earliest_expiration(&self) -> Option<DateTime<Utc>> {
        self.covering
            .iter()
            .map(|g| g.expiration)
            .chain(self.others.iter().copied())
            .filter_map(|e| e.instant())
            .min()
    }
}

/// Decides a request for `access_level` against a snapshot at `now`.
///
/// Denial precedence:
/// 1. a valid covering token exists at other levels: `AccessLevelNotCovered`
/// 2. a covering token exists but has expired: `ConsentExpired`
/// 3. a valid token exists for other types: `ResourceTypeNotCovered`
/// 4. only expired tokens remain: `ConsentExpired`
/// 5. otherwise: `NoActiveConsent`
#[must_use]
pub fn evaluate(
    snapshot: &ConsentSnapshot,
    access_level: AccessLevel,
    now: DateTime<Utc>,
) -> AccessDecision {
    let valid_covering = snapshot
        .covering
        .iter()
        .filter(|g| g.expiration.is_after(now));

    let mut level_mismatch = false;
    for grant in valid_covering {
        if grant.levels.iter().any(|l| l.satisfies(access_level)) {
            return AccessDecision::granted_by(grant.token_id.clone());
        }
        level_mismatch = true;
    }
    if level_mismatch {
        return AccessDecision::denied(DenialReason::AccessLevelNotCovered);
    }
    if !snapshot.covering.is_empty() {
        return AccessDecision::denied(DenialReason::ConsentExpired);
    }
    if snapshot.others.iter().any(|e| e.is_after(now)) {
        return AccessDecision::denied(DenialReason::ResourceTypeNotCovered);
    }
    if !snapshot.others.is_empty() {
        return AccessDecision::denied(DenialReason::ConsentExpired);
    }
    AccessDecision::denied(DenialReason::NoActiveConsent)
}
