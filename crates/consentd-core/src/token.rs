//! Consent tokens: capability grants from a patient to a provider.
//!
//! # Lifecycle
//!
//! ```text
//! grant  --> ConsentToken (is_active = true, revoked_at = None)
//!               |
//!               v
//! revoke --> ConsentToken (is_active = false, revoked_at = Some(t))
//! ```
//!
//! A token is mutated at most once, by revocation. Expiry is never stored: it
//! is derived from `expiration` and the current time on every check, so a
//! token past its expiration still reads `is_active = true` in storage.
//! Tokens are never deleted.
//!
//! # Validity
//!
//! A token is currently valid iff
//! `is_active && revoked_at.is_none() && expiration.is_after(now)`.
//! [`ConsentToken::validity_at`] is the single implementation of that rule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConsentError;
use crate::permission::PermissionSet;

/// Maximum length of token and principal identifiers.
pub const MAX_ID_LEN: usize = 128;

/// Maximum length of an opaque signature string.
pub const MAX_SIGNATURE_LEN: usize = 4096;

/// Maximum length of a free-text revocation reason.
pub const MAX_REASON_LEN: usize = 512;

/// When a consent token stops being valid on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expiration {
    /// Valid until explicitly revoked.
    #[default]
    Never,
    /// Valid strictly before this instant.
    At(DateTime<Utc>),
}

impl Expiration {
    /// Builds an expiration from an optional instant.
    #[must_use]
    pub const fn from_option(at: Option<DateTime<Utc>>) -> Self {
        match at {
            Some(at) => Self::At(at),
            None => Self::Never,
        }
    }

    /// Returns `true` if the grant is still in force at `now`.
    #[must_use]
    pub fn is_after(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Never => true,
            Self::At(at) => *at > now,
        }
    }

    /// Returns the expiration instant, if any.
    #[must_use]
    pub const fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Never => None,
            Self::At(at) => Some(*at),
        }
    }
}

/// Result of evaluating the validity invariant at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenValidity {
    /// Active, not revoked, not expired.
    Valid,
    /// Revoked (inactive or carrying a revocation instant).
    Revoked,
    /// Active but past its expiration.
    Expired,
}

impl TokenValidity {
    /// Returns `true` for [`TokenValidity::Valid`].
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// A capability grant from a patient to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsentToken {
    /// Globally unique identifier, assigned at creation.
    pub token_id: String,

    /// The granting patient.
    pub patient_id: String,

    /// The receiving provider.
    pub provider_id: String,

    /// Granted permissions, in the order the patient listed them.
    pub permissions: PermissionSet,

    /// Optional expiration.
    #[serde(default)]
    pub expiration: Expiration,

    /// `true` at creation, `false` once revoked.
    pub is_active: bool,

    /// Creation instant.
    pub created_at: DateTime<Utc>,

    /// Revocation instant, set exactly once.
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,

    /// Free-text reason supplied with the revocation.
    #[serde(default)]
    pub revocation_reason: Option<String>,

    /// Opaque patient signature over the grant message.
    pub signature: String,
}

impl ConsentToken {
    /// Creates a freshly granted, active token.
    #[must_use]
    pub fn new(
        token_id: String,
        patient_id: String,
        provider_id: String,
        permissions: PermissionSet,
        expiration: Expiration,
        created_at: DateTime<Utc>,
        signature: String,
    ) -> Self {
        Self {
            token_id,
            patient_id,
            provider_id,
            permissions,
            expiration,
            is_active: true,
            created_at,
            revoked_at: None,
            revocation_reason: None,
            signature,
        }
    }

    /// Evaluates the validity invariant at `now`.
    ///
    /// Revocation takes precedence over expiry.
    #[must_use]
    pub fn validity_at(&self, now: DateTime<Utc>) -> TokenValidity {
        if !self.is_active || self.revoked_at.is_some() {
            TokenValidity::Revoked
        } else if !self.expiration.is_after(now) {
            TokenValidity::Expired
        } else {
            TokenValidity::Valid
        }
    }

    /// Returns `true` if the token is currently valid at `now`.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.validity_at(now).is_valid()
    }

    /// Returns `true` if the token has been revoked.
    #[must_use]
    pub const fn is_revoked(&self) -> bool {
        !self.is_active || self.revoked_at.is_some()
    }

    /// Marks the token revoked at `now`.
    ///
    /// Returns `false` and leaves the token untouched if it was already
    /// revoked, so `revoked_at` is written exactly once.
    pub fn revoke(&mut self, now: DateTime<Utc>, reason: Option<String>) -> bool {
        if self.is_revoked() {
            return false;
        }
        self.is_active = false;
        self.revoked_at = Some(now);
        self.revocation_reason = reason;
        true
    }
}

/// Validates a principal or token identifier.
///
/// # Errors
///
/// Returns [`ConsentError::Validation`] if the identifier is empty, too long,
/// or contains control characters.
pub fn validate_id(field: &str, value: &str) -> Result<(), ConsentError> {
    if value.trim().is_empty() {
        return Err(ConsentError::validation(field, "must not be empty"));
    }
    if value.len() > MAX_ID_LEN {
        return Err(ConsentError::validation(
            field,
            format!("exceeds {MAX_ID_LEN} bytes"),
        ));
    }
    if value.chars().any(char::is_control) {
        return Err(ConsentError::validation(
            field,
            "contains control characters",
        ));
    }
    Ok(())
}

/// Validates an opaque signature string.
///
/// # Errors
///
/// Returns [`ConsentError::Validation`] if the signature is empty or too long.
pub fn validate_signature(field: &str, signature: &str) -> Result<(), ConsentError> {
    if signature.trim().is_empty() {
        return Err(ConsentError::validation(field, "signature is required"));
    }
    if signature.len() > MAX_SIGNATURE_LEN {
        return Err(ConsentError::validation(
            field,
            format!("exceeds {MAX_SIGNATURE_LEN} bytes"),
        ));
    }
    Ok(())
}

/// Validates an optional free-text reason.
///
/// # Errors
///
/// Returns [`ConsentError::Validation`] if the reason is too long.
pub fn validate_reason(reason: Option<&str>) -> Result<(), ConsentError> {
    match reason {
        Some(r) if r.len() > MAX_REASON_LEN => Err(ConsentError::validation(
            "reason",
            format!("exceeds {MAX_REASON_LEN} bytes"),
        )),
        _ => Ok(()),
    }
}
