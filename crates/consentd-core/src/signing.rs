//! Signing contract with the external signer/verifier.
//!
//! This crate never implements a signature algorithm. It decides which
//! operations need a signature check and what bytes are signed:
//!
//! | Operation | Signer | Message |
//! |---|---|---|
//! | grant | patient | [`grant_message`] |
//! | revoke | patient | [`revoke_message`] |
//! | bulk revoke | patient | [`bulk_revoke_message`] |
//! | audit append | node (optional) | [`audit_entry_message`] |
//!
//! Messages are compact JSON with a `domain` tag so a signature produced for
//! one operation can never be replayed as another.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::permission::Permission;
use crate::token::Expiration;

/// Domain tag for grant messages.
pub const GRANT_DOMAIN: &str = "consentd.grant.v1";

/// Domain tag for revoke messages.
pub const REVOKE_DOMAIN: &str = "consentd.revoke.v1";

/// Domain tag for bulk revoke messages.
pub const BULK_REVOKE_DOMAIN: &str = "consentd.bulk-revoke.v1";

/// Domain tag for audit entry messages.
pub const AUDIT_DOMAIN: &str = "consentd.audit.v1";

/// Verifies signatures produced by principals.
pub trait SignatureVerifier: Send + Sync + fmt::Debug {
    /// Returns `true` if `signature` is valid for `message` under `public_key`.
    fn verify(&self, signature: &str, message: &[u8], public_key: &str) -> bool;
}

/// Resolves a principal's registered public key.
pub trait KeyDirectory: Send + Sync + fmt::Debug {
    /// Returns the public key for `principal_id`, if one is registered.
    fn public_key(&self, principal_id: &str) -> Option<String>;
}

/// Produces node signatures over audit entries.
pub trait Signer: Send + Sync + fmt::Debug {
    /// Signs `message`, returning an opaque signature string.
    fn sign(&self, message: &[u8]) -> String;
}

#[derive(Serialize)]
struct GrantMessage<'a> {
    domain: &'static str,
    patient_id: &'a str,
    provider_id: &'a str,
    permissions: &'a [Permission],
    expiration: &'a Expiration,
}

#[derive(Serialize)]
struct RevokeMessage<'a> {
    domain: &'static str,
    token_id: &'a str,
    patient_id: &'a str,
}

#[derive(Serialize)]
struct BulkRevokeMessage<'a> {
    domain: &'static str,
    token_ids: &'a [String],
    patient_id: &'a str,
}

#[derive(Serialize)]
struct AuditMessage<'a, D: Serialize> {
    domain: &'static str,
    entry_id: &'a str,
    event_type: &'a str,
    actor_id: &'a str,
    subject_id: Option<&'a str>,
    resource_id: Option<&'a str>,
    timestamp: DateTime<Utc>,
    details: &'a D,
}

fn to_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    // Struct-of-primitives serialization cannot fail.
    serde_json::to_vec(value).unwrap_or_default()
}

/// Bytes a patient signs to grant consent.
#[must_use]
pub fn grant_message(
    patient_id: &str,
    provider_id: &str,
    permissions: &[Permission],
    expiration: &Expiration,
) -> Vec<u8> {
    to_bytes(&GrantMessage {
        domain: GRANT_DOMAIN,
        patient_id,
        provider_id,
        permissions,
        expiration,
    })
}

/// Bytes a patient signs to revoke a token.
#[must_use]
pub fn revoke_message(token_id: &str, patient_id: &str) -> Vec<u8> {
    to_bytes(&RevokeMessage {
        domain: REVOKE_DOMAIN,
        token_id,
        patient_id,
    })
}

/// Bytes a patient signs to revoke several tokens at once.
#[must_use]
pub fn bulk_revoke_message(token_ids: &[String], patient_id: &str) -> Vec<u8> {
    to_bytes(&BulkRevokeMessage {
        domain: BULK_REVOKE_DOMAIN,
        token_ids,
        patient_id,
    })
}

/// Bytes the node signs for an audit entry.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn audit_entry_message<D: Serialize>(
    entry_id: &str,
    event_type: &str,
    actor_id: &str,
    subject_id: Option<&str>,
    resource_id: Option<&str>,
    timestamp: DateTime<Utc>,
    details: &D,
) -> Vec<u8> {
    to_bytes(&AuditMessage {
        domain: AUDIT_DOMAIN,
        entry_id,
        event_type,
        actor_id,
        subject_id,
        resource_id,
        timestamp,
        details,
    })
}
