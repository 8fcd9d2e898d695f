//! End-to-end consent lifecycle tests.
//!
//! | Test | Property |
//! |------|----------|
//! | `grant_validate_revoke_validate` | grant allows, revoke denies with "no active consent" |
//! | `expiry_is_derived_from_time` | expired token denies with "consent expired" while still active in storage |
//! | `write_grant_does_not_confer_read` | access levels are not hierarchical |
//! | `cache_hit_skips_the_store` | repeat checks within the TTL do not query the store |
//! | `revoke_invalidates_cached_grant` | the next check after revoke is denied regardless of TTL |
//! | `revoke_is_idempotent` | a second revoke succeeds without a second audit entry |
//! | `expired_match_is_never_granted_from_cache` | a cached covering token past expiry is not matched |

mod common;

use std::time::Duration;

use chrono::TimeDelta;
use common::{harness, patient, perm};
use consentd_core::{
    AccessLevel, AuditEventType, DenialReason, Expiration, ResourceType,
};
use consentd_daemon::ledger::consent_fn;
use consentd_daemon::registry::RevocationStatus;
use consentd_daemon::validator::AccessRequest;

fn request(resource_type: ResourceType, access_level: AccessLevel) -> AccessRequest {
    AccessRequest::new("doc-1", "pat-1", resource_type, access_level).expect("valid request")
}

#[tokio::test]
async fn grant_validate_revoke_validate() {
    let h = harness();
    let receipt = h
        .grant(
            "pat-1",
            "doc-1",
            vec![perm(ResourceType::Diagnosis, AccessLevel::Read)],
            Expiration::Never,
        )
        .await;
    assert!(receipt.audit.is_recorded());

    let decision = h
        .service
        .validate_access(&request(ResourceType::Diagnosis, AccessLevel::Read))
        .await;
    assert!(decision.granted);
    assert_eq!(decision.matched_token_id.as_deref(), Some(receipt.token.token_id.as_str()));

    let result = h
        .service
        .revoke(&patient("pat-1"), &receipt.token.token_id, "patient-signature", None)
        .await
        .unwrap();
    assert!(result.revoked());

    let decision = h
        .service
        .validate_access(&request(ResourceType::Diagnosis, AccessLevel::Read))
        .await;
    assert!(!decision.granted);
    assert_eq!(decision.reason, "no active consent");

    assert_eq!(h.audit_count(AuditEventType::ConsentGranted).await, 1);
    assert_eq!(h.audit_count(AuditEventType::ConsentRevoked).await, 1);
    assert_eq!(h.audit_count(AuditEventType::AccessGranted).await, 1);
    assert_eq!(h.audit_count(AuditEventType::AccessDenied).await, 1);
}

#[tokio::test]
async fn expiry_is_derived_from_time() {
    let h = harness();
    let receipt = h
        .grant(
            "pat-1",
            "doc-1",
            vec![perm(ResourceType::Diagnosis, AccessLevel::Read)],
            Expiration::At(common::start_time() + TimeDelta::milliseconds(1)),
        )
        .await;

    h.clock.advance(Duration::from_millis(2));
    let decision = h
        .service
        .validate_access(&request(ResourceType::Diagnosis, AccessLevel::Read))
        .await;
    assert!(!decision.granted);
    assert_eq!(decision.reason, "consent expired");
    assert_eq!(decision.denial, Some(DenialReason::ConsentExpired));

    let stored = h.ledger.token(&receipt.token.token_id).unwrap();
    assert!(stored.is_active);
    assert!(stored.revoked_at.is_none());
}

#[tokio::test]
async fn write_grant_does_not_confer_read() {
    let h = harness();
    h.grant(
        "pat-1",
        "doc-1",
        vec![perm(ResourceType::Prescription, AccessLevel::Write)],
        Expiration::Never,
    )
    .await;

    let read = h
        .service
        .validate_access(&request(ResourceType::Prescription, AccessLevel::Read))
        .await;
    assert!(!read.granted);
    assert_eq!(read.denial, Some(DenialReason::AccessLevelNotCovered));

    let write = h
        .service
        .validate_access(&request(ResourceType::Prescription, AccessLevel::Write))
        .await;
    assert!(write.granted);
    // One cache entry serves both levels.
    assert_eq!(h.ledger.query_count(consent_fn::QUERY_ACTIVE), 1);
}

#[tokio::test]
async fn uncovered_resource_type_is_reported() {
    let h = harness();
    h.grant(
        "pat-1",
        "doc-1",
        vec![perm(ResourceType::Imaging, AccessLevel::Read)],
        Expiration::Never,
    )
    .await;
    let decision = h
        .service
        .validate_access(&request(ResourceType::LabResult, AccessLevel::Read))
        .await;
    assert_eq!(decision.denial, Some(DenialReason::ResourceTypeNotCovered));
}

#[tokio::test]
async fn cache_hit_skips_the_store() {
    let h = harness();
    h.grant(
        "pat-1",
        "doc-1",
        vec![perm(ResourceType::Diagnosis, AccessLevel::Read)],
        Expiration::Never,
    )
    .await;

    let req = request(ResourceType::Diagnosis, AccessLevel::Read);
    assert!(h.service.validate_access(&req).await.granted);
    h.clock.advance(Duration::from_secs(120));
    assert!(h.service.validate_access(&req).await.granted);
    assert_eq!(h.ledger.query_count(consent_fn::QUERY_ACTIVE), 1);
    assert_eq!(h.metrics.cache_lookups(true), 1);

    // Past the TTL the store is consulted again.
    h.clock.advance(Duration::from_secs(300));
    assert!(h.service.validate_access(&req).await.granted);
    assert_eq!(h.ledger.query_count(consent_fn::QUERY_ACTIVE), 2);
}

#[tokio::test]
async fn revoke_invalidates_cached_grant() {
    let h = harness();
    let receipt = h
        .grant(
            "pat-1",
            "doc-1",
            vec![
                perm(ResourceType::Diagnosis, AccessLevel::Read),
                perm(ResourceType::Imaging, AccessLevel::Read),
            ],
            Expiration::Never,
        )
        .await;

    for rt in [ResourceType::Diagnosis, ResourceType::Imaging] {
        assert!(h.service.validate_access(&request(rt, AccessLevel::Read)).await.granted);
    }
    assert_eq!(h.service.cache().len().await, 2);

    h.service
        .revoke(&patient("pat-1"), &receipt.token.token_id, "patient-signature", None)
        .await
        .unwrap();
    assert!(h.service.cache().is_empty().await);

    for rt in [ResourceType::Diagnosis, ResourceType::Imaging] {
        let decision = h.service.validate_access(&request(rt, AccessLevel::Read)).await;
        assert_eq!(decision.denial, Some(DenialReason::NoActiveConsent));
    }
}

#[tokio::test]
async fn grant_invalidates_cached_denial() {
    let h = harness();
    let req = request(ResourceType::Diagnosis, AccessLevel::Read);
    assert!(!h.service.validate_access(&req).await.granted);

    h.grant(
        "pat-1",
        "doc-1",
        vec![perm(ResourceType::Diagnosis, AccessLevel::Read)],
        Expiration::Never,
    )
    .await;
    assert!(h.service.validate_access(&req).await.granted);
}

#[tokio::test]
async fn revoke_is_idempotent() {
    let h = harness();
    let receipt = h
        .grant(
            "pat-1",
            "doc-1",
            vec![perm(ResourceType::LabResult, AccessLevel::Read)],
            Expiration::Never,
        )
        .await;
    let token_id = receipt.token.token_id;

    let first = h
        .service
        .revoke(&patient("pat-1"), &token_id, "patient-signature", Some("moved".into()))
        .await
        .unwrap();
    let second = h
        .service
        .revoke(&patient("pat-1"), &token_id, "patient-signature", None)
        .await
        .unwrap();

    assert!(matches!(first.status, RevocationStatus::Revoked { .. }));
    assert_eq!(second.status, RevocationStatus::AlreadyInactive);
    assert!(second.audit.is_none());
    assert_eq!(h.audit_count(AuditEventType::ConsentRevoked).await, 1);

    let stored = h.ledger.token(&token_id).unwrap();
    assert!(!stored.is_active);
    assert_eq!(stored.revocation_reason.as_deref(), Some("moved"));
}

#[tokio::test]
async fn expired_match_is_never_granted_from_cache() {
    let h = harness();
    let short = h
        .grant(
            "pat-1",
            "doc-1",
            vec![perm(ResourceType::Imaging, AccessLevel::Read)],
            Expiration::At(common::start_time() + TimeDelta::seconds(30)),
        )
        .await;
    let req = request(ResourceType::Imaging, AccessLevel::Read);
    let decision = h.service.validate_access(&req).await;
    assert_eq!(decision.matched_token_id.as_deref(), Some(short.token.token_id.as_str()));

    // Still inside the cache TTL, but past the token's expiry.
    h.clock.advance(Duration::from_secs(31));
    let decision = h.service.validate_access(&req).await;
    assert!(!decision.granted);
    assert!(decision.matched_token_id.is_none());
    assert_eq!(decision.denial, Some(DenialReason::ConsentExpired));
    assert_eq!(h.ledger.query_count(consent_fn::QUERY_ACTIVE), 1);
}

#[tokio::test]
async fn listings_reflect_lifecycle() {
    let h = harness();
    let first = h
        .grant(
            "pat-1",
            "doc-1",
            vec![perm(ResourceType::Imaging, AccessLevel::Read)],
            Expiration::Never,
        )
        .await;
    h.clock.advance(Duration::from_secs(1));
    h.grant(
        "pat-1",
        "doc-2",
        vec![perm(ResourceType::Imaging, AccessLevel::Write)],
        Expiration::Never,
    )
    .await;
    h.service
        .revoke(&patient("pat-1"), &first.token.token_id, "patient-signature", None)
        .await
        .unwrap();

    let tokens = h
        .service
        .patient_consents(&patient("pat-1"), "pat-1")
        .await
        .unwrap();
    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens[0].provider_id, "doc-2");
    assert!(tokens[1].is_revoked());
}
