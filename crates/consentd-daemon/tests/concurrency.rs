//! Concurrency, bulk revoke and signature verification tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{harness, harness_with, patient, perm};
use consentd_core::signing::{KeyDirectory, SignatureVerifier, grant_message, revoke_message};
use consentd_core::{
    AccessLevel, AuditEventType, ErrorKind, Expiration, GateConfig, ManualClock, ResourceType,
};
use consentd_daemon::ledger::InMemoryLedger;
use consentd_daemon::registry::RevocationStatus;
use consentd_daemon::service::ConsentService;
use consentd_daemon::validator::AccessRequest;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_revokes_emit_one_audit_entry() {
    let h = harness();
    let receipt = h
        .grant(
            "pat-1",
            "doc-1",
            vec![perm(ResourceType::Diagnosis, AccessLevel::Read)],
            Expiration::Never,
        )
        .await;
    let token_id = receipt.token.token_id;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let service = Arc::clone(&h.service);
        let token_id = token_id.clone();
        tasks.push(tokio::spawn(async move {
            service
                .revoke(&patient("pat-1"), &token_id, "patient-signature", None)
                .await
        }));
    }

    let mut revoked = 0;
    for task in tasks {
        let result = task.await.unwrap().unwrap();
        match result.status {
            RevocationStatus::Revoked { .. } => revoked += 1,
            RevocationStatus::AlreadyInactive => assert!(result.audit.is_none()),
        }
    }
    assert_eq!(revoked, 1);
    assert_eq!(h.audit_count(AuditEventType::ConsentRevoked).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_grant_observed_after_revoke_returns() {
    let h = harness();
    let receipt = h
        .grant(
            "pat-1",
            "doc-1",
            vec![perm(ResourceType::Diagnosis, AccessLevel::Read)],
            Expiration::Never,
        )
        .await;
    let req =
        AccessRequest::new("doc-1", "pat-1", ResourceType::Diagnosis, AccessLevel::Read).unwrap();

    let mut checkers = Vec::new();
    for _ in 0..4 {
        let service = Arc::clone(&h.service);
        let req = req.clone();
        checkers.push(tokio::spawn(async move {
            for _ in 0..25 {
                service.validate_access(&req).await;
                tokio::task::yield_now().await;
            }
        }));
    }

    h.service
        .revoke(&patient("pat-1"), &receipt.token.token_id, "patient-signature", None)
        .await
        .unwrap();
    for _ in 0..10 {
        assert!(!h.service.validate_access(&req).await.granted);
    }
    for checker in checkers {
        checker.await.unwrap();
    }
    assert!(!h.service.validate_access(&req).await.granted);
}

#[tokio::test]
async fn bulk_revoke_reports_partial_success() {
    let h = harness();
    let own_a = h
        .grant(
            "pat-1",
            "doc-1",
            vec![perm(ResourceType::Imaging, AccessLevel::Read)],
            Expiration::Never,
        )
        .await;
    let own_b = h
        .grant(
            "pat-1",
            "doc-2",
            vec![perm(ResourceType::Imaging, AccessLevel::Read)],
            Expiration::Never,
        )
        .await;
    let foreign = h
        .grant(
            "pat-2",
            "doc-1",
            vec![perm(ResourceType::Imaging, AccessLevel::Read)],
            Expiration::Never,
        )
        .await;

    let ids = vec![
        own_a.token.token_id.clone(),
        foreign.token.token_id.clone(),
        "CONSENT-missing".to_string(),
        own_b.token.token_id.clone(),
        own_a.token.token_id.clone(),
    ];
    let items = h
        .service
        .bulk_revoke(&patient("pat-1"), ids, "patient-signature", Some("closing account".into()))
        .await
        .unwrap();

    assert_eq!(items.len(), 4);
    assert!(items[0].result.as_ref().unwrap().revoked());
    assert_eq!(
        items[1].result.as_ref().unwrap_err().kind(),
        ErrorKind::Authorization
    );
    assert_eq!(items[2].result.as_ref().unwrap_err().kind(), ErrorKind::NotFound);
    assert!(items[3].result.as_ref().unwrap().revoked());

    assert!(h.ledger.token(&foreign.token.token_id).unwrap().is_active);
    assert_eq!(h.audit_count(AuditEventType::ConsentRevoked).await, 2);
}

#[tokio::test]
async fn bulk_revoke_isolates_store_write_failures() {
    let h = harness();
    let mut ids = Vec::new();
    for provider_id in ["doc-1", "doc-2", "doc-3"] {
        let receipt = h
            .grant(
                "pat-1",
                provider_id,
                vec![perm(ResourceType::LabResult, AccessLevel::Read)],
                Expiration::Never,
            )
            .await;
        ids.push(receipt.token.token_id);
    }

    h.ledger.fail_token_writes(&ids[1], true);
    let items = h
        .service
        .bulk_revoke(&patient("pat-1"), ids.clone(), "patient-signature", None)
        .await
        .unwrap();
    h.ledger.fail_token_writes(&ids[1], false);

    assert_eq!(items.len(), 3);
    assert!(items[0].result.as_ref().unwrap().revoked());
    assert_eq!(
        items[1].result.as_ref().unwrap_err().kind(),
        ErrorKind::StoreUnavailable
    );
    assert!(items[2].result.as_ref().unwrap().revoked());

    assert!(!h.ledger.token(&ids[0]).unwrap().is_active);
    assert!(h.ledger.token(&ids[1]).unwrap().is_active);
    assert!(!h.ledger.token(&ids[2]).unwrap().is_active);
    assert_eq!(h.audit_count(AuditEventType::ConsentRevoked).await, 2);

    let req =
        AccessRequest::new("doc-2", "pat-1", ResourceType::LabResult, AccessLevel::Read).unwrap();
    assert!(h.service.validate_access(&req).await.granted);
}

// =============================================================================
// Signature verification
// =============================================================================

/// Accepts a signature iff it is `<public key>|<message>`.
#[derive(Debug)]
struct EchoVerifier;

impl SignatureVerifier for EchoVerifier {
    fn verify(&self, signature: &str, message: &[u8], public_key: &str) -> bool {
        signature == echo_sign(public_key, message)
    }
}

fn echo_sign(public_key: &str, message: &[u8]) -> String {
    format!("{public_key}|{}", String::from_utf8_lossy(message))
}

#[derive(Debug)]
struct StaticKeys;

impl KeyDirectory for StaticKeys {
    fn public_key(&self, principal_id: &str) -> Option<String> {
        principal_id.starts_with("pat-").then(|| format!("pk-{principal_id}"))
    }
}

fn verifying_service() -> ConsentService {
    let mut config = GateConfig::default();
    config.signatures.verify = true;
    ConsentService::builder(Arc::new(InMemoryLedger::new()))
        .config(config)
        .clock(Arc::new(ManualClock::new(common::start_time())))
        .verifier(Arc::new(EchoVerifier), Arc::new(StaticKeys))
        .build()
        .unwrap()
}

#[tokio::test]
async fn signatures_bind_the_operation() {
    let service = verifying_service();
    let permissions = vec![perm(ResourceType::ConsultationNote, AccessLevel::Write)];
    let grant_sig = echo_sign(
        "pk-pat-1",
        &grant_message("pat-1", "doc-1", &permissions, &Expiration::Never),
    );

    let err = service
        .grant(&patient("pat-1"), "doc-1", permissions.clone(), Expiration::Never, "forged")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);

    let receipt = service
        .grant(&patient("pat-1"), "doc-1", permissions, Expiration::Never, &grant_sig)
        .await
        .unwrap();
    let token_id = receipt.token.token_id;

    // A grant signature cannot be replayed as a revoke.
    let err = service
        .revoke(&patient("pat-1"), &token_id, &grant_sig, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);

    let revoke_sig = echo_sign("pk-pat-1", &revoke_message(&token_id, "pat-1"));
    let result = service
        .revoke(&patient("pat-1"), &token_id, &revoke_sig, None)
        .await
        .unwrap();
    assert!(result.revoked());
}

#[tokio::test(start_paused = true)]
async fn service_sweeper_reclaims_expired_entries() {
    let mut config = GateConfig::default();
    config.cache.ttl_secs = 5;
    config.cache.sweep_interval_secs = 10;
    let h = harness_with(config);
    h.service.start().await;

    let req =
        AccessRequest::new("doc-1", "pat-1", ResourceType::Imaging, AccessLevel::Read).unwrap();
    h.service.validate_access(&req).await;
    assert_eq!(h.service.cache().len().await, 1);

    h.clock.advance(Duration::from_secs(6));
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(h.service.cache().is_empty().await);

    h.service.shutdown().await;
    assert!(!h.service.is_running().await);
}
