//! Shared fixtures for consent gate integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use consentd_core::{
    AccessLevel, AuditEventType, AuditFilter, Expiration, GateConfig, ManualClock, Permission,
    ResourceType,
};
use consentd_daemon::ledger::InMemoryLedger;
use consentd_daemon::metrics::GateMetrics;
use consentd_daemon::registry::GrantReceipt;
use consentd_daemon::service::{ConsentService, Principal, Role};

/// Test start instant: 2026-03-01 12:00:00 UTC.
pub fn start_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

pub struct Harness {
    pub ledger: Arc<InMemoryLedger>,
    pub clock: Arc<ManualClock>,
    pub metrics: GateMetrics,
    pub service: Arc<ConsentService>,
}

pub fn harness() -> Harness {
    harness_with(GateConfig::default())
}

pub fn harness_with(config: GateConfig) -> Harness {
    let ledger = Arc::new(InMemoryLedger::new());
    let clock = Arc::new(ManualClock::new(start_time()));
    let metrics = GateMetrics::standalone().expect("metrics register");
    let service = ConsentService::builder(ledger.clone())
        .config(config)
        .clock(clock.clone())
        .metrics(metrics.clone())
        .build()
        .expect("service builds");
    Harness {
        ledger,
        clock,
        metrics,
        service: Arc::new(service),
    }
}

pub fn patient(id: &str) -> Principal {
    Principal::new(id, Role::Patient)
}

pub fn provider(id: &str) -> Principal {
    Principal::new(id, Role::Provider)
}

pub fn auditor() -> Principal {
    Principal::new("aud-1", Role::Auditor)
}

pub fn perm(resource_type: ResourceType, access_level: AccessLevel) -> Permission {
    Permission::new(resource_type, access_level)
}

impl Harness {
    pub async fn grant(
        &self,
        patient_id: &str,
        provider_id: &str,
        permissions: Vec<Permission>,
        expiration: Expiration,
    ) -> GrantReceipt {
        self.service
            .grant(&patient(patient_id), provider_id, permissions, expiration, "patient-signature")
            .await
            .expect("grant succeeds")
    }

    /// Number of stored audit entries of one type.
    pub async fn audit_count(&self, event_type: AuditEventType) -> usize {
        self.service
            .query_audit(&auditor(), &AuditFilter::default().event_type(event_type), 1, 1)
            .await
            .expect("audit query succeeds")
            .total
    }
}
