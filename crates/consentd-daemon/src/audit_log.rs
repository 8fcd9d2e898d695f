//! Append-only audit log over the ledger's audit contract.
//!
//! The log assigns each entry its identity (`AUD-<uuid>`), a timestamp that is
//! strictly increasing per log instance, and a signature. Entries are
//! immutable once appended; there is no update or delete path.
//!
//! Callers choose between two append modes:
//!
//! - [`AuditLog::append`] surfaces failures as
//!   [`ConsentError::AuditWriteFailure`].
//! - [`AuditLog::append_best_effort`] is used after a primary operation has
//!   already succeeded. A failure is logged, counted and reported as
//!   [`AuditOutcome::Degraded`], never as an error.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use consentd_core::audit::{effective_limit, page_offset};
use consentd_core::signing::{Signer, audit_entry_message};
use consentd_core::{
    AuditEntry, AuditEntryInput, AuditFilter, AuditPage, AuditSlice, AuditStatistics, Clock,
    ConsentError, ConsentResult,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ledger::{AUDIT_CONTRACT, LedgerClient, audit_fn, submit_checked, with_timeout};
use crate::metrics::GateMetrics;

/// Prefix of every audit entry id.
pub const ENTRY_ID_PREFIX: &str = "AUD-";

/// What happened to the audit entry of an operation that itself succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The entry was appended.
    Recorded {
        /// The stored entry's id.
        entry_id: String,
    },
    /// The append failed; the operation still took effect.
    Degraded {
        /// Why the append failed.
        reason: String,
    },
}

impl AuditOutcome {
    /// Returns `true` if the entry was appended.
    #[must_use]
    pub const fn is_recorded(&self) -> bool {
        matches!(self, Self::Recorded { .. })
    }
}

/// Page-size bounds for audit queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    /// Size used when a query asks for `0`.
    pub default_limit: usize,
    /// Largest size a query may get.
    pub max_limit: usize,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default_limit: consentd_core::audit::DEFAULT_PAGE_LIMIT,
            max_limit: consentd_core::audit::MAX_PAGE_LIMIT,
        }
    }
}

impl From<&consentd_core::config::AuditConfig> for PageLimits {
    fn from(config: &consentd_core::config::AuditConfig) -> Self {
        Self {
            default_limit: config.default_page_limit,
            max_limit: config.max_page_limit,
        }
    }
}

/// The audit trail.
#[derive(Debug)]
pub struct AuditLog {
    ledger: Arc<dyn LedgerClient>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    limits: PageLimits,
    signer: Option<Arc<dyn Signer>>,
    metrics: Option<GateMetrics>,
    last_timestamp: Mutex<Option<DateTime<Utc>>>,
}

impl AuditLog {
    /// Creates a log writing to `ledger`.
    #[must_use]
    pub fn new(ledger: Arc<dyn LedgerClient>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            ledger,
            clock,
            timeout,
            limits: PageLimits::default(),
            signer: None,
            metrics: None,
            last_timestamp: Mutex::new(None),
        }
    }

    /// Sets the page-size bounds.
    #[must_use]
    pub const fn with_limits(mut self, limits: PageLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Signs entries that carry no actor signature with `signer`.
    #[must_use]
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Attaches metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: GateMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        let mut last = self
            .last_timestamp
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let timestamp = match *last {
            Some(prev) if now <= prev => prev + TimeDelta::microseconds(1),
            _ => now,
        };
        *last = Some(timestamp);
        timestamp
    }

    fn sign(&self, input: &AuditEntryInput, entry_id: &str, timestamp: DateTime<Utc>) -> String {
        if let Some(signature) = &input.actor_signature {
            return signature.clone();
        }
        self.signer.as_ref().map_or_else(String::new, |signer| {
            signer.sign(&audit_entry_message(
                entry_id,
                input.event_type.as_str(),
                &input.actor_id,
                input.subject_id.as_deref(),
                input.resource_id.as_deref(),
                timestamp,
                &input.details,
            ))
        })
    }

    /// Appends an entry.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::AuditWriteFailure`] if the ledger fails or
    /// rejects the append.
    pub async fn append(&self, input: AuditEntryInput) -> ConsentResult<AuditEntry> {
        let entry_id = format!("{ENTRY_ID_PREFIX}{}", Uuid::new_v4());
        let timestamp = self.next_timestamp();
        let signature = self.sign(&input, &entry_id, timestamp);
        let entry = AuditEntry::from_input(input, entry_id, timestamp, signature);
        let event_type = entry.event_type.as_str();

        let payload = serde_json::to_string(&entry)
            .map_err(|e| ConsentError::audit_write_failure(event_type, e.to_string()))?;
        submit_checked(
            self.ledger.as_ref(),
            self.timeout,
            AUDIT_CONTRACT,
            audit_fn::APPEND,
            vec![payload],
        )
        .await
        .map_err(|e| ConsentError::audit_write_failure(event_type, e.to_string()))?;

        debug!(
            entry_id = %entry.entry_id,
            event_type,
            actor_id = %entry.actor_id,
            "audit entry appended"
        );
        Ok(entry)
    }

    /// Appends an entry after the operation it describes already happened.
    pub async fn append_best_effort(&self, input: AuditEntryInput) -> AuditOutcome {
        let event_type = input.event_type;
        match self.append(input).await {
            Ok(entry) => AuditOutcome::Recorded {
                entry_id: entry.entry_id,
            },
            Err(err) => {
                warn!(event_type = %event_type, error = %err, "audit write degraded");
                if let Some(metrics) = &self.metrics {
                    metrics.audit_write_failed(event_type.as_str());
                }
                AuditOutcome::Degraded {
                    reason: err.to_string(),
                }
            },
        }
    }

    async fn query_ledger<T: DeserializeOwned>(
        &self,
        function: &'static str,
        args: Vec<String>,
    ) -> ConsentResult<T> {
        let response = with_timeout(
            function,
            self.timeout,
            self.ledger.query(AUDIT_CONTRACT, function, args),
        )
        .await
        .map_err(|e| ConsentError::store_unavailable("audit_query", e.to_string()))?;
        serde_json::from_str(&response.result)
            .map_err(|e| ConsentError::store_unavailable("audit_query", e.to_string()))
    }

    fn filter_json(filter: &AuditFilter) -> ConsentResult<String> {
        filter.validate()?;
        serde_json::to_string(filter).map_err(|e| ConsentError::validation("filter", e.to_string()))
    }

    /// Returns one page of entries matching `filter`.
    ///
    /// `page` is 1-based; a `limit` of `0` selects the default page size and
    /// larger limits are clamped to the maximum. Only the requested window is
    /// read from the ledger.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Validation`] for an inverted time range and
    /// [`ConsentError::StoreUnavailable`] if the ledger query fails.
    pub async fn query(
        &self,
        filter: &AuditFilter,
        page: usize,
        limit: usize,
    ) -> ConsentResult<AuditPage> {
        let limit = effective_limit(limit, self.limits.default_limit, self.limits.max_limit);
        let page = page.max(1);
        let args = vec![
            Self::filter_json(filter)?,
            page_offset(page, limit).to_string(),
            limit.to_string(),
        ];
        let slice: AuditSlice = self.query_ledger(audit_fn::QUERY, args).await?;
        Ok(slice.into_page(page, limit))
    }

    /// Aggregates the entries in `[from, to)`.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Validation`] for an inverted time range and
    /// [`ConsentError::StoreUnavailable`] if the ledger query fails.
    pub async fn statistics(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> ConsentResult<AuditStatistics> {
        let filter = AuditFilter {
            from,
            to,
            ..AuditFilter::default()
        };
        let mut entries: Vec<AuditEntry> = self
            .query_ledger(audit_fn::SCAN, vec![Self::filter_json(&filter)?])
            .await?;
        entries.retain(|entry| filter.matches(entry));
        let mut stats = AuditStatistics::for_window(from, to);
        for entry in &entries {
            stats.record(entry);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use consentd_core::{AuditDetails, AuditEventType, ManualClock, Order};

    use super::*;
    use crate::ledger::InMemoryLedger;

    #[derive(Debug)]
    struct TagSigner;

    impl Signer for TagSigner {
        fn sign(&self, message: &[u8]) -> String {
            format!("node:{}", message.len())
        }
    }

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn log() -> (Arc<InMemoryLedger>, Arc<ManualClock>, AuditLog) {
        let ledger = Arc::new(InMemoryLedger::new());
        let clock = Arc::new(ManualClock::new(start()));
        let log = AuditLog::new(ledger.clone(), clock.clone(), Duration::from_secs(1));
        (ledger, clock, log)
    }

    fn revoked(actor: &str, token: &str) -> AuditEntryInput {
        AuditEntryInput::new(
            AuditEventType::ConsentRevoked,
            actor,
            AuditDetails::ConsentRevoked {
                token_id: token.to_string(),
                provider_id: "doc-1".to_string(),
                reason: None,
            },
        )
        .with_subject(actor)
        .with_resource(token)
    }

    #[tokio::test]
    async fn append_assigns_id_and_strictly_increasing_timestamps() {
        let (ledger, _, log) = log();
        let first = log.append(revoked("pat-1", "tok-1")).await.unwrap();
        let second = log.append(revoked("pat-1", "tok-2")).await.unwrap();
        assert!(first.entry_id.starts_with(ENTRY_ID_PREFIX));
        assert_ne!(first.entry_id, second.entry_id);
        assert!(second.timestamp > first.timestamp);
        assert_eq!(ledger.audit_len(), 2);
    }

    #[tokio::test]
    async fn actor_signature_wins_over_node_signer() {
        let (_, _, log) = log();
        let log = log.with_signer(Arc::new(TagSigner));
        let node_signed = log.append(revoked("pat-1", "tok-1")).await.unwrap();
        assert!(node_signed.signature.starts_with("node:"));
        let actor_signed = log
            .append(revoked("pat-1", "tok-2").with_actor_signature("patient-sig"))
            .await
            .unwrap();
        assert_eq!(actor_signed.signature, "patient-sig");
    }

    #[tokio::test]
    async fn failed_append_surfaces_or_degrades() {
        let (ledger, _, log) = log();
        let metrics = GateMetrics::standalone().unwrap();
        let log = log.with_metrics(metrics.clone());
        ledger.fail_submits(true);

        let err = log.append(revoked("pat-1", "tok-1")).await.unwrap_err();
        assert!(matches!(err, ConsentError::AuditWriteFailure { .. }));

        let outcome = log.append_best_effort(revoked("pat-1", "tok-1")).await;
        assert!(!outcome.is_recorded());
        assert_eq!(metrics.audit_write_failures("CONSENT_REVOKED"), 1);
    }

    #[tokio::test]
    async fn query_filters_orders_and_pages() {
        let (_, clock, log) = log();
        for (actor, token) in [("pat-1", "tok-1"), ("pat-2", "tok-2"), ("pat-1", "tok-3")] {
            log.append(revoked(actor, token)).await.unwrap();
            clock.advance(Duration::from_secs(1));
        }

        let filter = AuditFilter::default().actor("pat-1");
        let page = log.query(&filter, 1, 1).await.unwrap();
        assert_eq!(page.total, 2);
        assert!(page.has_more);
        assert_eq!(page.entries[0].resource_id.as_deref(), Some("tok-3"));

        let oldest = AuditFilter {
            order: Order::OldestFirst,
            ..filter
        };
        let page = log.query(&oldest, 1, 0).await.unwrap();
        assert_eq!(page.limit, consentd_core::audit::DEFAULT_PAGE_LIMIT);
        assert_eq!(page.entries[0].resource_id.as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn inverted_range_is_rejected() {
        let (_, _, log) = log();
        let filter = AuditFilter::default().between(start(), start() - TimeDelta::hours(1));
        let err = log.query(&filter, 1, 10).await.unwrap_err();
        assert!(matches!(err, ConsentError::Validation { .. }));
    }

    #[tokio::test]
    async fn statistics_count_the_window() {
        let (_, clock, log) = log();
        log.append(revoked("pat-1", "tok-1")).await.unwrap();
        clock.advance(Duration::from_secs(3600));
        log.append(revoked("pat-2", "tok-2")).await.unwrap();

        let all = log.statistics(None, None).await.unwrap();
        assert_eq!(all.total, 2);
        assert_eq!(all.count(AuditEventType::ConsentRevoked), 2);
        assert_eq!(all.by_actor.get("pat-1"), Some(&1));

        let first_hour = log
            .statistics(Some(start()), Some(start() + TimeDelta::minutes(30)))
            .await
            .unwrap();
        assert_eq!(first_hour.total, 1);
    }
}
