//! Audit entry modelling: event types, payload schemas, filters, pages and
//! statistics.
//!
//! Entries are append-only. An [`AuditEntryInput`] describes what happened;
//! the audit log turns it into an [`AuditEntry`] by assigning `entry_id`,
//! `timestamp` and `signature`. Nothing here ever mutates a written entry.
//!
//! # Payload schema
//!
//! `details` is an [`AuditDetails`] value serialized with a `kind` tag:
//!
//! | `kind` | Event types | Fields |
//! |---|---|---|
//! | `consent_granted` | `CONSENT_GRANTED` | `token_id`, `provider_id`, `permissions`, `expiration` |
//! | `consent_revoked` | `CONSENT_REVOKED` | `token_id`, `provider_id`, `reason` |
//! | `access_decision` | `ACCESS_GRANTED`, `ACCESS_DENIED` | `provider_id`, `resource_type`, `access_level`, `matched_token_id`, `reason`, `source` |
//! | `record_accessed` | `RECORD_ACCESSED` | `record_id`, `resource_type`, `access_level`, `matched_token_id` |

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::decision::DenialReason;
use crate::error::ConsentError;
use crate::permission::{AccessLevel, Permission, ResourceType};
use crate::token::Expiration;

/// Hard upper bound on audit query page size.
pub const MAX_PAGE_LIMIT: usize = 1_000;

/// Page size used when a caller does not specify one.
pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// Kinds of audited events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum AuditEventType {
    /// A patient granted consent.
    ConsentGranted,
    /// A patient revoked consent.
    ConsentRevoked,
    /// An access check was granted.
    AccessGranted,
    /// An access check was denied.
    AccessDenied,
    /// A record was read or written after a granted check.
    RecordAccessed,
}

impl AuditEventType {
    /// Every event type.
    pub const ALL: [Self; 5] = [
        Self::ConsentGranted,
        Self::ConsentRevoked,
        Self::AccessGranted,
        Self::AccessDenied,
        Self::RecordAccessed,
    ];

    /// Returns the wire name of this event type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConsentGranted => "CONSENT_GRANTED",
            Self::ConsentRevoked => "CONSENT_REVOKED",
            Self::AccessGranted => "ACCESS_GRANTED",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::RecordAccessed => "RECORD_ACCESSED",
        }
    }

    /// Parses an event type from its wire name.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Validation`] for unknown names.
    pub fn parse(s: &str) -> Result<Self, ConsentError> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                ConsentError::validation("event_type", format!("unrecognized event type: {s}"))
            })
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an access decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// The requester created the record.
    Creator,
    /// Served from the decision cache.
    Cache,
    /// Computed from a fresh store query.
    Store,
    /// The store could not be consulted.
    FailClosed,
}

/// Event payload, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditDetails {
    /// Payload of `CONSENT_GRANTED`.
    ConsentGranted {
        /// The new token.
        token_id: String,
        /// The receiving provider.
        provider_id: String,
        /// The granted permissions, in grant order.
        permissions: Vec<Permission>,
        /// The token's expiration.
        expiration: Expiration,
    },
    /// Payload of `CONSENT_REVOKED`.
    ConsentRevoked {
        /// The revoked token.
        token_id: String,
        /// The provider that lost access.
        provider_id: String,
        /// Free-text reason, if supplied.
        reason: Option<String>,
    },
    /// Payload of `ACCESS_GRANTED` and `ACCESS_DENIED`.
    AccessDecision {
        /// The requesting provider.
        provider_id: String,
        /// Requested record category.
        resource_type: ResourceType,
        /// Requested level.
        access_level: AccessLevel,
        /// Token that authorized access, if any.
        matched_token_id: Option<String>,
        /// Human-readable justification.
        reason: String,
        /// Structured denial reason, if denied.
        denial: Option<DenialReason>,
        /// Where the decision came from.
        source: DecisionSource,
    },
    /// Payload of `RECORD_ACCESSED`.
    RecordAccessed {
        /// The record that was accessed.
        record_id: String,
        /// Its category.
        resource_type: ResourceType,
        /// The level exercised.
        access_level: AccessLevel,
        /// Token that authorized access, if any.
        matched_token_id: Option<String>,
    },
}

/// An audit event before the log assigns identity and time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntryInput {
    /// What happened.
    pub event_type: AuditEventType,
    /// Who triggered it.
    pub actor_id: String,
    /// Whose data is implicated.
    pub subject_id: Option<String>,
    /// Token or record the event concerns.
    pub resource_id: Option<String>,
    /// Structured payload.
    pub details: AuditDetails,
    /// Actor-supplied signature, if the actor signed the triggering request.
    pub actor_signature: Option<String>,
}

impl AuditEntryInput {
    /// Creates an input with no subject, resource or signature.
    #[must_use]
    pub fn new(
        event_type: AuditEventType,
        actor_id: impl Into<String>,
        details: AuditDetails,
    ) -> Self {
        Self {
            event_type,
            actor_id: actor_id.into(),
            subject_id: None,
            resource_id: None,
            details,
            actor_signature: None,
        }
    }

    /// Sets the implicated patient.
    #[must_use]
    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    /// Sets the token or record identifier.
    #[must_use]
    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Attaches the actor's signature.
    #[must_use]
    pub fn with_actor_signature(mut self, signature: impl Into<String>) -> Self {
        self.actor_signature = Some(signature.into());
        self
    }
}

/// A written, immutable audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditEntry {
    /// Unique identifier assigned at write time.
    pub entry_id: String,
    /// What happened.
    pub event_type: AuditEventType,
    /// Who triggered it.
    pub actor_id: String,
    /// Whose data is implicated.
    pub subject_id: Option<String>,
    /// Token or record the event concerns.
    pub resource_id: Option<String>,
    /// Structured payload.
    pub details: AuditDetails,
    /// Write time.
    pub timestamp: DateTime<Utc>,
    /// Opaque proof binding the entry to its actor. Empty when neither the
    /// actor nor the node signed.
    pub signature: String,
}

impl AuditEntry {
    /// Builds the stored entry from its input.
    #[must_use]
    pub fn from_input(
        input: AuditEntryInput,
        entry_id: String,
        timestamp: DateTime<Utc>,
        signature: String,
    ) -> Self {
        Self {
            entry_id,
            event_type: input.event_type,
            actor_id: input.actor_id,
            subject_id: input.subject_id,
            resource_id: input.resource_id,
            details: input.details,
            timestamp,
            signature,
        }
    }

    /// Returns the denial reason carried in the payload, if any.
    #[must_use]
    pub const fn denial_reason(&self) -> Option<DenialReason> {
        match &self.details {
            AuditDetails::AccessDecision { denial, .. } => *denial,
            _ => None,
        }
    }
}

/// Result ordering for audit queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    /// Most recent first.
    #[default]
    NewestFirst,
    /// Oldest first.
    OldestFirst,
}

/// Audit query filters. Every set field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditFilter {
    /// Restrict to one event type.
    pub event_type: Option<AuditEventType>,
    /// Restrict to one actor.
    pub actor_id: Option<String>,
    /// Restrict to one patient.
    pub subject_id: Option<String>,
    /// Restrict to one token or record.
    pub resource_id: Option<String>,
    /// Inclusive lower bound on `timestamp`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `timestamp`.
    pub to: Option<DateTime<Utc>>,
    /// Result ordering.
    pub order: Order,
}

impl AuditFilter {
    /// Restricts to `event_type`.
    #[must_use]
    pub const fn event_type(mut self, event_type: AuditEventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    /// Restricts to `actor_id`.
    #[must_use]
    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Restricts to `subject_id`.
    #[must_use]
    pub fn subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    /// Restricts to `resource_id`.
    #[must_use]
    pub fn resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Restricts to `[from, to)`.
    #[must_use]
    pub const fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    /// Returns `true` if `entry` satisfies every set field.
    #[must_use]
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.event_type.is_none_or(|t| t == entry.event_type)
            && self.actor_id.as_deref().is_none_or(|a| a == entry.actor_id)
            && self
                .subject_id
                .as_deref()
                .is_none_or(|s| entry.subject_id.as_deref() == Some(s))
            && self
                .resource_id
                .as_deref()
                .is_none_or(|r| entry.resource_id.as_deref() == Some(r))
            && self.from.is_none_or(|from| entry.timestamp >= from)
            && self.to.is_none_or(|to| entry.timestamp < to)
    }

    /// Checks that the time range is well formed.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Validation`] if `from` is after `to`.
    pub fn validate(&self) -> Result<(), ConsentError> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(ConsentError::validation(
                    "time_range",
                    "`from` must not be after `to`",
                ));
            }
        }
        Ok(())
    }
}

/// One page of audit query results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditPage {
    /// The entries on this page.
    pub entries: Vec<AuditEntry>,
    /// 1-based page number.
    pub page: usize,
    /// Effective page size after clamping.
    pub limit: usize,
    /// Number of entries matching the filter across all pages.
    pub total: usize,
    /// Whether a further page exists.
    pub has_more: bool,
}

/// Resolves a requested page size against the configured bounds.
///
/// `0` selects `default_limit`; anything above `max_limit` is clamped.
#[must_use]
pub fn effective_limit(requested: usize, default_limit: usize, max_limit: usize) -> usize {
    let max_limit = max_limit.clamp(1, MAX_PAGE_LIMIT);
    let limit = if requested == 0 { default_limit } else { requested };
    limit.clamp(1, max_limit)
}

/// Compares two entries in `order`, breaking timestamp ties by entry id.
#[must_use]
pub fn compare_entries(order: Order, a: &AuditEntry, b: &AuditEntry) -> std::cmp::Ordering {
    let oldest_first = a
        .timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.entry_id.cmp(&b.entry_id));
    match order {
        Order::NewestFirst => oldest_first.reverse(),
        Order::OldestFirst => oldest_first,
    }
}

/// Number of entries preceding 1-based `page`; `0` is treated as `1`.
#[must_use]
pub const fn page_offset(page: usize, limit: usize) -> usize {
    let page = if page == 0 { 0 } else { page - 1 };
    page.saturating_mul(limit)
}

/// A window of ordered matches as returned by the audit contract, with the
/// number of matches across all windows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSlice {
    /// Matches in the requested window.
    pub entries: Vec<AuditEntry>,
    /// Matches across all windows.
    pub total: usize,
}

impl AuditSlice {
    /// Wraps the slice as page `page` of size `limit`.
    #[must_use]
    pub fn into_page(self, page: usize, limit: usize) -> AuditPage {
        let page = page.max(1);
        let end = page_offset(page, limit).saturating_add(self.entries.len());
        AuditPage {
            entries: self.entries,
            page,
            limit,
            total: self.total,
            has_more: end < self.total,
        }
    }
}

/// Sorts matching entries and cuts out one page.
///
/// `page` is 1-based; `0` is treated as `1`.
#[must_use]
pub fn paginate(
    mut entries: Vec<AuditEntry>,
    order: Order,
    page: usize,
    limit: usize,
) -> AuditPage {
    entries.sort_by(|a, b| compare_entries(order, a, b));
    let total = entries.len();
    let start = page_offset(page, limit).min(total);
    let end = start.saturating_add(limit).min(total);
    let entries: Vec<AuditEntry> = entries.drain(start..end).collect();
    AuditSlice { entries, total }.into_page(page, limit)
}

/// Aggregate counts over a time window, derived from query results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStatistics {
    /// Inclusive window start.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive window end.
    pub to: Option<DateTime<Utc>>,
    /// Entries in the window.
    pub total: u64,
    /// Counts per event type.
    pub by_event_type: BTreeMap<AuditEventType, u64>,
    /// Counts per actor.
    pub by_actor: BTreeMap<String, u64>,
    /// Counts per UTC calendar day.
    pub by_day: BTreeMap<NaiveDate, u64>,
    /// Counts per denial reason, over `ACCESS_DENIED` entries.
    pub denial_reasons: BTreeMap<String, u64>,
}

impl AuditStatistics {
    /// Creates empty statistics for a window.
    #[must_use]
    pub fn for_window(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        Self {
            from,
            to,
            ..Self::default()
        }
    }

    /// Counts one entry.
    pub fn record(&mut self, entry: &AuditEntry) {
        self.total += 1;
        *self.by_event_type.entry(entry.event_type).or_default() += 1;
        *self.by_actor.entry(entry.actor_id.clone()).or_default() += 1;
        *self.by_day.entry(entry.timestamp.date_naive()).or_default() += 1;
        if let Some(reason) = entry.denial_reason() {
            *self
                .denial_reasons
                .entry(reason.as_str().to_string())
                .or_default() += 1;
        }
    }

    /// Returns the count for one event type.
    #[must_use]
    pub fn count(&self, event_type: AuditEventType) -> u64 {
        self.by_event_type.get(&event_type).copied().unwrap_or(0)
    }
}
