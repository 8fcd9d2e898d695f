//! consentd-daemon - consent registry, access validation and audit service
//!
//! This library hosts the async half of the consent gate: the ledger client
//! contract, the ledger-backed consent store, the decision cache, the audit
//! log, and the registry and validator built on them. [`ConsentService`]
//! wires all of them over one ledger client.
//!
//! # Modules
//!
//! - [`ledger`]: ledger client trait, contract names and the in-memory ledger
//! - [`store`]: typed consent token access over the consent contract
//! - [`cache`]: time-bounded decision cache with pair invalidation and sweep
//! - [`audit_log`]: append-only audit trail, queries and statistics
//! - [`registry`]: grant, revoke and bulk revoke
//! - [`validator`]: the access check hot path
//! - [`service`]: role-checked facade and sweep lifecycle
//! - [`metrics`]: Prometheus collectors
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use consentd_core::{AccessLevel, Expiration, Permission, ResourceType};
//! use consentd_daemon::ledger::InMemoryLedger;
//! use consentd_daemon::service::{ConsentService, Principal, Role};
//! use consentd_daemon::validator::AccessRequest;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = ConsentService::builder(Arc::new(InMemoryLedger::new())).build()?;
//! let patient = Principal::new("pat-1", Role::Patient);
//!
//! let receipt = service
//!     .grant(
//!         &patient,
//!         "doc-1",
//!         vec![Permission::new(ResourceType::Diagnosis, AccessLevel::Read)],
//!         Expiration::Never,
//!         "patient-signature",
//!     )
//!     .await?;
//!
//! let request = AccessRequest::new("doc-1", "pat-1", ResourceType::Diagnosis, AccessLevel::Read)?;
//! let decision = service.validate_access(&request).await;
//! assert!(decision.granted);
//! assert_eq!(decision.matched_token_id, Some(receipt.token.token_id));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod audit_log;
pub mod cache;
pub mod ledger;
pub mod metrics;
pub mod registry;
pub mod service;
pub mod store;
pub mod validator;

pub use audit_log::{AuditLog, AuditOutcome};
pub use cache::{CacheKey, DecisionCache, DecisionCacheConfig, SweeperHandle};
pub use ledger::{InMemoryLedger, LedgerClient, LedgerError};
pub use metrics::GateMetrics;
pub use registry::{
    BulkRevocationItem, ConsentRegistry, GrantReceipt, GrantRequest, RevocationResult,
    RevocationStatus, RevokeRequest,
};
pub use service::{ConsentService, Principal, RecordRef, Role};
pub use store::ConsentStore;
pub use validator::{AccessRequest, AccessValidator};
