//! # consentd-core
//!
//! Data model and pure decision logic for consent-based access control.
//!
//! Patients grant providers time-bounded, scoped [`ConsentToken`]s. Every
//! access check is answered from those tokens and recorded as an
//! [`AuditEntry`]. This crate holds the synchronous half of that system:
//!
//! - [`permission`]: closed vocabularies for resource types and access levels
//! - [`token`]: consent tokens and the validity invariant
//! - [`decision`]: access decisions, consent snapshots and the evaluator
//! - [`audit`]: audit event types, payloads, filters, pages and statistics
//! - [`signing`]: signed-message layout and signer/verifier capabilities
//! - [`clock`]: injectable time source
//! - [`config`]: TOML configuration
//! - [`error`]: the error taxonomy shared by every operation
//!
//! The async services that persist tokens, cache decisions and write the
//! audit trail live in `consentd-daemon`.
//!
//! ## Example
//!
//! ```rust
//! use chrono::Utc;
//! use consentd_core::decision::{evaluate, ConsentSnapshot};
//! use consentd_core::{
//!     AccessLevel, ConsentToken, Expiration, Permission, PermissionSet, ResourceType,
//! };
//!
//! let now = Utc::now();
//! let token = ConsentToken::new(
//!     "tok-1".into(),
//!     "pat-1".into(),
//!     "doc-1".into(),
//!     PermissionSet::new(vec![Permission::new(ResourceType::Diagnosis, AccessLevel::Read)])?,
//!     Expiration::Never,
//!     now,
//!     "patient-signature".into(),
//! );
//!
//! let snapshot = ConsentSnapshot::from_tokens([&token], ResourceType::Diagnosis, now);
//! assert!(evaluate(&snapshot, AccessLevel::Read, now).granted);
//! assert!(!evaluate(&snapshot, AccessLevel::Write, now).granted);
//! # Ok::<(), consentd_core::ConsentError>(())
//! ```

#![warn(missing_docs)]

pub mod audit;
pub mod clock;
pub mod config;
pub mod decision;
pub mod error;
pub mod permission;
pub mod signing;
pub mod token;

pub use audit::{
    AuditDetails, AuditEntry, AuditEntryInput, AuditEventType, AuditFilter, AuditPage,
    AuditSlice, AuditStatistics, DecisionSource, Order,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, GateConfig};
pub use decision::{AccessDecision, ConsentSnapshot, DenialReason};
pub use error::{ConsentError, ConsentResult, ErrorKind};
pub use permission::{AccessLevel, Permission, PermissionSet, ResourceType};
pub use token::{ConsentToken, Expiration, TokenValidity};
