//! Ledger client contract.
//!
//! The distributed ledger is an external collaborator. This module pins down
//! the two calls the daemon makes against it and the contract/function names
//! it uses:
//!
//! ```text
//! submit(contract, function, args) -> { transaction_id, result, is_successful }
//! query (contract, function, args) -> { result }
//! ```
//!
//! All mutations go through `submit` and all reads through `query`. Both may
//! be slow or fail, so every call the daemon makes is wrapped in
//! [`with_timeout`]; an elapsed timeout is reported as
//! [`LedgerError::Timeout`] and treated like any other outage.
//!
//! Arguments and results are JSON strings. A `query` for a missing record
//! returns the JSON literal `null`.

pub mod memory;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::InMemoryLedger;

/// Contract holding consent tokens.
pub const CONSENT_CONTRACT: &str = "consent";

/// Contract holding audit entries.
pub const AUDIT_CONTRACT: &str = "audit";

/// Consent contract functions.
pub mod consent_fn {
    /// `[token_json]`: create a token; rejected if the id exists.
    pub const CREATE: &str = "CreateConsent";
    /// `[token_json]`: replace a token; only the revocation fields may change.
    pub const UPDATE: &str = "UpdateConsent";
    /// `[token_id]`: fetch one token or `null`.
    pub const GET: &str = "GetConsent";
    /// `[patient_id, provider_id]`: active tokens for the pair.
    pub const QUERY_ACTIVE: &str = "QueryActiveConsents";
    /// `[patient_id]`: every token granted by the patient.
    pub const QUERY_BY_PATIENT: &str = "QueryConsentsByPatient";
    /// `[provider_id]`: every token granted to the provider.
    pub const QUERY_BY_PROVIDER: &str = "QueryConsentsByProvider";
}

/// Audit contract functions.
pub mod audit_fn {
    /// `[entry_json]`: append an entry; rejected if the id exists.
    pub const APPEND: &str = "AppendEntry";
    /// `[filter_json, offset, limit]`: one window of the matching entries,
    /// ordered by the filter's `order`, as an `AuditSlice`.
    pub const QUERY: &str = "QueryEntries";
    /// `[filter_json]`: every entry matching the filter, unordered.
    pub const SCAN: &str = "ScanEntries";
}

/// Outcome of a `submit` call that reached the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    /// Ledger transaction identifier.
    pub transaction_id: String,
    /// Contract-defined result payload, or the rejection message.
    pub result: String,
    /// `false` if the contract rejected the transaction.
    pub is_successful: bool,
}

/// Outcome of a `query` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse {
    /// Contract-defined JSON result.
    pub result: String,
}

/// Failures talking to the ledger.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum LedgerError {
    /// The call did not complete within the configured timeout.
    #[error("ledger call {function} timed out after {timeout_ms} ms")]
    Timeout {
        /// The contract function called.
        function: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The contract rejected a transaction.
    #[error("ledger rejected {function}: {reason}")]
    Rejected {
        /// The contract function called.
        function: String,
        /// The rejection message.
        reason: String,
    },

    /// The ledger could not be reached.
    #[error("ledger transport failure: {0}")]
    Transport(String),

    /// The ledger returned a payload the daemon could not decode.
    #[error("malformed ledger payload from {function}: {reason}")]
    Malformed {
        /// The contract function called.
        function: String,
        /// The decode failure.
        reason: String,
    },
}

/// Client for the external ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync + fmt::Debug {
    /// Submits a state-changing transaction.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the ledger cannot be reached. A contract
    /// rejection is reported as `Ok` with `is_successful == false`.
    async fn submit(
        &self,
        contract: &str,
        function: &str,
        args: Vec<String>,
    ) -> Result<SubmitReceipt, LedgerError>;

    /// Evaluates a read-only query.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the ledger cannot be reached or rejects the
    /// query.
    async fn query(
        &self,
        contract: &str,
        function: &str,
        args: Vec<String>,
    ) -> Result<QueryResponse, LedgerError>;
}

/// Bounds a ledger call by `timeout`.
///
/// # Errors
///
/// Returns [`LedgerError::Timeout`] if the call does not finish in time, or
/// the call's own error.
pub async fn with_timeout<T, F>(
    function: &str,
    timeout: Duration,
    call: F,
) -> Result<T, LedgerError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(LedgerError::Timeout {
            function: function.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

/// Submits and turns a contract rejection into [`LedgerError::Rejected`].
///
/// # Errors
///
/// Returns [`LedgerError`] on timeout, transport failure or rejection.
pub async fn submit_checked(
    ledger: &dyn LedgerClient,
    timeout: Duration,
    contract: &str,
    function: &str,
    args: Vec<String>,
) -> Result<SubmitReceipt, LedgerError> {
    let receipt = with_timeout(function, timeout, ledger.submit(contract, function, args)).await?;
    if receipt.is_successful {
        Ok(receipt)
    } else {
        Err(LedgerError::Rejected {
            function: function.to_string(),
            reason: receipt.result,
        })
    }
}
