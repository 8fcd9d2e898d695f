//! In-memory ledger.
//!
//! Implements the consent and audit contracts over process memory. It is the
//! development backend of the `consentd` binary and the test double for every
//! component above the ledger, so it also supports:
//!
//! - per-function call counters ([`InMemoryLedger::query_count`],
//!   [`InMemoryLedger::submit_count`])
//! - failure injection for all calls, for one contract or for writes of one
//!   consent token
//! - artificial latency, to exercise timeouts
//!
//! The contract rules mirror what a real chaincode enforces: ids are unique,
//! audit entries are never replaced, and a consent update may only flip the
//! revocation fields of an existing token.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use consentd_core::audit::compare_entries;
use consentd_core::{AuditEntry, AuditFilter, AuditSlice, ConsentToken};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use super::{
    AUDIT_CONTRACT, CONSENT_CONTRACT, LedgerClient, LedgerError, QueryResponse, SubmitReceipt,
    audit_fn, consent_fn,
};

#[derive(Debug, Default)]
struct LedgerState {
    /// Tokens in creation order.
    tokens: Vec<ConsentToken>,
    token_index: HashMap<String, usize>,
    audit: Vec<AuditEntry>,
    audit_ids: HashSet<String>,
}

/// In-memory implementation of [`LedgerClient`].
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    next_tx: AtomicU64,
    submit_counts: Mutex<HashMap<String, u64>>,
    query_counts: Mutex<HashMap<String, u64>>,
    audit_rows_served: AtomicU64,
    fail_submits: AtomicBool,
    fail_queries: AtomicBool,
    failing_contracts: Mutex<HashSet<String>>,
    failing_tokens: Mutex<HashSet<String>>,
    latency: Mutex<Option<Duration>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn decode<T: DeserializeOwned>(function: &str, args: &[String], index: usize) -> Result<T, String> {
    let raw = args
        .get(index)
        .ok_or_else(|| format!("{function}: missing argument {index}"))?;
    serde_json::from_str(raw).map_err(|e| format!("{function}: {e}"))
}

fn arg<'a>(function: &str, args: &'a [String], index: usize) -> Result<&'a str, String> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| format!("{function}: missing argument {index}"))
}

fn encode<T: Serialize>(function: &str, value: &T) -> Result<String, LedgerError> {
    serde_json::to_string(value).map_err(|e| LedgerError::Malformed {
        function: function.to_string(),
        reason: e.to_string(),
    })
}

impl InMemoryLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `submit` fail with a transport error while `fail` is set.
    pub fn fail_submits(&self, fail: bool) {
        self.fail_submits.store(fail, Ordering::SeqCst);
    }

    /// Makes every `query` fail with a transport error while `fail` is set.
    pub fn fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Makes every call against `contract` fail while `fail` is set.
    pub fn fail_contract(&self, contract: &str, fail: bool) {
        let mut failing = lock(&self.failing_contracts);
        if fail {
            failing.insert(contract.to_string());
        } else {
            failing.remove(contract);
        }
    }

    /// Makes every consent write of `token_id` fail while `fail` is set.
    pub fn fail_token_writes(&self, token_id: &str, fail: bool) {
        let mut failing = lock(&self.failing_tokens);
        if fail {
            failing.insert(token_id.to_string());
        } else {
            failing.remove(token_id);
        }
    }

    fn token_write_fails(&self, contract: &str, args: &[String]) -> bool {
        if contract != CONSENT_CONTRACT {
            return false;
        }
        let failing = lock(&self.failing_tokens);
        if failing.is_empty() {
            return false;
        }
        args.first()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            .and_then(|value| value.get("token_id")?.as_str().map(str::to_string))
            .is_some_and(|token_id| failing.contains(&token_id))
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    /// Number of `query` calls made to `function`.
    #[must_use]
    pub fn query_count(&self, function: &str) -> u64 {
        lock(&self.query_counts).get(function).copied().unwrap_or(0)
    }

    /// Number of `submit` calls made to `function`.
    #[must_use]
    pub fn submit_count(&self, function: &str) -> u64 {
        lock(&self.submit_counts).get(function).copied().unwrap_or(0)
    }

    /// Number of audit entries held.
    #[must_use]
    pub fn audit_len(&self) -> usize {
        lock(&self.state).audit.len()
    }

    /// Number of audit entries returned by audit queries so far.
    #[must_use]
    pub fn audit_rows_served(&self) -> u64 {
        self.audit_rows_served.load(Ordering::SeqCst)
    }

    /// Returns a stored token without going through the client interface.
    #[must_use]
    pub fn token(&self, token_id: &str) -> Option<ConsentToken> {
        let state = lock(&self.state);
        state
            .token_index
            .get(token_id)
            .map(|&i| state.tokens[i].clone())
    }

    fn serve_audit_rows(&self, rows: usize) {
        self.audit_rows_served
            .fetch_add(u64::try_from(rows).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    async fn before_call(&self, contract: &str, global_failure: bool) -> Result<(), LedgerError> {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if global_failure || lock(&self.failing_contracts).contains(contract) {
            return Err(LedgerError::Transport(format!(
                "injected failure for contract {contract}"
            )));
        }
        Ok(())
    }

    fn apply_submit(
        &self,
        contract: &str,
        function: &str,
        args: &[String],
    ) -> Result<String, String> {
        let mut state = lock(&self.state);
        match (contract, function) {
            (CONSENT_CONTRACT, consent_fn::CREATE) => {
                let token: ConsentToken = decode(function, args, 0)?;
                if state.token_index.contains_key(&token.token_id) {
                    return Err(format!("token {} already exists", token.token_id));
                }
                let id = token.token_id.clone();
                state.tokens.push(token);
                let index = state.tokens.len() - 1;
                state.token_index.insert(id.clone(), index);
                Ok(id)
            },
            (CONSENT_CONTRACT, consent_fn::UPDATE) => {
                let token: ConsentToken = decode(function, args, 0)?;
                let index = *state
                    .token_index
                    .get(&token.token_id)
                    .ok_or_else(|| format!("token {} does not exist", token.token_id))?;
                let existing = &state.tokens[index];
                let immutable_changed = existing.patient_id != token.patient_id
                    || existing.provider_id != token.provider_id
                    || existing.permissions != token.permissions
                    || existing.expiration != token.expiration
                    || existing.created_at != token.created_at
                    || existing.signature != token.signature;
                if immutable_changed {
                    return Err(format!("token {} immutable fields changed", token.token_id));
                }
                if existing.revoked_at.is_some() && existing.revoked_at != token.revoked_at {
                    return Err(format!("token {} already revoked", token.token_id));
                }
                if !existing.is_active && token.is_active {
                    return Err(format!("token {} cannot be reactivated", token.token_id));
                }
                let id = token.token_id.clone();
                state.tokens[index] = token;
                Ok(id)
            },
            (AUDIT_CONTRACT, audit_fn::APPEND) => {
                let entry: AuditEntry = decode(function, args, 0)?;
                if !state.audit_ids.insert(entry.entry_id.clone()) {
                    return Err(format!("audit entry {} already exists", entry.entry_id));
                }
                let id = entry.entry_id.clone();
                state.audit.push(entry);
                Ok(id)
            },
            _ => Err(format!("unknown function {contract}.{function}")),
        }
    }

    fn apply_query(
        &self,
        contract: &str,
        function: &str,
        args: &[String],
    ) -> Result<String, LedgerError> {
        let malformed = |reason: String| LedgerError::Malformed {
            function: function.to_string(),
            reason,
        };
        let state = lock(&self.state);
        match (contract, function) {
            (CONSENT_CONTRACT, consent_fn::GET) => {
                let token_id = arg(function, args, 0).map_err(malformed)?;
                let token = state.token_index.get(token_id).map(|&i| &state.tokens[i]);
                encode(function, &token)
            },
            (CONSENT_CONTRACT, consent_fn::QUERY_ACTIVE) => {
                let patient_id = arg(function, args, 0).map_err(malformed)?;
                let provider_id = arg(function, args, 1).map_err(malformed)?;
                let tokens: Vec<&ConsentToken> = state
                    .tokens
                    .iter()
                    .filter(|t| {
                        t.patient_id == patient_id && t.provider_id == provider_id && t.is_active
                    })
                    .collect();
                encode(function, &tokens)
            },
            (CONSENT_CONTRACT, consent_fn::QUERY_BY_PATIENT) => {
                let patient_id = arg(function, args, 0).map_err(malformed)?;
                let tokens: Vec<&ConsentToken> =
                    state.tokens.iter().filter(|t| t.patient_id == patient_id).collect();
                encode(function, &tokens)
            },
            (CONSENT_CONTRACT, consent_fn::QUERY_BY_PROVIDER) => {
                let provider_id = arg(function, args, 0).map_err(malformed)?;
                let tokens: Vec<&ConsentToken> =
                    state.tokens.iter().filter(|t| t.provider_id == provider_id).collect();
                encode(function, &tokens)
            },
            (AUDIT_CONTRACT, audit_fn::QUERY) => {
                let filter: AuditFilter = decode(function, args, 0).map_err(malformed)?;
                let offset: usize = decode(function, args, 1).map_err(malformed)?;
                let limit: usize = decode(function, args, 2).map_err(malformed)?;
                let mut matches: Vec<&AuditEntry> =
                    state.audit.iter().filter(|e| filter.matches(e)).collect();
                matches.sort_by(|a, b| compare_entries(filter.order, a, b));
                let slice = AuditSlice {
                    total: matches.len(),
                    entries: matches.into_iter().skip(offset).take(limit).cloned().collect(),
                };
                self.serve_audit_rows(slice.entries.len());
                encode(function, &slice)
            },
            (AUDIT_CONTRACT, audit_fn::SCAN) => {
                let filter: AuditFilter = decode(function, args, 0).map_err(malformed)?;
                let entries: Vec<&AuditEntry> =
                    state.audit.iter().filter(|e| filter.matches(e)).collect();
                self.serve_audit_rows(entries.len());
                encode(function, &entries)
            },
            _ => Err(LedgerError::Rejected {
                function: function.to_string(),
                reason: format!("unknown query {contract}.{function}"),
            }),
        }
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn submit(
        &self,
        contract: &str,
        function: &str,
        args: Vec<String>,
    ) -> Result<SubmitReceipt, LedgerError> {
        *lock(&self.submit_counts).entry(function.to_string()).or_default() += 1;
        self.before_call(contract, self.fail_submits.load(Ordering::SeqCst))
            .await?;
        if self.token_write_fails(contract, &args) {
            return Err(LedgerError::Transport(format!(
                "injected write failure for {function}"
            )));
        }

        let tx = self.next_tx.fetch_add(1, Ordering::SeqCst) + 1;
        let transaction_id = format!("tx-{tx:08}");
        let receipt = match self.apply_submit(contract, function, &args) {
            Ok(result) => SubmitReceipt {
                transaction_id,
                result,
                is_successful: true,
            },
            Err(reason) => SubmitReceipt {
                transaction_id,
                result: reason,
                is_successful: false,
            },
        };
        trace!(
            contract,
            function,
            tx = %receipt.transaction_id,
            ok = receipt.is_successful,
            "ledger submit"
        );
        Ok(receipt)
    }

    async fn query(
        &self,
        contract: &str,
        function: &str,
        args: Vec<String>,
    ) -> Result<QueryResponse, LedgerError> {
        *lock(&self.query_counts).entry(function.to_string()).or_default() += 1;
        self.before_call(contract, self.fail_queries.load(Ordering::SeqCst))
            .await?;
        let result = self.apply_query(contract, function, &args)?;
        trace!(contract, function, "ledger query");
        Ok(QueryResponse { result })
    }
}
