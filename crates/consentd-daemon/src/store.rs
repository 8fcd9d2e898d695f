//! Ledger-backed consent token store.
//!
//! `ConsentStore` is the system of record for grant and revoke state. It is a
//! thin typed layer over the consent contract: tokens go in and out as JSON,
//! every call is bounded by the configured timeout, and every failure (timeout,
//! transport, rejection, undecodable payload) surfaces as
//! [`ConsentError::StoreUnavailable`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use consentd_core::{ConsentError, ConsentResult, ConsentToken};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::ledger::{
    CONSENT_CONTRACT, LedgerClient, LedgerError, consent_fn, submit_checked, with_timeout,
};
use crate::metrics::GateMetrics;

/// Typed access to consent tokens on the ledger.
#[derive(Debug, Clone)]
pub struct ConsentStore {
    ledger: Arc<dyn LedgerClient>,
    timeout: Duration,
    metrics: Option<GateMetrics>,
}

fn unavailable(operation: &str, err: &LedgerError) -> ConsentError {
    ConsentError::store_unavailable(operation, err.to_string())
}

impl ConsentStore {
    /// Creates a store over `ledger` with a per-call `timeout`.
    #[must_use]
    pub fn new(ledger: Arc<dyn LedgerClient>, timeout: Duration) -> Self {
        Self {
            ledger,
            timeout,
            metrics: None,
        }
    }

    /// Attaches metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: GateMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Persists a newly granted token.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::StoreUnavailable`] if the ledger fails or
    /// rejects the write.
    pub async fn create(&self, token: &ConsentToken) -> ConsentResult<String> {
        self.submit("create", consent_fn::CREATE, token).await
    }

    /// Persists a revoked token.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::StoreUnavailable`] if the ledger fails or
    /// rejects the write.
    pub async fn update(&self, token: &ConsentToken) -> ConsentResult<String> {
        self.submit("update", consent_fn::UPDATE, token).await
    }

    /// Fetches one token.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::StoreUnavailable`] if the ledger fails.
    pub async fn get(&self, token_id: &str) -> ConsentResult<Option<ConsentToken>> {
        self.query("get", consent_fn::GET, vec![token_id.to_string()])
            .await
    }

    /// Fetches the active tokens of a (patient, provider) pair.
    ///
    /// "Active" is the stored flag only; expiry is left to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::StoreUnavailable`] if the ledger fails.
    pub async fn active_for_pair(
        &self,
        patient_id: &str,
        provider_id: &str,
    ) -> ConsentResult<Vec<ConsentToken>> {
        self.query(
            "query_active",
            consent_fn::QUERY_ACTIVE,
            vec![patient_id.to_string(), provider_id.to_string()],
        )
        .await
    }

    /// Fetches every token a patient has granted.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::StoreUnavailable`] if the ledger fails.
    pub async fn by_patient(&self, patient_id: &str) -> ConsentResult<Vec<ConsentToken>> {
        self.query(
            "query_by_patient",
            consent_fn::QUERY_BY_PATIENT,
            vec![patient_id.to_string()],
        )
        .await
    }

    /// Fetches every token granted to a provider.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::StoreUnavailable`] if the ledger fails.
    pub async fn by_provider(&self, provider_id: &str) -> ConsentResult<Vec<ConsentToken>> {
        self.query(
            "query_by_provider",
            consent_fn::QUERY_BY_PROVIDER,
            vec![provider_id.to_string()],
        )
        .await
    }

    async fn submit(
        &self,
        operation: &str,
        function: &str,
        token: &ConsentToken,
    ) -> ConsentResult<String> {
        let payload = serde_json::to_string(token)
            .map_err(|e| ConsentError::validation("token", e.to_string()))?;
        let started = Instant::now();
        let result = submit_checked(
            self.ledger.as_ref(),
            self.timeout,
            CONSENT_CONTRACT,
            function,
            vec![payload],
        )
        .await;
        self.observe(operation, started);
        match result {
            Ok(receipt) => {
                debug!(
                    token_id = %token.token_id,
                    tx = %receipt.transaction_id,
                    operation,
                    "consent token persisted"
                );
                Ok(receipt.transaction_id)
            },
            Err(err) => {
                warn!(
                    token_id = %token.token_id,
                    operation,
                    error = %err,
                    "consent store write failed"
                );
                Err(unavailable(operation, &err))
            },
        }
    }

    async fn query<T: DeserializeOwned>(
        &self,
        operation: &str,
        function: &str,
        args: Vec<String>,
    ) -> ConsentResult<T> {
        let started = Instant::now();
        let result = with_timeout(
            function,
            self.timeout,
            self.ledger.query(CONSENT_CONTRACT, function, args),
        )
        .await;
        self.observe(operation, started);
        let response = result.map_err(|err| {
            warn!(operation, error = %err, "consent store query failed");
            unavailable(operation, &err)
        })?;
        serde_json::from_str(&response.result).map_err(|e| {
            let err = LedgerError::Malformed {
                function: function.to_string(),
                reason: e.to_string(),
            };
            warn!(operation, error = %err, "consent store returned malformed payload");
            unavailable(operation, &err)
        })
    }

    fn observe(&self, operation: &str, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.store_call(operation, started.elapsed());
        }
    }
}
