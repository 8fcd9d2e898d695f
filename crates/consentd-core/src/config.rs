//! Configuration parsing and validation.
//!
//! Configuration is a TOML document. Every key has a default, so an empty
//! file is a valid configuration:
//!
//! ```toml
//! [cache]
//! ttl_secs = 300
//! sweep_interval_secs = 60
//! max_entries = 100000
//!
//! [store]
//! timeout_ms = 5000
//!
//! [audit]
//! default_page_limit = 50
//! max_page_limit = 1000
//!
//! [signatures]
//! verify = false
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::audit::MAX_PAGE_LIMIT;

/// Default decision cache TTL (5 minutes).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Maximum decision cache TTL (1 hour).
pub const MAX_CACHE_TTL_SECS: u64 = 3_600;

/// Default sweep interval (1 minute).
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Maximum sweep interval (1 hour).
pub const MAX_SWEEP_INTERVAL_SECS: u64 = 3_600;

/// Default maximum number of cached decisions.
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 100_000;

/// Default store call timeout (5 seconds).
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;

/// Maximum store call timeout (60 seconds).
pub const MAX_STORE_TIMEOUT_MS: u64 = 60_000;

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be serialized.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GateConfig {
    /// Decision cache settings.
    pub cache: CacheConfig,
    /// Ledger-backed store settings.
    pub store: StoreConfig,
    /// Audit query settings.
    pub audit: AuditConfig,
    /// Signature verification settings.
    pub signatures: SignatureConfig,
}

impl GateConfig {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        debug!(path = %path.display(), "loaded gate config");
        Ok(config)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid, names unknown keys, or holds
    /// out-of-range values.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks every value against its bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("cache.ttl_secs", self.cache.ttl_secs, 1, MAX_CACHE_TTL_SECS)?;
        check_range(
            "cache.sweep_interval_secs",
            self.cache.sweep_interval_secs,
            1,
            MAX_SWEEP_INTERVAL_SECS,
        )?;
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Validation(
                "cache.max_entries must be at least 1".to_string(),
            ));
        }
        check_range("store.timeout_ms", self.store.timeout_ms, 1, MAX_STORE_TIMEOUT_MS)?;
        check_range(
            "audit.max_page_limit",
            self.audit.max_page_limit as u64,
            1,
            MAX_PAGE_LIMIT as u64,
        )?;
        check_range(
            "audit.default_page_limit",
            self.audit.default_page_limit as u64,
            1,
            self.audit.max_page_limit as u64,
        )?;
        Ok(())
    }
}

fn check_range(key: &str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::Validation(format!(
            "{key} = {value} is outside {min}..={max}"
        )));
    }
    Ok(())
}

/// Decision cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Entry lifetime in seconds.
    pub ttl_secs: u64,
    /// Interval between background sweeps, in seconds.
    pub sweep_interval_secs: u64,
    /// Maximum number of cached decisions.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
        }
    }
}

impl CacheConfig {
    /// Entry lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Sweep interval.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Ledger-backed store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Per-call timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
        }
    }
}

impl StoreConfig {
    /// Per-call timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Audit query settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditConfig {
    /// Page size used when a query does not name one.
    pub default_page_limit: usize,
    /// Largest page size a query may request.
    pub max_page_limit: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            default_page_limit: crate::audit::DEFAULT_PAGE_LIMIT,
            max_page_limit: MAX_PAGE_LIMIT,
        }
    }
}

/// Signature verification settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SignatureConfig {
    /// Verify patient signatures on grant and revoke.
    pub verify: bool,
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = GateConfig::from_toml("").unwrap();
        assert_eq!(config, GateConfig::default());
        assert_eq!(config.cache.ttl(), Duration::from_secs(300));
        assert_eq!(config.cache.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.audit.max_page_limit, 1_000);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = GateConfig::from_toml(
            r"
            [cache]
            ttl_secs = 30

            [store]
            timeout_ms = 250
            ",
        )
        .unwrap();
        assert_eq!(config.cache.ttl_secs, 30);
        assert_eq!(config.cache.sweep_interval_secs, DEFAULT_SWEEP_INTERVAL_SECS);
        assert_eq!(config.store.timeout(), Duration::from_millis(250));
    }

    #[test]
    fn unknown_keys_rejected() {
        let err = GateConfig::from_toml("[cache]\nttl = 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn out_of_range_values_rejected() {
        for doc in [
            "[cache]\nttl_secs = 0\n",
            "[cache]\nttl_secs = 7200\n",
            "[cache]\nmax_entries = 0\n",
            "[store]\ntimeout_ms = 0\n",
            "[audit]\nmax_page_limit = 5000\n",
            "[audit]\ndefault_page_limit = 100\nmax_page_limit = 10\n",
        ] {
            let err = GateConfig::from_toml(doc).unwrap_err();
            assert!(matches!(err, ConfigError::Validation(_)), "{doc}");
        }
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = GateConfig::default();
        config.signatures.verify = true;
        config.cache.ttl_secs = 45;
        let text = config.to_toml().unwrap();
        assert_eq!(GateConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[signatures]\nverify = true").unwrap();
        let config = GateConfig::from_file(file.path()).unwrap();
        assert!(config.signatures.verify);
    }
}
