//! Decision cache in front of the consent store.
//!
//! The cache memoizes what the store said about one
//! (provider, patient, resource type) so repeated access checks skip the
//! ledger round trip. It never stores a verdict: entries hold a
//! [`ConsentSnapshot`] and the validator re-evaluates it against the clock on
//! every hit, so an entry cannot outlive the expiry of the token it names and
//! one entry answers both read and write checks.
//!
//! # Architecture
//!
//! ```text
//! DecisionCache
//!     ├── entries: HashMap<CacheKey, CacheEntry>
//!     ├── insert_order: VecDeque<(CacheKey, cached_at)>   // capacity eviction
//!     ├── invalidations: HashMap<PairKey, InvalidationMark>
//!     └── epoch: u64                                       // bumped per invalidation
//! ```
//!
//! # Fill/invalidate race
//!
//! A miss reads the store and then inserts. A grant or revoke that lands in
//! between must not be overwritten by the older read. Fills therefore start
//! with [`DecisionCache::begin_fill`], which captures the current epoch. Every
//! [`DecisionCache::invalidate_pair`] bumps the epoch and leaves a mark for
//! the pair. An insert whose ticket predates the pair's mark is dropped.
//!
//! Marks are pruned by the sweep once they are older than the TTL; tickets
//! older than the TTL are rejected outright, so a pruned mark can never hide
//! a racing invalidation.
//!
//! # Bounds
//!
//! - Entries older than the TTL are treated as absent on lookup.
//! - At `max_entries` the oldest insertion is evicted.
//! - The insertion queue may hold ghost keys (replaced or removed entries);
//!   they are skipped during eviction and dropped by the sweep.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use consentd_core::{Clock, ConsentSnapshot, ResourceType};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

// =============================================================================
// Keys and entries
// =============================================================================

/// Cache key: one resource type of one (provider, patient) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// The requesting provider.
    pub provider_id: String,
    /// The patient whose records are requested.
    pub patient_id: String,
    /// The requested record category.
    pub resource_type: ResourceType,
}

impl CacheKey {
    /// Creates a key.
    #[must_use]
    pub fn new(
        provider_id: impl Into<String>,
        patient_id: impl Into<String>,
        resource_type: ResourceType,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            patient_id: patient_id.into(),
            resource_type,
        }
    }

    fn pair(&self) -> PairKey {
        PairKey {
            provider_id: self.provider_id.clone(),
            patient_id: self.patient_id.clone(),
        }
    }

    fn belongs_to(&self, pair: &PairKey) -> bool {
        self.provider_id == pair.provider_id && self.patient_id == pair.patient_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PairKey {
    provider_id: String,
    patient_id: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    snapshot: ConsentSnapshot,
    cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct InvalidationMark {
    epoch: u64,
    at: DateTime<Utc>,
}

/// Proof that a fill started at a given point; required by
/// [`DecisionCache::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a fill ticket must be passed to insert"]
pub struct FillTicket {
    epoch: u64,
    issued_at: DateTime<Utc>,
}

// =============================================================================
// Configuration
// =============================================================================

/// Decision cache configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionCacheConfig {
    /// Entry lifetime.
    pub ttl: Duration,
    /// Maximum number of entries.
    pub max_entries: usize,
}

impl Default for DecisionCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(consentd_core::config::DEFAULT_CACHE_TTL_SECS),
            max_entries: consentd_core::config::DEFAULT_CACHE_MAX_ENTRIES,
        }
    }
}

impl From<&consentd_core::config::CacheConfig> for DecisionCacheConfig {
    fn from(config: &consentd_core::config::CacheConfig) -> Self {
        Self {
            ttl: config.ttl(),
            max_entries: config.max_entries,
        }
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Expired entries removed.
    pub expired_entries: usize,
    /// Invalidation marks pruned.
    pub pruned_marks: usize,
}

// =============================================================================
// DecisionCache
// =============================================================================

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    insert_order: VecDeque<(CacheKey, DateTime<Utc>)>,
    invalidations: HashMap<PairKey, InvalidationMark>,
    epoch: u64,
}

impl CacheState {
    fn evict_oldest(&mut self) -> bool {
        while let Some((key, cached_at)) = self.insert_order.pop_front() {
            let live = self
                .entries
                .get(&key)
                .is_some_and(|entry| entry.cached_at == cached_at);
            if live {
                self.entries.remove(&key);
                return true;
            }
        }
        false
    }
}

/// Time-bounded memo of consent snapshots.
///
/// `DecisionCache` is `Send + Sync`; all state sits behind one `RwLock` so an
/// invalidation is fully applied before `invalidate_pair` returns.
#[derive(Debug)]
pub struct DecisionCache {
    config: DecisionCacheConfig,
    clock: Arc<dyn Clock>,
    state: RwLock<CacheState>,
}

impl DecisionCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(config: DecisionCacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &DecisionCacheConfig {
        &self.config
    }

    fn ttl(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.ttl).unwrap_or(TimeDelta::MAX)
    }

    fn is_fresh(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(since) < self.ttl()
    }

    /// Returns the cached snapshot for `key` if it is younger than the TTL.
    pub async fn lookup(&self, key: &CacheKey) -> Option<ConsentSnapshot> {
        let now = self.clock.now();
        let state = self.state.read().await;
        state
            .entries
            .get(key)
            .filter(|entry| self.is_fresh(entry.cached_at, now))
            .map(|entry| entry.snapshot.clone())
    }

    /// Starts a fill. Call before reading the store.
    pub async fn begin_fill(&self) -> FillTicket {
        let epoch = self.state.read().await.epoch;
        FillTicket {
            epoch,
            issued_at: self.clock.now(),
        }
    }

    /// Stores `snapshot` under `key` unless an invalidation of the key's pair
    /// happened after `ticket` was issued.
    ///
    /// Returns `true` if the snapshot was stored.
    pub async fn insert(
        &self,
        key: CacheKey,
        snapshot: ConsentSnapshot,
        ticket: FillTicket,
    ) -> bool {
        if self.config.max_entries == 0 {
            return false;
        }
        let now = self.clock.now();
        if !self.is_fresh(ticket.issued_at, now) {
            debug!(provider_id = %key.provider_id, "dropping stale cache fill");
            return false;
        }

        let mut state = self.state.write().await;
        let invalidated = state
            .invalidations
            .get(&key.pair())
            .is_some_and(|mark| mark.epoch > ticket.epoch);
        if invalidated {
            debug!(
                provider_id = %key.provider_id,
                patient_id = %key.patient_id,
                "dropping cache fill that raced an invalidation"
            );
            return false;
        }

        if !state.entries.contains_key(&key) {
            while state.entries.len() >= self.config.max_entries {
                if !state.evict_oldest() {
                    break;
                }
            }
        }
        state.insert_order.push_back((key.clone(), now));
        state.entries.insert(
            key,
            CacheEntry {
                snapshot,
                cached_at: now,
            },
        );
        true
    }

    /// Drops every entry for the (provider, patient) pair and fences off
    /// in-flight fills for it.
    ///
    /// Returns the number of entries removed.
    pub async fn invalidate_pair(&self, provider_id: &str, patient_id: &str) -> usize {
        let pair = PairKey {
            provider_id: provider_id.to_string(),
            patient_id: patient_id.to_string(),
        };
        let now = self.clock.now();
        let mut state = self.state.write().await;
        state.epoch += 1;
        let epoch = state.epoch;
        let before = state.entries.len();
        state.entries.retain(|key, _| !key.belongs_to(&pair));
        let removed = before - state.entries.len();
        state
            .invalidations
            .insert(pair, InvalidationMark { epoch, at: now });
        debug!(provider_id, patient_id, removed, "invalidated cached decisions");
        removed
    }

    /// Removes expired entries and prunes invalidation marks older than the
    /// TTL.
    pub async fn sweep(&self) -> SweepStats {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| self.is_fresh(entry.cached_at, now));
        let expired_entries = before - state.entries.len();

        let marks_before = state.invalidations.len();
        state
            .invalidations
            .retain(|_, mark| self.is_fresh(mark.at, now));
        let pruned_marks = marks_before - state.invalidations.len();

        let CacheState {
            entries,
            insert_order,
            ..
        } = &mut *state;
        insert_order.retain(|(key, cached_at)| {
            entries
                .get(key)
                .is_some_and(|entry| entry.cached_at == *cached_at)
        });

        SweepStats {
            expired_entries,
            pruned_marks,
        }
    }

    /// Returns the number of entries, including ones past their TTL that the
    /// sweep has not yet removed.
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    /// Returns `true` if the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    /// Spawns the periodic sweep.
    ///
    /// The task runs until the returned handle is shut down or dropped.
    #[must_use = "dropping the handle stops the sweeper"]
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let cache = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = cache.sweep().await;
                        if stats.expired_entries > 0 || stats.pruned_marks > 0 {
                            debug!(
                                expired = stats.expired_entries,
                                pruned_marks = stats.pruned_marks,
                                "decision cache sweep"
                            );
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("decision cache sweeper stopped");
        });
        SweeperHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a running sweep task.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stops the sweep and waits for the task to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "decision cache sweeper panicked");
        }
    }

    /// Returns `true` if the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
