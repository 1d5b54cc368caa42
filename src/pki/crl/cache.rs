use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::errors::FetchError;
use super::fetcher::CrlFetcher;
use super::parser::parse_crl;
use super::types::{Crl, CrlSourceId};

type InFlight = Shared<BoxFuture<'static, Result<Arc<Crl>, FetchError>>>;

/// When a cached CRL stops being served.
///
/// Both limits are optional; an entry must satisfy every configured limit.
/// With neither configured the cache is eternal and only bounded by size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheExpiry {
    /// Measured from the successful fetch
    pub time_to_live: Option<Duration>,
    /// Measured from the last access
    pub time_to_idle: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheSettings {
    pub expiry: CacheExpiry,
    /// Maximum number of completed entries, `None` for unbounded
    pub max_entries: Option<usize>,
}

struct CacheEntry {
    crl: Arc<Crl>,
    fetched_at: Instant,
    /// Milliseconds since the cache epoch
    last_access: AtomicU64,
}

impl CacheEntry {
    fn touch(&self, at_ms: u64) {
        self.last_access.fetch_max(at_ms, Ordering::Relaxed);
    }

    fn last_access_ms(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }
}

/// A fetch in flight, tagged so that only the fetch that installed it can
/// clear it.
struct Pending {
    generation: u64,
    in_flight: InFlight,
}

#[derive(Default)]
struct Slot {
    ready: Option<Arc<CacheEntry>>,
    pending: Option<Pending>,
}

impl Slot {
    fn finish(&mut self, generation: u64) {
        if self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.generation == generation)
        {
            self.pending = None;
        }
    }
}

struct Inner {
    fetcher: Arc<dyn CrlFetcher>,
    slots: DashMap<CrlSourceId, Slot>,
    settings: CacheSettings,
    epoch: Instant,
    next_generation: AtomicU64,
}

/// Memoizes parsed CRLs per source.
///
/// Concurrent misses for one source share a single fetch. The fetch runs in
/// its own task, so a caller giving up on it does not cancel it for the
/// others or keep the result out of the cache.
#[derive(Clone)]
pub struct CrlCache {
    inner: Arc<Inner>,
}

impl CrlCache {
    pub fn new(fetcher: Arc<dyn CrlFetcher>, settings: CacheSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                slots: DashMap::new(),
                settings,
                epoch: Instant::now(),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the cached CRL if it is still fresh, otherwise fetches,
    /// parses and stores it. Joins a fetch already in flight for `source`.
    pub async fn get_or_fetch(&self, source: &CrlSourceId) -> Result<Arc<Crl>, FetchError> {
        let now = Instant::now();

        if let Some(slot) = self.inner.slots.get(source)
            && let Some(entry) = &slot.ready
            && self.inner.is_fresh(entry, now)
        {
            entry.touch(self.inner.millis(now));
            debug!("Using cached CRL from {}", source);
            return Ok(entry.crl.clone());
        }

        let in_flight = {
            let mut slot = self.inner.slots.entry(source.clone()).or_default();
            if let Some(entry) = &slot.ready
                && self.inner.is_fresh(entry, now)
            {
                entry.touch(self.inner.millis(now));
                return Ok(entry.crl.clone());
            }
            self.inner.join_or_spawn(&mut slot, source)
        };

        in_flight.await
    }

    /// Re-fetches `source` regardless of freshness. A fetch already in flight
    /// is joined instead of starting another one. On failure a previous entry
    /// that is still fresh stays in place.
    pub async fn refresh(&self, source: &CrlSourceId) -> Result<Arc<Crl>, FetchError> {
        let in_flight = {
            let mut slot = self.inner.slots.entry(source.clone()).or_default();
            self.inner.join_or_spawn(&mut slot, source)
        };

        in_flight.await
    }

    /// The cached CRL if present and fresh. Never fetches and does not count
    /// as an access.
    pub fn cached(&self, source: &CrlSourceId) -> Option<Arc<Crl>> {
        let now = Instant::now();
        let slot = self.inner.slots.get(source)?;
        slot.ready
            .as_ref()
            .filter(|entry| self.inner.is_fresh(entry, now))
            .map(|entry| entry.crl.clone())
    }

    /// Drops expired entries that have no fetch in flight. Returns the number
    /// of entries removed.
    /// Expired entries are also purged whenever a fetch completes.
    pub fn cleanup_expired(&self) -> usize {
        self.inner.cleanup_expired()
    }

    pub fn clear(&self) {
        self.inner.slots.clear();
    }

    /// Number of completed entries, fresh or not.
    pub fn len(&self) -> usize {
        self.inner.ready_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn millis(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_millis() as u64
    }

    fn is_fresh(&self, entry: &CacheEntry, now: Instant) -> bool {
        let expiry = self.settings.expiry;
        let within_ttl = expiry
            .time_to_live
            .is_none_or(|ttl| now.saturating_duration_since(entry.fetched_at) < ttl);
        let idle = Duration::from_millis(self.millis(now).saturating_sub(entry.last_access_ms()));
        let within_tti = expiry.time_to_idle.is_none_or(|tti| idle < tti);
        within_ttl && within_tti
    }

    fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| {
            slot.pending.is_some()
                || slot
                    .ready
                    .as_ref()
                    .is_some_and(|entry| self.is_fresh(entry, now))
        });
        let removed = before.saturating_sub(self.slots.len());
        if removed > 0 {
            debug!("Removed {} expired CRL cache entries", removed);
        }
        removed
    }

    fn ready_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.ready.is_some())
            .count()
    }

    /// Must be called with the slot's shard locked, so that at most one
    /// fetch per source is ever in flight.
    fn join_or_spawn(self: &Arc<Self>, slot: &mut Slot, source: &CrlSourceId) -> InFlight {
        if let Some(pending) = &slot.pending {
            debug!("Joining in-flight CRL fetch for {}", source);
            return pending.in_flight.clone();
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(self.clone().fetch_and_store(source.clone(), generation));
        let in_flight = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(FetchError::Transport(format!("CRL fetch task failed: {e}"))),
            }
        }
        .boxed()
        .shared();

        slot.pending = Some(Pending {
            generation,
            in_flight: in_flight.clone(),
        });
        in_flight
    }

    /// A fetch that was dropped from its slot by `clear` or eviction still
    /// stores its result, but leaves any newer fetch's marker alone.
    async fn fetch_and_store(
        self: Arc<Self>,
        source: CrlSourceId,
        generation: u64,
    ) -> Result<Arc<Crl>, FetchError> {
        let fetched = self
            .fetcher
            .fetch(&source)
            .await
            .and_then(|bytes| parse_crl(&bytes));

        match fetched {
            Ok(crl) => {
                let crl = Arc::new(crl);
                let now = Instant::now();
                let entry = Arc::new(CacheEntry {
                    crl: crl.clone(),
                    fetched_at: now,
                    last_access: AtomicU64::new(self.millis(now)),
                });
                {
                    let mut slot = self.slots.entry(source.clone()).or_default();
                    slot.ready = Some(entry);
                    slot.finish(generation);
                }
                info!(
                    "Cached CRL from {} ({} revoked entries)",
                    source,
                    crl.revoked_count()
                );
                self.cleanup_expired();
                self.enforce_capacity(&source);
                Ok(crl)
            }
            Err(e) => {
                warn!("Failed to obtain CRL from {}: {}", source, e);
                let now = Instant::now();
                if let Some(mut slot) = self.slots.get_mut(&source) {
                    slot.finish(generation);
                }
                self.slots.remove_if(&source, |_, slot| {
                    slot.pending.is_none()
                        && !slot
                            .ready
                            .as_ref()
                            .is_some_and(|entry| self.is_fresh(entry, now))
                });
                Err(e)
            }
        }
    }

    /// Evicts least recently accessed entries, never `keep` and never one
    /// with a fetch in flight, until the bound holds again.
    fn enforce_capacity(&self, keep: &CrlSourceId) {
        let Some(max_entries) = self.settings.max_entries else {
            return;
        };

        while self.ready_count() > max_entries {
            let victim = self
                .slots
                .iter()
                .filter(|slot| slot.key() != keep && slot.pending.is_none())
                .filter_map(|slot| {
                    slot.ready
                        .as_ref()
                        .map(|entry| (slot.key().clone(), entry.last_access_ms()))
                })
                .min_by_key(|(_, last_access)| *last_access)
                .map(|(source, _)| source);

            let Some(source) = victim else {
                break;
            };
            if self
                .slots
                .remove_if(&source, |_, slot| slot.pending.is_none())
                .is_some()
            {
                debug!("Evicted CRL cache entry for {}", source);
            }
        }
    }
}
