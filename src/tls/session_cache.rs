//! Server-side TLS session cache and resumption arbitration.
//!
//! # Responsibilities
//! - Store negotiated sessions keyed by session identifier
//! - Enforce the entry limit and the per-session timeout
//! - Decide, per presented identifier, between resumption and a full handshake
//! - Invalidate everything on flush
//!
//! # Design Decisions
//! - Expiry is checked lazily at lookup time; an expired entry is dropped
//!   and reported as a miss
//! - Overflow purges expired entries first, then evicts the oldest-created
//! - Store failures degrade to "no resumption", never to an error
//! - The rustls engine consults the cache through [`CacheSessionStore`], so
//!   every resumption decision it makes follows these rules

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rustls::server::StoresServerSessions;

use crate::config::SessionCacheConfig;
use crate::observability::metrics;

/// Opaque session identifier.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionId(Vec<u8>);

impl SessionId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for SessionId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for SessionId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().take(8) {
            write!(f, "{byte:02x}")?;
        }
        if self.0.len() > 8 {
            write!(f, "…")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

/// A negotiated session eligible for resumption.
struct CachedSession {
    id: SessionId,
    /// Engine-encoded negotiated state (suite, version, master secret).
    state: Vec<u8>,
    created_at: Instant,
}

impl CachedSession {
    fn is_expired(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= timeout
    }
}

impl fmt::Debug for CachedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedSession")
            .field("id", &self.id)
            .field("state", &format_args!("<{} bytes redacted>", self.state.len()))
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Outcome of looking up a presented session identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLookup {
    /// Live, resumable entry; carries the negotiated state.
    Resumable(Vec<u8>),
    /// Entry existed but its timeout had elapsed. It has been removed.
    Expired,
    /// No entry (never stored, evicted, or flushed).
    Miss,
    /// Caching is disabled.
    Disabled,
}

impl SessionLookup {
    pub fn is_resumable(&self) -> bool {
        matches!(self, SessionLookup::Resumable(_))
    }

    fn into_state(self) -> Option<Vec<u8>> {
        match self {
            SessionLookup::Resumable(state) => Some(state),
            _ => None,
        }
    }
}

/// Snapshot of cache activity since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub evictions: u64,
    pub stores: u64,
    pub flushes: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<SessionId, CachedSession>,
    /// Identifiers of live entries in creation order, oldest first.
    order: VecDeque<SessionId>,
    stats: SessionCacheStats,
}

impl CacheState {
    fn remove(&mut self, id: &SessionId) -> Option<CachedSession> {
        let removed = self.entries.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(removed)
    }

    fn purge_expired(&mut self, timeout: Duration, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, session| !session.is_expired(timeout, now));
        let entries = &self.entries;
        self.order.retain(|id| entries.contains_key(id));
        before - self.entries.len()
    }

    fn evict_oldest(&mut self) -> Option<SessionId> {
        let id = self.order.pop_front()?;
        self.entries.remove(&id);
        Some(id)
    }
}

/// Bounded, time-limited store of resumable sessions.
#[derive(Debug)]
pub struct SessionCache {
    name: String,
    enabled: bool,
    timeout: Duration,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl SessionCache {
    pub fn new(name: impl Into<String>, enabled: bool, timeout: Duration, capacity: usize) -> Self {
        Self {
            name: name.into(),
            enabled,
            timeout,
            capacity,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn from_config(config: &SessionCacheConfig) -> Self {
        Self::new(
            config.cache_name.clone(),
            config.enable_cache,
            config.session_timeout(),
            config.cache_size,
        )
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self::new("disabled", false, Duration::ZERO, 0)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().expect("session cache mutex poisoned")
    }

    /// Number of entries physically present, expired ones included.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> SessionCacheStats {
        let state = self.lock();
        SessionCacheStats {
            entries: state.entries.len(),
            ..state.stats
        }
    }

    /// Store a freshly negotiated session. Returns false when nothing was
    /// stored (caching disabled or zero capacity).
    pub fn store(&self, id: SessionId, state: Vec<u8>) -> bool {
        if !self.enabled || self.capacity == 0 {
            return false;
        }

        let now = Instant::now();
        let mut cache = self.lock();

        // A re-stored id replaces its entry and counts as newly created.
        let replaced = cache.remove(&id).is_some();
        if !replaced && cache.entries.len() >= self.capacity {
            let purged = cache.purge_expired(self.timeout, now);
            cache.stats.expired += purged as u64;

            while cache.entries.len() >= self.capacity {
                match cache.evict_oldest() {
                    Some(evicted) => {
                        cache.stats.evictions += 1;
                        tracing::debug!(cache = %self.name, session_id = %evicted, "Evicted oldest session");
                        metrics::record_session_event(&self.name, "evicted");
                    }
                    None => break,
                }
            }
        }

        tracing::trace!(cache = %self.name, session_id = %id, "Session stored");
        cache.order.push_back(id.clone());
        cache.entries.insert(
            id.clone(),
            CachedSession {
                id,
                state,
                created_at: now,
            },
        );
        cache.stats.stores += 1;
        metrics::record_session_event(&self.name, "stored");
        true
    }

    /// Look up a presented identifier, dropping it if expired.
    pub fn lookup(&self, id: &[u8]) -> SessionLookup {
        self.lookup_inner(id, false)
    }

    /// Look up a presented identifier and remove it (single-use resumption).
    pub fn take(&self, id: &[u8]) -> SessionLookup {
        self.lookup_inner(id, true)
    }

    fn lookup_inner(&self, id: &[u8], consume: bool) -> SessionLookup {
        if !self.enabled {
            return SessionLookup::Disabled;
        }

        let key = SessionId::from(id);
        let now = Instant::now();
        let mut cache = self.lock();

        let probe = cache
            .entries
            .get(&key)
            .map(|session| session.is_expired(self.timeout, now));
        let Some(expired) = probe else {
            cache.stats.misses += 1;
            drop(cache);
            metrics::record_session_event(&self.name, "miss");
            return SessionLookup::Miss;
        };

        if expired {
            cache.remove(&key);
            cache.stats.expired += 1;
            cache.stats.misses += 1;
            drop(cache);
            tracing::debug!(cache = %self.name, session_id = %key, "Presented session expired");
            metrics::record_session_event(&self.name, "expired");
            return SessionLookup::Expired;
        }

        let state = if consume {
            cache.remove(&key).map(|session| session.state)
        } else {
            cache.entries.get(&key).map(|session| session.state.clone())
        };
        cache.stats.hits += 1;
        drop(cache);
        metrics::record_session_event(&self.name, "hit");

        match state {
            Some(state) => SessionLookup::Resumable(state),
            None => SessionLookup::Miss,
        }
    }

    /// Invalidate every entry. Previously issued identifiers never resume.
    pub fn flush(&self) {
        let mut cache = self.lock();
        let dropped = cache.entries.len();
        cache.entries.clear();
        cache.order.clear();
        cache.stats.flushes += 1;
        drop(cache);

        tracing::info!(cache = %self.name, dropped, "Session cache flushed");
        metrics::record_session_event(&self.name, "flushed");
    }

    /// Remove all expired entries, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let mut cache = self.lock();
        let purged = cache.purge_expired(self.timeout, Instant::now());
        cache.stats.expired += purged as u64;
        purged
    }
}

/// Adapter exposing a [`SessionCache`] as the rustls server session store.
#[derive(Debug)]
pub struct CacheSessionStore {
    cache: Arc<SessionCache>,
}

impl CacheSessionStore {
    pub fn new(cache: Arc<SessionCache>) -> Self {
        Self { cache }
    }
}

impl StoresServerSessions for CacheSessionStore {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        self.cache.store(SessionId::from(key), value)
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.cache.lookup(key).into_state()
    }

    fn take(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.cache.take(key).into_state()
    }

    fn can_cache(&self) -> bool {
        self.cache.is_enabled() && self.cache.capacity() > 0
    }
}
