//! TTL-backed store for scope definitions and computed frames.
//!
//! The store is the single point of shared mutable state between the
//! processor (writer, via the frame computer) and the API layer (reader).
//! Every entry carries an absolute expiry computed at write time; expiry is
//! checked lazily on read, so an expired entry is observationally identical
//! to one that was never written.
//!
//! # Design
//!
//! The [`ScopeStore`] trait is the seam between the pipeline and the
//! backend. The in-memory implementation cannot fail, but the trait returns
//! `Result` so degraded backends (and tests) can surface write errors where
//! the frame computer collects them per scope.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use crate::model::{ScopeDefinition, ScopedTrainsFrame};

/// Errors raised by store backends.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Backend could not complete the operation.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Key-value storage for scopes and frames with per-entry TTL.
///
/// Implementations must be `Send + Sync`; the processor and the API layer
/// share one instance across tasks.
pub trait ScopeStore: Send + Sync {
    /// Store a scope definition under `id`, replacing any prior entry and
    /// resetting its TTL from now.
    fn upsert_scope(
        &self,
        id: &str,
        def: ScopeDefinition,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Fetch a scope definition. Expired entries read as absent.
    fn get_scope(&self, id: &str) -> Result<Option<ScopeDefinition>, StoreError>;

    /// Store a computed frame under `id`, superseding any prior frame and
    /// resetting its TTL from now.
    fn set_frame(
        &self,
        id: &str,
        frame: ScopedTrainsFrame,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Fetch the latest frame for a scope. Expired entries read as absent.
    fn get_frame(&self, id: &str) -> Result<Option<ScopedTrainsFrame>, StoreError>;

    /// Visit every non-expired scope definition.
    fn for_each_active_scope(
        &self,
        f: &mut dyn FnMut(&ScopeDefinition),
    ) -> Result<(), StoreError>;
}

/// Entry wrapper carrying an absolute expiry timestamp.
#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-memory [`ScopeStore`] backed by concurrent maps.
///
/// Nothing survives restart; the TTL store and per-city vehicle maps are
/// process-local by design.
#[derive(Debug, Default)]
pub struct MemoryScopeStore {
    scopes: DashMap<String, Expiring<ScopeDefinition>>,
    frames: DashMap<String, Expiring<ScopedTrainsFrame>>,
}

impl MemoryScopeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of scope entries still resident, expired or not.
    pub fn resident_scopes(&self) -> usize {
        self.scopes.len()
    }

    /// Remove expired entries from both maps.
    ///
    /// Purely a memory-growth bound: read semantics are identical whether or
    /// not this ever runs. Returns the number of entries removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.scopes.len() + self.frames.len();
        self.scopes.retain(|_, entry| !entry.is_expired(now));
        self.frames.retain(|_, entry| !entry.is_expired(now));
        let removed = before - (self.scopes.len() + self.frames.len());
        if removed > 0 {
            debug!(removed, "purged expired store entries");
        }
        removed
    }
}

impl ScopeStore for MemoryScopeStore {
    fn upsert_scope(
        &self,
        id: &str,
        def: ScopeDefinition,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.scopes.insert(id.to_string(), Expiring::new(def, ttl));
        Ok(())
    }

    fn get_scope(&self, id: &str) -> Result<Option<ScopeDefinition>, StoreError> {
        let now = Instant::now();
        Ok(self
            .scopes
            .get(id)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone()))
    }

    fn set_frame(
        &self,
        id: &str,
        frame: ScopedTrainsFrame,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.frames.insert(id.to_string(), Expiring::new(frame, ttl));
        Ok(())
    }

    fn get_frame(&self, id: &str) -> Result<Option<ScopedTrainsFrame>, StoreError> {
        let now = Instant::now();
        Ok(self
            .frames
            .get(id)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone()))
    }

    fn for_each_active_scope(
        &self,
        f: &mut dyn FnMut(&ScopeDefinition),
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        for entry in self.scopes.iter() {
            if !entry.is_expired(now) {
                f(&entry.value);
            }
        }
        Ok(())
    }
}
