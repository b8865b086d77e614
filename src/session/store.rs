//! Session store
//!
//! Active sessions live in a per-owner LRU cache capped at
//! `max_active_per_user`; sessions past their `expires_at` are evicted on
//! every lookup. With a durable backend configured, sessions missing from
//! the cache are loaded from it and every `save` is written through.
//!
//! Session ids are owner-scoped: an id cached or stored for one owner is
//! refused to every other owner.
//!
//! Each session sits behind its own async mutex, so mutations on one
//! session never interleave while distinct sessions proceed independently.

use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;

use crate::core::{Config, QuillError, Result};
use crate::session::backend::SessionBackend;
use crate::session::state::Session;

/// Owner used when the caller does not name one
pub const DEFAULT_OWNER: &str = "local";

/// Shared, serialized access to one session
pub type SessionHandle = Arc<tokio::sync::Mutex<Session>>;

struct CachedSession {
    handle: SessionHandle,
    expires_at: DateTime<Utc>,
}

type ActiveCache = HashMap<String, LruCache<String, CachedSession>>;

/// Process-wide session registry
pub struct SessionStore {
    active: Mutex<ActiveCache>,
    ttl: Duration,
    max_per_user: NonZeroUsize,
    backend: Option<Arc<dyn SessionBackend>>,
}

impl SessionStore {
    /// Memory-only store
    pub fn new(ttl: Duration, max_per_user: usize) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            ttl,
            max_per_user: NonZeroUsize::new(max_per_user).unwrap_or(NonZeroUsize::MIN),
            backend: None,
        }
    }

    /// Store configured from the `session` section (memory only)
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.session_ttl(), config.session.max_active_per_user)
    }

    /// Write sessions through to `backend`
    pub fn with_backend(mut self, backend: Arc<dyn SessionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn active(&self) -> MutexGuard<'_, ActiveCache> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Session `id` for the default owner
    pub async fn get_or_create(&self, id: &str) -> Result<SessionHandle> {
        self.get_or_create_for(DEFAULT_OWNER, id).await
    }

    /// Cached session, else durable snapshot, else a fresh session
    pub async fn get_or_create_for(&self, owner: &str, id: &str) -> Result<SessionHandle> {
        let evicted = self.evict_expired();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted expired sessions");
        }

        if let Some(handle) = self.cached(owner, id)? {
            return Ok(handle);
        }

        if let Some(backend) = &self.backend {
            match backend.load(id).await? {
                Some(session) if !session.is_expired(Utc::now()) => {
                    if session.owner != owner {
                        tracing::warn!(session = %id, owner, "stored session belongs to another owner");
                        return Err(QuillError::session_owner(id, owner));
                    }
                    tracing::debug!(session = %id, "session restored from storage");
                    return self.admit(session);
                }
                Some(_) => {
                    tracing::info!(session = %id, "stored session expired, starting fresh");
                    if let Err(e) = backend.remove(id).await {
                        tracing::warn!(session = %id, error = %e, "failed to remove expired snapshot");
                    }
                }
                None => {}
            }
        }

        tracing::info!(session = %id, owner, "creating session");
        self.admit(Session::new(id, owner, self.ttl))
    }

    /// Unexpired handle from `owner`'s cache, refreshing its LRU position
    fn cached(&self, owner: &str, id: &str) -> Result<Option<SessionHandle>> {
        let now = Utc::now();
        let mut active = self.active();

        if active
            .iter()
            .any(|(other, cache)| other != owner && cache.contains(id))
        {
            return Err(QuillError::session_owner(id, owner));
        }

        Ok(active
            .get_mut(owner)
            .and_then(|cache| cache.get(id))
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.handle.clone()))
    }

    /// Put a session in its owner's cache; a concurrently admitted copy wins
    fn admit(&self, session: Session) -> Result<SessionHandle> {
        let mut active = self.active();

        if active
            .iter()
            .any(|(owner, cache)| *owner != session.owner && cache.contains(&session.id))
        {
            return Err(QuillError::session_owner(&session.id, &session.owner));
        }

        let id = session.id.clone();
        let owner = session.owner.clone();
        let expires_at = session.expires_at;

        let cache = active
            .entry(owner.clone())
            .or_insert_with(|| LruCache::new(self.max_per_user));

        if let Some(existing) = cache.get(&id) {
            return Ok(existing.handle.clone());
        }

        let handle = Arc::new(tokio::sync::Mutex::new(session));
        if let Some((evicted, _)) = cache.push(
            id.clone(),
            CachedSession {
                handle: handle.clone(),
                expires_at,
            },
        ) {
            if evicted != id {
                tracing::debug!(owner = %owner, session = %evicted, "active session cap reached, evicted");
            }
        }

        Ok(handle)
    }

    /// Ids of every cached or stored session, sorted
    pub async fn list(&self) -> Result<Vec<String>> {
        self.evict_expired();
        let mut ids: BTreeSet<String> = self
            .active()
            .values()
            .flat_map(|cache| cache.iter().map(|(id, _)| id.clone()))
            .collect();

        if let Some(backend) = &self.backend {
            ids.extend(backend.list().await?);
        }
        Ok(ids.into_iter().collect())
    }

    /// Forget session `id` in the cache and in durable storage.
    /// Returns whether it existed in either.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let cached = {
            let mut active = self.active();
            let mut found = false;
            for cache in active.values_mut() {
                found |= cache.pop(id).is_some();
            }
            active.retain(|_, cache| !cache.is_empty());
            found
        };

        let stored = match &self.backend {
            Some(backend) => backend.remove(id).await?,
            None => false,
        };

        if cached || stored {
            tracing::info!(session = %id, "session removed");
        }
        Ok(cached || stored)
    }

    /// Persist `session` and refresh its cached expiry
    pub async fn save(&self, session: &Session) -> Result<()> {
        {
            let mut active = self.active();
            if let Some(entry) = active
                .get_mut(&session.owner)
                .and_then(|cache| cache.peek_mut(&session.id))
            {
                entry.expires_at = session.expires_at;
            }
        }

        if let Some(backend) = &self.backend {
            backend.store(session).await?;
        }
        Ok(())
    }

    /// Drop every cached session whose `expires_at` has passed
    pub fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let mut active = self.active();
        let mut evicted = 0;

        for cache in active.values_mut() {
            let expired: Vec<String> = cache
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                cache.pop(&id);
                evicted += 1;
            }
        }

        active.retain(|_, cache| !cache.is_empty());
        evicted
    }

    /// Number of sessions currently cached for `owner`
    pub fn active_count(&self, owner: &str) -> usize {
        self.active().get(owner).map_or(0, |cache| cache.len())
    }
}
