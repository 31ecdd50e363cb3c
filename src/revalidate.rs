//! Stale-while-revalidate profile service.
//!
//! Request handling:
//! - `force_refresh`: aggregate now, overwrite the cache.
//! - Live cache hit: serve immediately. Past the refresh threshold, also
//!   start a background aggregation that overwrites the entry on success.
//! - Miss or hard expiry: aggregate synchronously and cache the result.
//! - Upstream failure: serve whatever entry still exists (even expired) as
//!   `Freshness::Stale` with a warning; fail only when there is nothing.
//!
//! Background refreshes are tracked per identity so concurrent near-expiry
//! hits never start a second refresh for the same key. A refresh only writes
//! over the exact entry version it was started for; invalidating or deleting
//! an identity also aborts its refresh.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::aggregator::ProfileLoader;
use crate::cache::{CacheEntry, CacheStats, Lookup, ProfileCache};
use crate::error::ProfileError;
use crate::latency::{LatencyRecorder, LatencySnapshot};
use crate::prefetch::{self, PrefetchReport};
use crate::sources::ContactStore;
use crate::types::{
    Contact, ContactPatch, CustomerProfile, Freshness, PrefetchConfig, ProfilePatch,
    ProfileResponse,
};
use crate::util;

/// In-flight background refreshes keyed by identity.
#[derive(Default)]
struct RefreshRegistry {
    next_id: AtomicU64,
    tasks: DashMap<String, (u64, JoinHandle<()>)>,
}

impl RefreshRegistry {
    /// Spawn `refresh` for `key` unless one is already running. The shard lock
    /// is held across spawn + insert, so the task's own removal cannot run
    /// before its handle is registered.
    fn try_spawn<F>(self: &Arc<Self>, key: &str, refresh: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(self);
        let owned_key = key.to_string();

        let slot = match self.tasks.entry(key.to_string()) {
            Entry::Occupied(entry) if !entry.get().1.is_finished() => return false,
            slot => slot,
        };

        let handle = tokio::spawn(async move {
            refresh.await;
            registry.tasks.remove_if(&owned_key, |_, (task_id, _)| *task_id == id);
        });

        match slot {
            Entry::Occupied(mut entry) => {
                entry.insert((id, handle));
            }
            Entry::Vacant(entry) => {
                entry.insert((id, handle));
            }
        }
        true
    }

    /// Abort the refresh for `key`, if any. Returns true if one was running.
    fn cancel(&self, key: &str) -> bool {
        match self.tasks.remove(key) {
            Some((_, (_, handle))) => {
                let running = !handle.is_finished();
                handle.abort();
                running
            }
            None => false,
        }
    }

    fn in_flight(&self) -> usize {
        self.tasks.iter().filter(|t| !t.value().1.is_finished()).count()
    }

    fn contains(&self, key: &str) -> bool {
        self.tasks.get(key).is_some_and(|t| !t.value().1.is_finished())
    }

    async fn drain(&self) {
        let keys: Vec<String> = self.tasks.iter().map(|t| t.key().clone()).collect();
        for key in keys {
            if let Some((_, (_, handle))) = self.tasks.remove(&key) {
                if let Err(e) = handle.await {
                    log::warn!("Background refresh for {key} ended abnormally: {e}");
                }
            }
        }
    }
}

pub struct ProfileService {
    cache: Arc<ProfileCache>,
    loader: Arc<dyn ProfileLoader>,
    contacts: Arc<dyn ContactStore>,
    latency: Arc<LatencyRecorder>,
    prefetch: PrefetchConfig,
    refreshes: Arc<RefreshRegistry>,
}

impl ProfileService {
    pub fn new(
        cache: Arc<ProfileCache>,
        loader: Arc<dyn ProfileLoader>,
        contacts: Arc<dyn ContactStore>,
        latency: Arc<LatencyRecorder>,
        prefetch: PrefetchConfig,
    ) -> Self {
        Self {
            cache,
            loader,
            contacts,
            latency,
            prefetch,
            refreshes: Arc::new(RefreshRegistry::default()),
        }
    }

    pub fn cache(&self) -> &Arc<ProfileCache> {
        &self.cache
    }

    pub async fn get_profile(
        &self,
        identity: &str,
        force_refresh: bool,
    ) -> Result<ProfileResponse, ProfileError> {
        let key = util::validate_identity(identity)?;

        if force_refresh {
            return match self.loader.load(&key).await {
                Ok(profile) => Ok(self.store_fresh(&key, profile)),
                Err(e) => {
                    let fallback = self.cache.peek(&key);
                    self.fall_back(&key, fallback, e)
                }
            };
        }

        let expired = match self.cache.lookup(&key) {
            Lookup::Hit(entry) => {
                let refreshing =
                    self.cache.is_refresh_due(&entry) && self.spawn_refresh(&key, entry.version());
                return Ok(ProfileResponse {
                    profile: (*entry.profile).clone(),
                    from_cache: true,
                    freshness: Freshness::Cached,
                    refreshing,
                    warning: None,
                });
            }
            Lookup::Expired(entry) => Some(entry),
            Lookup::Miss => None,
        };

        match self.loader.load(&key).await {
            Ok(profile) => Ok(self.store_fresh(&key, profile)),
            Err(e) => self.fall_back(&key, expired, e),
        }
    }

    fn store_fresh(&self, key: &str, profile: CustomerProfile) -> ProfileResponse {
        let shared = Arc::new(profile);
        self.cache.set_shared(key, shared.clone());
        ProfileResponse {
            profile: Arc::unwrap_or_clone(shared),
            from_cache: false,
            freshness: Freshness::Fresh,
            refreshing: false,
            warning: None,
        }
    }

    fn fall_back(
        &self,
        key: &str,
        entry: Option<CacheEntry>,
        error: ProfileError,
    ) -> Result<ProfileResponse, ProfileError> {
        let Some(entry) = entry else {
            log::warn!("Profile load failed for {key} with nothing cached: {error}");
            return Err(error);
        };

        log::warn!(
            "Profile load failed for {key}, serving data cached {} ago: {error}",
            humanize(entry.age())
        );
        Ok(ProfileResponse {
            profile: (*entry.profile).clone(),
            from_cache: true,
            freshness: Freshness::Stale,
            refreshing: false,
            warning: Some(format!(
                "Showing data from {} ago; refresh failed: {}",
                humanize(entry.age()),
                error
            )),
        })
    }

    /// Start a background refresh for `key` unless one is already running.
    /// The result replaces the entry only while it is still at `version`.
    fn spawn_refresh(&self, key: &str, version: u64) -> bool {
        let loader = self.loader.clone();
        let cache = self.cache.clone();
        let owned_key = key.to_string();

        let started = self.refreshes.try_spawn(key, async move {
            match loader.load(&owned_key).await {
                Ok(profile) => {
                    if cache.replace_if_unchanged(&owned_key, version, profile) {
                        log::debug!("Background refresh for {owned_key} complete");
                    } else {
                        log::debug!(
                            "Background refresh for {owned_key} discarded; entry changed meanwhile"
                        );
                    }
                }
                Err(e) => log::warn!("Background refresh for {owned_key} failed: {e}"),
            }
        });

        if started {
            log::debug!("Scheduled background refresh for {key}");
        }
        started
    }

    pub fn refreshes_in_flight(&self) -> usize {
        self.refreshes.in_flight()
    }

    pub fn is_refreshing(&self, identity: &str) -> bool {
        self.refreshes.contains(&util::normalize_identity(identity))
    }

    /// Wait for every background refresh started so far.
    pub async fn wait_for_refreshes(&self) {
        self.refreshes.drain().await;
    }

    /// Edit the stored contact and reflect it in the cached profile without
    /// re-aggregating.
    pub async fn edit_contact(
        &self,
        identity: &str,
        patch: ContactPatch,
    ) -> Result<Contact, ProfileError> {
        let key = util::validate_identity(identity)?;
        let contact = self.find_contact(&key).await?;

        let updated = self
            .contacts
            .update(&contact.id, patch)
            .await
            .map_err(|e| ProfileError::SourceUnavailable {
                label: "contact_write".to_string(),
                message: e.to_string(),
            })?;

        if self.cache.update(&key, ProfilePatch::contact(updated.clone())) {
            log::debug!("Cached profile for {key} updated in place");
        }
        Ok(updated)
    }

    /// Delete the stored contact and drop the cached profile.
    pub async fn delete_contact(&self, identity: &str) -> Result<(), ProfileError> {
        let key = util::validate_identity(identity)?;
        let contact = self.find_contact(&key).await?;

        // A refresh still running would search, miss, and recreate the contact
        if self.refreshes.cancel(&key) {
            log::debug!("Aborted background refresh for deleted contact {key}");
        }
        self.contacts
            .delete(&contact.id)
            .await
            .map_err(|e| ProfileError::SourceUnavailable {
                label: "contact_write".to_string(),
                message: e.to_string(),
            })?;
        self.cache.invalidate(&key);
        Ok(())
    }

    async fn find_contact(&self, key: &str) -> Result<Contact, ProfileError> {
        let candidates = self
            .contacts
            .search_by_identity(key)
            .await
            .map_err(|e| ProfileError::SourceUnavailable {
                label: "contact_search".to_string(),
                message: e.to_string(),
            })?;

        candidates
            .into_iter()
            .find(|c| util::normalize_identity(&c.email) == key)
            .ok_or_else(|| ProfileError::NotFound(key.to_string()))
    }

    pub fn invalidate(&self, identity: &str) -> bool {
        self.refreshes.cancel(&util::normalize_identity(identity));
        self.cache.invalidate(identity)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn source_latency(&self) -> LatencySnapshot {
        self.latency.snapshot()
    }

    /// How long ago the cached profile for `identity` was built.
    pub fn profile_age(&self, identity: &str) -> Option<Duration> {
        self.cache.peek_age(identity)
    }

    /// Warm the cache for `identities` using this service's loader.
    pub async fn prefetch(&self, identities: &[String]) -> PrefetchReport {
        let evicted = self.cache.evict_expired();
        if evicted > 0 {
            log::debug!("Dropped {evicted} expired profiles before prefetch");
        }
        let loader = self.loader.clone();
        prefetch::prefetch(&self.cache, identities, &self.prefetch, move |identity| {
            let loader = loader.clone();
            async move { loader.load(&identity).await }
        })
        .await
    }
}

fn humanize(age: Duration) -> String {
    let secs = age.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3_600 {
        format!("{}m", secs / 60)
    } else {
        format!("{}h", secs / 3_600)
    }
}
