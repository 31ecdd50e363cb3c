//! In-memory profile cache with TTL expiry and LRU eviction.
//!
//! - Keys are normalized identities; lookups are case-insensitive.
//! - An entry is served only while `age < ttl`. Expired entries are removed
//!   on lookup (and handed back to the caller as `Lookup::Expired` so it can
//!   fall back to them) or by `evict_expired`.
//! - Once `age > ttl * refresh_threshold` a live entry is due for background
//!   refresh; see `revalidate`.
//! - Inserting an unseen key at capacity evicts the entry with the oldest
//!   `last_accessed`. Ties go to the lower access sequence number, so eviction
//!   order is deterministic.
//! - Every write stamps the entry with a new `version`. Writers that computed
//!   a profile from an older snapshot (background refresh, `update`) only
//!   replace the entry when its version is still the one they started from.
//!
//! All state sits behind one `parking_lot::Mutex` that is never held across
//! an `.await`. Replacement profiles are built before the lock is taken.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::timeline;
use crate::types::{CacheConfig, CustomerProfile, ProfilePatch};
use crate::util::normalize_identity;

/// A cached profile and its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub profile: Arc<CustomerProfile>,
    pub created_at: Instant,
    pub last_accessed: Instant,
    /// Wall-clock time the entry was written, for display.
    pub cached_at: DateTime<Utc>,
    pub access_count: u64,
    access_seq: u64,
    version: u64,
}

impl CacheEntry {
    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.created_at)
    }

    /// Changes on every write to this key; reads leave it alone.
    pub fn version(&self) -> u64 {
        self.version
    }
}

const UPDATE_ATTEMPTS: usize = 3;

/// Result of a counted lookup.
#[derive(Debug, Clone)]
pub enum Lookup {
    Hit(CacheEntry),
    /// Past its TTL. Already removed from the cache.
    Expired(CacheEntry),
    Miss,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    /// Percentage, 0–100.
    pub hit_rate: f64,
    pub size: usize,
    pub capacity: usize,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    hit_rate: f64,
    next_seq: u64,
}

impl CacheState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn record_hit(&mut self) {
        self.hits += 1;
        self.recompute_hit_rate();
    }

    fn record_miss(&mut self) {
        self.misses += 1;
        self.recompute_hit_rate();
    }

    fn recompute_hit_rate(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        };
    }

    fn lru_key(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| (e.last_accessed, e.access_seq))
            .map(|(k, _)| k.clone())
    }
}

pub struct ProfileCache {
    ttl: Duration,
    refresh_after: Duration,
    max_size: usize,
    state: Mutex<CacheState>,
}

impl ProfileCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            ttl: config.ttl(),
            refresh_after: config.refresh_after(),
            max_size: config.max_size.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    fn is_live(&self, entry: &CacheEntry) -> bool {
        entry.age() < self.ttl
    }

    /// Counted lookup. Live entries are touched; expired ones are removed and
    /// returned so the caller can still fall back to them.
    pub fn lookup(&self, identity: &str) -> Lookup {
        let key = normalize_identity(identity);
        let mut state = self.state.lock();

        let expired = match state.entries.get(&key) {
            None => {
                state.record_miss();
                return Lookup::Miss;
            }
            Some(entry) => !self.is_live(entry),
        };

        if expired {
            state.record_miss();
            return match state.entries.remove(&key) {
                Some(entry) => {
                    log::debug!("cache: {key} expired after {:?}", entry.age());
                    Lookup::Expired(entry)
                }
                None => Lookup::Miss,
            };
        }

        let seq = state.next_seq();
        state.record_hit();
        match state.entries.get_mut(&key) {
            Some(entry) => {
                entry.last_accessed = Instant::now();
                entry.access_seq = seq;
                entry.access_count += 1;
                Lookup::Hit(entry.clone())
            }
            None => Lookup::Miss,
        }
    }

    pub fn get(&self, identity: &str) -> Option<CacheEntry> {
        match self.lookup(identity) {
            Lookup::Hit(entry) => Some(entry),
            Lookup::Expired(_) | Lookup::Miss => None,
        }
    }

    /// True if a live entry exists. Does not count as a request or touch recency.
    pub fn has(&self, identity: &str) -> bool {
        let key = normalize_identity(identity);
        self.state
            .lock()
            .entries
            .get(&key)
            .is_some_and(|e| self.is_live(e))
    }

    /// Uncounted read of any entry, expired or not.
    pub fn peek(&self, identity: &str) -> Option<CacheEntry> {
        let key = normalize_identity(identity);
        self.state.lock().entries.get(&key).cloned()
    }

    /// Age of the entry for `identity`, expired or not.
    pub fn peek_age(&self, identity: &str) -> Option<Duration> {
        let key = normalize_identity(identity);
        self.state.lock().entries.get(&key).map(CacheEntry::age)
    }

    /// True once an entry is past the refresh threshold (it may still be live).
    pub fn is_refresh_due(&self, entry: &CacheEntry) -> bool {
        entry.age() > self.refresh_after
    }

    pub fn set(&self, identity: &str, profile: CustomerProfile) {
        self.set_shared(identity, Arc::new(profile));
    }

    pub fn set_shared(&self, identity: &str, profile: Arc<CustomerProfile>) {
        let key = normalize_identity(identity);
        let now = Instant::now();
        let mut state = self.state.lock();

        if !state.entries.contains_key(&key) && state.entries.len() >= self.max_size {
            if let Some(victim) = state.lru_key() {
                state.entries.remove(&victim);
                log::debug!("cache: evicted {victim} (capacity {})", self.max_size);
            }
        }

        let seq = state.next_seq();
        state.entries.insert(
            key,
            CacheEntry {
                profile,
                created_at: now,
                last_accessed: now,
                cached_at: Utc::now(),
                access_count: 0,
                access_seq: seq,
                version: seq,
            },
        );
    }

    /// Write `profile` as a fresh entry only if the entry for `identity` still
    /// has version `expected`. Returns false when the key was invalidated,
    /// evicted or rewritten in the meantime.
    pub fn replace_if_unchanged(
        &self,
        identity: &str,
        expected: u64,
        profile: CustomerProfile,
    ) -> bool {
        let key = normalize_identity(identity);
        let mut state = self.state.lock();
        let seq = state.next_seq();

        match state.entries.get_mut(&key) {
            Some(entry) if entry.version == expected => {
                let now = Instant::now();
                entry.profile = Arc::new(profile);
                entry.created_at = now;
                entry.last_accessed = now;
                entry.cached_at = Utc::now();
                entry.access_seq = seq;
                entry.version = seq;
                true
            }
            _ => false,
        }
    }

    /// Merge `patch` into a live entry in place. Returns false when there is
    /// no live entry for `identity`.
    ///
    /// The patched profile is built outside the lock from a snapshot; if the
    /// entry is rewritten before the patch lands, the patch is reapplied to the
    /// newer profile.
    pub fn update(&self, identity: &str, patch: ProfilePatch) -> bool {
        self.update_with(identity, &patch, || {})
    }

    fn update_with(
        &self,
        identity: &str,
        patch: &ProfilePatch,
        mut before_write: impl FnMut(),
    ) -> bool {
        let key = normalize_identity(identity);

        for _ in 0..UPDATE_ATTEMPTS {
            let Some(current) = self.peek(&key).filter(|e| self.is_live(e)) else {
                return false;
            };
            let profile = Arc::new(patched(&current.profile, patch));
            before_write();

            let mut state = self.state.lock();
            let seq = state.next_seq();
            match state.entries.get_mut(&key) {
                Some(entry) if entry.version == current.version && self.is_live(entry) => {
                    entry.profile = profile;
                    entry.last_accessed = Instant::now();
                    entry.access_seq = seq;
                    entry.version = seq;
                    return true;
                }
                Some(_) => log::debug!("cache: {key} rewritten during update, retrying"),
                None => return false,
            }
        }

        log::warn!("cache: gave up patching {key} after {UPDATE_ATTEMPTS} concurrent rewrites");
        false
    }

    pub fn invalidate(&self, identity: &str) -> bool {
        let key = normalize_identity(identity);
        self.state.lock().entries.remove(&key).is_some()
    }

    /// Empty the cache and reset all counters.
    pub fn clear(&self) {
        *self.state.lock() = CacheState::default();
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, e| e.age() < self.ttl);
        before - state.entries.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            total_requests: state.hits + state.misses,
            hit_rate: state.hit_rate,
            size: state.entries.len(),
            capacity: self.max_size,
        }
    }
}

fn patched(base: &CustomerProfile, patch: &ProfilePatch) -> CustomerProfile {
    let mut profile = base.clone();
    if let Some(contact) = &patch.contact {
        profile.contact = contact.clone();
    }
    if let Some(messages) = &patch.messages {
        profile.messages = messages.clone();
    }
    if let Some(meetings) = &patch.meetings {
        profile.meetings = meetings.clone();
    }
    if let Some(documents) = &patch.documents {
        profile.documents = documents.clone();
    }
    if patch.touches_records() {
        timeline::rebuild_profile(&mut profile, Utc::now());
    }
    profile
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{
        Contact, ContactPatch, ContactSource, ContactStatus, Direction, Importance, Message,
        ProfileMessage, ProfileStats,
    };

    pub(crate) fn profile(identity: &str) -> CustomerProfile {
        let now = Utc::now();
        CustomerProfile {
            identity: identity.to_lowercase(),
            contact: Contact {
                id: format!("id-{identity}"),
                name: crate::util::name_from_email(identity),
                email: identity.to_lowercase(),
                company: None,
                position: None,
                location: None,
                status: ContactStatus::Lead,
                tags: vec![],
                deal_value: 0.0,
                source: ContactSource::Email,
                avatar_url: None,
                created_at: now,
                updated_at: now,
            },
            messages: vec![],
            meetings: vec![],
            documents: vec![],
            interactions: vec![],
            stats: ProfileStats::default(),
            generated_at: now,
        }
    }

    fn cache(max_size: usize) -> ProfileCache {
        ProfileCache::new(&CacheConfig {
            ttl_ms: 300_000,
            max_size,
            refresh_threshold: 0.4,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_normalization() {
        let cache = cache(10);
        cache.set("Sarah@Acme.com", profile("sarah@acme.com"));

        let lower = cache.get("sarah@acme.com").expect("hit");
        let upper = cache.get("SARAH@ACME.COM").expect("hit");
        assert_eq!(lower.profile, upper.profile);
        assert_eq!(cache.len(), 1);
        assert!(cache.has(" sarah@ACME.com "));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_boundary() {
        let cache = cache(10);
        cache.set("a@x.com", profile("a@x.com"));

        tokio::time::advance(Duration::from_millis(299_999)).await;
        assert!(cache.get("a@x.com").is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!cache.has("a@x.com"));
        match cache.lookup("a@x.com") {
            Lookup::Expired(entry) => assert_eq!(entry.profile.identity, "a@x.com"),
            other => panic!("expected expired entry, got {other:?}"),
        }
        // Removed on expiry
        assert!(cache.is_empty());
        assert!(matches!(cache.lookup("a@x.com"), Lookup::Miss));

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_evicts_oldest_access() {
        let cache = cache(2);
        cache.set("a@x.com", profile("a@x.com"));
        cache.set("b@x.com", profile("b@x.com"));
        cache.set("c@x.com", profile("c@x.com"));

        assert!(!cache.has("a@x.com"));
        assert!(cache.has("b@x.com"));
        assert!(cache.has("c@x.com"));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_respects_reaccess() {
        let cache = cache(3);
        cache.set("a@x.com", profile("a@x.com"));
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.set("b@x.com", profile("b@x.com"));
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.set("c@x.com", profile("c@x.com"));
        tokio::time::advance(Duration::from_secs(1)).await;

        // a is the oldest insert but the most recent access
        assert!(cache.get("a@x.com").is_some());
        cache.set("d@x.com", profile("d@x.com"));

        assert!(cache.has("a@x.com"));
        assert!(!cache.has("b@x.com"));
        assert!(cache.has("c@x.com"));
        assert!(cache.has("d@x.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacing_existing_key_never_evicts() {
        let cache = cache(2);
        cache.set("a@x.com", profile("a@x.com"));
        cache.set("b@x.com", profile("b@x.com"));
        cache.set("A@x.com", profile("a@x.com"));
        assert!(cache.has("a@x.com"));
        assert!(cache.has("b@x.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_rate_arithmetic() {
        let cache = cache(10);
        assert_eq!(cache.stats().hit_rate, 0.0);

        cache.set("a@x.com", profile("a@x.com"));
        for _ in 0..3 {
            cache.get("a@x.com");
        }
        cache.get("missing@x.com");

        let stats = cache.stats();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_requests, 4);
        assert!((stats.hit_rate - 75.0).abs() < 1e-9);

        cache.clear();
        assert_eq!(cache.stats(), CacheStats { capacity: 10, ..CacheStats::default() });
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_due_and_peek_age() {
        let cache = cache(10);
        cache.set("a@x.com", profile("a@x.com"));

        tokio::time::advance(Duration::from_secs(60)).await;
        let entry = cache.get("a@x.com").unwrap();
        assert!(!cache.is_refresh_due(&entry));
        assert_eq!(cache.peek_age("A@X.COM"), Some(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(90)).await;
        let entry = cache.get("a@x.com").unwrap();
        assert!(cache.is_refresh_due(&entry));
        assert_eq!(cache.peek_age("nobody@x.com"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_merges_contact() {
        let cache = cache(10);
        cache.set("a@x.com", profile("a@x.com"));

        let mut contact = cache.peek("a@x.com").unwrap().profile.contact.clone();
        ContactPatch {
            status: Some(ContactStatus::Customer),
            ..ContactPatch::default()
        }
        .apply(&mut contact, Utc::now());

        assert!(cache.update("A@x.com", ProfilePatch::contact(contact)));
        let entry = cache.peek("a@x.com").unwrap();
        assert_eq!(entry.profile.contact.status, ContactStatus::Customer);

        // Absent key is a no-op
        assert!(!cache.update("b@x.com", ProfilePatch::default()));
        assert_eq!(cache.len(), 1);
        // Peek and update do not count as requests
        assert_eq!(cache.stats().total_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_rebuilds_timeline() {
        let cache = cache(10);
        cache.set("a@x.com", profile("a@x.com"));

        let message = ProfileMessage {
            message: Message {
                id: "m1".into(),
                thread_id: None,
                subject: "Pricing".into(),
                preview: String::new(),
                from: "a@x.com".into(),
                to: vec![],
                cc: vec![],
                received_at: Utc::now(),
                is_read: true,
                importance: Importance::High,
                has_attachments: false,
            },
            direction: Direction::Inbound,
        };
        assert!(cache.update(
            "a@x.com",
            ProfilePatch {
                messages: Some(vec![message]),
                ..ProfilePatch::default()
            }
        ));

        let entry = cache.peek("a@x.com").unwrap();
        assert_eq!(entry.profile.interactions.len(), 1);
        assert_eq!(entry.profile.stats.total_messages, 1);
        assert_eq!(entry.profile.stats.engagement_score, 40);
    }

    fn with_message(identity: &str, id: &str) -> CustomerProfile {
        let mut p = profile(identity);
        p.messages.push(ProfileMessage {
            message: Message {
                id: id.into(),
                thread_id: None,
                subject: "Renewal".into(),
                preview: String::new(),
                from: identity.into(),
                to: vec![],
                cc: vec![],
                received_at: Utc::now(),
                is_read: false,
                importance: Importance::Normal,
                has_attachments: false,
            },
            direction: Direction::Inbound,
        });
        p
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_reapplies_patch_after_concurrent_write() {
        let cache = cache(10);
        cache.set("a@x.com", profile("a@x.com"));

        let mut contact = profile("a@x.com").contact;
        contact.status = ContactStatus::Partner;

        let mut raced = false;
        let updated = cache.update_with("a@x.com", &ProfilePatch::contact(contact), || {
            if !raced {
                raced = true;
                cache.set("a@x.com", with_message("a@x.com", "fresh"));
            }
        });

        assert!(updated);
        let entry = cache.peek("a@x.com").unwrap();
        // Both the concurrent write and the patch survive
        assert_eq!(entry.profile.messages.len(), 1);
        assert_eq!(entry.profile.messages[0].message.id, "fresh");
        assert_eq!(entry.profile.contact.status, ContactStatus::Partner);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_dropped_when_invalidated_midway() {
        let cache = cache(10);
        cache.set("a@x.com", profile("a@x.com"));

        let updated = cache.update_with("a@x.com", &ProfilePatch::default(), || {
            cache.invalidate("a@x.com");
        });
        assert!(!updated);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_if_unchanged() {
        let cache = cache(10);
        cache.set("a@x.com", profile("a@x.com"));
        let started_from = cache.peek("a@x.com").unwrap().version();

        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(cache.replace_if_unchanged("A@x.com", started_from, with_message("a@x.com", "m1")));
        let entry = cache.peek("a@x.com").unwrap();
        assert_eq!(entry.profile.messages.len(), 1);
        assert_eq!(entry.age(), Duration::ZERO);

        // A stale version never overwrites
        assert!(!cache.replace_if_unchanged("a@x.com", started_from, profile("a@x.com")));
        assert_eq!(cache.peek("a@x.com").unwrap().profile.messages.len(), 1);

        // Nor does it resurrect an invalidated key
        let current = cache.peek("a@x.com").unwrap().version();
        cache.invalidate("a@x.com");
        assert!(!cache.replace_if_unchanged("a@x.com", current, profile("a@x.com")));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_does_not_change_version() {
        let cache = cache(10);
        cache.set("a@x.com", profile("a@x.com"));
        let before = cache.peek("a@x.com").unwrap().version();
        let hit = cache.get("a@x.com").unwrap();
        assert_eq!(hit.version(), before);
    }

    #[test]
    fn test_unsanitized_threshold_does_not_panic() {
        for threshold in [-1.0, f64::NAN, f64::INFINITY, 7.0] {
            let cache = ProfileCache::new(&CacheConfig {
                ttl_ms: 300_000,
                max_size: 10,
                refresh_threshold: threshold,
            });
            assert!(cache.refresh_after <= cache.ttl());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired_and_invalidate() {
        let cache = cache(10);
        cache.set("a@x.com", profile("a@x.com"));
        tokio::time::advance(Duration::from_secs(200)).await;
        cache.set("b@x.com", profile("b@x.com"));
        tokio::time::advance(Duration::from_secs(150)).await;

        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.has("b@x.com"));
        assert!(cache.invalidate("B@x.com"));
        assert!(!cache.invalidate("b@x.com"));
        assert!(cache.is_empty());
    }
}
