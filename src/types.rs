use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration stored in ~/.customer360/config.json
///
/// Every field is optional in the JSON; missing values fall back to the
/// defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub prefetch: PrefetchConfig,
    /// JSON fixtures backing the in-memory sources (CLI only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixtures_path: Option<String>,
}

impl Config {
    /// Clamp out-of-range values to something the cache can run with.
    pub fn sanitized(mut self) -> Self {
        if !(self.cache.refresh_threshold > 0.0 && self.cache.refresh_threshold < 1.0) {
            log::warn!(
                "refreshThreshold {} outside (0, 1), using {}",
                self.cache.refresh_threshold,
                default_refresh_threshold()
            );
            self.cache.refresh_threshold = default_refresh_threshold();
        }
        if self.cache.max_size == 0 {
            log::warn!("cache maxSize 0 is not usable, using 1");
            self.cache.max_size = 1;
        }
        if self.cache.ttl_ms == 0 {
            log::warn!("cache ttlMs 0 is not usable, using {}", default_ttl_ms());
            self.cache.ttl_ms = default_ttl_ms();
        }
        if self.prefetch.batch_size == 0 {
            self.prefetch.batch_size = 1;
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Fraction of the TTL after which a hit schedules a background refresh.
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            max_size: default_max_size(),
            refresh_threshold: default_refresh_threshold(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// `ttl * refresh_threshold`. A threshold outside [0, 1] is clamped and a
    /// non-finite one falls back to the default.
    pub fn refresh_after(&self) -> Duration {
        let threshold = if self.refresh_threshold.is_finite() {
            self.refresh_threshold.clamp(0.0, 1.0)
        } else {
            default_refresh_threshold()
        };
        self.ttl().mul_f64(threshold)
    }
}

fn default_ttl_ms() -> u64 {
    5 * 60 * 1000
}

fn default_max_size() -> usize {
    50
}

fn default_refresh_threshold() -> f64 {
    0.4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchConfig {
    /// Budget for every guarded upstream call.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    2_500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
        }
    }
}

impl PrefetchConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

fn default_batch_size() -> usize {
    3
}

fn default_batch_delay_ms() -> u64 {
    200
}

// =============================================================================
// Contacts
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    #[default]
    Lead,
    Prospect,
    Customer,
    Partner,
    Inactive,
    Churned,
}

/// Which upstream produced a contact record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactSource {
    /// Existing record found in the contact store.
    Crm,
    /// Created from directory enrichment.
    Directory,
    /// Synthesized from the email address alone.
    Email,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub status: ContactStatus,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub deal_value: f64,
    pub source: ContactSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a contact that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContact {
    pub name: String,
    pub email: String,
    pub company: Option<String>,
    pub position: Option<String>,
    pub location: Option<String>,
    pub status: ContactStatus,
    pub tags: Vec<String>,
    pub deal_value: f64,
    pub source: ContactSource,
    pub avatar_url: Option<String>,
}

impl NewContact {
    /// Materialize without a store round-trip, using `id`.
    pub fn into_contact(self, id: String, now: DateTime<Utc>) -> Contact {
        Contact {
            id,
            name: self.name,
            email: self.email,
            company: self.company,
            position: self.position,
            location: self.location,
            status: self.status,
            tags: crate::util::dedupe_tags(&self.tags),
            deal_value: self.deal_value,
            source: self.source,
            avatar_url: self.avatar_url,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial edit of a contact. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub status: Option<ContactStatus>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub deal_value: Option<f64>,
}

impl ContactPatch {
    pub fn apply(&self, contact: &mut Contact, now: DateTime<Utc>) {
        if let Some(ref name) = self.name {
            contact.name = name.clone();
        }
        if let Some(ref company) = self.company {
            contact.company = Some(company.clone());
        }
        if let Some(ref position) = self.position {
            contact.position = Some(position.clone());
        }
        if let Some(ref location) = self.location {
            contact.location = Some(location.clone());
        }
        if let Some(status) = self.status {
            contact.status = status;
        }
        if let Some(ref tags) = self.tags {
            contact.tags = crate::util::dedupe_tags(tags);
        }
        if let Some(deal_value) = self.deal_value {
            contact.deal_value = deal_value;
        }
        contact.updated_at = now;
    }
}

/// Enrichment returned by a directory lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryProfile {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl DirectoryProfile {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none()
            && self.company.is_none()
            && self.job_title.is_none()
            && self.location.is_none()
    }
}

// =============================================================================
// Upstream records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub subject: String,
    #[serde(default)]
    pub preview: String,
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub importance: Importance,
    #[serde(default)]
    pub has_attachments: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A message as it appears in a profile, tagged with its direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileMessage {
    #[serde(flatten)]
    pub message: Message,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meeting {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attendees: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub shared_with: Vec<String>,
    pub shared_at: DateTime<Utc>,
}

// =============================================================================
// Timeline
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionKind {
    Message,
    Meeting,
    Document,
    Call,
}

/// Kind-specific interaction metadata, tagged by `kind` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InteractionDetails {
    #[serde(rename_all = "camelCase")]
    Message {
        direction: Direction,
        has_attachments: bool,
        is_read: bool,
    },
    #[serde(rename_all = "camelCase")]
    Meeting {
        attendee_count: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_minutes: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    Document {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Call { duration_seconds: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub id: String,
    pub title: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub importance: Importance,
    #[serde(flatten)]
    pub details: InteractionDetails,
}

impl Interaction {
    pub fn kind(&self) -> InteractionKind {
        match self.details {
            InteractionDetails::Message { .. } => InteractionKind::Message,
            InteractionDetails::Meeting { .. } => InteractionKind::Meeting,
            InteractionDetails::Document { .. } => InteractionKind::Document,
            InteractionDetails::Call { .. } => InteractionKind::Call,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileStats {
    pub total_messages: usize,
    pub total_meetings: usize,
    pub total_documents: usize,
    pub total_calls: usize,
    pub total_interactions: usize,
    pub inbound_messages: usize,
    pub outbound_messages: usize,
    pub unread_messages: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_interaction: Option<DateTime<Utc>>,
    /// 0–100
    pub engagement_score: u8,
    pub response_time: String,
}

// =============================================================================
// Profile
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerProfile {
    pub identity: String,
    pub contact: Contact,
    pub messages: Vec<ProfileMessage>,
    pub meetings: Vec<Meeting>,
    pub documents: Vec<Document>,
    pub interactions: Vec<Interaction>,
    pub stats: ProfileStats,
    pub generated_at: DateTime<Utc>,
}

/// Partial profile merged into a cached entry without re-aggregating.
#[derive(Debug, Clone, Default)]
pub struct ProfilePatch {
    pub contact: Option<Contact>,
    pub messages: Option<Vec<ProfileMessage>>,
    pub meetings: Option<Vec<Meeting>>,
    pub documents: Option<Vec<Document>>,
}

impl ProfilePatch {
    pub fn contact(contact: Contact) -> Self {
        Self {
            contact: Some(contact),
            ..Self::default()
        }
    }

    /// True when the patch replaces a record list and the timeline must be rebuilt.
    pub fn touches_records(&self) -> bool {
        self.messages.is_some() || self.meetings.is_some() || self.documents.is_some()
    }
}

/// How current a served profile is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Aggregated for this request.
    Fresh,
    /// Served from a live cache entry.
    Cached,
    /// Upstream failed; served from an entry past its refresh point or TTL.
    Stale,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileResponse {
    pub profile: CustomerProfile,
    pub from_cache: bool,
    pub freshness: Freshness,
    /// A background refresh was scheduled by this request.
    pub refreshing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}
