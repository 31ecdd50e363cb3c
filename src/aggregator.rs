//! Multi-source profile aggregation.
//!
//! Resolves (or creates) the contact for an identity, then fans out to every
//! history source at once. Each upstream call is timeout-guarded; a failing
//! source contributes an empty list instead of failing the profile. Only a
//! malformed identity or a contact that cannot even be synthesized aborts.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use crate::error::ProfileError;
use crate::fetch;
use crate::latency::{CallOutcome, LatencyRecorder};
use crate::sources::{SourceError, SourceKind, Sources};
use crate::timeline;
use crate::types::{
    Contact, ContactSource, ContactStatus, CustomerProfile, DirectoryProfile, Direction,
    FetchConfig, Message, NewContact, ProfileMessage,
};
use crate::util::{self, extract_address};

/// Anything that can produce a full profile for an identity.
#[async_trait]
pub trait ProfileLoader: Send + Sync {
    async fn load(&self, identity: &str) -> Result<CustomerProfile, ProfileError>;
}

pub struct Aggregator {
    sources: Sources,
    budget: Duration,
    latency: Arc<LatencyRecorder>,
}

impl Aggregator {
    pub fn new(sources: Sources, fetch: &FetchConfig, latency: Arc<LatencyRecorder>) -> Self {
        Self {
            sources,
            budget: fetch.timeout(),
            latency,
        }
    }

    pub async fn aggregate(&self, identity: &str) -> Result<CustomerProfile, ProfileError> {
        let identity = util::validate_identity(identity)?;
        let started = Instant::now();

        let contact = self.resolve_contact(&identity).await?;

        let (sent, mentioned, meetings, documents) = tokio::join!(
            self.fetch_or_empty(SourceKind::MessagesFrom, {
                let source = self.sources.messages.clone();
                let identity = identity.clone();
                async move { source.messages_from(&identity).await }
            }),
            self.fetch_or_empty(SourceKind::MessageSearch, {
                let source = self.sources.messages.clone();
                let identity = identity.clone();
                async move { source.search_messages(&identity).await }
            }),
            self.fetch_or_empty(SourceKind::Meetings, {
                let source = self.sources.meetings.clone();
                let identity = identity.clone();
                async move { source.meetings_involving(&identity).await }
            }),
            self.fetch_or_empty(SourceKind::Documents, {
                let source = self.sources.documents.clone();
                let identity = identity.clone();
                async move { source.documents_shared_with(&identity).await }
            }),
        );

        let messages = merge_messages(&identity, sent, mentioned);
        let now = Utc::now();
        let timeline = timeline::build(&messages, &meetings, &documents, now);

        log::info!(
            "Aggregated {}: {} messages, {} meetings, {} documents in {} ms",
            identity,
            messages.len(),
            meetings.len(),
            documents.len(),
            started.elapsed().as_millis()
        );

        Ok(CustomerProfile {
            identity,
            contact,
            messages,
            meetings,
            documents,
            interactions: timeline.interactions,
            stats: timeline.stats,
            generated_at: now,
        })
    }

    /// Find the stored contact for `identity`, or synthesize and persist one.
    async fn resolve_contact(&self, identity: &str) -> Result<Contact, ProfileError> {
        let search = {
            let store = self.sources.contacts.clone();
            let identity = identity.to_string();
            self.guarded(SourceKind::ContactSearch, async move {
                store.search_by_identity(&identity).await
            })
            .await
        };

        let search_ok = match search {
            Ok(candidates) => {
                if let Some(existing) = candidates
                    .into_iter()
                    .find(|c| util::normalize_identity(&c.email) == identity)
                {
                    return Ok(existing);
                }
                true
            }
            Err(e) => {
                log::warn!("Contact search failed for {identity}: {e}");
                false
            }
        };

        let enrichment = {
            let directory = self.sources.directory.clone();
            let address = identity.to_string();
            match self
                .guarded(SourceKind::Directory, async move {
                    directory.lookup(&address).await
                })
                .await
            {
                Ok(profile) => profile,
                Err(e) => {
                    log::debug!("Directory enrichment unavailable for {identity}: {e}");
                    None
                }
            }
        };

        let draft = synthesize_contact(identity, enrichment.as_ref())
            .ok_or_else(|| ProfileError::NotFound(identity.to_string()))?;

        // A failed search may just be a slow store; creating now could duplicate
        // a record that already exists.
        if !search_ok {
            return Ok(draft.into_contact(util::person_id_from_email(identity), Utc::now()));
        }

        let store = self.sources.contacts.clone();
        let new_contact = draft.clone();
        match self
            .guarded(SourceKind::ContactWrite, async move {
                store.create(new_contact).await
            })
            .await
        {
            Ok(created) => {
                log::info!("Created contact {} for {}", created.id, identity);
                Ok(created)
            }
            Err(e) => {
                log::warn!("Could not persist contact for {identity}, using unsaved: {e}");
                Ok(draft.into_contact(util::person_id_from_email(identity), Utc::now()))
            }
        }
    }

    async fn guarded<T, F>(&self, kind: SourceKind, operation: F) -> Result<T, ProfileError>
    where
        F: Future<Output = Result<T, SourceError>> + Send + 'static,
        T: Send + 'static,
    {
        let started = Instant::now();
        let result = fetch::guard(operation, self.budget, kind.label()).await;
        self.latency
            .record(kind, started.elapsed(), CallOutcome::of(&result));
        result
    }

    async fn fetch_or_empty<T, F>(&self, kind: SourceKind, operation: F) -> Vec<T>
    where
        F: Future<Output = Result<Vec<T>, SourceError>> + Send + 'static,
        T: Send + 'static,
    {
        match self.guarded(kind, operation).await {
            Ok(records) => records,
            Err(e) => {
                log::warn!("{}: degraded to empty result: {}", kind.label(), e);
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl ProfileLoader for Aggregator {
    async fn load(&self, identity: &str) -> Result<CustomerProfile, ProfileError> {
        self.aggregate(identity).await
    }
}

/// Build a contact from directory enrichment, falling back to what the
/// address itself says. `None` when not even a display name can be derived.
pub fn synthesize_contact(identity: &str, enrichment: Option<&DirectoryProfile>) -> Option<NewContact> {
    let enrichment = enrichment.filter(|p| !p.is_empty());
    let non_empty = |v: &Option<String>| v.as_ref().filter(|s| !s.trim().is_empty()).cloned();

    let name = enrichment
        .and_then(|p| non_empty(&p.display_name))
        .unwrap_or_else(|| util::name_from_email(identity));
    if name.is_empty() {
        return None;
    }

    let company = enrichment
        .and_then(|p| non_empty(&p.company))
        .or_else(|| Some(util::org_from_email(identity)).filter(|c| !c.is_empty()));

    Some(NewContact {
        name,
        email: identity.to_string(),
        company,
        position: enrichment.and_then(|p| non_empty(&p.job_title)),
        location: enrichment.and_then(|p| non_empty(&p.location)),
        status: ContactStatus::Lead,
        tags: Vec::new(),
        deal_value: 0.0,
        source: if enrichment.is_some() {
            ContactSource::Directory
        } else {
            ContactSource::Email
        },
        avatar_url: Some(util::avatar_url(identity)),
    })
}

/// Union of both message queries, deduplicated by id (first seen wins), with
/// direction relative to `identity`.
pub fn merge_messages(identity: &str, sent: Vec<Message>, mentioned: Vec<Message>) -> Vec<ProfileMessage> {
    let mut seen = HashSet::new();
    sent.into_iter()
        .chain(mentioned)
        .filter(|m| seen.insert(m.id.clone()))
        .map(|message| {
            let direction = if extract_address(&message.from) == identity {
                Direction::Inbound
            } else {
                Direction::Outbound
            };
            ProfileMessage { message, direction }
        })
        .collect()
}
