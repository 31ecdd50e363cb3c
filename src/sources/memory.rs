//! Fixture-backed in-memory implementation of every upstream interface.
//!
//! Used by the CLI (fixtures loaded from JSON) and by tests, which can inject
//! per-source latency and failures through [`SourceBehavior`].

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{
    ContactStore, DirectorySource, DocumentSource, MeetingSource, MessageSource, SourceError,
    SourceKind,
};
use crate::types::{Contact, ContactPatch, DirectoryProfile, Document, Meeting, Message, NewContact};
use crate::util::{extract_address, normalize_identity};

/// On-disk fixtures file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fixtures {
    #[serde(default)]
    pub contacts: Vec<Contact>,
    /// Directory enrichment keyed by address.
    #[serde(default)]
    pub directory: HashMap<String, DirectoryProfile>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub meetings: Vec<Meeting>,
    #[serde(default)]
    pub documents: Vec<Document>,
}

impl Fixtures {
    pub fn load(path: &Path) -> Result<Self, SourceError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Injected latency and failure for one upstream call kind.
#[derive(Debug, Clone, Default)]
pub struct SourceBehavior {
    pub delay: Option<Duration>,
    pub fail: bool,
}

impl SourceBehavior {
    pub fn failing() -> Self {
        Self {
            delay: None,
            fail: true,
        }
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            fail: false,
        }
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    contacts: Mutex<Vec<Contact>>,
    directory: HashMap<String, DirectoryProfile>,
    messages: Vec<Message>,
    meetings: Vec<Meeting>,
    documents: Vec<Document>,
    behaviors: Mutex<HashMap<SourceKind, SourceBehavior>>,
    calls: Mutex<HashMap<SourceKind, usize>>,
    completed: Mutex<HashMap<SourceKind, usize>>,
}

impl MemoryBackend {
    pub fn new(fixtures: Fixtures) -> Self {
        let directory = fixtures
            .directory
            .into_iter()
            .map(|(email, profile)| (normalize_identity(&email), profile))
            .collect();

        Self {
            contacts: Mutex::new(fixtures.contacts),
            directory,
            messages: fixtures.messages,
            meetings: fixtures.meetings,
            documents: fixtures.documents,
            ..Self::default()
        }
    }

    pub fn set_behavior(&self, kind: SourceKind, behavior: SourceBehavior) {
        self.behaviors.lock().insert(kind, behavior);
    }

    /// Number of calls started against `kind`.
    pub fn calls(&self, kind: SourceKind) -> usize {
        self.calls.lock().get(&kind).copied().unwrap_or(0)
    }

    /// Number of calls against `kind` that ran to completion (including
    /// injected failures), whether or not anyone was still waiting.
    pub fn completed(&self, kind: SourceKind) -> usize {
        self.completed.lock().get(&kind).copied().unwrap_or(0)
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.contacts.lock().clone()
    }

    async fn enter(&self, kind: SourceKind) -> Result<(), SourceError> {
        *self.calls.lock().entry(kind).or_default() += 1;
        let behavior = self.behaviors.lock().get(&kind).cloned().unwrap_or_default();

        if let Some(delay) = behavior.delay {
            tokio::time::sleep(delay).await;
        }
        *self.completed.lock().entry(kind).or_default() += 1;

        if behavior.fail {
            return Err(SourceError::Unavailable(format!(
                "{} is failing",
                kind.label()
            )));
        }
        Ok(())
    }
}

fn involves(addresses: &[String], identity: &str) -> bool {
    addresses.iter().any(|a| extract_address(a) == identity)
}

#[async_trait]
impl ContactStore for MemoryBackend {
    async fn search_by_identity(&self, identity: &str) -> Result<Vec<Contact>, SourceError> {
        self.enter(SourceKind::ContactSearch).await?;
        let needle = normalize_identity(identity);
        Ok(self
            .contacts
            .lock()
            .iter()
            .filter(|c| c.email.to_lowercase().contains(&needle))
            .cloned()
            .collect())
    }

    async fn create(&self, contact: NewContact) -> Result<Contact, SourceError> {
        self.enter(SourceKind::ContactWrite).await?;
        let created = contact.into_contact(uuid::Uuid::new_v4().to_string(), Utc::now());
        self.contacts.lock().push(created.clone());
        Ok(created)
    }

    async fn update(&self, id: &str, patch: ContactPatch) -> Result<Contact, SourceError> {
        self.enter(SourceKind::ContactWrite).await?;
        let mut contacts = self.contacts.lock();
        let contact = contacts
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| SourceError::NotFound(id.to_string()))?;
        patch.apply(contact, Utc::now());
        Ok(contact.clone())
    }

    async fn delete(&self, id: &str) -> Result<(), SourceError> {
        self.enter(SourceKind::ContactWrite).await?;
        let mut contacts = self.contacts.lock();
        let before = contacts.len();
        contacts.retain(|c| c.id != id);
        if contacts.len() == before {
            return Err(SourceError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DirectorySource for MemoryBackend {
    async fn lookup(&self, identity: &str) -> Result<Option<DirectoryProfile>, SourceError> {
        self.enter(SourceKind::Directory).await?;
        Ok(self.directory.get(&normalize_identity(identity)).cloned())
    }
}

#[async_trait]
impl MessageSource for MemoryBackend {
    async fn messages_from(&self, identity: &str) -> Result<Vec<Message>, SourceError> {
        self.enter(SourceKind::MessagesFrom).await?;
        let identity = normalize_identity(identity);
        Ok(self
            .messages
            .iter()
            .filter(|m| extract_address(&m.from) == identity)
            .cloned()
            .collect())
    }

    async fn search_messages(&self, identity: &str) -> Result<Vec<Message>, SourceError> {
        self.enter(SourceKind::MessageSearch).await?;
        let identity = normalize_identity(identity);
        Ok(self
            .messages
            .iter()
            .filter(|m| {
                extract_address(&m.from) == identity
                    || involves(&m.to, &identity)
                    || involves(&m.cc, &identity)
                    || m.subject.to_lowercase().contains(&identity)
                    || m.preview.to_lowercase().contains(&identity)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MeetingSource for MemoryBackend {
    async fn meetings_involving(&self, identity: &str) -> Result<Vec<Meeting>, SourceError> {
        self.enter(SourceKind::Meetings).await?;
        let identity = normalize_identity(identity);
        Ok(self
            .meetings
            .iter()
            .filter(|m| {
                involves(&m.attendees, &identity)
                    || m.organizer.as_deref().map(extract_address).as_deref()
                        == Some(identity.as_str())
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DocumentSource for MemoryBackend {
    async fn documents_shared_with(&self, identity: &str) -> Result<Vec<Document>, SourceError> {
        self.enter(SourceKind::Documents).await?;
        let identity = normalize_identity(identity);
        Ok(self
            .documents
            .iter()
            .filter(|d| {
                involves(&d.shared_with, &identity)
                    || d.owner.as_deref().map(extract_address).as_deref() == Some(identity.as_str())
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContactSource, ContactStatus, Importance};

    fn message(id: &str, from: &str, to: &[&str]) -> Message {
        Message {
            id: id.to_string(),
            thread_id: None,
            subject: format!("Subject {id}"),
            preview: String::new(),
            from: from.to_string(),
            to: to.iter().map(|s| s.to_string()).collect(),
            cc: Vec::new(),
            received_at: Utc::now(),
            is_read: false,
            importance: Importance::Normal,
            has_attachments: false,
        }
    }

    #[tokio::test]
    async fn test_message_queries() {
        let backend = MemoryBackend::new(Fixtures {
            messages: vec![
                message("1", "Sarah <sarah@acme.com>", &["me@myco.com"]),
                message("2", "me@myco.com", &["SARAH@acme.com"]),
                message("3", "other@else.com", &["me@myco.com"]),
            ],
            ..Fixtures::default()
        });

        let sent = backend.messages_from("Sarah@Acme.com").await.unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, "1");

        let mentioned = backend.search_messages("sarah@acme.com").await.unwrap();
        let ids: Vec<_> = mentioned.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(backend.calls(SourceKind::MessagesFrom), 1);
        assert_eq!(backend.calls(SourceKind::MessageSearch), 1);
    }

    #[tokio::test]
    async fn test_contact_crud() {
        let backend = MemoryBackend::default();
        let created = backend
            .create(NewContact {
                name: "Joe".into(),
                email: "joe@bigcorp.io".into(),
                company: None,
                position: None,
                location: None,
                status: ContactStatus::Lead,
                tags: vec![],
                deal_value: 0.0,
                source: ContactSource::Email,
                avatar_url: None,
            })
            .await
            .unwrap();

        let found = backend.search_by_identity("JOE@bigcorp.io").await.unwrap();
        assert_eq!(found.len(), 1);

        let updated = backend
            .update(
                &created.id,
                ContactPatch {
                    deal_value: Some(1200.0),
                    ..ContactPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.deal_value, 1200.0);

        backend.delete(&created.id).await.unwrap();
        assert!(backend.contacts().is_empty());
        assert!(matches!(
            backend.delete(&created.id).await,
            Err(SourceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let backend = MemoryBackend::default();
        backend.set_behavior(SourceKind::Meetings, SourceBehavior::failing());
        assert!(backend.meetings_involving("a@x.com").await.is_err());
        assert!(backend.documents_shared_with("a@x.com").await.unwrap().is_empty());
    }

    #[test]
    fn test_fixtures_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixtures.json");
        std::fs::write(
            &path,
            r#"{"directory": {"Sarah@Acme.com": {"displayName": "Sarah Chen"}}}"#,
        )
        .unwrap();
        let backend = MemoryBackend::new(Fixtures::load(&path).unwrap());
        assert_eq!(
            backend.directory.get("sarah@acme.com").and_then(|p| p.display_name.clone()),
            Some("Sarah Chen".to_string())
        );
    }
}
