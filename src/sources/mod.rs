//! Upstream collaborator interfaces.
//!
//! The aggregator only ever talks to these traits. Real provider clients
//! (directory, mail, calendar, document storage) live outside this crate;
//! `memory` provides a fixture-backed implementation of every trait for the
//! CLI and tests.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{Contact, ContactPatch, DirectoryProfile, Document, Meeting, Message, NewContact};

/// Errors returned by upstream collaborators.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

/// Labels for every upstream call, used in logs, timeouts and latency rollups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    ContactSearch,
    ContactWrite,
    Directory,
    MessagesFrom,
    MessageSearch,
    Meetings,
    Documents,
}

impl SourceKind {
    pub fn label(self) -> &'static str {
        match self {
            SourceKind::ContactSearch => "contact_search",
            SourceKind::ContactWrite => "contact_write",
            SourceKind::Directory => "directory",
            SourceKind::MessagesFrom => "messages_from",
            SourceKind::MessageSearch => "message_search",
            SourceKind::Meetings => "meetings",
            SourceKind::Documents => "documents",
        }
    }
}

#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Contacts whose address matches `identity`. May return loose matches;
    /// callers pick the exact one.
    async fn search_by_identity(&self, identity: &str) -> Result<Vec<Contact>, SourceError>;
    async fn create(&self, contact: NewContact) -> Result<Contact, SourceError>;
    async fn update(&self, id: &str, patch: ContactPatch) -> Result<Contact, SourceError>;
    async fn delete(&self, id: &str) -> Result<(), SourceError>;
}

#[async_trait]
pub trait DirectorySource: Send + Sync {
    async fn lookup(&self, identity: &str) -> Result<Option<DirectoryProfile>, SourceError>;
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Messages sent by `identity`.
    async fn messages_from(&self, identity: &str) -> Result<Vec<Message>, SourceError>;
    /// Messages that mention `identity` anywhere (sender, recipients, body).
    async fn search_messages(&self, identity: &str) -> Result<Vec<Message>, SourceError>;
}

#[async_trait]
pub trait MeetingSource: Send + Sync {
    /// May legitimately be empty when no calendar integration is configured.
    async fn meetings_involving(&self, identity: &str) -> Result<Vec<Meeting>, SourceError>;
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// May legitimately be empty when no document integration is configured.
    async fn documents_shared_with(&self, identity: &str) -> Result<Vec<Document>, SourceError>;
}

/// Handles to every upstream the aggregator consults.
#[derive(Clone)]
pub struct Sources {
    pub contacts: Arc<dyn ContactStore>,
    pub directory: Arc<dyn DirectorySource>,
    pub messages: Arc<dyn MessageSource>,
    pub meetings: Arc<dyn MeetingSource>,
    pub documents: Arc<dyn DocumentSource>,
}

impl Sources {
    /// Route every interface to one backend.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: ContactStore + DirectorySource + MessageSource + MeetingSource + DocumentSource + 'static,
    {
        Self {
            contacts: backend.clone(),
            directory: backend.clone(),
            messages: backend.clone(),
            meetings: backend.clone(),
            documents: backend,
        }
    }
}
