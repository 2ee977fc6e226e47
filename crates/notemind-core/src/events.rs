//! Document change events
//!
//! The note and conversation stores publish their mutations on an [`EventBus`];
//! the index sync service subscribes and keeps the search indexes in step.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::{Document, DocumentKind};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum DocumentEvent {
    /// A document was created or updated
    Saved(Document),
    /// A single document was removed
    Deleted { kind: DocumentKind, parent_id: String },
    /// Every document of a kind was removed
    AllDeleted { kind: DocumentKind },
}

impl DocumentEvent {
    pub fn kind(&self) -> DocumentKind {
        match self {
            DocumentEvent::Saved(document) => document.kind(),
            DocumentEvent::Deleted { kind, .. } | DocumentEvent::AllDeleted { kind } => *kind,
        }
    }
}

/// Broadcast channel for document events
pub struct EventBus {
    sender: broadcast::Sender<DocumentEvent>,
}

pub type SharedEventBus = Arc<EventBus>;

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn shared() -> SharedEventBus {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of subscribers that received it.
    pub fn emit(&self, event: DocumentEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                log::debug!("[EventBus] No subscribers, event dropped");
                0
            }
        }
    }

    pub fn emit_saved(&self, document: impl Into<Document>) -> usize {
        self.emit(DocumentEvent::Saved(document.into()))
    }

    pub fn emit_deleted(&self, kind: DocumentKind, parent_id: impl Into<String>) -> usize {
        self.emit(DocumentEvent::Deleted {
            kind,
            parent_id: parent_id.into(),
        })
    }

    pub fn emit_all_deleted(&self, kind: DocumentKind) -> usize {
        self.emit(DocumentEvent::AllDeleted { kind })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
