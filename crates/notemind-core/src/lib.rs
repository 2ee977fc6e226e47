//! notemind-core
//!
//! Retrieval engine behind the notemind assistant: chunking of notes and chat
//! conversations, a BM25 lexical index, a vector store fed by pluggable embedding
//! providers, and hybrid ranking at query time.
//!
//! Document storage lives with the host application. The engine only reads a
//! [`Document`] when it is saved and keeps its own chunk-level state.


pub mod events;
pub mod search;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two corpora the engine indexes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Note,
    Chat,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Note => "note",
            DocumentKind::Chat => "chat",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "note" => Some(DocumentKind::Note),
            "chat" => Some(DocumentKind::Chat),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A saved note (markdown body)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Note {
    pub fn new(id: impl Into<String>, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            content: content.into(),
            tags: Vec::new(),
            source_url: None,
            updated_at: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }
}

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// A past chat conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub turns: Vec<Turn>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, title: impl Into<String>, turns: Vec<Turn>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            turns,
        }
    }
}

/// Anything the document collaborators hand to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Document {
    Note(Note),
    Chat(Conversation),
}

impl Document {
    pub fn kind(&self) -> DocumentKind {
        match self {
            Document::Note(_) => DocumentKind::Note,
            Document::Chat(_) => DocumentKind::Chat,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Document::Note(note) => &note.id,
            Document::Chat(conversation) => &conversation.id,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Document::Note(note) => &note.title,
            Document::Chat(conversation) => &conversation.title,
        }
    }
}

impl From<Note> for Document {
    fn from(note: Note) -> Self {
        Document::Note(note)
    }
}

impl From<Conversation> for Document {
    fn from(conversation: Conversation) -> Self {
        Document::Chat(conversation)
    }
}
