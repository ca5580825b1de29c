//! Core data models for the indexing pipeline and query service.
//!
//! These types mirror the SQLite rows (documents, chunks, profiles,
//! conversations) and the shapes that cross the API boundary (search
//! results, stream events).

use serde::{Deserialize, Serialize};

/// Lifecycle state of a document.
///
/// `Indexed` is only set once chunk rows and vector points exist
/// consistently; `Failed` implies no orphaned chunk rows remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Indexed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DocumentStatus::Pending),
            "processing" => Some(DocumentStatus::Processing),
            "indexed" => Some(DocumentStatus::Indexed),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

/// One ingested source file, stored in SQLite.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub profile_id: Option<String>,
    pub title: String,
    /// Raw extracted plain text.
    pub content: String,
    pub source: Option<String>,
    pub metadata_json: String,
    pub status: DocumentStatus,
    pub chunk_count: i64,
    /// Last failure message, if any.
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One contiguous text segment of a document. Its id doubles as the id of
/// the corresponding vector-store point, so cross-referencing is O(1).
#[derive(Debug, Clone, Serialize)]
pub struct DocumentChunk {
    pub id: String,
    pub document_id: String,
    pub content: String,
    pub chunk_index: i64,
    pub token_count: i64,
}

/// Named configuration bundle owned by a user. At most one profile per
/// owner is marked default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub is_default: bool,
    // Chunking
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub separators: Vec<String>,
    // Embedding / retrieval
    pub embedding_model: String,
    pub top_k: usize,
    pub score_threshold: f32,
    pub strategy: String,
    // Generation
    pub generation_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub reasoning_effort: Option<String>,
    // Persona
    pub assistant_name: String,
    pub company: Option<String>,
    pub tone: Option<String>,
    pub domain: Option<String>,
    pub response_length: Option<String>,
    pub language: Option<String>,
    pub citations: bool,
    pub custom_instructions: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A retrieved chunk backing a RAG answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagSource {
    pub document_id: String,
    pub chunk_id: String,
    pub content: String,
    pub score: f32,
}

/// Event yielded by the streaming query path, in strict order:
/// one `Sources`, zero or more `Token`s, one terminal `Done`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum StreamEvent {
    Sources(Vec<RagSource>),
    Token(String),
    /// Terminal event. Carries the conversation id when the exchange was
    /// persisted to a server-managed conversation.
    Done { conversation_id: Option<String> },
}

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(ChatRole::User),
            "assistant" => Some(ChatRole::Assistant),
            "system" => Some(ChatRole::System),
            _ => None,
        }
    }
}

/// One turn of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Server-managed chat history container.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub owner_id: String,
    pub profile_id: Option<String>,
    pub title: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}
