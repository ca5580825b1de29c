//! Conversation and message storage.
//!
//! Two history modes exist for queries and are mutually exclusive:
//! stateless (the caller sends prior turns inline) and server-managed (the
//! caller names a conversation id and the service loads and appends
//! turns). Supplying both is a validation error rather than a guess about
//! which one wins.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{ChatMessage, ChatRole, Conversation};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub async fn create_conversation(
    pool: &SqlitePool,
    owner_id: &str,
    profile_id: Option<&str>,
    title: Option<&str>,
) -> Result<Conversation> {
    let id = Uuid::new_v4().to_string();
    let now = now_ms();
    sqlx::query(
        r#"
        INSERT INTO conversations (id, owner_id, profile_id, title, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(owner_id)
    .bind(profile_id)
    .bind(title)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(Conversation {
        id,
        owner_id: owner_id.to_string(),
        profile_id: profile_id.map(|s| s.to_string()),
        title: title.map(|s| s.to_string()),
        created_at: now,
        updated_at: now,
    })
}

/// Fetch a conversation, scoped to its owner. Someone else's conversation
/// id behaves like a missing one.
pub async fn get_conversation(
    pool: &SqlitePool,
    id: &str,
    owner_id: &str,
) -> Result<Option<Conversation>> {
    let row = sqlx::query(
        "SELECT id, owner_id, profile_id, title, created_at, updated_at FROM conversations WHERE id = ? AND owner_id = ?",
    )
    .bind(id)
    .bind(owner_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| Conversation {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        profile_id: row.get("profile_id"),
        title: row.get("title"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }))
}

pub async fn append_message(
    pool: &SqlitePool,
    conversation_id: &str,
    role: ChatRole,
    content: &str,
) -> Result<()> {
    let now = now_ms();
    sqlx::query(
        "INSERT INTO messages (id, conversation_id, role, content, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(conversation_id)
    .bind(role.as_str())
    .bind(content)
    .bind(now)
    .execute(pool)
    .await?;

    sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(conversation_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn messages_for_conversation(
    pool: &SqlitePool,
    conversation_id: &str,
) -> Result<Vec<ChatMessage>> {
    let rows = sqlx::query(
        // rowid breaks ties for turns appended within the same millisecond.
        "SELECT role, content FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, rowid ASC",
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let role_str: String = row.get("role");
            Ok(ChatMessage {
                role: ChatRole::parse(&role_str)
                    .ok_or_else(|| Error::fatal(format!("unknown message role: {}", role_str)))?,
                content: row.get("content"),
            })
        })
        .collect()
}

/// Resolved history for one query: the prior turns to feed the model and,
/// when server-managed, the conversation to append new turns to.
#[derive(Debug)]
pub struct ResolvedHistory {
    pub conversation: Option<Conversation>,
    pub turns: Vec<ChatMessage>,
}

/// Resolve the history mode for a query. `inline` and `conversation_id`
/// are mutually exclusive; a named conversation must exist and belong to
/// the caller.
pub async fn resolve_history(
    pool: &SqlitePool,
    owner_id: &str,
    conversation_id: Option<&str>,
    inline: Option<Vec<ChatMessage>>,
) -> Result<ResolvedHistory> {
    match (conversation_id, inline) {
        (Some(_), Some(_)) => Err(Error::validation(
            "history and conversation_id are mutually exclusive",
        )),
        (Some(id), None) => {
            let conversation = get_conversation(pool, id, owner_id)
                .await?
                .ok_or_else(|| Error::not_found(format!("conversation {}", id)))?;
            let turns = messages_for_conversation(pool, id).await?;
            Ok(ResolvedHistory {
                conversation: Some(conversation),
                turns,
            })
        }
        (None, inline) => Ok(ResolvedHistory {
            conversation: None,
            turns: inline.unwrap_or_default(),
        }),
    }
}
