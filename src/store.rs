//! Document and chunk persistence over SQLite.
//!
//! Thin row mappers around the `documents` and `chunks` tables. Status
//! transitions live here so the worker and server share one code path.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Document, DocumentChunk, DocumentStatus};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fields supplied by the caller when creating a document.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub owner_id: String,
    pub profile_id: Option<String>,
    pub title: String,
    pub content: String,
    pub source: Option<String>,
    pub metadata_json: String,
}

pub async fn insert_document(pool: &SqlitePool, new: NewDocument) -> Result<Document> {
    let id = Uuid::new_v4().to_string();
    let now = now_ms();
    sqlx::query(
        r#"
        INSERT INTO documents
            (id, owner_id, profile_id, title, content, source, metadata_json,
             status, chunk_count, error, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', 0, NULL, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&new.owner_id)
    .bind(&new.profile_id)
    .bind(&new.title)
    .bind(&new.content)
    .bind(&new.source)
    .bind(&new.metadata_json)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    get_document(pool, &id)
        .await?
        .ok_or_else(|| Error::fatal("document vanished after insert"))
}

pub async fn get_document(pool: &SqlitePool, id: &str) -> Result<Option<Document>> {
    let row = sqlx::query(
        r#"
        SELECT id, owner_id, profile_id, title, content, source, metadata_json,
               status, chunk_count, error, created_at, updated_at
        FROM documents WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(document_from_row).transpose()
}

pub async fn list_documents(pool: &SqlitePool, owner_id: &str) -> Result<Vec<Document>> {
    let rows = sqlx::query(
        r#"
        SELECT id, owner_id, profile_id, title, content, source, metadata_json,
               status, chunk_count, error, created_at, updated_at
        FROM documents WHERE owner_id = ? ORDER BY created_at DESC
        "#,
    )
    .bind(owner_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(document_from_row).collect()
}

fn document_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Document> {
    let status_str: String = row.get("status");
    Ok(Document {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        profile_id: row.get("profile_id"),
        title: row.get("title"),
        content: row.get("content"),
        source: row.get("source"),
        metadata_json: row.get("metadata_json"),
        status: DocumentStatus::parse(&status_str)
            .ok_or_else(|| Error::fatal(format!("unknown document status: {}", status_str)))?,
        chunk_count: row.get("chunk_count"),
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub async fn set_status(pool: &SqlitePool, id: &str, status: DocumentStatus) -> Result<()> {
    sqlx::query("UPDATE documents SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(now_ms())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Mark a document successfully indexed, recording its chunk count and
/// clearing any prior failure message.
pub async fn set_indexed(pool: &SqlitePool, id: &str, chunk_count: i64) -> Result<()> {
    sqlx::query(
        "UPDATE documents SET status = 'indexed', chunk_count = ?, error = NULL, updated_at = ? WHERE id = ?",
    )
    .bind(chunk_count)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_failed(pool: &SqlitePool, id: &str, message: &str) -> Result<()> {
    sqlx::query(
        "UPDATE documents SET status = 'failed', error = ?, updated_at = ? WHERE id = ?",
    )
    .bind(message)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_document(pool: &SqlitePool, id: &str) -> Result<()> {
    // Chunk rows go with it via ON DELETE CASCADE.
    sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Insert all chunk rows for a document in one transaction. Returns the
/// inserted rows (ids are generated here and reused as vector point ids).
pub async fn insert_chunks(
    pool: &SqlitePool,
    document_id: &str,
    pieces: &[(String, i64)],
) -> Result<Vec<DocumentChunk>> {
    let mut tx = pool.begin().await?;
    let mut out = Vec::with_capacity(pieces.len());

    for (index, (content, token_count)) in pieces.iter().enumerate() {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, content, chunk_index, token_count)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(document_id)
        .bind(content)
        .bind(index as i64)
        .bind(token_count)
        .execute(&mut *tx)
        .await?;
        out.push(DocumentChunk {
            id,
            document_id: document_id.to_string(),
            content: content.clone(),
            chunk_index: index as i64,
            token_count: *token_count,
        });
    }

    tx.commit().await?;
    Ok(out)
}

pub async fn delete_chunks_for_document(pool: &SqlitePool, document_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn chunks_for_document(
    pool: &SqlitePool,
    document_id: &str,
) -> Result<Vec<DocumentChunk>> {
    let rows = sqlx::query(
        r#"
        SELECT id, document_id, content, chunk_index, token_count
        FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC
        "#,
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| DocumentChunk {
            id: row.get("id"),
            document_id: row.get("document_id"),
            content: row.get("content"),
            chunk_index: row.get("chunk_index"),
            token_count: row.get("token_count"),
        })
        .collect())
}

pub async fn chunk_count(pool: &SqlitePool, document_id: &str) -> Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .fetch_one(pool)
        .await?;
    Ok(row.get("n"))
}
