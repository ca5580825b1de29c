//! Profile storage and resolution.
//!
//! A profile bundles chunking, retrieval, generation, and persona settings
//! under an owner. Resolution order for any operation: explicitly supplied
//! profile id, then the owner's default profile, then a synthetic profile
//! built from config defaults. A supplied id that does not resolve is an
//! error, never a silent fallback.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::Profile;

/// Marker id of the synthetic config-defaults profile.
pub const BUILTIN_PROFILE_ID: &str = "builtin-default";

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Caller-supplied profile fields; anything absent takes config defaults.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ProfileDraft {
    pub name: Option<String>,
    pub is_default: Option<bool>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub separators: Option<Vec<String>>,
    pub embedding_model: Option<String>,
    pub top_k: Option<usize>,
    pub score_threshold: Option<f32>,
    pub strategy: Option<String>,
    pub generation_model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub reasoning_effort: Option<String>,
    pub assistant_name: Option<String>,
    pub company: Option<String>,
    pub tone: Option<String>,
    pub domain: Option<String>,
    pub response_length: Option<String>,
    pub language: Option<String>,
    pub citations: Option<bool>,
    pub custom_instructions: Option<Vec<String>>,
}

/// Synthetic profile carrying the service-wide config defaults. Used when
/// an owner has no stored default.
pub fn config_profile(config: &Config, owner_id: &str) -> Profile {
    let now = now_ms();
    Profile {
        id: BUILTIN_PROFILE_ID.to_string(),
        owner_id: owner_id.to_string(),
        name: "Default".to_string(),
        is_default: true,
        chunk_size: config.chunking.chunk_size,
        chunk_overlap: config.chunking.chunk_overlap,
        separators: config.chunking.separators.clone(),
        embedding_model: config.embedding.model.clone(),
        top_k: config.retrieval.top_k,
        score_threshold: config.retrieval.score_threshold,
        strategy: "similarity".to_string(),
        generation_model: config.generation.model.clone(),
        temperature: config.generation.temperature,
        max_tokens: config.generation.max_tokens,
        reasoning_effort: None,
        assistant_name: "Assistant".to_string(),
        company: None,
        tone: None,
        domain: None,
        response_length: None,
        language: None,
        citations: false,
        custom_instructions: Vec::new(),
        created_at: now,
        updated_at: now,
    }
}

/// Create a profile from a draft, filling gaps with config defaults.
pub async fn create_profile(
    pool: &SqlitePool,
    config: &Config,
    owner_id: &str,
    draft: ProfileDraft,
) -> Result<Profile> {
    let base = config_profile(config, owner_id);
    let now = now_ms();
    let profile = Profile {
        id: Uuid::new_v4().to_string(),
        owner_id: owner_id.to_string(),
        name: draft
            .name
            .ok_or_else(|| Error::validation("profile name is required"))?,
        is_default: draft.is_default.unwrap_or(false),
        chunk_size: draft.chunk_size.unwrap_or(base.chunk_size),
        chunk_overlap: draft.chunk_overlap.unwrap_or(base.chunk_overlap),
        separators: draft.separators.unwrap_or(base.separators),
        embedding_model: draft.embedding_model.unwrap_or(base.embedding_model),
        top_k: draft.top_k.unwrap_or(base.top_k),
        score_threshold: draft.score_threshold.unwrap_or(base.score_threshold),
        strategy: draft.strategy.unwrap_or(base.strategy),
        generation_model: draft.generation_model.unwrap_or(base.generation_model),
        temperature: draft.temperature.unwrap_or(base.temperature),
        max_tokens: draft.max_tokens.unwrap_or(base.max_tokens),
        reasoning_effort: draft.reasoning_effort,
        assistant_name: draft.assistant_name.unwrap_or(base.assistant_name),
        company: draft.company,
        tone: draft.tone,
        domain: draft.domain,
        response_length: draft.response_length,
        language: draft.language,
        citations: draft.citations.unwrap_or(false),
        custom_instructions: draft.custom_instructions.unwrap_or_default(),
        created_at: now,
        updated_at: now,
    };

    validate_profile(&profile)?;

    let mut tx = pool.begin().await?;
    if profile.is_default {
        sqlx::query("UPDATE profiles SET is_default = 0 WHERE owner_id = ?")
            .bind(owner_id)
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query(
        r#"
        INSERT INTO profiles
            (id, owner_id, name, is_default, chunk_size, chunk_overlap,
             separators_json, embedding_model, top_k, score_threshold, strategy,
             generation_model, temperature, max_tokens, reasoning_effort,
             assistant_name, company, tone, domain, response_length, language,
             citations, custom_instructions_json, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&profile.id)
    .bind(&profile.owner_id)
    .bind(&profile.name)
    .bind(profile.is_default as i64)
    .bind(profile.chunk_size as i64)
    .bind(profile.chunk_overlap as i64)
    .bind(serde_json::to_string(&profile.separators)?)
    .bind(&profile.embedding_model)
    .bind(profile.top_k as i64)
    .bind(profile.score_threshold)
    .bind(&profile.strategy)
    .bind(&profile.generation_model)
    .bind(profile.temperature)
    .bind(profile.max_tokens as i64)
    .bind(&profile.reasoning_effort)
    .bind(&profile.assistant_name)
    .bind(&profile.company)
    .bind(&profile.tone)
    .bind(&profile.domain)
    .bind(&profile.response_length)
    .bind(&profile.language)
    .bind(profile.citations as i64)
    .bind(serde_json::to_string(&profile.custom_instructions)?)
    .bind(profile.created_at)
    .bind(profile.updated_at)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(profile)
}

/// Apply a draft on top of an existing profile.
pub async fn update_profile(
    pool: &SqlitePool,
    id: &str,
    owner_id: &str,
    draft: ProfileDraft,
) -> Result<Profile> {
    let mut profile = get_profile(pool, id)
        .await?
        .filter(|p| p.owner_id == owner_id)
        .ok_or_else(|| Error::not_found(format!("profile {}", id)))?;

    if let Some(v) = draft.name {
        profile.name = v;
    }
    if let Some(v) = draft.is_default {
        profile.is_default = v;
    }
    if let Some(v) = draft.chunk_size {
        profile.chunk_size = v;
    }
    if let Some(v) = draft.chunk_overlap {
        profile.chunk_overlap = v;
    }
    if let Some(v) = draft.separators {
        profile.separators = v;
    }
    if let Some(v) = draft.embedding_model {
        profile.embedding_model = v;
    }
    if let Some(v) = draft.top_k {
        profile.top_k = v;
    }
    if let Some(v) = draft.score_threshold {
        profile.score_threshold = v;
    }
    if let Some(v) = draft.strategy {
        profile.strategy = v;
    }
    if let Some(v) = draft.generation_model {
        profile.generation_model = v;
    }
    if let Some(v) = draft.temperature {
        profile.temperature = v;
    }
    if let Some(v) = draft.max_tokens {
        profile.max_tokens = v;
    }
    if draft.reasoning_effort.is_some() {
        profile.reasoning_effort = draft.reasoning_effort;
    }
    if let Some(v) = draft.assistant_name {
        profile.assistant_name = v;
    }
    if draft.company.is_some() {
        profile.company = draft.company;
    }
    if draft.tone.is_some() {
        profile.tone = draft.tone;
    }
    if draft.domain.is_some() {
        profile.domain = draft.domain;
    }
    if draft.response_length.is_some() {
        profile.response_length = draft.response_length;
    }
    if draft.language.is_some() {
        profile.language = draft.language;
    }
    if let Some(v) = draft.citations {
        profile.citations = v;
    }
    if let Some(v) = draft.custom_instructions {
        profile.custom_instructions = v;
    }
    profile.updated_at = now_ms();

    validate_profile(&profile)?;

    let mut tx = pool.begin().await?;
    if profile.is_default {
        sqlx::query("UPDATE profiles SET is_default = 0 WHERE owner_id = ? AND id != ?")
            .bind(owner_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query(
        r#"
        UPDATE profiles SET
            name = ?, is_default = ?, chunk_size = ?, chunk_overlap = ?,
            separators_json = ?, embedding_model = ?, top_k = ?,
            score_threshold = ?, strategy = ?, generation_model = ?,
            temperature = ?, max_tokens = ?, reasoning_effort = ?,
            assistant_name = ?, company = ?, tone = ?, domain = ?,
            response_length = ?, language = ?, citations = ?,
            custom_instructions_json = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&profile.name)
    .bind(profile.is_default as i64)
    .bind(profile.chunk_size as i64)
    .bind(profile.chunk_overlap as i64)
    .bind(serde_json::to_string(&profile.separators)?)
    .bind(&profile.embedding_model)
    .bind(profile.top_k as i64)
    .bind(profile.score_threshold)
    .bind(&profile.strategy)
    .bind(&profile.generation_model)
    .bind(profile.temperature)
    .bind(profile.max_tokens as i64)
    .bind(&profile.reasoning_effort)
    .bind(&profile.assistant_name)
    .bind(&profile.company)
    .bind(&profile.tone)
    .bind(&profile.domain)
    .bind(&profile.response_length)
    .bind(&profile.language)
    .bind(profile.citations as i64)
    .bind(serde_json::to_string(&profile.custom_instructions)?)
    .bind(profile.updated_at)
    .bind(id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(profile)
}

fn validate_profile(profile: &Profile) -> Result<()> {
    if profile.name.trim().is_empty() {
        return Err(Error::validation("profile name must not be blank"));
    }
    if profile.chunk_size == 0 {
        return Err(Error::validation("chunk_size must be > 0"));
    }
    if profile.chunk_overlap >= profile.chunk_size {
        return Err(Error::validation("chunk_overlap must be < chunk_size"));
    }
    if profile.top_k == 0 {
        return Err(Error::validation("top_k must be >= 1"));
    }
    if !(0.0..=1.0).contains(&profile.score_threshold) {
        return Err(Error::validation("score_threshold must be in [0.0, 1.0]"));
    }
    // Reject unknown embedding models at write time rather than at index
    // time, when the failure would surface as a dead-lettered job.
    crate::embedding::model_dims(&profile.embedding_model)?;
    Ok(())
}

pub async fn get_profile(pool: &SqlitePool, id: &str) -> Result<Option<Profile>> {
    let row = sqlx::query("SELECT * FROM profiles WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(profile_from_row).transpose()
}

pub async fn list_profiles(pool: &SqlitePool, owner_id: &str) -> Result<Vec<Profile>> {
    let rows = sqlx::query("SELECT * FROM profiles WHERE owner_id = ? ORDER BY created_at ASC")
        .bind(owner_id)
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(profile_from_row).collect()
}

pub async fn delete_profile(pool: &SqlitePool, id: &str, owner_id: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM profiles WHERE id = ? AND owner_id = ?")
        .bind(id)
        .bind(owner_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("profile {}", id)));
    }
    Ok(())
}

pub async fn default_profile(pool: &SqlitePool, owner_id: &str) -> Result<Option<Profile>> {
    let row = sqlx::query("SELECT * FROM profiles WHERE owner_id = ? AND is_default = 1 LIMIT 1")
        .bind(owner_id)
        .fetch_optional(pool)
        .await?;
    row.map(profile_from_row).transpose()
}

/// Resolve the effective profile: explicit id, else the owner's default,
/// else the config-defaults profile. An explicit id that does not exist
/// (or belongs to someone else) is a not-found error.
pub async fn resolve_profile(
    pool: &SqlitePool,
    config: &Config,
    owner_id: &str,
    explicit: Option<&str>,
) -> Result<Profile> {
    if let Some(id) = explicit {
        return get_profile(pool, id)
            .await?
            .filter(|p| p.owner_id == owner_id)
            .ok_or_else(|| Error::not_found(format!("profile {}", id)));
    }
    if let Some(profile) = default_profile(pool, owner_id).await? {
        return Ok(profile);
    }
    Ok(config_profile(config, owner_id))
}

fn profile_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Profile> {
    let separators_json: String = row.get("separators_json");
    let instructions_json: String = row.get("custom_instructions_json");
    let is_default: i64 = row.get("is_default");
    let citations: i64 = row.get("citations");
    let chunk_size: i64 = row.get("chunk_size");
    let chunk_overlap: i64 = row.get("chunk_overlap");
    let top_k: i64 = row.get("top_k");
    let max_tokens: i64 = row.get("max_tokens");
    Ok(Profile {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        name: row.get("name"),
        is_default: is_default != 0,
        chunk_size: chunk_size as usize,
        chunk_overlap: chunk_overlap as usize,
        separators: serde_json::from_str(&separators_json)?,
        embedding_model: row.get("embedding_model"),
        top_k: top_k as usize,
        score_threshold: row.get("score_threshold"),
        strategy: row.get("strategy"),
        generation_model: row.get("generation_model"),
        temperature: row.get("temperature"),
        max_tokens: max_tokens as u32,
        reasoning_effort: row.get("reasoning_effort"),
        assistant_name: row.get("assistant_name"),
        company: row.get("company"),
        tone: row.get("tone"),
        domain: row.get("domain"),
        response_length: row.get("response_length"),
        language: row.get("language"),
        citations: citations != 0,
        custom_instructions: serde_json::from_str(&instructions_json)?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
