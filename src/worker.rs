//! Job handlers and the worker pool.
//!
//! Each worker task loops: claim a job, dispatch on its payload, then mark
//! the job completed or failed. Retry scheduling lives entirely in the
//! queue; handlers just return errors, and the error class decides whether
//! the job comes back.
//!
//! The index handler is compensating: any failure after chunk rows were
//! written deletes those rows and flips the document to `failed`, so a
//! document is never left half-indexed. The whole job re-runs on retry
//! rather than resuming mid-pipeline.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chunk::{approx_token_count, chunk_text, ChunkOptions, ChunkOverride};
use crate::config::Config;
use crate::embedding::{embed_in_batches, ProviderFactory};
use crate::error::{Error, Result};
use crate::models::{Document, DocumentStatus, Profile};
use crate::profiles;
use crate::queue::{Job, JobPayload, JobQueue};
use crate::store;
use crate::vector::{CollectionResolver, PointFilter, PointPayload, VectorPoint, VectorStore};

/// Shared state for the worker pool and the API layer.
pub struct PipelineContext {
    pub pool: SqlitePool,
    pub config: Config,
    pub queue: JobQueue,
    pub vectors: Arc<dyn VectorStore>,
    pub embedders: Arc<dyn ProviderFactory>,
    pub resolver: Arc<CollectionResolver>,
}

/// Spawn the worker pool. Tasks run until the process exits.
pub fn spawn_workers(ctx: Arc<PipelineContext>) -> Vec<JoinHandle<()>> {
    (0..ctx.config.queue.index_concurrency)
        .map(|n| {
            let ctx = ctx.clone();
            tokio::spawn(async move { worker_loop(ctx, n).await })
        })
        .collect()
}

async fn worker_loop(ctx: Arc<PipelineContext>, n: usize) {
    let poll = Duration::from_millis(ctx.config.queue.poll_interval_ms);
    debug!(worker = n, "worker started");
    loop {
        match ctx.queue.claim().await {
            Ok(Some(job)) => run_job(&ctx, &job).await,
            Ok(None) => tokio::time::sleep(poll).await,
            Err(e) => {
                error!(worker = n, error = %e, "claim failed");
                tokio::time::sleep(poll).await;
            }
        }
    }
}

/// Run all queued jobs to completion, then return. One-shot CLI commands
/// and tests use this instead of the long-running pool.
pub async fn drain(ctx: &PipelineContext) -> Result<()> {
    loop {
        match ctx.queue.claim().await? {
            Some(job) => run_job(ctx, &job).await,
            None => {
                if ctx.queue.pending_count().await? == 0 {
                    return Ok(());
                }
                // Remaining jobs are delayed; wait for their run_at.
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

/// Execute one claimed job and record its outcome.
pub async fn run_job(ctx: &PipelineContext, job: &Job) {
    info!(job = %job.id, attempt = job.attempts_made, "job started");
    let outcome = dispatch(ctx, job).await;
    match outcome {
        Ok(result) => {
            if let Err(e) = ctx.queue.complete(&job.id, result).await {
                error!(job = %job.id, error = %e, "failed to record completion");
            } else {
                info!(job = %job.id, "job completed");
            }
        }
        Err(err) => {
            warn!(job = %job.id, error = %err, retryable = err.is_retryable(), "job failed");
            if let Err(e) = ctx.queue.fail(&job.id, &err).await {
                error!(job = %job.id, error = %e, "failed to record failure");
            }
        }
    }
}

async fn dispatch(ctx: &PipelineContext, job: &Job) -> Result<Option<serde_json::Value>> {
    match &job.payload {
        JobPayload::Index {
            document_id,
            profile_id,
            chunk_options,
        } => {
            handle_index(
                ctx,
                job,
                document_id,
                profile_id.as_deref(),
                chunk_options.as_ref(),
            )
            .await
        }
        JobPayload::Delete { document_id } => handle_delete(ctx, job, document_id).await,
        JobPayload::Reindex {
            document_id,
            profile_id,
            chunk_options,
        } => {
            handle_reindex(
                ctx,
                job,
                document_id,
                profile_id.as_deref(),
                chunk_options.as_ref(),
            )
            .await
        }
    }
}

/// Progress milestones scaled into a sub-range of 0..=100, so the reindex
/// handler can reuse the index pipeline in its 20..=100 window.
struct ProgressWindow<'a> {
    queue: &'a JobQueue,
    job_id: &'a str,
    base: f64,
}

impl ProgressWindow<'_> {
    async fn report(&self, milestone: f64) -> Result<()> {
        let scaled = self.base + milestone * (100.0 - self.base) / 100.0;
        self.queue.set_progress(self.job_id, scaled).await
    }
}

async fn handle_index(
    ctx: &PipelineContext,
    job: &Job,
    document_id: &str,
    payload_profile: Option<&str>,
    chunk_options: Option<&ChunkOverride>,
) -> Result<Option<serde_json::Value>> {
    let doc = store::get_document(&ctx.pool, document_id)
        .await?
        .ok_or_else(|| Error::fatal(format!("document {} not found", document_id)))?;

    let explicit = payload_profile.or(doc.profile_id.as_deref());
    let profile = profiles::resolve_profile(&ctx.pool, &ctx.config, &doc.owner_id, explicit).await?;

    let window = ProgressWindow {
        queue: &ctx.queue,
        job_id: &job.id,
        base: 0.0,
    };
    index_document(ctx, &doc, &profile, chunk_options, &window).await
}

/// The core index pipeline: chunk, embed, persist rows, upsert points,
/// flip status. Shared by the index and reindex handlers.
async fn index_document(
    ctx: &PipelineContext,
    doc: &Document,
    profile: &Profile,
    chunk_options: Option<&ChunkOverride>,
    window: &ProgressWindow<'_>,
) -> Result<Option<serde_json::Value>> {
    store::set_status(&ctx.pool, &doc.id, DocumentStatus::Processing).await?;
    window.report(5.0).await?;

    let result = index_inner(ctx, doc, profile, chunk_options, window).await;
    match result {
        Ok(chunk_count) => {
            store::set_indexed(&ctx.pool, &doc.id, chunk_count).await?;
            window.report(100.0).await?;
            Ok(Some(serde_json::json!({ "chunk_count": chunk_count })))
        }
        Err(err) => {
            // Compensate: no orphaned chunk rows or points may survive a
            // failed run.
            if let Err(e) = store::delete_chunks_for_document(&ctx.pool, &doc.id).await {
                error!(document = %doc.id, error = %e, "chunk cleanup failed");
            }
            if let Ok(collection) = ctx.resolver.collection_for_model(&profile.embedding_model) {
                if let Err(e) = ctx
                    .vectors
                    .delete(&collection, &PointFilter::for_document(&doc.id))
                    .await
                {
                    error!(document = %doc.id, error = %e, "point cleanup failed");
                }
            }
            store::set_failed(&ctx.pool, &doc.id, &err.to_string()).await?;
            Err(err)
        }
    }
}

async fn index_inner(
    ctx: &PipelineContext,
    doc: &Document,
    profile: &Profile,
    chunk_options: Option<&ChunkOverride>,
    window: &ProgressWindow<'_>,
) -> Result<i64> {
    let provider = ctx.embedders.for_model(&profile.embedding_model)?;
    let collection = ctx
        .resolver
        .resolve(ctx.vectors.as_ref(), &profile.embedding_model)
        .await?;

    let base = ChunkOptions {
        chunk_size: profile.chunk_size,
        chunk_overlap: profile.chunk_overlap,
        separators: profile.separators.clone(),
    };
    let opts = match chunk_options {
        Some(ov) => ov.apply(base),
        None => base,
    };
    let pieces = chunk_text(&doc.content, &opts);
    if pieces.is_empty() {
        return Ok(0);
    }

    let texts: Vec<String> = pieces.iter().map(|p| p.content.clone()).collect();
    let vectors = embed_in_batches(
        provider.as_ref(),
        &texts,
        ctx.config.embedding.batch_size,
        |done, total| {
            // Embedding spans the 5..=75 stretch of the job; interpolate
            // per completed batch.
            let milestone = 5.0 + 70.0 * done as f64 / total.max(1) as f64;
            async move { window.report(milestone).await }
        },
    )
    .await?;

    // Re-runs replace earlier rows and points wholesale; a failed run's
    // point cleanup is log-and-continue, so stale points may still exist.
    store::delete_chunks_for_document(&ctx.pool, &doc.id).await?;
    ctx.vectors
        .delete(&collection, &PointFilter::for_document(&doc.id))
        .await?;
    let rows: Vec<(String, i64)> = pieces
        .iter()
        .map(|p| (p.content.clone(), approx_token_count(&p.content) as i64))
        .collect();
    let chunks = store::insert_chunks(&ctx.pool, &doc.id, &rows).await?;
    window.report(80.0).await?;

    let points: Vec<VectorPoint> = chunks
        .iter()
        .zip(vectors)
        .map(|(chunk, vector)| VectorPoint {
            id: chunk.id.clone(),
            vector,
            payload: PointPayload {
                document_id: doc.id.clone(),
                owner_id: doc.owner_id.clone(),
                chunk_id: chunk.id.clone(),
                content: chunk.content.clone(),
                chunk_index: chunk.chunk_index,
                source: doc.source.clone(),
                metadata: serde_json::from_str(&doc.metadata_json)
                    .unwrap_or(serde_json::Value::Null),
            },
        })
        .collect();
    ctx.vectors.upsert(&collection, points).await?;
    window.report(90.0).await?;

    Ok(chunks.len() as i64)
}

async fn handle_delete(
    ctx: &PipelineContext,
    job: &Job,
    document_id: &str,
) -> Result<Option<serde_json::Value>> {
    let Some(doc) = store::get_document(&ctx.pool, document_id).await? else {
        // Already gone; deletion is idempotent.
        return Ok(None);
    };

    let collection = collection_for_document(ctx, &doc).await?;
    ctx.vectors
        .delete(&collection, &PointFilter::for_document(document_id))
        .await?;
    ctx.queue.set_progress(&job.id, 50.0).await?;

    store::delete_document(&ctx.pool, document_id).await?;
    Ok(None)
}

async fn handle_reindex(
    ctx: &PipelineContext,
    job: &Job,
    document_id: &str,
    payload_profile: Option<&str>,
    chunk_options: Option<&ChunkOverride>,
) -> Result<Option<serde_json::Value>> {
    let doc = store::get_document(&ctx.pool, document_id)
        .await?
        .ok_or_else(|| Error::fatal(format!("document {} not found", document_id)))?;

    // Resolve the target profile before any destructive step, so a bad
    // profile id fails the job with the old index still intact.
    let explicit = payload_profile.or(doc.profile_id.as_deref());
    let profile = profiles::resolve_profile(&ctx.pool, &ctx.config, &doc.owner_id, explicit).await?;

    // Tear down the old index under the document's previous model; it may
    // live in a different collection than the new one.
    let old_collection = collection_for_document(ctx, &doc).await?;
    ctx.vectors
        .delete(&old_collection, &PointFilter::for_document(document_id))
        .await?;
    store::delete_chunks_for_document(&ctx.pool, document_id).await?;

    // Record the profile switch on the document.
    if payload_profile.is_some() && doc.profile_id.as_deref() != payload_profile {
        sqlx::query("UPDATE documents SET profile_id = ? WHERE id = ?")
            .bind(payload_profile)
            .bind(document_id)
            .execute(&ctx.pool)
            .await?;
    }
    ctx.queue.set_progress(&job.id, 20.0).await?;

    let doc = store::get_document(&ctx.pool, document_id)
        .await?
        .ok_or_else(|| Error::fatal(format!("document {} vanished mid-reindex", document_id)))?;
    let window = ProgressWindow {
        queue: &ctx.queue,
        job_id: &job.id,
        base: 20.0,
    };
    index_document(ctx, &doc, &profile, chunk_options, &window).await
}

/// Collection holding a document's current points, derived from its
/// profile's embedding model with config defaults as fallback (the profile
/// row may have been deleted since indexing).
async fn collection_for_document(ctx: &PipelineContext, doc: &Document) -> Result<String> {
    let model = match &doc.profile_id {
        Some(pid) => profiles::get_profile(&ctx.pool, pid)
            .await?
            .map(|p| p.embedding_model)
            .unwrap_or_else(|| ctx.config.embedding.model.clone()),
        None => ctx.config.embedding.model.clone(),
    };
    ctx.resolver.collection_for_model(&model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::embedding::{EmbeddingProvider, OfflineProviderFactory};
    use crate::migrate;
    use crate::store::NewDocument;
    use crate::vector::MemoryVectorStore;
    use async_trait::async_trait;
    use tempfile::TempDir;

    async fn context_with(embedders: Arc<dyn ProviderFactory>) -> (Arc<PipelineContext>, TempDir) {
        let dir = TempDir::new().unwrap();
        let pool = db::connect(&dir.path().join("test.sqlite")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let mut config: Config = toml::from_str("[db]\npath = \"/tmp/x.sqlite\"\n").unwrap();
        config.queue.backoff_base_ms = 0;
        let queue = JobQueue::new(pool.clone(), config.queue.clone());
        let ctx = PipelineContext {
            pool,
            resolver: Arc::new(CollectionResolver::new(&config.vector.collection_prefix)),
            queue,
            vectors: Arc::new(MemoryVectorStore::new()),
            embedders,
            config,
        };
        (Arc::new(ctx), dir)
    }

    async fn context() -> (Arc<PipelineContext>, TempDir) {
        context_with(Arc::new(OfflineProviderFactory)).await
    }

    async fn insert_doc(ctx: &PipelineContext, content: &str) -> Document {
        store::insert_document(
            &ctx.pool,
            NewDocument {
                owner_id: "u1".to_string(),
                profile_id: None,
                title: "Handbook".to_string(),
                content: content.to_string(),
                source: Some("upload".to_string()),
                metadata_json: "{}".to_string(),
            },
        )
        .await
        .unwrap()
    }

    fn long_text() -> String {
        "Employees receive twenty five days of vacation per calendar year. "
            .repeat(30)
    }

    #[tokio::test]
    async fn index_job_produces_consistent_rows_and_points() {
        let (ctx, _dir) = context().await;
        let doc = insert_doc(&ctx, &long_text()).await;

        let job_id = ctx
            .queue
            .enqueue(&JobPayload::Index {
                document_id: doc.id.clone(),
                profile_id: None,
                chunk_options: None,
            })
            .await
            .unwrap();
        drain(&ctx).await.unwrap();

        let job = ctx.queue.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.state, crate::queue::JobState::Completed);
        assert_eq!(job.progress, 100.0);

        let doc = store::get_document(&ctx.pool, &doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Indexed);
        assert!(doc.chunk_count > 1);

        let rows = store::chunk_count(&ctx.pool, &doc.id).await.unwrap();
        assert_eq!(rows, doc.chunk_count);

        let points = ctx
            .vectors
            .count("docs_1536", &PointFilter::for_document(&doc.id))
            .await
            .unwrap();
        assert_eq!(points as i64, doc.chunk_count);
    }

    #[tokio::test]
    async fn empty_document_indexes_with_zero_chunks() {
        let (ctx, _dir) = context().await;
        let doc = insert_doc(&ctx, "   \n\n  ").await;
        ctx.queue
            .enqueue(&JobPayload::Index {
                document_id: doc.id.clone(),
                profile_id: None,
                chunk_options: None,
            })
            .await
            .unwrap();
        drain(&ctx).await.unwrap();

        let doc = store::get_document(&ctx.pool, &doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Indexed);
        assert_eq!(doc.chunk_count, 0);
    }

    struct AlwaysFailingProvider;

    #[async_trait]
    impl EmbeddingProvider for AlwaysFailingProvider {
        fn model(&self) -> &str {
            "text-embedding-3-small"
        }
        fn dims(&self) -> usize {
            1536
        }
        async fn embed(&self, _texts: &[String]) -> crate::error::Result<Vec<Vec<f32>>> {
            Err(Error::transient("provider down"))
        }
    }

    struct FailingFactory;

    impl ProviderFactory for FailingFactory {
        fn for_model(&self, _model: &str) -> crate::error::Result<Arc<dyn EmbeddingProvider>> {
            Ok(Arc::new(AlwaysFailingProvider))
        }
    }

    #[tokio::test]
    async fn failed_index_leaves_no_orphans_and_marks_document_failed() {
        let (ctx, _dir) = context_with(Arc::new(FailingFactory)).await;
        let doc = insert_doc(&ctx, &long_text()).await;

        let job_id = ctx
            .queue
            .enqueue(&JobPayload::Index {
                document_id: doc.id.clone(),
                profile_id: None,
                chunk_options: None,
            })
            .await
            .unwrap();
        drain(&ctx).await.unwrap();

        let job = ctx.queue.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.state, crate::queue::JobState::Failed);
        assert_eq!(job.attempts_made, ctx.config.queue.max_attempts as i64);

        let doc = store::get_document(&ctx.pool, &doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert!(doc.error.is_some());
        assert_eq!(store::chunk_count(&ctx.pool, &doc.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_job_removes_rows_and_points() {
        let (ctx, _dir) = context().await;
        let doc = insert_doc(&ctx, &long_text()).await;
        ctx.queue
            .enqueue(&JobPayload::Index {
                document_id: doc.id.clone(),
                profile_id: None,
                chunk_options: None,
            })
            .await
            .unwrap();
        drain(&ctx).await.unwrap();
        assert!(
            ctx.vectors
                .count("docs_1536", &PointFilter::for_document(&doc.id))
                .await
                .unwrap()
                > 0
        );

        ctx.queue
            .enqueue(&JobPayload::Delete {
                document_id: doc.id.clone(),
            })
            .await
            .unwrap();
        drain(&ctx).await.unwrap();

        assert!(store::get_document(&ctx.pool, &doc.id).await.unwrap().is_none());
        assert_eq!(store::chunk_count(&ctx.pool, &doc.id).await.unwrap(), 0);
        assert_eq!(
            ctx.vectors
                .count("docs_1536", &PointFilter::for_document(&doc.id))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn delete_of_missing_document_completes() {
        let (ctx, _dir) = context().await;
        let job_id = ctx
            .queue
            .enqueue(&JobPayload::Delete {
                document_id: "ghost".to_string(),
            })
            .await
            .unwrap();
        drain(&ctx).await.unwrap();
        let job = ctx.queue.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.state, crate::queue::JobState::Completed);
    }

    #[tokio::test]
    async fn reindex_with_new_profile_moves_points_between_collections() {
        let (ctx, _dir) = context().await;
        let doc = insert_doc(&ctx, &long_text()).await;
        ctx.queue
            .enqueue(&JobPayload::Index {
                document_id: doc.id.clone(),
                profile_id: None,
                chunk_options: None,
            })
            .await
            .unwrap();
        drain(&ctx).await.unwrap();

        let profile = profiles::create_profile(
            &ctx.pool,
            &ctx.config,
            "u1",
            profiles::ProfileDraft {
                name: Some("Large".to_string()),
                embedding_model: Some("text-embedding-3-large".to_string()),
                ..profiles::ProfileDraft::default()
            },
        )
        .await
        .unwrap();

        ctx.queue
            .enqueue(&JobPayload::Reindex {
                document_id: doc.id.clone(),
                profile_id: Some(profile.id.clone()),
                chunk_options: None,
            })
            .await
            .unwrap();
        drain(&ctx).await.unwrap();

        let filter = PointFilter::for_document(&doc.id);
        assert_eq!(ctx.vectors.count("docs_1536", &filter).await.unwrap(), 0);
        assert!(ctx.vectors.count("docs_3072", &filter).await.unwrap() > 0);

        let doc = store::get_document(&ctx.pool, &doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Indexed);
        assert_eq!(doc.profile_id.as_deref(), Some(profile.id.as_str()));
    }

    #[tokio::test]
    async fn reindex_missing_document_fails_fatally() {
        let (ctx, _dir) = context().await;
        let job_id = ctx
            .queue
            .enqueue(&JobPayload::Reindex {
                document_id: "ghost".to_string(),
                profile_id: None,
                chunk_options: None,
            })
            .await
            .unwrap();
        drain(&ctx).await.unwrap();
        let job = ctx.queue.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.state, crate::queue::JobState::Failed);
        assert_eq!(job.attempts_made, 1); // fatal, no retries
    }

    #[tokio::test]
    async fn chunk_option_overrides_change_segmentation() {
        let (ctx, _dir) = context().await;
        let doc = insert_doc(&ctx, &long_text()).await;
        ctx.queue
            .enqueue(&JobPayload::Index {
                document_id: doc.id.clone(),
                profile_id: None,
                chunk_options: None,
            })
            .await
            .unwrap();
        drain(&ctx).await.unwrap();
        let default_count = store::get_document(&ctx.pool, &doc.id)
            .await
            .unwrap()
            .unwrap()
            .chunk_count;

        // Reindex with a much smaller chunk size; the override beats the
        // profile's settings.
        ctx.queue
            .enqueue(&JobPayload::Reindex {
                document_id: doc.id.clone(),
                profile_id: None,
                chunk_options: Some(ChunkOverride {
                    chunk_size: Some(100),
                    chunk_overlap: Some(0),
                    separators: None,
                }),
            })
            .await
            .unwrap();
        drain(&ctx).await.unwrap();

        let doc = store::get_document(&ctx.pool, &doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Indexed);
        assert!(
            doc.chunk_count > default_count,
            "expected more chunks at size 100, got {} vs {}",
            doc.chunk_count,
            default_count
        );
        for chunk in store::chunks_for_document(&ctx.pool, &doc.id).await.unwrap() {
            assert!(chunk.content.chars().count() <= 100);
        }
    }

    #[tokio::test]
    async fn index_rerun_replaces_stale_points() {
        let (ctx, _dir) = context().await;
        let doc = insert_doc(&ctx, &long_text()).await;

        // A point left behind by an earlier run whose cleanup never
        // reached the vector store.
        let collection = ctx
            .resolver
            .resolve(ctx.vectors.as_ref(), "text-embedding-3-small")
            .await
            .unwrap();
        ctx.vectors
            .upsert(
                &collection,
                vec![VectorPoint {
                    id: "stale-point".to_string(),
                    vector: vec![0.1; 1536],
                    payload: PointPayload {
                        document_id: doc.id.clone(),
                        owner_id: doc.owner_id.clone(),
                        chunk_id: "stale-chunk".to_string(),
                        content: "old content".to_string(),
                        chunk_index: 0,
                        source: None,
                        metadata: serde_json::Value::Null,
                    },
                }],
            )
            .await
            .unwrap();

        ctx.queue
            .enqueue(&JobPayload::Index {
                document_id: doc.id.clone(),
                profile_id: None,
                chunk_options: None,
            })
            .await
            .unwrap();
        drain(&ctx).await.unwrap();

        let doc = store::get_document(&ctx.pool, &doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Indexed);
        // Rows and points agree; the stale point did not survive.
        assert_eq!(
            ctx.vectors
                .count(&collection, &PointFilter::for_document(&doc.id))
                .await
                .unwrap() as i64,
            doc.chunk_count
        );
    }
}
