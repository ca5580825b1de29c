//! Vector store abstraction, Qdrant HTTP client, and collection resolver.
//!
//! Points are keyed by the same id as their chunk row and carry a payload
//! rich enough to render a search result without touching SQLite. One
//! collection exists per embedding dimensionality (`docs_1536`,
//! `docs_3072`, ...), so switching a profile to a different model never
//! mixes vector sizes inside a collection.
//!
//! [`CollectionResolver`] memoizes ensure-collection calls in an injected
//! set with a lifecycle tied to the resolver instance, so tests get a
//! fresh cache per resolver instead of process-global state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::VectorConfig;
use crate::embedding::model_dims;
use crate::error::{Error, Result};

/// Payload stored alongside each vector, sufficient to reconstruct a
/// search result without a relational join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointPayload {
    pub document_id: String,
    pub owner_id: String,
    pub chunk_id: String,
    pub content: String,
    pub chunk_index: i64,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// One vector-store record. The id equals the chunk row id by convention.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

/// Equality filter; populated fields are ANDed.
#[derive(Debug, Clone, Default)]
pub struct PointFilter {
    pub document_id: Option<String>,
    pub owner_id: Option<String>,
    pub source: Option<String>,
}

impl PointFilter {
    pub fn for_document(document_id: &str) -> Self {
        Self {
            document_id: Some(document_id.to_string()),
            owner_id: None,
            source: None,
        }
    }

    pub fn for_owner(owner_id: &str) -> Self {
        Self {
            document_id: None,
            owner_id: Some(owner_id.to_string()),
            source: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.document_id.is_none() && self.owner_id.is_none() && self.source.is_none()
    }

    fn matches(&self, payload: &PointPayload) -> bool {
        if let Some(ref d) = self.document_id {
            if &payload.document_id != d {
                return false;
            }
        }
        if let Some(ref o) = self.owner_id {
            if &payload.owner_id != o {
                return false;
            }
        }
        if let Some(ref s) = self.source {
            if payload.source.as_deref() != Some(s.as_str()) {
                return false;
            }
        }
        true
    }
}

/// A search hit with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: PointPayload,
}

/// Vector database operations used by the pipeline and query service.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection if it does not exist (cosine distance,
    /// payload indexes on document_id/source, text index on content).
    /// Must be idempotent.
    async fn ensure_collection(&self, name: &str, dims: usize) -> Result<()>;

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()>;

    async fn delete(&self, collection: &str, filter: &PointFilter) -> Result<()>;

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: f32,
        filter: &PointFilter,
    ) -> Result<Vec<ScoredPoint>>;

    /// Point count matching a filter. Used by lifecycle checks and tests.
    async fn count(&self, collection: &str, filter: &PointFilter) -> Result<usize>;
}

// ============ Collection resolver ============

/// Maps an embedding model to its dimensionality-keyed collection name,
/// lazily creating the collection on first use.
pub struct CollectionResolver {
    prefix: String,
    seen: Mutex<HashSet<String>>,
}

impl CollectionResolver {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Collection name for a model id. Unknown model is a validation
    /// error, never a silent default.
    pub fn collection_for_model(&self, model: &str) -> Result<String> {
        Ok(self.collection_for_dims(model_dims(model)?))
    }

    pub fn collection_for_dims(&self, dims: usize) -> String {
        format!("{}_{}", self.prefix, dims)
    }

    /// Resolve and ensure the collection for a model, memoizing the
    /// ensure so repeated resolutions hit the store at most once.
    pub async fn resolve(&self, store: &dyn VectorStore, model: &str) -> Result<String> {
        let dims = model_dims(model)?;
        let name = self.collection_for_dims(dims);
        {
            let seen = self.seen.lock().unwrap();
            if seen.contains(&name) {
                return Ok(name);
            }
        }
        store.ensure_collection(&name, dims).await?;
        self.seen.lock().unwrap().insert(name.clone());
        Ok(name)
    }
}

// ============ Qdrant HTTP store ============

/// Qdrant-backed store speaking the HTTP API directly.
pub struct QdrantStore {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl QdrantStore {
    pub fn new(config: &VectorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::transient(format!("http client: {}", e)))?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(ref key) = self.api_key {
            req = req.header("api-key", key);
        }
        req
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        context: &str,
    ) -> Result<serde_json::Value> {
        let resp = req
            .send()
            .await
            .map_err(|e| Error::transient(format!("{}: {}", context, e)))?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
        if status.is_success() {
            Ok(body)
        } else if status.is_server_error() || status.as_u16() == 429 {
            Err(Error::transient(format!("{}: HTTP {} {}", context, status, body)))
        } else {
            Err(Error::fatal(format!("{}: HTTP {} {}", context, status, body)))
        }
    }

    fn filter_json(filter: &PointFilter) -> Option<serde_json::Value> {
        let mut must = Vec::new();
        if let Some(ref d) = filter.document_id {
            must.push(serde_json::json!({"key": "document_id", "match": {"value": d}}));
        }
        if let Some(ref o) = filter.owner_id {
            must.push(serde_json::json!({"key": "owner_id", "match": {"value": o}}));
        }
        if let Some(ref s) = filter.source {
            must.push(serde_json::json!({"key": "source", "match": {"value": s}}));
        }
        if must.is_empty() {
            None
        } else {
            Some(serde_json::json!({"must": must}))
        }
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(&self, name: &str, dims: usize) -> Result<()> {
        let probe = self
            .request(reqwest::Method::GET, &format!("/collections/{}", name))
            .send()
            .await
            .map_err(|e| Error::transient(format!("collection probe: {}", e)))?;
        if probe.status().is_success() {
            return Ok(());
        }

        self.send(
            self.request(reqwest::Method::PUT, &format!("/collections/{}", name))
                .json(&serde_json::json!({
                    "vectors": {"size": dims, "distance": "Cosine"}
                })),
            "create collection",
        )
        .await?;

        for (field, schema) in [
            ("document_id", "keyword"),
            ("owner_id", "keyword"),
            ("source", "keyword"),
            ("content", "text"),
        ] {
            self.send(
                self.request(reqwest::Method::PUT, &format!("/collections/{}/index", name))
                    .json(&serde_json::json!({
                        "field_name": field,
                        "field_schema": schema,
                    })),
                "create payload index",
            )
            .await?;
        }
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        let body: Vec<serde_json::Value> = points
            .iter()
            .map(|p| {
                serde_json::json!({
                    "id": p.id,
                    "vector": p.vector,
                    "payload": p.payload,
                })
            })
            .collect();
        self.send(
            self.request(
                reqwest::Method::PUT,
                &format!("/collections/{}/points?wait=true", collection),
            )
            .json(&serde_json::json!({"points": body})),
            "upsert points",
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, filter: &PointFilter) -> Result<()> {
        let Some(filter_json) = Self::filter_json(filter) else {
            return Err(Error::validation("refusing unfiltered point delete"));
        };
        self.send(
            self.request(
                reqwest::Method::POST,
                &format!("/collections/{}/points/delete?wait=true", collection),
            )
            .json(&serde_json::json!({"filter": filter_json})),
            "delete points",
        )
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: f32,
        filter: &PointFilter,
    ) -> Result<Vec<ScoredPoint>> {
        let mut body = serde_json::json!({
            "vector": vector,
            "limit": limit,
            "score_threshold": score_threshold,
            "with_payload": true,
        });
        if let Some(filter_json) = Self::filter_json(filter) {
            body["filter"] = filter_json;
        }

        let json = self
            .send(
                self.request(
                    reqwest::Method::POST,
                    &format!("/collections/{}/points/search", collection),
                )
                .json(&body),
                "search points",
            )
            .await?;

        let hits = json
            .get("result")
            .and_then(|r| r.as_array())
            .ok_or_else(|| Error::transient("invalid search response"))?;

        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            let payload: PointPayload = serde_json::from_value(
                hit.get("payload").cloned().unwrap_or(serde_json::Value::Null),
            )
            .map_err(|e| Error::transient(format!("invalid point payload: {}", e)))?;
            out.push(ScoredPoint {
                id: hit
                    .get("id")
                    .map(|i| i.to_string().trim_matches('"').to_string())
                    .unwrap_or_default(),
                score: hit.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0) as f32,
                payload,
            });
        }
        Ok(out)
    }

    async fn count(&self, collection: &str, filter: &PointFilter) -> Result<usize> {
        let mut body = serde_json::json!({"exact": true});
        if let Some(filter_json) = Self::filter_json(filter) {
            body["filter"] = filter_json;
        }
        let json = self
            .send(
                self.request(
                    reqwest::Method::POST,
                    &format!("/collections/{}/points/count", collection),
                )
                .json(&body),
                "count points",
            )
            .await?;
        Ok(json
            .get("result")
            .and_then(|r| r.get("count"))
            .and_then(|c| c.as_u64())
            .unwrap_or(0) as usize)
    }
}

// ============ In-memory store ============

/// In-process store with cosine scoring. Backs the hermetic pipeline
/// tests and offline smoke runs; semantics mirror [`QdrantStore`].
#[derive(Default)]
pub struct MemoryVectorStore {
    collections: Mutex<HashMap<String, MemoryCollection>>,
    creations: AtomicUsize,
}

struct MemoryCollection {
    dims: usize,
    points: HashMap<String, (Vec<f32>, PointPayload)>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of collection creations performed (not ensure calls).
    pub fn creation_count(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_collection(&self, name: &str, dims: usize) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        if !collections.contains_key(name) {
            collections.insert(
                name.to_string(),
                MemoryCollection {
                    dims,
                    points: HashMap::new(),
                },
            );
            self.creations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        let coll = collections
            .get_mut(collection)
            .ok_or_else(|| Error::not_found(format!("collection {}", collection)))?;
        for p in points {
            if p.vector.len() != coll.dims {
                return Err(Error::fatal(format!(
                    "vector of {} dims upserted into {}-dim collection {}",
                    p.vector.len(),
                    coll.dims,
                    collection
                )));
            }
            coll.points.insert(p.id, (p.vector, p.payload));
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, filter: &PointFilter) -> Result<()> {
        if filter.is_empty() {
            return Err(Error::validation("refusing unfiltered point delete"));
        }
        let mut collections = self.collections.lock().unwrap();
        // Deleting from a collection that was never created is a no-op,
        // matching the idempotency of a filtered delete.
        if let Some(coll) = collections.get_mut(collection) {
            coll.points.retain(|_, (_, payload)| !filter.matches(payload));
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: f32,
        filter: &PointFilter,
    ) -> Result<Vec<ScoredPoint>> {
        let collections = self.collections.lock().unwrap();
        let Some(coll) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<ScoredPoint> = coll
            .points
            .iter()
            .filter(|(_, (_, payload))| filter.matches(payload))
            .map(|(id, (v, payload))| ScoredPoint {
                id: id.clone(),
                score: cosine_similarity(vector, v),
                payload: payload.clone(),
            })
            .filter(|hit| hit.score >= score_threshold)
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count(&self, collection: &str, filter: &PointFilter) -> Result<usize> {
        let collections = self.collections.lock().unwrap();
        Ok(collections
            .get(collection)
            .map(|coll| {
                coll.points
                    .values()
                    .filter(|(_, payload)| filter.matches(payload))
                    .count()
            })
            .unwrap_or(0))
    }
}

/// Cosine similarity between two vectors; 0.0 for mismatched or empty
/// inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(doc: &str, chunk: &str, source: Option<&str>) -> PointPayload {
        PointPayload {
            document_id: doc.to_string(),
            owner_id: "u1".to_string(),
            chunk_id: chunk.to_string(),
            content: format!("content of {}", chunk),
            chunk_index: 0,
            source: source.map(|s| s.to_string()),
            metadata: serde_json::Value::Null,
        }
    }

    fn point(id: &str, vector: Vec<f32>, doc: &str, source: Option<&str>) -> VectorPoint {
        VectorPoint {
            id: id.to_string(),
            vector,
            payload: payload(doc, id, source),
        }
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("docs_4", 4).await.unwrap();
        store.ensure_collection("docs_4", 4).await.unwrap();
        assert_eq!(store.creation_count(), 1);
    }

    #[tokio::test]
    async fn resolver_ensures_at_most_once_per_model() {
        let store = MemoryVectorStore::new();
        let resolver = CollectionResolver::new("docs");
        let a = resolver
            .resolve(&store, "text-embedding-3-small")
            .await
            .unwrap();
        let b = resolver
            .resolve(&store, "text-embedding-3-small")
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "docs_1536");
        assert_eq!(store.creation_count(), 1);
    }

    #[tokio::test]
    async fn different_models_resolve_to_dims_named_collections() {
        let store = MemoryVectorStore::new();
        let resolver = CollectionResolver::new("docs");
        let small = resolver
            .resolve(&store, "text-embedding-3-small")
            .await
            .unwrap();
        let large = resolver
            .resolve(&store, "text-embedding-3-large")
            .await
            .unwrap();
        assert_ne!(small, large);
        assert_eq!(store.collection_names(), vec!["docs_1536", "docs_3072"]);
    }

    #[tokio::test]
    async fn resolver_rejects_unknown_model() {
        let store = MemoryVectorStore::new();
        let resolver = CollectionResolver::new("docs");
        let err = resolver.resolve(&store, "mystery-model").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn search_filters_and_thresholds() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("docs_2", 2).await.unwrap();
        store
            .upsert(
                "docs_2",
                vec![
                    point("a", vec![1.0, 0.0], "doc1", Some("web")),
                    point("b", vec![0.9, 0.1], "doc1", None),
                    point("c", vec![0.0, 1.0], "doc2", Some("web")),
                ],
            )
            .await
            .unwrap();

        // Threshold excludes the orthogonal point.
        let hits = store
            .search("docs_2", &[1.0, 0.0], 10, 0.5, &PointFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");

        // Document filter.
        let hits = store
            .search(
                "docs_2",
                &[1.0, 0.0],
                10,
                0.0,
                &PointFilter::for_document("doc2"),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "c");

        // Source + document ANDed.
        let filter = PointFilter {
            document_id: Some("doc1".to_string()),
            owner_id: None,
            source: Some("web".to_string()),
        };
        let hits = store
            .search("docs_2", &[1.0, 0.0], 10, 0.0, &filter)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }

    #[tokio::test]
    async fn delete_by_document_removes_only_that_document() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("docs_2", 2).await.unwrap();
        store
            .upsert(
                "docs_2",
                vec![
                    point("a", vec![1.0, 0.0], "doc1", None),
                    point("b", vec![0.0, 1.0], "doc2", None),
                ],
            )
            .await
            .unwrap();
        store
            .delete("docs_2", &PointFilter::for_document("doc1"))
            .await
            .unwrap();
        assert_eq!(
            store
                .count("docs_2", &PointFilter::for_document("doc1"))
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            store.count("docs_2", &PointFilter::default()).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn unfiltered_delete_is_refused() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("docs_2", 2).await.unwrap();
        let err = store
            .delete("docs_2", &PointFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn mismatched_dims_rejected() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("docs_2", 2).await.unwrap();
        let err = store
            .upsert("docs_2", vec![point("a", vec![1.0, 0.0, 0.0], "d", None)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }

    #[test]
    fn cosine_basics() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
