//! Retrieval-augmented query service.
//!
//! `search` embeds the query and returns scored chunks from the caller's
//! own documents. `query` wraps retrieval in a persona-shaped prompt and
//! generates an answer; `query_stream` does the same but yields events as
//! they happen, in strict order: one `Sources`, then content tokens, then
//! a terminal `Done`.
//!
//! Retrieval coming back empty short-circuits: the caller gets a fixed
//! "nothing indexed matches" answer and the generation provider is never
//! called, so an empty corpus costs no tokens and cannot hallucinate.

use std::sync::Arc;

use futures_util::StreamExt;
use sqlx::SqlitePool;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::chat;
use crate::completion::{CompletionProvider, CompletionRequest};
use crate::config::Config;
use crate::embedding::{embed_query, ProviderFactory};
use crate::error::Result;
use crate::models::{ChatMessage, ChatRole, Profile, RagSource, StreamEvent};
use crate::profiles::{self, BUILTIN_PROFILE_ID};
use crate::vector::{CollectionResolver, PointFilter, VectorStore};

/// Answer returned when retrieval finds nothing above the threshold.
pub const NO_CONTEXT_ANSWER: &str =
    "I could not find any relevant information in the indexed documents.";

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub profile_id: Option<String>,
    /// Overrides the profile's top_k when set.
    #[serde(default)]
    pub top_k: Option<usize>,
    /// Overrides the profile's score threshold when set.
    #[serde(default)]
    pub score_threshold: Option<f32>,
    /// Restrict hits to one document.
    #[serde(default)]
    pub document_id: Option<String>,
    /// Restrict hits to documents with this source value.
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub history: Option<Vec<ChatMessage>>,
    /// Start a server-managed conversation for this exchange. Ignored when
    /// `conversation_id` is set.
    #[serde(default)]
    pub start_conversation: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryAnswer {
    pub answer: String,
    pub sources: Vec<RagSource>,
    pub conversation_id: Option<String>,
}

pub struct RagService {
    pub pool: SqlitePool,
    pub config: Config,
    pub vectors: Arc<dyn VectorStore>,
    pub embedders: Arc<dyn ProviderFactory>,
    pub resolver: Arc<CollectionResolver>,
    pub completer: Arc<dyn CompletionProvider>,
}

impl RagService {
    /// Embed the query and return scored chunks from the owner's corpus.
    pub async fn search(&self, owner_id: &str, req: &SearchRequest) -> Result<Vec<RagSource>> {
        let profile =
            profiles::resolve_profile(&self.pool, &self.config, owner_id, req.profile_id.as_deref())
                .await?;
        self.search_with_profile(owner_id, &profile, req).await
    }

    async fn search_with_profile(
        &self,
        owner_id: &str,
        profile: &Profile,
        req: &SearchRequest,
    ) -> Result<Vec<RagSource>> {
        let provider = self.embedders.for_model(&profile.embedding_model)?;
        let vector = embed_query(provider.as_ref(), &req.query).await?;
        let collection = self
            .resolver
            .resolve(self.vectors.as_ref(), &profile.embedding_model)
            .await?;

        let mut filter = PointFilter::for_owner(owner_id);
        filter.document_id = req.document_id.clone();
        filter.source = req.source.clone();

        let hits = self
            .vectors
            .search(
                &collection,
                &vector,
                req.top_k.unwrap_or(profile.top_k),
                req.score_threshold.unwrap_or(profile.score_threshold),
                &filter,
            )
            .await?;

        Ok(hits
            .into_iter()
            .map(|hit| RagSource {
                document_id: hit.payload.document_id,
                chunk_id: hit.payload.chunk_id,
                content: hit.payload.content,
                score: hit.score,
            })
            .collect())
    }

    /// Answer a question over the owner's corpus, with optional history.
    pub async fn query(&self, owner_id: &str, req: &QueryRequest) -> Result<QueryAnswer> {
        let history = chat::resolve_history(
            &self.pool,
            owner_id,
            req.conversation_id.as_deref(),
            req.history.clone(),
        )
        .await?;

        let explicit = req.profile_id.as_deref().or_else(|| {
            history
                .conversation
                .as_ref()
                .and_then(|c| c.profile_id.as_deref())
        });
        let profile =
            profiles::resolve_profile(&self.pool, &self.config, owner_id, explicit).await?;

        let sources = self
            .search_with_profile(
                owner_id,
                &profile,
                &SearchRequest {
                    query: req.question.clone(),
                    ..SearchRequest::default()
                },
            )
            .await?;

        let answer = if sources.is_empty() {
            NO_CONTEXT_ANSWER.to_string()
        } else {
            let request = build_completion_request(&profile, &sources, &history.turns, &req.question);
            self.completer.complete(&request).await?
        };

        let conversation_id = self
            .persist_turns(owner_id, req, &profile, history.conversation.map(|c| c.id), &answer)
            .await?;

        Ok(QueryAnswer {
            answer,
            sources,
            conversation_id,
        })
    }

    /// Streaming variant of [`query`](Self::query). Retrieval and history
    /// resolution happen before the stream starts, so their failures
    /// surface as plain errors; a generation failure mid-stream is logged
    /// and the stream ends with `Done`.
    ///
    /// Dropping the returned stream cancels generation.
    pub async fn query_stream(
        &self,
        owner_id: &str,
        req: &QueryRequest,
    ) -> Result<ReceiverStream<StreamEvent>> {
        let history = chat::resolve_history(
            &self.pool,
            owner_id,
            req.conversation_id.as_deref(),
            req.history.clone(),
        )
        .await?;

        let explicit = req.profile_id.as_deref().or_else(|| {
            history
                .conversation
                .as_ref()
                .and_then(|c| c.profile_id.as_deref())
        });
        let profile =
            profiles::resolve_profile(&self.pool, &self.config, owner_id, explicit).await?;

        let sources = self
            .search_with_profile(
                owner_id,
                &profile,
                &SearchRequest {
                    query: req.question.clone(),
                    ..SearchRequest::default()
                },
            )
            .await?;

        // A fresh conversation is created before streaming begins so the
        // terminal `Done` event can hand its id back to the client.
        let conversation_id = match history.conversation.map(|c| c.id) {
            Some(id) => Some(id),
            None if req.start_conversation => {
                let profile_id = (profile.id != BUILTIN_PROFILE_ID).then(|| profile.id.as_str());
                let conv =
                    chat::create_conversation(&self.pool, owner_id, profile_id, None).await?;
                Some(conv.id)
            }
            None => None,
        };

        let (tx, rx) = tokio::sync::mpsc::channel::<StreamEvent>(32);
        let completer = self.completer.clone();
        let pool = self.pool.clone();
        let question = req.question.clone();
        let turns = history.turns;

        tokio::spawn(async move {
            if tx.send(StreamEvent::Sources(sources.clone())).await.is_err() {
                return;
            }

            let mut answer = String::new();
            if sources.is_empty() {
                answer.push_str(NO_CONTEXT_ANSWER);
                if tx
                    .send(StreamEvent::Token(NO_CONTEXT_ANSWER.to_string()))
                    .await
                    .is_err()
                {
                    return;
                }
            } else {
                let request = build_completion_request(&profile, &sources, &turns, &question);
                match completer.stream(&request).await {
                    Ok(mut tokens) => {
                        while let Some(token) = tokens.next().await {
                            match token {
                                Ok(token) => {
                                    answer.push_str(&token);
                                    if tx.send(StreamEvent::Token(token)).await.is_err() {
                                        // Client went away; cancel generation.
                                        return;
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "generation stream failed");
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "generation failed"),
                }
            }

            if let Some(ref conv_id) = conversation_id {
                if let Err(e) = append_exchange(&pool, conv_id, &question, &answer).await {
                    warn!(conversation = %conv_id, error = %e, "failed to persist turns");
                }
            }

            let _ = tx.send(StreamEvent::Done { conversation_id }).await;
        });

        Ok(ReceiverStream::new(rx))
    }

    async fn persist_turns(
        &self,
        owner_id: &str,
        req: &QueryRequest,
        profile: &Profile,
        existing: Option<String>,
        answer: &str,
    ) -> Result<Option<String>> {
        let conversation_id = match existing {
            Some(id) => Some(id),
            None if req.start_conversation => {
                let profile_id = (profile.id != BUILTIN_PROFILE_ID).then(|| profile.id.as_str());
                let conv =
                    chat::create_conversation(&self.pool, owner_id, profile_id, None).await?;
                Some(conv.id)
            }
            None => None,
        };

        if let Some(ref id) = conversation_id {
            append_exchange(&self.pool, id, &req.question, answer).await?;
        }
        Ok(conversation_id)
    }
}

async fn append_exchange(
    pool: &SqlitePool,
    conversation_id: &str,
    question: &str,
    answer: &str,
) -> Result<()> {
    chat::append_message(pool, conversation_id, ChatRole::User, question).await?;
    chat::append_message(pool, conversation_id, ChatRole::Assistant, answer).await?;
    Ok(())
}

/// Render the persona system prompt plus retrieved context, then flatten
/// history and the new question into one completion request.
fn build_completion_request(
    profile: &Profile,
    sources: &[RagSource],
    history: &[ChatMessage],
    question: &str,
) -> CompletionRequest {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage {
        role: ChatRole::System,
        content: build_system_prompt(profile, sources),
    });
    messages.extend(history.iter().cloned());
    messages.push(ChatMessage {
        role: ChatRole::User,
        content: question.to_string(),
    });

    CompletionRequest {
        model: profile.generation_model.clone(),
        messages,
        temperature: profile.temperature,
        max_tokens: profile.max_tokens,
    }
}

fn build_system_prompt(profile: &Profile, sources: &[RagSource]) -> String {
    let mut lines = Vec::new();

    match &profile.company {
        Some(company) => lines.push(format!(
            "You are {}, the assistant of {}.",
            profile.assistant_name, company
        )),
        None => lines.push(format!("You are {}.", profile.assistant_name)),
    }
    if let Some(domain) = &profile.domain {
        lines.push(format!("You specialize in {}.", domain));
    }
    if let Some(tone) = &profile.tone {
        lines.push(format!("Respond in a {} tone.", tone));
    }
    if let Some(length) = &profile.response_length {
        lines.push(format!("Keep responses {}.", length));
    }
    if let Some(language) = &profile.language {
        lines.push(format!("Always answer in {}.", language));
    }
    if profile.citations {
        lines.push("Cite sources with [n] markers matching the numbered context blocks.".to_string());
    }
    for instruction in &profile.custom_instructions {
        lines.push(instruction.clone());
    }

    lines.push(String::new());
    lines.push(
        "Answer using only the context below. If the context does not contain the answer, say that you do not know."
            .to_string(),
    );
    lines.push(String::new());
    lines.push("Context:".to_string());
    for (i, source) in sources.iter().enumerate() {
        lines.push(format!("[{}] {}", i + 1, source.content));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::embedding::{EmbeddingProvider, OfflineProviderFactory};
    use crate::migrate;
    use crate::profiles::ProfileDraft;
    use crate::vector::{MemoryVectorStore, PointPayload, VectorPoint};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct RecordingCompleter {
        answer: String,
        calls: AtomicUsize,
        last_messages: Mutex<Vec<ChatMessage>>,
    }

    impl RecordingCompleter {
        fn new(answer: &str) -> Self {
            Self {
                answer: answer.to_string(),
                calls: AtomicUsize::new(0),
                last_messages: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompletionProvider for RecordingCompleter {
        async fn complete(&self, req: &CompletionRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_messages.lock().unwrap() = req.messages.clone();
            Ok(self.answer.clone())
        }

        async fn stream(
            &self,
            req: &CompletionRequest,
        ) -> Result<futures_util::stream::BoxStream<'static, Result<String>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_messages.lock().unwrap() = req.messages.clone();
            let tokens: Vec<Result<String>> = self
                .answer
                .split_inclusive(' ')
                .map(|t| Ok(t.to_string()))
                .collect();
            Ok(futures_util::stream::iter(tokens).boxed())
        }
    }

    async fn service(answer: &str) -> (RagService, Arc<RecordingCompleter>, TempDir) {
        let dir = TempDir::new().unwrap();
        let pool = db::connect(&dir.path().join("test.sqlite")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let config: Config = toml::from_str("[db]\npath = \"/tmp/x.sqlite\"\n").unwrap();
        let completer = Arc::new(RecordingCompleter::new(answer));
        let svc = RagService {
            pool,
            resolver: Arc::new(CollectionResolver::new(&config.vector.collection_prefix)),
            vectors: Arc::new(MemoryVectorStore::new()),
            embedders: Arc::new(OfflineProviderFactory),
            completer: completer.clone(),
            config,
        };
        (svc, completer, dir)
    }

    /// Embed chunk texts with the offline provider and plant them as
    /// points, as the index pipeline would have.
    async fn seed_points(svc: &RagService, owner: &str, model: &str, doc: &str, texts: &[&str]) {
        seed_points_from(svc, owner, model, doc, None, texts).await
    }

    async fn seed_points_from(
        svc: &RagService,
        owner: &str,
        model: &str,
        doc: &str,
        source: Option<&str>,
        texts: &[&str],
    ) {
        let provider = svc.embedders.for_model(model).unwrap();
        let collection = svc.resolver.resolve(svc.vectors.as_ref(), model).await.unwrap();
        let inputs: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
        let vectors = provider.embed(&inputs).await.unwrap();
        let points: Vec<VectorPoint> = texts
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (text, vector))| VectorPoint {
                id: uuid::Uuid::new_v4().to_string(),
                vector,
                payload: PointPayload {
                    document_id: doc.to_string(),
                    owner_id: owner.to_string(),
                    chunk_id: format!("{}-{}", doc, i),
                    content: text.to_string(),
                    chunk_index: i as i64,
                    source: source.map(|s| s.to_string()),
                    metadata: serde_json::Value::Null,
                },
            })
            .collect();
        svc.vectors.upsert(&collection, points).await.unwrap();
    }

    /// A permissive profile so offline-hash similarity always clears the
    /// threshold.
    async fn permissive_profile(svc: &RagService, owner: &str) -> Profile {
        profiles::create_profile(
            &svc.pool,
            &svc.config,
            owner,
            ProfileDraft {
                name: Some("Test".to_string()),
                is_default: Some(true),
                score_threshold: Some(0.0),
                ..ProfileDraft::default()
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn empty_corpus_returns_canned_answer_without_generation() {
        let (svc, completer, _dir) = service("should never appear").await;
        let answer = svc
            .query(
                "u1",
                &QueryRequest {
                    question: "How many vacation days?".to_string(),
                    ..QueryRequest::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(answer.answer, NO_CONTEXT_ANSWER);
        assert!(answer.sources.is_empty());
        assert_eq!(completer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn query_feeds_sources_into_the_prompt() {
        let (svc, completer, _dir) = service("Twenty five days.").await;
        permissive_profile(&svc, "u1").await;
        seed_points(
            &svc,
            "u1",
            "text-embedding-3-small",
            "doc1",
            &["Employees receive 25 vacation days per year."],
        )
        .await;

        let answer = svc
            .query(
                "u1",
                &QueryRequest {
                    question: "How many vacation days do employees get?".to_string(),
                    ..QueryRequest::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(answer.answer, "Twenty five days.");
        assert_eq!(answer.sources.len(), 1);
        assert_eq!(completer.calls.load(Ordering::SeqCst), 1);

        let messages = completer.last_messages.lock().unwrap();
        assert_eq!(messages[0].role, ChatRole::System);
        assert!(messages[0].content.contains("25 vacation days"));
        assert_eq!(messages.last().unwrap().role, ChatRole::User);
    }

    #[tokio::test]
    async fn search_is_scoped_to_owner() {
        let (svc, _completer, _dir) = service("x").await;
        permissive_profile(&svc, "u1").await;
        permissive_profile(&svc, "u2").await;
        seed_points(
            &svc,
            "u2",
            "text-embedding-3-small",
            "doc-theirs",
            &["Their secret salary table."],
        )
        .await;

        let hits = svc
            .search(
                "u1",
                &SearchRequest {
                    query: "salary".to_string(),
                    ..SearchRequest::default()
                },
            )
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn request_threshold_overrides_profile_threshold() {
        let (svc, _completer, _dir) = service("x").await;
        permissive_profile(&svc, "u1").await;
        seed_points(
            &svc,
            "u1",
            "text-embedding-3-small",
            "doc1",
            &["Employees receive 25 vacation days per year."],
        )
        .await;

        // The profile's zero threshold lets a weak match through.
        let req = SearchRequest {
            query: "zzz unrelated zzz".to_string(),
            ..SearchRequest::default()
        };
        let hits = svc.search("u1", &req).await.unwrap();
        assert!(!hits.is_empty());

        // A stricter per-request threshold filters it out.
        let hits = svc
            .search(
                "u1",
                &SearchRequest {
                    score_threshold: Some(0.999),
                    ..req
                },
            )
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn source_filter_scopes_search_to_matching_documents() {
        let (svc, _completer, _dir) = service("x").await;
        permissive_profile(&svc, "u1").await;
        seed_points_from(
            &svc,
            "u1",
            "text-embedding-3-small",
            "doc-handbook",
            Some("handbook"),
            &["Vacation policy lives here."],
        )
        .await;
        seed_points_from(
            &svc,
            "u1",
            "text-embedding-3-small",
            "doc-wiki",
            Some("wiki"),
            &["Vacation policy lives there."],
        )
        .await;

        let hits = svc
            .search(
                "u1",
                &SearchRequest {
                    query: "vacation policy".to_string(),
                    source: Some("wiki".to_string()),
                    ..SearchRequest::default()
                },
            )
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|hit| hit.document_id == "doc-wiki"));
    }

    #[tokio::test]
    async fn profiles_with_different_models_search_different_collections() {
        let (svc, completer, _dir) = service("answer").await;
        // Default profile on the small model; a second profile on large.
        permissive_profile(&svc, "u1").await;
        let large = profiles::create_profile(
            &svc.pool,
            &svc.config,
            "u1",
            ProfileDraft {
                name: Some("Large".to_string()),
                embedding_model: Some("text-embedding-3-large".to_string()),
                score_threshold: Some(0.0),
                ..ProfileDraft::default()
            },
        )
        .await
        .unwrap();

        seed_points(
            &svc,
            "u1",
            "text-embedding-3-small",
            "doc1",
            &["Vacation policy text."],
        )
        .await;

        // Querying under the large-model profile must not see points
        // indexed under the small model.
        let answer = svc
            .query(
                "u1",
                &QueryRequest {
                    question: "vacation?".to_string(),
                    profile_id: Some(large.id.clone()),
                    ..QueryRequest::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(answer.answer, NO_CONTEXT_ANSWER);
        assert_eq!(completer.calls.load(Ordering::SeqCst), 0);

        // The same question under the default profile finds them.
        let answer = svc
            .query(
                "u1",
                &QueryRequest {
                    question: "vacation?".to_string(),
                    ..QueryRequest::default()
                },
            )
            .await
            .unwrap();
        assert!(!answer.sources.is_empty());
    }

    #[tokio::test]
    async fn stream_yields_sources_then_tokens_then_done() {
        let (svc, _completer, _dir) = service("two words").await;
        permissive_profile(&svc, "u1").await;
        seed_points(
            &svc,
            "u1",
            "text-embedding-3-small",
            "doc1",
            &["Relevant content here."],
        )
        .await;

        let mut stream = svc
            .query_stream(
                "u1",
                &QueryRequest {
                    question: "content?".to_string(),
                    ..QueryRequest::default()
                },
            )
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(ev) = stream.next().await {
            events.push(ev);
        }

        assert!(matches!(events.first(), Some(StreamEvent::Sources(s)) if !s.is_empty()));
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
        let answer: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Token(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(answer, "two words");
    }

    #[tokio::test]
    async fn stream_on_empty_corpus_emits_canned_token() {
        let (svc, completer, _dir) = service("never").await;
        let mut stream = svc
            .query_stream(
                "u1",
                &QueryRequest {
                    question: "anything?".to_string(),
                    ..QueryRequest::default()
                },
            )
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(ev) = stream.next().await {
            events.push(ev);
        }

        assert!(matches!(&events[0], StreamEvent::Sources(s) if s.is_empty()));
        assert!(matches!(&events[1], StreamEvent::Token(t) if t == NO_CONTEXT_ANSWER));
        assert!(matches!(
            events[2],
            StreamEvent::Done {
                conversation_id: None
            }
        ));
        assert_eq!(completer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stream_start_conversation_hands_back_id_in_done() {
        let (svc, _completer, _dir) = service("streamed answer").await;
        permissive_profile(&svc, "u1").await;
        seed_points(
            &svc,
            "u1",
            "text-embedding-3-small",
            "doc1",
            &["Policy content."],
        )
        .await;

        let mut stream = svc
            .query_stream(
                "u1",
                &QueryRequest {
                    question: "policy?".to_string(),
                    start_conversation: true,
                    ..QueryRequest::default()
                },
            )
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(ev) = stream.next().await {
            events.push(ev);
        }
        let conv_id = match events.last() {
            Some(StreamEvent::Done {
                conversation_id: Some(id),
            }) => id.clone(),
            other => panic!("expected Done with conversation id, got {:?}", other),
        };

        // Both turns of the exchange were persisted under that id.
        let turns = chat::messages_for_conversation(&svc.pool, &conv_id)
            .await
            .unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, ChatRole::User);
        assert_eq!(turns[1].role, ChatRole::Assistant);
        assert_eq!(turns[1].content, "streamed answer");
    }

    #[tokio::test]
    async fn conversation_mode_persists_turns_and_replays_history() {
        let (svc, completer, _dir) = service("First answer.").await;
        permissive_profile(&svc, "u1").await;
        seed_points(
            &svc,
            "u1",
            "text-embedding-3-small",
            "doc1",
            &["Policy content."],
        )
        .await;

        let first = svc
            .query(
                "u1",
                &QueryRequest {
                    question: "First question?".to_string(),
                    start_conversation: true,
                    ..QueryRequest::default()
                },
            )
            .await
            .unwrap();
        let conv_id = first.conversation_id.expect("conversation created");

        let second = svc
            .query(
                "u1",
                &QueryRequest {
                    question: "Second question?".to_string(),
                    conversation_id: Some(conv_id.clone()),
                    ..QueryRequest::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(second.conversation_id.as_deref(), Some(conv_id.as_str()));

        // Second call saw the first exchange as history: system + 2 prior
        // turns + new question.
        let messages = completer.last_messages.lock().unwrap();
        assert_eq!(messages.len(), 4);

        let turns = chat::messages_for_conversation(&svc.pool, &conv_id)
            .await
            .unwrap();
        assert_eq!(turns.len(), 4);
    }

    #[test]
    fn persona_prompt_renders_all_fields() {
        let config: Config = toml::from_str("[db]\npath = \"/tmp/x.sqlite\"\n").unwrap();
        let mut profile = profiles::config_profile(&config, "u1");
        profile.assistant_name = "Ada".to_string();
        profile.company = Some("Initech".to_string());
        profile.tone = Some("friendly".to_string());
        profile.citations = true;
        profile.custom_instructions = vec!["Never discuss pricing.".to_string()];

        let sources = vec![RagSource {
            document_id: "d".to_string(),
            chunk_id: "c".to_string(),
            content: "Vacation is 25 days.".to_string(),
            score: 0.9,
        }];
        let prompt = build_system_prompt(&profile, &sources);
        assert!(prompt.contains("You are Ada, the assistant of Initech."));
        assert!(prompt.contains("friendly tone"));
        assert!(prompt.contains("[n] markers"));
        assert!(prompt.contains("Never discuss pricing."));
        assert!(prompt.contains("[1] Vacation is 25 days."));
    }
}
