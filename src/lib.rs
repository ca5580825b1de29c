//! # Ragline
//!
//! A document-ingestion and retrieval-augmented-generation service.
//!
//! Ragline ingests documents (PDF, DOCX, XLSX, HTML, plain text), chunks
//! and embeds them through a durable background job queue, stores vectors
//! in Qdrant keyed by embedding dimensionality, and answers questions over
//! the indexed corpus with persona-configurable prompts and token
//! streaming.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌─────────────────┐
//! │  HTTP    │──▶│ Job queue  │──▶│ Workers          │
//! │  (axum)  │   │ (SQLite)   │   │ chunk→embed→upsert│
//! └────┬─────┘   └───────────┘   └────────┬────────┘
//!      │                                  │
//!      ▼                                  ▼
//! ┌──────────┐                      ┌──────────┐
//! │ RAG query │◀────────────────────│  Qdrant   │
//! │ + stream  │                     │ docs_{d}  │
//! └──────────┘                      └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ragline init                        # create database
//! ragline index ./handbook.pdf       # ingest and index a file
//! ragline search "vacation policy"   # similarity search
//! ragline ask "how many vacation days?"
//! ragline serve                      # start the HTTP API + workers
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extract`] | Text extraction per MIME type |
//! | [`chunk`] | Recursive overlapping chunker |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector`] | Vector store and collection resolver |
//! | [`queue`] | Durable SQLite job queue |
//! | [`worker`] | Job handlers and worker pool |
//! | [`store`] | Document and chunk persistence |
//! | [`profiles`] | Per-owner configuration profiles |
//! | [`rag`] | Retrieval and answer generation |
//! | [`completion`] | Chat-completion providers |
//! | [`chat`] | Conversations and history |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chat;
pub mod chunk;
pub mod completion;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod migrate;
pub mod models;
pub mod profiles;
pub mod queue;
pub mod rag;
pub mod server;
pub mod store;
pub mod vector;
pub mod worker;
