//! # Knowledge Engine
//!
//! A retrieval-augmented knowledge engine over a local SQLite database.
//!
//! Documents are chunked at paragraph boundaries, embedded, and stored;
//! queries are answered by cosine-similarity retrieval over two candidate
//! pools (document chunks and a company research cache), optionally
//! handed to a generation provider, cached, and logged for analytics.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────┐
//! │ Ingest    │──▶│ Chunk+Embed │──▶│  SQLite   │
//! │ pipeline  │   │             │   │  (store)  │
//! └──────────┘   └──────────────┘   └────┬─────┘
//!                                        │
//!              ┌─────────────────────────┤
//!              ▼                         ▼
//!        ┌───────────┐            ┌───────────┐
//!        │ Retriever  │──context──▶│ RAG engine │──▶ cache + usage log
//!        └───────────┘            └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rke init                          # create database
//! rke ingest notes.md --tag eng     # chunk, embed, store
//! rke retrieve "deployment steps"   # ranked matches
//! rke ask "how do we deploy?"       # cached RAG answer
//! rke serve                         # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy with stable wire codes |
//! | [`chunk`] | Paragraph-boundary text chunking with overlap |
//! | [`embedding`] | Embedding provider abstraction and vector math |
//! | [`generation`] | Answer-generation collaborator |
//! | [`ingest`] | Document ingestion pipeline |
//! | [`retrieve`] | Similarity retrieval over both candidate pools |
//! | [`research`] | Company research cache read side |
//! | [`rag`] | Retrieval orchestrator (cache, generate, record) |
//! | [`cache`] | Query-result cache and usage analytics |
//! | [`store`] | Storage trait with SQLite and in-memory backends |
//! | [`server`] | JSON HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod rag;
pub mod research;
pub mod retrieve;
pub mod server;
pub mod store;

pub use error::{EngineError, Result};
