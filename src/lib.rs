//! # medcontext
//!
//! An offline medical knowledge store for retrieval-augmented generation.
//!
//! The crate distributes a multi-gigabyte SQLite knowledge base (medical
//! documents and Q&A pairs, each with a 384-dimension embedding), keeps it
//! valid on disk, and turns a free-text question into a bounded,
//! citation-ready context block for a downstream language model.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────┐   ┌────────────────┐
//! │ Download     │──▶│ Validator │──▶│ KnowledgeStore │
//! │ (resumable)  │   │ (header)  │   │ (swap-in, RW)  │
//! └──────┬───────┘   └───────────┘   └───────┬────────┘
//!        └──── LifecycleController ──────────┤
//!                                            ▼
//! query ─▶ EmbeddingGate ─▶ VectorSearchEngine ─▶ ContextAssembler ─▶ completion
//!          (FIFO, 1 at a time)  (index → scan)      (cite [n], dedup)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`models`] | Core data types |
//! | [`validate`] | Artifact header and size validation |
//! | [`download`] | Resumable, pausable, cancellable artifact download |
//! | [`progress`] | Download progress reporters for the CLI |
//! | [`lifecycle`] | Artifact state machine |
//! | [`embedding`] | Embedding backends and vector utilities |
//! | [`embed_gate`] | Serialized FIFO access to the embedding backend |
//! | [`db`] | SQLite connections |
//! | [`migrate`] | Store schema and row writers |
//! | [`store`] | Shared store handle and vector indexes |
//! | [`search`] | Vector search with index fallback |
//! | [`context`] | Context assembly and citations |
//! | [`rag`] | Retrieval pipeline and message composition |

pub mod config;
pub mod context;
pub mod db;
pub mod download;
pub mod embed_gate;
pub mod embedding;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod rag;
pub mod search;
pub mod store;
pub mod validate;
