//! # Embedder
//!
//! **A self-hosted Retrieval-Augmented Generation backend for source-code
//! corpora.**
//!
//! Embedder ingests a configured set of files, directories, and URLs,
//! splits each document into token-bounded chunks, obtains dense vector
//! embeddings from an external provider, and stores chunks and vectors in
//! a hybrid SQLite + ANN index. On top of that corpus it serves two
//! retrieval-augmented endpoints — chat completion and fill-in-the-middle —
//! that assemble a token-budgeted context before calling the generation
//! provider and stream the answer back over SSE.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────────┐
//! │   Sources    │──▶│   Pipeline   │──▶│ Hybrid store  │
//! │ dirs/files/  │   │ chunk+embed  │   │ SQLite + HNSW │
//! │     urls     │   └──────────────┘   └──────┬────────┘
//! └──────────────┘                             │
//!                         ┌────────────────────┤
//!                         ▼                    ▼
//!                   ┌──────────┐        ┌────────────┐
//!                   │   CLI    │        │ HTTP (SSE) │
//!                   │(embedder)│        │ chat / fim │
//!                   └──────────┘        └────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. The **source processor** ([`sources`]) expands configured source
//!    descriptors into file paths and URLs.
//! 2. The **chunker** ([`chunk`]) splits each document into ordered,
//!    token-bounded [`models::Chunk`]s with byte offsets and overlap.
//! 3. The **embedding client** ([`embedding`]) batch-converts chunk texts
//!    into normalized vectors.
//! 4. The **hybrid store** ([`store`]) persists chunk metadata in SQLite
//!    and vectors in an ANN index ([`index`]), kept consistent by staged
//!    transactions.
//! 5. The **ingest engine** ([`ingest`]) orchestrates full embeds and
//!    incremental updates with mtime/size change detection and a
//!    three-strike failure quarantine.
//! 6. The **context assembler** ([`context`]) turns a question plus
//!    optional attachments and pinned sources into an ordered,
//!    token-budgeted passage list.
//! 7. The **completion client** ([`completion`]) injects the context into
//!    the prompt and streams the provider's answer.
//! 8. The **HTTP surface** ([`server`]) and **lifecycle supervisor**
//!    ([`serve`]) expose everything, alongside the multi-process
//!    [`registry`].
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | JSON settings: chunking, providers, database, sources, logging |
//! | [`models`] | Core data types: `Chunk`, `SearchResult`, `FileMetadata` |
//! | [`tokenizer`] | Deterministic, cached token counting |
//! | [`chunk`] | Token-bounded chunker with overlap and content typing |
//! | [`sources`] | Source enumeration, file/URL reading, related-file heuristic |
//! | [`embedding`] | Batched embedding client with keep-alive client cache |
//! | [`completion`] | Chat + FIM completion with SSE stream parsing |
//! | [`index`] | ANN index wrapper: mark-delete, persistence, recovery |
//! | [`store`] | Hybrid SQLite + ANN store with staged transactions |
//! | [`ingest`] | Embed/update/compact orchestration and failure quarantine |
//! | [`context`] | Token-budgeted context assembly with excerpts |
//! | [`auth`] | Admin password file and bearer JWTs |
//! | [`metrics`] | Request counters, latency averages, Prometheus text |
//! | [`server`] | Axum HTTP surface with streaming chat |
//! | [`registry`] | Shared multi-instance registry with heartbeats |
//! | [`serve`] | Port binding, watcher, heartbeat, cooperative shutdown |

pub mod auth;
pub mod chunk;
pub mod completion;
pub mod config;
pub mod context;
pub mod embedding;
pub mod index;
pub mod ingest;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod serve;
pub mod server;
pub mod sources;
pub mod store;
pub mod tokenizer;
