//! # Stratus
//!
//! Per-project source indexing and retrieval-augmented question answering.
//!
//! A project is a directory on disk. Indexing walks the directory, splits
//! documents into content units, embeds them and reconciles a vector
//! collection named after the project. Queries run a four-stage workflow
//! (resolve, retrieve, rerank, synthesize) against that collection.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────┐
//! │ Source filter│──▶│ Chunk planner│──▶│  Ingestion   │──▶│  SQLite  │
//! │  (walkdir)   │   │ whole/para/llm│  │  reconcile   │   │ vectors  │
//! └──────────────┘   └──────────────┘   └──────────────┘   └────┬─────┘
//!                                                                │
//!          ┌─────────┐   ┌──────────┐   ┌────────┐   ┌──────────┐│
//!  query──▶│ resolve │──▶│ retrieve │──▶│ rerank │──▶│synthesize│◀┘
//!          └─────────┘   └──────────┘   └────────┘   └──────────┘
//! ```
//!
//! Runtime-free pieces (models, hashing, diffing, split planning, context
//! packing, the status gate) live in `stratus-core`. This crate adds
//! SQLite persistence, HTTP and local providers, the async pipeline and
//! the CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`db`] / [`migrate`] | Connection pool and schema |
//! | [`projects`] | Project registry and status store |
//! | [`sqlite_store`] | On-disk vector collections |
//! | [`connector_fs`] | Document source filter |
//! | [`chunk`] | Chunk planner |
//! | [`embedding`] / [`llm`] / [`rerank`] | Provider implementations |
//! | [`ingest`] | Reconciling ingestion pipeline |
//! | [`indexer`] | Status-gated indexing jobs |
//! | [`workflow`] | Query state machine |
//! | [`questions`] | Practice question generation and grading |
//! | [`service`] | Component wiring |

pub mod chunk;
pub mod config;
pub mod connector_fs;
pub mod db;
pub mod embedding;
pub mod http;
pub mod indexer;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod projects;
pub mod questions;
pub mod rerank;
pub mod service;
pub mod sqlite_store;
pub mod workflow;

pub use stratus_core::{StratusError, StratusResult};
