//! # Stratus Core
//!
//! Runtime-free logic for Stratus: data models, chunk planning, the
//! reconciliation diff, provider capability traits, reranking, the
//! compact-and-refine synthesis loop, and practice-question prompts.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. The
//! application crate supplies concrete stores and providers and drives
//! the pipelines built from these pieces.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod models;
pub mod planner;
pub mod questions;
pub mod reconcile;
pub mod repository;
pub mod rerank;
pub mod status;
pub mod store;
pub mod synth;

pub use error::{StratusError, StratusResult};
