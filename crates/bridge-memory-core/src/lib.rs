//! # Bridge Memory Core
//!
//! Runtime-free logic for the bridge memory engine: data models, path
//! rules, chunking, the embedding provider trait, the embedding cache,
//! the content/index store abstractions, and hybrid scoring.
//!
//! This crate contains no tokio, sqlx, or network dependencies. The
//! application crate supplies SQLite-backed stores, concrete embedding
//! providers, and the scheduling around them.

pub mod cache;
pub mod chunk;
pub mod content;
pub mod embedding;
pub mod error;
pub mod models;
pub mod paths;
pub mod search;
pub mod store;
