//! # codekb: code knowledge-graph indexer
//!
//! Indexes SQL, JavaScript, TypeScript and PHP sources into a persistent
//! graph of entities, source chunks and typed dependency links.
//!
//! ## Architecture
//!
//! - **[`config`]**: Configuration loading, validation, and defaults
//! - **[`db`]**: SQLite knowledge store (files, identities, chunks, links)
//! - **[`indexer`]**: Pattern-anchored entity extraction, dependency analysis, column lineage
//! - **[`pipeline`]**: Extract and fix-links runs with progress and history
//! - **[`source`]**: Source unit providers (directory walk, in-memory)
//! - **[`error`]**: Error types shared across the crate

pub mod config;
pub mod db;
pub mod error;
pub mod indexer;
pub mod pipeline;
pub mod source;
