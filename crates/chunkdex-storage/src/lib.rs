//! chunkdex storage - SQLite persistence for collections and chunks.
//!
//! Provides a WAL-mode SQLite database with versioned migrations and a
//! repository that persists collection definitions, id counters, and chunk
//! rows so a collection can be rebuilt after restart.

pub mod db;
pub mod migrations;
pub mod repository;

pub use db::Database;
pub use repository::{CollectionRepository, CollectionRow};
