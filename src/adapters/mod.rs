//! Adapters: the knowledge base store and per-tool source adapters.

pub mod sources;
pub mod sqlite;
