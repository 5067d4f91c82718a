//! Vigil - Autonomous Security-Operations Controller
//!
//! An event-driven remediation pipeline:
//! - Source adapters polling security tooling at per-source cadences
//! - Persistent event deduplication across restarts
//! - Batching orchestrator with model-backed planning, single human
//!   approval, and sequential execution under a global lock
//! - SQLite knowledge base feeding per-strategy success statistics
//!   back into retry pacing
//! - Service-safety layer: backups, validated command execution,
//!   impact analysis, and service orchestration

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;
