//! Infrastructure: config loading, logging, model providers, webhook
//! server, notifier implementation, and persisted JSON state.

pub mod ai;
pub mod config;
pub mod http;
pub mod logging;
pub mod notify;
pub mod state;
