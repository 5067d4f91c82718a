//! HTTP surfaces: the webhook receiver.

pub mod webhook;

pub use webhook::{build_router, serve, WebhookState};
