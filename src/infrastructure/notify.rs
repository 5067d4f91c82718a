//! Log-backed notifier.
//!
//! The shipped Notifier implementation writes structured log lines
//! per logical channel and resolves approval requests from
//! configuration: reject on timeout by default, or auto-approve for
//! dry-run soak testing. Chat-platform notifiers implement the same
//! port out of tree.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::domain::ports::{ApprovalDecision, ChannelKind, Notifier};

pub struct LogNotifier {
    auto_approve: bool,
    /// Live messages by handle, for `update_live`.
    live_messages: RwLock<HashMap<String, String>>,
    next_handle: AtomicU64,
}

impl LogNotifier {
    pub fn new(auto_approve: bool) -> Self {
        Self {
            auto_approve,
            live_messages: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Current content of a live message (dashboards in tests).
    pub async fn live_content(&self, handle: &str) -> Option<String> {
        self.live_messages.read().await.get(handle).cloned()
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, channel: ChannelKind, message: &str) {
        info!(channel = %channel, "{message}");
    }

    async fn request_approval(&self, plan_summary: &str, timeout: Duration) -> ApprovalDecision {
        if self.auto_approve {
            warn!("auto-approving plan (notifier.auto_approve is set)");
            return ApprovalDecision::approved_by("auto-approve");
        }
        // No interactive surface: the request stands until the
        // timeout, then counts as a rejection.
        info!(
            timeout_secs = timeout.as_secs(),
            "approval requested:\n{plan_summary}"
        );
        tokio::time::sleep(timeout).await;
        warn!("approval timed out, treating as rejection");
        ApprovalDecision::rejected()
    }

    async fn update_live(&self, handle: &str, new_content: &str) -> String {
        let mut messages = self.live_messages.write().await;
        let handle = if handle.is_empty() || !messages.contains_key(handle) {
            format!("live-{}", self.next_handle.fetch_add(1, Ordering::SeqCst))
        } else {
            handle.to_string()
        };
        messages.insert(handle.clone(), new_content.to_string());
        handle
    }

    async fn ensure_channels(&self, layout: &[ChannelKind]) {
        for channel in layout {
            info!(channel = %channel, "channel ensured");
        }
    }
}
