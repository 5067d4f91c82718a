//! Source adapter port.

use async_trait::async_trait;

use crate::domain::errors::WatcherError;
use crate::domain::models::{EventSource, SecurityEvent};

/// A per-tool component that turns raw tool output into normalized
/// `SecurityEvent`s.
///
/// Contract:
/// - `poll()` returns all events observed since the last poll and is
///   idempotent: with no new observations it returns an empty list.
/// - Adapters never deduplicate; the watcher owns that.
/// - Severity classification is source-specific and happens here.
/// - The caller bounds each poll with a timeout and treats errors as
///   "no new events this cycle".
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> EventSource;

    async fn poll(&self) -> Result<Vec<SecurityEvent>, WatcherError>;
}
