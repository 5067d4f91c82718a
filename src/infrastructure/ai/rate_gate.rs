//! Shared request pacing gate.
//!
//! One fair gate serializes all provider calls: callers acquire in
//! turn and each acquisition waits out the remaining spacing since
//! the previous request, so concurrent callers line up predictably
//! instead of sleeping ad hoc.

use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

pub struct RequestGate {
    /// Monotonic time of the last admitted request.
    last_request: Mutex<Option<Instant>>,
    spacing: Duration,
}

impl RequestGate {
    pub fn new(spacing: Duration) -> Self {
        Self {
            last_request: Mutex::new(None),
            spacing,
        }
    }

    /// Wait until at least `spacing` has passed since the previous
    /// admitted request, then claim the slot.
    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.spacing {
                sleep(self.spacing - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_first_acquire_is_immediate() {
        let gate = RequestGate::new(Duration::from_millis(200));
        let start = Instant::now();
        gate.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_second_acquire_waits_out_spacing() {
        let gate = RequestGate::new(Duration::from_millis(100));
        gate.acquire().await;

        let start = Instant::now();
        gate.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_concurrent_callers_serialize() {
        let gate = Arc::new(RequestGate::new(Duration::from_millis(50)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move { gate.acquire().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 4 requests at 50ms spacing: at least 150ms total.
        assert!(start.elapsed() >= Duration::from_millis(140));
    }
}
