//! Per-project health status tracked by the health monitor.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Ring buffer capacity for response-time samples.
pub const MAX_RESPONSE_SAMPLES: usize = 100;

/// Rolling health state for one monitored project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectHealthStatus {
    pub name: String,
    pub is_online: bool,
    pub total_checks: u64,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub consecutive_failures: u32,
    /// Last N response times in milliseconds.
    pub response_times_ms: Vec<f64>,
    pub last_check_time: Option<DateTime<Utc>>,
    pub last_online_time: Option<DateTime<Utc>>,
    pub last_offline_time: Option<DateTime<Utc>>,
    pub current_downtime_start: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Whether the remediation command already fired for the current
    /// downtime episode.
    pub remediation_triggered: bool,
}

impl ProjectHealthStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_online: false,
            total_checks: 0,
            successful_checks: 0,
            failed_checks: 0,
            consecutive_failures: 0,
            response_times_ms: Vec::new(),
            last_check_time: None,
            last_online_time: None,
            last_offline_time: None,
            current_downtime_start: None,
            last_error: None,
            remediation_triggered: false,
        }
    }

    pub fn uptime_percentage(&self) -> f64 {
        if self.total_checks == 0 {
            return 0.0;
        }
        (self.successful_checks as f64 / self.total_checks as f64) * 100.0
    }

    pub fn average_response_time_ms(&self) -> f64 {
        if self.response_times_ms.is_empty() {
            return 0.0;
        }
        self.response_times_ms.iter().sum::<f64>() / self.response_times_ms.len() as f64
    }

    pub fn current_downtime(&self) -> Option<Duration> {
        if self.is_online {
            return None;
        }
        self.current_downtime_start.map(|start| Utc::now() - start)
    }

    /// Record a successful probe. Returns true when this is a recovery
    /// (the project had consecutive failures before this check).
    pub fn update_online(&mut self, response_time_ms: f64) -> bool {
        let was_recovering = self.consecutive_failures > 0;
        let now = Utc::now();

        self.is_online = true;
        self.last_check_time = Some(now);
        self.last_online_time = Some(now);
        self.total_checks += 1;
        self.successful_checks += 1;
        self.consecutive_failures = 0;
        self.current_downtime_start = None;
        self.remediation_triggered = false;

        self.response_times_ms.push(response_time_ms);
        if self.response_times_ms.len() > MAX_RESPONSE_SAMPLES {
            self.response_times_ms.remove(0);
        }

        was_recovering
    }

    /// Record a failed probe. Returns true when this starts a new
    /// incident (the project was online before this check).
    pub fn update_offline(&mut self, error: impl Into<String>) -> bool {
        let was_online = self.is_online;
        let now = Utc::now();

        self.is_online = false;
        self.last_check_time = Some(now);
        self.last_offline_time = Some(now);
        self.total_checks += 1;
        self.failed_checks += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error.into());

        if was_online || self.current_downtime_start.is_none() {
            self.current_downtime_start = Some(now);
        }

        was_online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uptime_percentage_matches_counters() {
        let mut status = ProjectHealthStatus::new("api");
        for _ in 0..7 {
            status.update_online(12.0);
        }
        for _ in 0..3 {
            status.update_offline("503");
        }
        assert_eq!(status.total_checks, 10);
        assert!((status.uptime_percentage() - 70.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_incident_and_recovery_transitions() {
        let mut status = ProjectHealthStatus::new("api");
        status.update_online(10.0);

        // online -> offline is a new incident
        assert!(status.update_offline("timeout"));
        // staying offline is not
        assert!(!status.update_offline("timeout"));
        assert_eq!(status.consecutive_failures, 2);

        // offline -> online is a recovery
        assert!(status.update_online(11.0));
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.current_downtime_start.is_none());
    }

    #[test]
    fn test_response_ring_is_bounded() {
        let mut status = ProjectHealthStatus::new("api");
        for i in 0..(MAX_RESPONSE_SAMPLES + 20) {
            status.update_online(i as f64);
        }
        assert_eq!(status.response_times_ms.len(), MAX_RESPONSE_SAMPLES);
        // Oldest samples were dropped.
        assert!((status.response_times_ms[0] - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_remediation_flag_resets_on_recovery() {
        let mut status = ProjectHealthStatus::new("api");
        status.update_offline("down");
        status.remediation_triggered = true;
        status.update_online(5.0);
        assert!(!status.remediation_triggered);
    }
}
