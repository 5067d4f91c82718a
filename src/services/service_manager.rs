//! Service manager: start, stop, restart, and health-verify the
//! services defined in configuration.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::domain::errors::ServiceError;
use crate::domain::models::config::ServiceConfig;
use crate::services::executor::{CommandExecutor, ExecuteOptions};

/// Observed service state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Running,
    Stopped,
    Starting,
    Stopping,
    Failed,
    Unknown,
}

/// Seconds to wait for a started service to report running.
const START_WAIT_SECS: u64 = 30;
/// Seconds to wait for a configured health check to pass.
const HEALTH_WAIT_SECS: u64 = 60;
/// Pause between stop and start on restart.
const RESTART_GAP_SECS: u64 = 2;

pub struct ServiceManager {
    services: BTreeMap<String, ServiceConfig>,
    executor: Arc<CommandExecutor>,
}

impl ServiceManager {
    pub fn new(services: BTreeMap<String, ServiceConfig>, executor: Arc<CommandExecutor>) -> Self {
        info!(services = services.len(), "service manager ready");
        Self { services, executor }
    }

    fn service(&self, name: &str) -> Result<&ServiceConfig, ServiceError> {
        self.services
            .get(name)
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))
    }

    /// Probe the current state via the service's check command.
    pub async fn get_service_state(&self, name: &str) -> ServiceState {
        let Ok(service) = self.service(name) else {
            return ServiceState::Unknown;
        };
        match self
            .executor
            .execute(
                &service.check_command,
                ExecuteOptions::new().with_timeout(Duration::from_secs(10)),
            )
            .await
        {
            Ok(result) if result.success => ServiceState::Running,
            Ok(_) => ServiceState::Stopped,
            Err(_) => ServiceState::Unknown,
        }
    }

    /// Stop a service, polling once per second up to the graceful
    /// timeout, then force-killing. True iff the final state is
    /// STOPPED.
    pub async fn stop_service(&self, name: &str, graceful: bool) -> Result<bool, ServiceError> {
        let service = self.service(name)?.clone();

        if self.get_service_state(name).await == ServiceState::Stopped {
            return Ok(true);
        }

        let Some(stop_command) = &service.stop_command else {
            warn!(service = name, "no stop command configured");
            return Ok(false);
        };

        info!(service = name, graceful, "stopping service");
        let _ = self
            .executor
            .execute(
                stop_command,
                ExecuteOptions::new().with_timeout(Duration::from_secs(30)),
            )
            .await;

        let deadline = if graceful {
            service.graceful_shutdown_timeout
        } else {
            0
        };
        for _ in 0..deadline {
            if self.get_service_state(name).await == ServiceState::Stopped {
                info!(service = name, "service stopped");
                return Ok(true);
            }
            sleep(Duration::from_secs(1)).await;
        }

        // Force kill past the graceful window.
        warn!(service = name, "graceful stop timed out, force killing");
        let _ = self
            .executor
            .execute(
                &format!("pkill -9 -f '{name}'"),
                ExecuteOptions::new().with_timeout(Duration::from_secs(10)),
            )
            .await;
        sleep(Duration::from_secs(1)).await;

        Ok(self.get_service_state(name).await == ServiceState::Stopped)
    }

    /// Start a service and wait for it to report running; when a
    /// health check is configured and requested, wait for it too.
    pub async fn start_service(
        &self,
        name: &str,
        wait_for_healthy: bool,
    ) -> Result<bool, ServiceError> {
        let service = self.service(name)?.clone();

        if self.get_service_state(name).await == ServiceState::Running {
            return Ok(true);
        }

        let Some(start_command) = &service.start_command else {
            warn!(service = name, "no start command configured");
            return Ok(false);
        };

        info!(service = name, "starting service");
        let result = self
            .executor
            .execute(
                start_command,
                ExecuteOptions::new().with_timeout(Duration::from_secs(60)),
            )
            .await
            .map_err(|e| ServiceError::StartFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        if !result.success {
            return Err(ServiceError::StartFailed {
                name: name.to_string(),
                reason: result.error_message.unwrap_or_default(),
            });
        }

        let mut running = false;
        for _ in 0..START_WAIT_SECS {
            if self.get_service_state(name).await == ServiceState::Running {
                running = true;
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
        if !running {
            return Ok(false);
        }

        if wait_for_healthy {
            if let Some(health_check) = &service.health_check {
                if !self.wait_for_healthy(name, health_check).await {
                    return Err(ServiceError::Unhealthy {
                        name: name.to_string(),
                    });
                }
            }
        }

        info!(service = name, "service started");
        Ok(true)
    }

    /// Stop, wait, start.
    pub async fn restart_service(&self, name: &str) -> Result<bool, ServiceError> {
        if !self.stop_service(name, true).await? {
            return Ok(false);
        }
        sleep(Duration::from_secs(RESTART_GAP_SECS)).await;
        self.start_service(name, true).await
    }

    /// Stop several services; failures are logged and the batch
    /// continues.
    pub async fn stop_services_batch(&self, names: &[String], reverse_order: bool) -> Vec<String> {
        let ordered: Vec<&String> = if reverse_order {
            names.iter().rev().collect()
        } else {
            names.iter().collect()
        };

        let mut stopped = Vec::new();
        for name in ordered {
            match self.stop_service(name, true).await {
                Ok(true) => stopped.push(name.clone()),
                Ok(false) | Err(_) => {
                    warn!(service = %name, "batch stop: service did not stop");
                }
            }
        }
        stopped
    }

    /// Start several services; the batch halts at the first failure.
    pub async fn start_services_batch(&self, names: &[String]) -> Result<Vec<String>, ServiceError> {
        let mut started = Vec::new();
        for name in names {
            match self.start_service(name, true).await {
                Ok(true) => started.push(name.clone()),
                Ok(false) => {
                    return Err(ServiceError::StartFailed {
                        name: name.clone(),
                        reason: "did not reach running state".into(),
                    })
                }
                Err(e) => return Err(e),
            }
        }
        Ok(started)
    }

    pub fn known_services(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    async fn wait_for_healthy(&self, name: &str, health_check: &str) -> bool {
        for _ in 0..HEALTH_WAIT_SECS {
            if let Ok(result) = self
                .executor
                .execute(
                    health_check,
                    ExecuteOptions::new().with_timeout(Duration::from_secs(10)),
                )
                .await
            {
                if result.success {
                    return true;
                }
            }
            sleep(Duration::from_secs(1)).await;
        }
        warn!(service = name, "health check never passed");
        false
    }
}
