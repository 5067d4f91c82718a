//! Services: the remediation pipeline and its safety layer.

pub mod backup;
pub mod circuit_breaker;
pub mod executor;
pub mod fixers;
pub mod health_monitor;
pub mod impact;
pub mod orchestrator;
pub mod planner;
pub mod push_ingestor;
pub mod service_manager;
pub mod watcher;

pub use backup::BackupManager;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use executor::CommandExecutor;
pub use health_monitor::HealthMonitor;
pub use impact::ImpactAnalyzer;
pub use orchestrator::Orchestrator;
pub use planner::Planner;
pub use push_ingestor::PushIngestor;
pub use service_manager::ServiceManager;
pub use watcher::EventWatcher;
