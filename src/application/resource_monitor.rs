//! Resource monitor: track resident memory, elapsed run time, and
//! in-flight tracked operations; gate admission of new work.
//!
//! `check` classifies the most-loaded axis against configured limits.
//! Starting a tracked operation while the status is `exceeded` raises
//! the distinguished `ResourceLimit` error.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::domain::error::RuntimeError;
use crate::domain::models::config::ResourceConfig;
use crate::services::event_bus::{EventBus, EventCategory, EventPayload, EventSeverity};

/// Health classification, worst axis wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResourceHealth {
    Healthy,
    Warning,
    Critical,
    Exceeded,
}

impl std::fmt::Display for ResourceHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
            Self::Exceeded => write!(f, "exceeded"),
        }
    }
}

/// Sampled usage across the tracked axes.
#[derive(Debug, Clone, Copy)]
pub struct ResourceUsage {
    pub memory_mb: u64,
    pub elapsed_secs: u64,
    pub operations: usize,
}

/// Result of a `check` call.
#[derive(Debug, Clone)]
pub struct ResourceCheck {
    pub status: ResourceHealth,
    pub usage: ResourceUsage,
    pub message: Option<String>,
}

/// Decrements the in-flight counter when dropped (floored at zero).
pub struct OperationGuard {
    operations: Arc<AtomicUsize>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let _ = self
            .operations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }
}

/// The monitor.
pub struct ResourceMonitor {
    config: ResourceConfig,
    started_at: Instant,
    operations: Arc<AtomicUsize>,
    system: Mutex<System>,
    last_status: Mutex<ResourceHealth>,
    event_bus: Arc<EventBus>,
}

impl ResourceMonitor {
    pub fn new(config: ResourceConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            config,
            started_at: Instant::now(),
            operations: Arc::new(AtomicUsize::new(0)),
            system: Mutex::new(System::new()),
            last_status: Mutex::new(ResourceHealth::Healthy),
            event_bus,
        }
    }

    /// Sample usage and classify it. Publishes a status event when the
    /// classification changes.
    pub fn check(&self) -> ResourceCheck {
        let usage = self.sample();

        let memory_load = usage.memory_mb as f64 / self.config.max_memory_mb.max(1) as f64;
        let time_load = usage.elapsed_secs as f64 / self.config.max_cpu_time_secs.max(1) as f64;
        let ops_load = usage.operations as f64 / self.config.max_operations.max(1) as f64;

        let (axis, load) = [("memory", memory_load), ("run time", time_load), ("operations", ops_load)]
            .into_iter()
            .fold(("memory", 0.0_f64), |acc, item| if item.1 > acc.1 { item } else { acc });

        let status = if load >= 1.0 {
            ResourceHealth::Exceeded
        } else if load >= self.config.critical_threshold {
            ResourceHealth::Critical
        } else if load >= self.config.warn_threshold {
            ResourceHealth::Warning
        } else {
            ResourceHealth::Healthy
        };

        let message = (status != ResourceHealth::Healthy)
            .then(|| format!("{axis} at {:.0}% of limit", load * 100.0));

        if let Ok(mut last) = self.last_status.lock() {
            if *last != status {
                if status > *last {
                    warn!(%status, ?message, "resource status degraded");
                }
                self.event_bus.publish(
                    if status >= ResourceHealth::Critical {
                        EventSeverity::Warning
                    } else {
                        EventSeverity::Info
                    },
                    EventCategory::Resource,
                    EventPayload::ResourceStatusChanged {
                        status: status.to_string(),
                        message: message.clone(),
                    },
                );
                *last = status;
            }
        }

        ResourceCheck { status, usage, message }
    }

    /// Admit a tracked operation. Fails with `ResourceLimit` while the
    /// status is `exceeded`.
    pub fn start_operation(&self) -> Result<OperationGuard, RuntimeError> {
        let check = self.check();
        if check.status == ResourceHealth::Exceeded {
            return Err(RuntimeError::ResourceLimit(
                check.message.unwrap_or_else(|| "resource limits exceeded".to_string()),
            ));
        }
        self.operations.fetch_add(1, Ordering::SeqCst);
        debug!(operations = self.operations.load(Ordering::SeqCst), "operation started");
        Ok(OperationGuard { operations: Arc::clone(&self.operations) })
    }

    /// Run `f` as a tracked operation; the counter decrements even when
    /// the future panics or errs (guard drop).
    pub async fn run_tracked<F, Fut, T>(&self, f: F) -> Result<T, RuntimeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.start_operation()?;
        let result = f().await;
        drop(guard);
        Ok(result)
    }

    /// Run `f` only while healthy and under capacity; otherwise return
    /// `fallback` untouched.
    pub async fn run_if_available<F, Fut, T>(&self, f: F, fallback: T) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let check = self.check();
        let at_capacity = check.usage.operations >= self.config.max_operations;
        if check.status != ResourceHealth::Healthy || at_capacity {
            return fallback;
        }
        match self.run_tracked(f).await {
            Ok(value) => value,
            Err(_) => fallback,
        }
    }

    pub fn operations_in_flight(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    fn sample(&self) -> ResourceUsage {
        let memory_mb = self
            .system
            .lock()
            .ok()
            .map(|mut system| {
                if let Ok(pid) = sysinfo::get_current_pid() {
                    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                    if let Some(process) = system.process(pid) {
                        return process.memory() / 1024 / 1024;
                    }
                }
                system.refresh_memory();
                system.used_memory() / 1024 / 1024
            })
            .unwrap_or(0);

        ResourceUsage {
            memory_mb,
            elapsed_secs: self.started_at.elapsed().as_secs(),
            operations: self.operations.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::event_bus::EventBusConfig;

    fn roomy_config() -> ResourceConfig {
        ResourceConfig {
            max_memory_mb: 1_000_000,
            max_cpu_time_secs: 1_000_000,
            max_operations: 8,
            warn_threshold: 0.7,
            critical_threshold: 0.9,
        }
    }

    fn make_monitor(config: ResourceConfig) -> ResourceMonitor {
        ResourceMonitor::new(config, Arc::new(EventBus::new(EventBusConfig::default())))
    }

    #[tokio::test]
    async fn test_healthy_under_roomy_limits() {
        let monitor = make_monitor(roomy_config());
        let check = monitor.check();
        assert_eq!(check.status, ResourceHealth::Healthy);
        assert!(check.message.is_none());
        assert!(check.usage.memory_mb > 0);
    }

    #[tokio::test]
    async fn test_operation_guard_decrements_on_drop() {
        let monitor = make_monitor(roomy_config());
        {
            let _a = monitor.start_operation().unwrap();
            let _b = monitor.start_operation().unwrap();
            assert_eq!(monitor.operations_in_flight(), 2);
        }
        assert_eq!(monitor.operations_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_operations_axis_classification() {
        let config = ResourceConfig { max_operations: 4, ..roomy_config() };
        let monitor = make_monitor(config);
        let _guards: Vec<_> = (0..3).map(|_| monitor.start_operation().unwrap()).collect();

        let check = monitor.check();
        // 3/4 = 75%, warning territory.
        assert_eq!(check.status, ResourceHealth::Warning);
        assert!(check.message.unwrap().contains("operations"));
    }

    #[tokio::test]
    async fn test_exceeded_blocks_admission() {
        let config = ResourceConfig { max_operations: 2, ..roomy_config() };
        let monitor = make_monitor(config);
        let _a = monitor.start_operation().unwrap();
        let _b = monitor.start_operation().unwrap();

        let result = monitor.start_operation();
        assert!(matches!(result, Err(RuntimeError::ResourceLimit(_))));
    }

    #[tokio::test]
    async fn test_run_tracked_decrements_even_on_inner_failure() {
        let monitor = make_monitor(roomy_config());
        let outcome: Result<Result<(), String>, _> =
            monitor.run_tracked(|| async { Err::<(), String>("boom".to_string()) }).await;
        assert!(outcome.is_ok());
        assert_eq!(monitor.operations_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_run_if_available_falls_back_at_capacity() {
        let config = ResourceConfig { max_operations: 1, ..roomy_config() };
        let monitor = make_monitor(config);
        let _guard = monitor.start_operation().unwrap();

        let value = monitor.run_if_available(|| async { 42 }, -1).await;
        assert_eq!(value, -1);
    }

    #[tokio::test]
    async fn test_run_if_available_runs_when_healthy() {
        let monitor = make_monitor(roomy_config());
        let value = monitor.run_if_available(|| async { 42 }, -1).await;
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_memory_limit_exceeded_detection() {
        let config = ResourceConfig { max_memory_mb: 1, ..roomy_config() };
        let monitor = make_monitor(config);
        let check = monitor.check();
        assert_eq!(check.status, ResourceHealth::Exceeded);
        assert!(monitor.start_operation().is_err());
    }
}
