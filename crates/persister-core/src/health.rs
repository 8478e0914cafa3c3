//! Health tracking for the transport and the storage backend.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;

/// A tracked dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Component {
    /// The Kafka consumer
    Kafka,
    /// The storage backend
    Storage,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Kafka => "kafka",
            Component::Storage => "storage",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health status of a component.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentStatus {
    /// Component is healthy
    Healthy,
    /// Component is degraded but operational
    Degraded(String),
    /// Component is unhealthy
    Unhealthy(String),
    /// No outcome observed yet
    Unknown,
}

/// Overall system health status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health registry shared between the consume loop, the flush engine and
/// the HTTP endpoints.
pub struct HealthCheck {
    components: RwLock<BTreeMap<Component, ComponentStatus>>,
    running: RwLock<bool>,
}

impl HealthCheck {
    /// Create a registry with every component in the `Unknown` state.
    pub fn new() -> Self {
        let components = [Component::Kafka, Component::Storage]
            .into_iter()
            .map(|c| (c, ComponentStatus::Unknown))
            .collect();
        Self {
            components: RwLock::new(components),
            running: RwLock::new(false),
        }
    }

    pub fn mark_healthy(&self, component: Component) {
        self.components
            .write()
            .insert(component, ComponentStatus::Healthy);
    }

    /// Healthy, but something was lost or slowed down along the way.
    pub fn mark_degraded(&self, component: Component, reason: &str) {
        self.components
            .write()
            .insert(component, ComponentStatus::Degraded(reason.to_string()));
    }

    pub fn mark_unhealthy(&self, component: Component, reason: &str) {
        self.components
            .write()
            .insert(component, ComponentStatus::Unhealthy(reason.to_string()));
    }

    pub fn status(&self, component: Component) -> ComponentStatus {
        self.components
            .read()
            .get(&component)
            .cloned()
            .unwrap_or(ComponentStatus::Unknown)
    }

    /// Get all component statuses.
    pub fn get_all_statuses(&self) -> BTreeMap<Component, ComponentStatus> {
        self.components.read().clone()
    }

    /// Worst status across all components.
    pub fn overall_status(&self) -> HealthStatus {
        let components = self.components.read();

        let mut has_degraded = false;
        for status in components.values() {
            match status {
                ComponentStatus::Unhealthy(_) => return HealthStatus::Unhealthy,
                ComponentStatus::Degraded(_) => has_degraded = true,
                _ => {}
            }
        }

        if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Whether the consume loop is running and nothing is unhealthy.
    pub fn is_ready(&self) -> bool {
        self.is_running() && self.overall_status() != HealthStatus::Unhealthy
    }

    pub fn set_running(&self, running: bool) {
        *self.running.write() = running;
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_check_lifecycle() {
        let health = HealthCheck::new();
        assert_eq!(health.status(Component::Kafka), ComponentStatus::Unknown);
        assert_eq!(health.overall_status(), HealthStatus::Healthy);

        health.mark_healthy(Component::Kafka);
        health.mark_healthy(Component::Storage);
        assert_eq!(health.overall_status(), HealthStatus::Healthy);

        health.mark_degraded(Component::Storage, "points beyond retention policy dropped");
        assert_eq!(health.overall_status(), HealthStatus::Degraded);

        health.mark_unhealthy(Component::Storage, "write rejected");
        assert_eq!(health.overall_status(), HealthStatus::Unhealthy);

        // Recovery
        health.mark_healthy(Component::Storage);
        assert_eq!(health.overall_status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_readiness_requires_running_loop() {
        let health = HealthCheck::new();
        assert!(!health.is_ready());

        health.set_running(true);
        assert!(health.is_ready());

        health.mark_unhealthy(Component::Kafka, "poll failed");
        assert!(!health.is_ready());

        health.mark_healthy(Component::Kafka);
        health.set_running(false);
        assert!(!health.is_ready());
    }

    #[test]
    fn test_all_statuses_are_ordered() {
        let health = HealthCheck::new();
        health.mark_degraded(Component::Storage, "slow");

        let statuses = health.get_all_statuses();
        let names: Vec<_> = statuses.keys().map(Component::as_str).collect();
        assert_eq!(names, vec!["kafka", "storage"]);
        assert!(matches!(
            statuses.get(&Component::Storage),
            Some(ComponentStatus::Degraded(_))
        ));
    }
}
