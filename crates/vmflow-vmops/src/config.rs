//! Operational configuration

use std::time::Duration;

/// Tunables for the VM operations layer.
#[derive(Debug, Clone)]
pub struct VmOpsConfig {
    /// How long to wait for a freshly booted VM to reach the running
    /// power state. Expiry is logged, not fatal.
    pub running_timeout: Duration,

    /// Interval between boot-readiness power-state polls
    pub boot_poll_interval: Duration,

    /// Hypervisor type, used for guest-agent build lookup
    pub hypervisor_type: String,

    /// Remote staging directory for migrated disk layers
    pub staging_path: String,
}

impl Default for VmOpsConfig {
    fn default() -> Self {
        Self {
            running_timeout: Duration::from_secs(60),
            boot_poll_interval: Duration::from_millis(500),
            hypervisor_type: "xen".to_string(),
            staging_path: "/images/instance".to_string(),
        }
    }
}

impl VmOpsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the boot-readiness deadline
    pub fn with_running_timeout(mut self, timeout: Duration) -> Self {
        self.running_timeout = timeout;
        self
    }

    /// Set the boot-readiness poll interval
    pub fn with_boot_poll_interval(mut self, interval: Duration) -> Self {
        self.boot_poll_interval = interval;
        self
    }

    /// Set the hypervisor type used for agent build lookup
    pub fn with_hypervisor_type(mut self, hypervisor: impl Into<String>) -> Self {
        self.hypervisor_type = hypervisor.into();
        self
    }

    /// Set the migration staging directory
    pub fn with_staging_path(mut self, path: impl Into<String>) -> Self {
        self.staging_path = path.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VmOpsConfig::default();
        assert_eq!(config.running_timeout, Duration::from_secs(60));
        assert_eq!(config.boot_poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_builders() {
        let config = VmOpsConfig::new()
            .with_running_timeout(Duration::from_secs(5))
            .with_boot_poll_interval(Duration::from_millis(10))
            .with_hypervisor_type("kvm")
            .with_staging_path("/srv/staging");

        assert_eq!(config.running_timeout, Duration::from_secs(5));
        assert_eq!(config.hypervisor_type, "kvm");
        assert_eq!(config.staging_path, "/srv/staging");
    }
}
