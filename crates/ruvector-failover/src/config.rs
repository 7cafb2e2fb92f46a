//! Failover configuration

use std::time::Duration;

/// Tunables for the reconfiguration state machine
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// How long to wait for offline replicas before recovering from data loss
    pub recover_on_data_loss_wait_duration: Duration,
    /// Minimum interval between repeated actions for a failover unit
    pub min_action_retry_interval: Duration,
    /// Interval used once a failover unit has been unchanged for this long
    pub max_action_retry_interval: Duration,
    /// Use `+1` data loss versions instead of wall clock milliseconds
    pub deterministic_data_loss_versions: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            recover_on_data_loss_wait_duration: Duration::ZERO,
            min_action_retry_interval: Duration::from_secs(5),
            max_action_retry_interval: Duration::from_secs(60),
            deterministic_data_loss_versions: false,
        }
    }
}

impl FailoverConfig {
    /// Configuration with reproducible epochs, used by tests and simulations
    pub fn deterministic() -> Self {
        Self {
            deterministic_data_loss_versions: true,
            ..Self::default()
        }
    }
}
