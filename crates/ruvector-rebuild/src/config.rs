//! Rebuild configuration

use std::time::Duration;

/// Tunables for the rebuild protocol
#[derive(Debug, Clone)]
pub struct RebuildConfig {
    /// Wait before the first proposal so that the cluster can settle
    pub cluster_stable_wait: Duration,

    /// Lower bound of the randomized update retry interval
    pub min_retry_interval: Duration,

    /// Upper bound of the randomized update retry interval
    pub max_retry_interval: Duration,

    /// Up nodes needed before recovery completes
    pub expected_cluster_size: usize,

    /// Total rebuild time after which an error health report is raised
    pub rebuild_time_limit: Duration,

    /// Time in one phase after which a warning health report is raised
    pub health_report_threshold: Duration,

    /// Validity of rebuild health reports
    pub health_report_ttl: Duration,

    /// How long to wait for the next proposal reply before re-listening
    pub proposal_receive_timeout: Duration,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            cluster_stable_wait: Duration::from_secs(30),
            min_retry_interval: Duration::from_secs(5),
            max_retry_interval: Duration::from_secs(10),
            expected_cluster_size: 1,
            rebuild_time_limit: Duration::from_secs(600),
            health_report_threshold: Duration::from_secs(300),
            health_report_ttl: Duration::from_secs(40),
            proposal_receive_timeout: Duration::from_secs(5),
        }
    }
}
