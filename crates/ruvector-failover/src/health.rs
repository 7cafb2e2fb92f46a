//! Health reporting for failover units and rebuild
//!
//! Health reports are fire-and-forget. The state machine and the rebuild
//! protocol emit them when progress stalls, and emit an `Ok` report once the
//! condition clears.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthSeverity {
    Ok,
    Warning,
    Error,
}

/// What a health report is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthReportKind {
    /// A partition lost quorum
    QuorumLoss,
    /// A partition moved to a new data loss version
    DataLoss,
    /// Rebuild is waiting for generation proposal replies
    RebuildBroadcastStuck,
    /// Rebuild is waiting for failover unit uploads
    RebuildUploadStuck,
    /// Rebuild exceeded its time limit
    RebuildTimeLimitExceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub kind: HealthReportKind,
    pub severity: HealthSeverity,
    /// Free-form description, usually naming the partition or nodes involved
    pub context: String,
    /// How long the report stays valid, `None` for until replaced
    pub ttl: Option<Duration>,
    pub reported_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn new(kind: HealthReportKind, severity: HealthSeverity, context: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            context: context.into(),
            ttl: None,
            reported_at: Utc::now(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Sink for health reports
pub trait HealthReporter: Send + Sync {
    fn report_health(&self, report: HealthReport);
}

/// Writes health reports to the log
#[derive(Debug, Default)]
pub struct TracingHealthReporter;

impl HealthReporter for TracingHealthReporter {
    fn report_health(&self, report: HealthReport) {
        match report.severity {
            HealthSeverity::Ok => info!("Health {:?} ok: {}", report.kind, report.context),
            HealthSeverity::Warning => warn!("Health {:?} warning: {}", report.kind, report.context),
            HealthSeverity::Error => error!("Health {:?} error: {}", report.kind, report.context),
        }
    }
}

/// Keeps every report in memory
#[derive(Debug, Default)]
pub struct InMemoryHealthReporter {
    reports: RwLock<Vec<HealthReport>>,
}

impl InMemoryHealthReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<HealthReport> {
        self.reports.read().clone()
    }

    /// Most recent report of `kind`
    pub fn latest(&self, kind: HealthReportKind) -> Option<HealthReport> {
        self.reports
            .read()
            .iter()
            .rev()
            .find(|r| r.kind == kind)
            .cloned()
    }

    pub fn clear(&self) {
        self.reports.write().clear();
    }
}

impl HealthReporter for InMemoryHealthReporter {
    fn report_health(&self, report: HealthReport) {
        self.reports.write().push(report);
    }
}
