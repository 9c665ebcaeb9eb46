//! Health verdicts for the status report

use serde::Serialize;

/// Health of one aspect of the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "UPPERCASE")]
pub enum HealthStatus {
    /// Operating normally
    Healthy,
    /// Running but needs attention
    Degraded { reason: String },
    /// Not keeping up or losing work
    Unhealthy { reason: String },
}

impl HealthStatus {
    fn severity(&self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded { .. } => 1,
            Self::Unhealthy { .. } => 2,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// The more severe of two verdicts
    pub fn worst(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Degraded { reason } => write!(f, "DEGRADED: {}", reason),
            HealthStatus::Unhealthy { reason } => write!(f, "UNHEALTHY: {}", reason),
        }
    }
}

/// Freshness of a batch lock, judged from its heartbeat age
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HeartbeatHealth {
    Ok,
    Warning,
    Stale,
}

impl std::fmt::Display for HeartbeatHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Stale => "STALE",
        })
    }
}

/// One named check with an operator hint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub name: &'static str,
    #[serde(flatten)]
    pub status: HealthStatus,
    pub recommendation: Option<String>,
}

impl HealthCheck {
    pub fn healthy(name: &'static str) -> Self {
        Self {
            name,
            status: HealthStatus::Healthy,
            recommendation: None,
        }
    }

    pub fn degraded(name: &'static str, reason: String, recommendation: &str) -> Self {
        Self {
            name,
            status: HealthStatus::Degraded { reason },
            recommendation: Some(recommendation.to_string()),
        }
    }

    pub fn unhealthy(name: &'static str, reason: String, recommendation: &str) -> Self {
        Self {
            name,
            status: HealthStatus::Unhealthy { reason },
            recommendation: Some(recommendation.to_string()),
        }
    }
}

/// Worst status over all checks
pub fn overall(checks: &[HealthCheck]) -> HealthStatus {
    checks
        .iter()
        .map(|c| c.status.clone())
        .fold(HealthStatus::Healthy, HealthStatus::worst)
}
