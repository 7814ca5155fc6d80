use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use patchflow_core::{DomainError, ErrorKind, JobId, TenantId};

/// Subscription tier; decides the concurrency cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl PlanTier {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Pro => "pro",
            PlanTier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(PlanTier::Free),
            "pro" => Ok(PlanTier::Pro),
            "enterprise" => Ok(PlanTier::Enterprise),
            other => Err(DomainError::validation(format!("unknown plan: {other}"))),
        }
    }
}

/// In-flight cap per plan tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanLimits {
    pub free: u32,
    pub pro: u32,
    pub enterprise: u32,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            free: 1,
            pro: 5,
            enterprise: 20,
        }
    }
}

impl PlanLimits {
    pub fn limit_for(&self, plan: PlanTier) -> u32 {
        match plan {
            PlanTier::Free => self.free,
            PlanTier::Pro => self.pro,
            PlanTier::Enterprise => self.enterprise,
        }
    }
}

/// Admission settings shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    pub default_plan: PlanTier,
    pub limits: PlanLimits,
    /// Suggested wait attached to limit and pause rejections.
    pub retry_after: Duration,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            default_plan: PlanTier::Free,
            limits: PlanLimits::default(),
            retry_after: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Paused,
    Suspended,
}

impl TenantStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Paused => "paused",
            TenantStatus::Suspended => "suspended",
        }
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TenantStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TenantStatus::Active),
            "paused" => Ok(TenantStatus::Paused),
            "suspended" => Ok(TenantStatus::Suspended),
            other => Err(DomainError::validation(format!("unknown tenant status: {other}"))),
        }
    }
}

/// Per-tenant admission state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantConcurrencyState {
    pub tenant_id: TenantId,
    pub plan: PlanTier,
    pub plan_limit: u32,
    pub in_flight_count: u32,
    pub status: TenantStatus,
    pub status_reason: Option<String>,
    pub status_changed_at: Option<DateTime<Utc>>,
    /// Jobs currently holding a slot.
    pub holders: BTreeSet<JobId>,
}

/// Why a tenant was turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Retry later.
    LimitExhausted { limit: u32, current: u32, retry_after: Duration },
    /// Service unavailable for this tenant until resumed.
    Paused { reason: Option<String>, retry_after: Duration },
    /// Access denied.
    Suspended { reason: Option<String> },
}

impl Rejection {
    /// Metrics label.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::LimitExhausted { .. } => "limit",
            Rejection::Paused { .. } => "paused",
            Rejection::Suspended { .. } => "suspended",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Rejection::LimitExhausted { retry_after, .. } | Rejection::Paused { retry_after, .. } => {
                Some(*retry_after)
            }
            Rejection::Suspended { .. } => None,
        }
    }

    /// Capacity rejections re-delay the job; suspension does not resolve by waiting.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            Rejection::Suspended { .. } => ErrorKind::Fatal,
            _ => ErrorKind::Capacity,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::LimitExhausted { limit, current, .. } => {
                write!(f, "concurrency limit reached ({current}/{limit})")
            }
            Rejection::Paused { reason, .. } => {
                write!(f, "tenant paused: {}", reason.as_deref().unwrap_or("no reason given"))
            }
            Rejection::Suspended { reason } => {
                write!(f, "tenant suspended: {}", reason.as_deref().unwrap_or("no reason given"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Granted { in_flight: u32, limit: u32 },
    Rejected(Rejection),
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted { .. })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
}

impl TenantConcurrencyState {
    pub fn new(tenant_id: TenantId, policy: &AdmissionPolicy) -> Self {
        Self {
            tenant_id,
            plan: policy.default_plan,
            plan_limit: policy.limits.limit_for(policy.default_plan),
            in_flight_count: 0,
            status: TenantStatus::Active,
            status_reason: None,
            status_changed_at: None,
            holders: BTreeSet::new(),
        }
    }

    /// Check and take a slot for `holder`.
    ///
    /// An existing holder is granted again without counting twice.
    pub fn admit(&mut self, holder: JobId, policy: &AdmissionPolicy) -> Admission {
        match self.status {
            TenantStatus::Suspended => {
                return Admission::Rejected(Rejection::Suspended {
                    reason: self.status_reason.clone(),
                });
            }
            TenantStatus::Paused => {
                return Admission::Rejected(Rejection::Paused {
                    reason: self.status_reason.clone(),
                    retry_after: policy.retry_after,
                });
            }
            TenantStatus::Active => {}
        }

        if !self.holders.contains(&holder) {
            if self.in_flight_count >= self.plan_limit {
                return Admission::Rejected(Rejection::LimitExhausted {
                    limit: self.plan_limit,
                    current: self.in_flight_count,
                    retry_after: policy.retry_after,
                });
            }
            self.holders.insert(holder);
            self.in_flight_count = self.holders.len() as u32;
        }

        Admission::Granted {
            in_flight: self.in_flight_count,
            limit: self.plan_limit,
        }
    }

    /// Free the slot held by `holder`; unknown holders are a no-op.
    pub fn release(&mut self, holder: JobId) -> bool {
        let removed = self.holders.remove(&holder);
        self.in_flight_count = self.holders.len() as u32;
        removed
    }

    /// Move to `status`; returns false when already there.
    pub fn transition(&mut self, status: TenantStatus, reason: Option<&str>, now: DateTime<Utc>) -> bool {
        if self.status == status {
            return false;
        }
        info!(
            target: "audit",
            tenant_id = %self.tenant_id,
            from = %self.status,
            to = %status,
            reason = reason.unwrap_or(""),
            "tenant admission status changed"
        );
        self.status = status;
        self.status_reason = reason.map(str::to_string);
        self.status_changed_at = Some(now);
        true
    }

    pub fn set_plan(&mut self, plan: PlanTier, policy: &AdmissionPolicy) {
        if self.plan != plan {
            info!(
                target: "audit",
                tenant_id = %self.tenant_id,
                from = %self.plan,
                to = %plan,
                "tenant plan changed"
            );
        }
        self.plan = plan;
        self.plan_limit = policy.limits.limit_for(plan);
    }
}
