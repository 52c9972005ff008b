use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::storage::types::tenant::TenantPlan;

/// Admission decision for one tenant request.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Rejected { retry_after_secs: i64 },
}

/// Per-tenant sliding-window admission.
///
/// Keeps one timestamp queue per tenant; a request is admitted when fewer
/// than `limit` admissions happened in the trailing window. State is
/// in-process; the orchestrator owns exactly one instance.
#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&self, tenant_id: &str, limit: usize, window_secs: i64) -> Admission {
        self.admit_at(tenant_id, limit, window_secs, Utc::now())
    }

    /// Admission check against an explicit clock; `admit` passes `Utc::now()`.
    pub fn admit_at(
        &self,
        tenant_id: &str,
        limit: usize,
        window_secs: i64,
        now: DateTime<Utc>,
    ) -> Admission {
        let window_start = now - Duration::seconds(window_secs);

        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let timestamps = windows.entry(tenant_id.to_string()).or_default();

        while timestamps.front().is_some_and(|ts| *ts <= window_start) {
            timestamps.pop_front();
        }

        if timestamps.len() >= limit {
            // Time until the oldest admission leaves the window.
            let retry_after_secs = timestamps.front().map_or(1, |oldest| {
                (*oldest - window_start).num_seconds().saturating_add(1)
            });
            debug!(tenant_id, retry_after_secs, "rate limit rejection");
            return Admission::Rejected { retry_after_secs };
        }

        timestamps.push_back(now);
        Admission::Granted
    }

    /// Drop tenants with no admissions in the last `max_idle_secs`.
    pub fn sweep(&self, max_idle_secs: i64) {
        self.sweep_at(max_idle_secs, Utc::now());
    }

    pub fn sweep_at(&self, max_idle_secs: i64, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(max_idle_secs);

        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        windows.retain(|_, timestamps| {
            while timestamps.front().is_some_and(|ts| *ts <= cutoff) {
                timestamps.pop_front();
            }
            !timestamps.is_empty()
        });
    }

    #[cfg(test)]
    fn tracked_tenants(&self) -> usize {
        match self.windows.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// `(limit, window_secs)` admission pairs per plan.
pub fn plan_limits(plan: &TenantPlan) -> (usize, i64) {
    match plan {
        TenantPlan::Free => (30, 60),
        TenantPlan::Starter => (120, 60),
        TenantPlan::Professional => (600, 60),
        TenantPlan::Enterprise => (3000, 60),
    }
}
