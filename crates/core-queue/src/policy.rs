//! [`PolicyEngine`]: pure submission/dispatch rules.
//!
//! Grounded on `jobs/policy.py`'s `evaluate_dispatch`: the same rule order
//! (role gate, mode downgrade, concurrency cap, queued cap, daily cap, admin
//! bypass), expressed as a pure function over already-resolved counters
//! rather than reaching into a store itself.

use core_jobstate::{Device, Mode, Role, UserQuotaOverride};
use serde::{Deserialize, Serialize};

/// Global caps not tied to any one user; configured process-wide.
#[derive(Debug, Clone)]
pub struct GlobalLimits {
    pub max_concurrent_jobs: i64,
    pub max_queued: i64,
    pub jobs_per_day: i64,
    pub max_high_mode_running: i64,
    pub gpu_available: bool,
}

impl Default for GlobalLimits {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            max_queued: 50,
            jobs_per_day: 200,
            max_high_mode_running: 2,
            gpu_available: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Submit,
    Dispatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub ok: bool,
    pub reasons: Vec<String>,
    pub effective_mode: Mode,
    pub effective_device: Device,
    pub http_status: u16,
}

pub struct PolicyRequest<'a> {
    pub user_id: &'a str,
    pub role: Role,
    pub requested_mode: Mode,
    pub requested_device: Device,
    pub operation: Operation,
    pub user_running: i64,
    pub user_queued: i64,
    pub user_jobs_today: i64,
    pub global_running: i64,
    pub global_high_running: i64,
    pub user_quota: Option<&'a UserQuotaOverride>,
    pub draining: bool,
}

pub struct PolicyEngine {
    limits: GlobalLimits,
}

impl PolicyEngine {
    pub fn new(limits: GlobalLimits) -> Self {
        Self { limits }
    }

    /// Evaluate a submission or dispatch request. Never mutates state.
    pub fn evaluate(&self, req: &PolicyRequest<'_>) -> PolicyDecision {
        let mut reasons = Vec::new();

        if req.role == Role::Viewer {
            return PolicyDecision {
                ok: false,
                reasons: vec!["viewer role is read-only".to_string()],
                effective_mode: req.requested_mode,
                effective_device: req.requested_device,
                http_status: 403,
            };
        }

        if req.draining {
            return PolicyDecision {
                ok: false,
                reasons: vec!["service is draining".to_string()],
                effective_mode: req.requested_mode,
                effective_device: req.requested_device,
                http_status: 503,
            };
        }

        let mut effective_device = req.requested_device;
        if effective_device == Device::Auto && !self.limits.gpu_available {
            effective_device = Device::Cpu;
        }

        let mut effective_mode = req.requested_mode;
        if effective_mode == Mode::High {
            if !self.limits.gpu_available {
                effective_mode = Mode::Medium;
                reasons.push("high mode requires gpu, downgraded to medium".to_string());
            } else if req.global_high_running >= self.limits.max_high_mode_running {
                effective_mode = Mode::Medium;
                reasons.push("global high-mode capacity reached, downgraded to medium".to_string());
            }
        }

        let admin_bypass = req.role == Role::Admin && req.user_quota.is_none();

        let max_running = resolve(req.user_quota.and_then(|q| q.max_running), self.limits.max_concurrent_jobs, admin_bypass);
        let max_queued = resolve(req.user_quota.and_then(|q| q.max_queued), self.limits.max_queued, admin_bypass);
        let jobs_per_day = resolve(req.user_quota.and_then(|q| q.jobs_per_day), self.limits.jobs_per_day, admin_bypass);

        let mut ok = true;
        let mut http_status = 200;

        match req.operation {
            Operation::Dispatch => {
                if let Some(cap) = max_running {
                    if req.user_running >= cap {
                        ok = false;
                        http_status = 429;
                        reasons.push(format!("concurrency cap reached ({}/{})", req.user_running, cap));
                    }
                }
            }
            Operation::Submit => {
                if let Some(cap) = max_queued {
                    if req.user_queued >= cap {
                        ok = false;
                        http_status = 429;
                        reasons.push(format!("queued cap reached ({}/{})", req.user_queued, cap));
                    }
                }
                if let Some(cap) = jobs_per_day {
                    if req.user_jobs_today + 1 > cap {
                        ok = false;
                        http_status = 429;
                        reasons.push(format!("daily cap reached ({}/{})", req.user_jobs_today, cap));
                    }
                }
            }
        }

        if req.global_running >= self.limits.max_concurrent_jobs && req.operation == Operation::Dispatch {
            ok = false;
            http_status = 429;
            reasons.push("global concurrency cap reached".to_string());
        }

        PolicyDecision {
            ok,
            reasons,
            effective_mode,
            effective_device,
            http_status: if ok { 200 } else { http_status },
        }
    }
}

/// `None` means "no cap" (admin bypass with no explicit per-user override).
fn resolve(override_val: Option<i64>, default: i64, admin_bypass: bool) -> Option<i64> {
    if admin_bypass {
        return None;
    }
    Some(override_val.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_req<'a>() -> PolicyRequest<'a> {
        PolicyRequest {
            user_id: "user1",
            role: Role::Operator,
            requested_mode: Mode::Medium,
            requested_device: Device::Auto,
            operation: Operation::Submit,
            user_running: 0,
            user_queued: 0,
            user_jobs_today: 0,
            global_running: 0,
            global_high_running: 0,
            user_quota: None,
            draining: false,
        }
    }

    #[test]
    fn viewer_role_is_denied() {
        let engine = PolicyEngine::new(GlobalLimits::default());
        let mut req = base_req();
        req.role = Role::Viewer;
        let dec = engine.evaluate(&req);
        assert!(!dec.ok);
        assert_eq!(dec.http_status, 403);
    }

    #[test]
    fn draining_denies_every_submission() {
        let engine = PolicyEngine::new(GlobalLimits::default());
        let mut req = base_req();
        req.draining = true;
        let dec = engine.evaluate(&req);
        assert!(!dec.ok);
        assert_eq!(dec.http_status, 503);
    }

    #[test]
    fn high_mode_without_gpu_downgrades_to_medium() {
        let engine = PolicyEngine::new(GlobalLimits { gpu_available: false, ..GlobalLimits::default() });
        let mut req = base_req();
        req.requested_mode = Mode::High;
        let dec = engine.evaluate(&req);
        assert_eq!(dec.effective_mode, Mode::Medium);
    }

    #[test]
    fn auto_device_without_gpu_resolves_to_cpu() {
        let engine = PolicyEngine::new(GlobalLimits { gpu_available: false, ..GlobalLimits::default() });
        let req = base_req();
        let dec = engine.evaluate(&req);
        assert_eq!(dec.effective_device, Device::Cpu);
    }

    #[test]
    fn daily_cap_denies_submission_over_limit() {
        let engine = PolicyEngine::new(GlobalLimits { jobs_per_day: 5, ..GlobalLimits::default() });
        let mut req = base_req();
        req.user_jobs_today = 5;
        let dec = engine.evaluate(&req);
        assert!(!dec.ok);
        assert_eq!(dec.http_status, 429);
    }

    #[test]
    fn admin_without_override_bypasses_concurrency_cap() {
        let engine = PolicyEngine::new(GlobalLimits { max_concurrent_jobs: 1, ..GlobalLimits::default() });
        let mut req = base_req();
        req.role = Role::Admin;
        req.operation = Operation::Dispatch;
        req.user_running = 10;
        req.global_running = 0;
        let dec = engine.evaluate(&req);
        assert!(dec.ok);
    }

    #[test]
    fn admin_with_explicit_override_is_still_capped() {
        let engine = PolicyEngine::new(GlobalLimits::default());
        let quota = UserQuotaOverride { max_running: Some(2), ..Default::default() };
        let mut req = base_req();
        req.role = Role::Admin;
        req.operation = Operation::Dispatch;
        req.user_running = 3;
        req.user_quota = Some(&quota);
        let dec = engine.evaluate(&req);
        assert!(!dec.ok);
    }
}
