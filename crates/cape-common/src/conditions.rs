//! Condition bookkeeping shared by all provider statuses
//!
//! Readiness is never a literal flag: controllers record each named health
//! check as a condition and derive `Ready` as the conjunction of the checks
//! that gate it, then project the boolean `ready` field from that.

use crate::crd::{Condition, ConditionSeverity, ConditionStatus};

/// Condition type of the derived readiness signal
pub const READY_CONDITION: &str = "Ready";

/// Reason used on Ready when a required check has not been evaluated yet
pub const WAITING_FOR_CHECK_REASON: &str = "WaitingForCheck";

/// Look up a condition by type
pub fn get<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// True when the condition exists and holds
pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    get(conditions, type_).map(Condition::is_true).unwrap_or(false)
}

/// Insert or replace a condition by type
///
/// The existing `lastTransitionTime` is kept unless the status changes, and
/// an identical condition leaves the list untouched so repeated passes do
/// not produce status churn.
pub fn set(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.same_state(&condition) {
                return;
            }
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Mark a check as passing
pub fn mark_true(conditions: &mut Vec<Condition>, type_: &str) {
    set(conditions, Condition::true_(type_));
}

/// Mark a check as failing
pub fn mark_false(
    conditions: &mut Vec<Condition>,
    type_: &str,
    reason: &str,
    severity: ConditionSeverity,
    message: impl Into<String>,
) {
    set(conditions, Condition::false_(type_, reason, severity, message));
}

/// Derive the Ready condition from the required checks, in order
///
/// The first check that is not True decides the reason, severity, and
/// message of a false Ready. A check never evaluated counts as not ready.
pub fn summarize(conditions: &[Condition], required: &[&str]) -> Condition {
    for check in required {
        match get(conditions, check) {
            Some(c) if c.is_true() => continue,
            Some(c) => {
                let mut ready = Condition::false_(
                    READY_CONDITION,
                    c.reason.clone().unwrap_or_else(|| check.to_string()),
                    c.severity.unwrap_or(ConditionSeverity::Info),
                    c.message.clone().unwrap_or_default(),
                );
                if c.status == ConditionStatus::Unknown {
                    ready.severity = Some(ConditionSeverity::Info);
                }
                return ready;
            }
            None => {
                return Condition::false_(
                    READY_CONDITION,
                    WAITING_FOR_CHECK_REASON,
                    ConditionSeverity::Info,
                    format!("{check} has not been evaluated"),
                )
            }
        }
    }
    Condition::true_(READY_CONDITION)
}

/// Recompute Ready from the required checks and store it
///
/// Returns the stored Ready condition so callers can project their
/// `ready`/`failureReason`/`failureMessage` fields from it.
pub fn update_ready(conditions: &mut Vec<Condition>, required: &[&str]) -> Condition {
    let ready = summarize(conditions, required);
    set(conditions, ready.clone());
    ready
}
