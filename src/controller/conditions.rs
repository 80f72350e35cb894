//! Condition bookkeeping for the proxy status surface
//!
//! Conditions summarise the last pass in a form that is easy to alert on:
//! `Ready`, `Progressing` and `Degraded`, each `True`/`False` with a reason.

use chrono::Utc;
use serde::Serialize;

use super::status::{ReconcileOutcome, ServicePhase};

pub const CONDITION_TYPE_READY: &str = "Ready";
pub const CONDITION_TYPE_PROGRESSING: &str = "Progressing";
pub const CONDITION_TYPE_DEGRADED: &str = "Degraded";

pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub last_transition_time: String,
    pub reason: String,
    pub message: String,
}

/// Update or add a condition to the conditions list
///
/// The transition time only moves when the status flips.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
) {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        let should_update_time = existing.status != status;

        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();

        if should_update_time {
            existing.last_transition_time = now;
        }
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

fn status_str(value: bool) -> &'static str {
    if value {
        CONDITION_STATUS_TRUE
    } else {
        CONDITION_STATUS_FALSE
    }
}

/// Derive Ready/Progressing/Degraded from a finished pass
pub fn conditions_for_outcome(conditions: &mut Vec<Condition>, outcome: &ReconcileOutcome) {
    let (ready_reason, ready_message) = match outcome.status {
        ServicePhase::Active => ("AllServicesActive", "Every related service is online"),
        ServicePhase::Blocked => ("NoClientRelated", "No SSL termination client is related"),
        ServicePhase::AwaitingCertificate => {
            ("CertificatePending", "Certificate has not been issued yet")
        }
        ServicePhase::Configuring => ("Configuring", "Proxy configuration in progress"),
        ServicePhase::Failed => ("ServiceFailed", "At least one service failed to configure"),
    };
    set_condition(
        conditions,
        CONDITION_TYPE_READY,
        status_str(outcome.status == ServicePhase::Active),
        ready_reason,
        ready_message,
    );

    let progressing = matches!(
        outcome.status,
        ServicePhase::AwaitingCertificate | ServicePhase::Configuring
    );
    set_condition(
        conditions,
        CONDITION_TYPE_PROGRESSING,
        status_str(progressing),
        if progressing { ready_reason } else { "Idle" },
        if progressing {
            ready_message
        } else {
            "No changes pending"
        },
    );

    let degraded_message = if outcome.failed_services.is_empty() {
        "No degradation detected".to_string()
    } else {
        format!(
            "Failed services: {}",
            outcome
                .failed_services
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        )
    };
    set_condition(
        conditions,
        CONDITION_TYPE_DEGRADED,
        status_str(!outcome.failed_services.is_empty()),
        if outcome.failed_services.is_empty() {
            "NoIssues"
        } else {
            "ServiceFailed"
        },
        &degraded_message,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            CONDITION_TYPE_READY,
            CONDITION_STATUS_TRUE,
            "AllServicesActive",
            "ok",
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, CONDITION_TYPE_READY);
        assert_eq!(conditions[0].status, CONDITION_STATUS_TRUE);
    }

    #[test]
    fn test_set_condition_updates_existing() {
        let mut conditions = vec![Condition {
            type_: CONDITION_TYPE_READY.to_string(),
            status: CONDITION_STATUS_FALSE.to_string(),
            last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            reason: "NoClientRelated".to_string(),
            message: "No SSL termination client is related".to_string(),
        }];

        let old_time = conditions[0].last_transition_time.clone();
        set_condition(
            &mut conditions,
            CONDITION_TYPE_READY,
            CONDITION_STATUS_TRUE,
            "AllServicesActive",
            "ok",
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, CONDITION_STATUS_TRUE);
        assert_ne!(conditions[0].last_transition_time, old_time);
    }

    #[test]
    fn test_same_status_keeps_transition_time() {
        let mut conditions = vec![Condition {
            type_: CONDITION_TYPE_DEGRADED.to_string(),
            status: CONDITION_STATUS_FALSE.to_string(),
            last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            reason: "NoIssues".to_string(),
            message: "No degradation detected".to_string(),
        }];
        set_condition(
            &mut conditions,
            CONDITION_TYPE_DEGRADED,
            CONDITION_STATUS_FALSE,
            "NoIssues",
            "still fine",
        );
        assert_eq!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
        assert_eq!(conditions[0].message, "still fine");
    }

    #[test]
    fn test_conditions_for_failed_outcome() {
        let mut outcome = ReconcileOutcome::new(BTreeSet::from(["a.example.com".to_string()]));
        outcome.set_phase("svc-a", ServicePhase::Active);
        outcome.set_phase("svc-b", ServicePhase::Failed);
        outcome.finish();

        let mut conditions = Vec::new();
        conditions_for_outcome(&mut conditions, &outcome);

        assert!(!is_condition_true(&conditions, CONDITION_TYPE_READY));
        assert!(!is_condition_true(&conditions, CONDITION_TYPE_PROGRESSING));
        assert!(is_condition_true(&conditions, CONDITION_TYPE_DEGRADED));
        let degraded = find_condition(&conditions, CONDITION_TYPE_DEGRADED).unwrap();
        assert_eq!(degraded.message, "Failed services: svc-b");
    }

    #[test]
    fn test_conditions_for_active_outcome() {
        let mut outcome = ReconcileOutcome::new(BTreeSet::from(["a.example.com".to_string()]));
        outcome.set_phase("svc-a", ServicePhase::Active);
        outcome.finish();

        let mut conditions = Vec::new();
        conditions_for_outcome(&mut conditions, &outcome);
        assert!(is_condition_true(&conditions, CONDITION_TYPE_READY));
        assert!(!is_condition_true(&conditions, CONDITION_TYPE_DEGRADED));
        assert_eq!(conditions.len(), 3);
    }
}
