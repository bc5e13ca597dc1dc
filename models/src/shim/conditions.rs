//! Typed status conditions for `Shim` resources.
//!
//! Conditions are keyed by type: setting a condition replaces any earlier condition of the same
//! type. The transition time only moves when the condition's status flips, so re-applying the same
//! observation is a no-op.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

const STATUS_TRUE: &str = "True";
const STATUS_FALSE: &str = "False";

/// One observation about a `Shim`, before it is merged into the status conditions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatusCondition {
    pub type_: &'static str,
    pub status: bool,
    pub reason: &'static str,
    pub message: String,
}

impl StatusCondition {
    pub fn new<S: Into<String>>(
        type_: &'static str,
        status: bool,
        reason: &'static str,
        message: S,
    ) -> Self {
        StatusCondition {
            type_,
            status,
            reason,
            message: message.into(),
        }
    }
}

/// Merges `update` into `conditions`. Returns whether anything changed.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    update: StatusCondition,
    observed_generation: i64,
    now: DateTime<Utc>,
) -> bool {
    let status = if update.status {
        STATUS_TRUE
    } else {
        STATUS_FALSE
    };

    match conditions.iter_mut().find(|c| c.type_ == update.type_) {
        Some(existing) => {
            let before = existing.clone();
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Time(now);
            }
            existing.reason = update.reason.to_string();
            existing.message = update.message;
            existing.observed_generation = Some(observed_generation);
            *existing != before
        }
        None => {
            conditions.push(Condition {
                type_: update.type_.to_string(),
                status: status.to_string(),
                reason: update.reason.to_string(),
                message: update.message,
                observed_generation: Some(observed_generation),
                last_transition_time: Time(now),
            });
            true
        }
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the condition of the given type is present with status `True`.
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).map_or(false, |c| c.status == STATUS_TRUE)
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_insert_then_reapply_is_noop() {
        let mut conditions = Vec::new();
        let update = StatusCondition::new("Valid", true, "SpecValid", "ok");

        assert!(set_condition(&mut conditions, update.clone(), 1, at(10)));
        assert!(!set_condition(&mut conditions, update, 1, at(20)));

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, Time(at(10)));
    }

    #[test]
    fn test_transition_time_moves_only_on_flip() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            StatusCondition::new("RolloutComplete", false, "RolloutInProgress", "1/3"),
            1,
            at(10),
        );
        assert!(set_condition(
            &mut conditions,
            StatusCondition::new("RolloutComplete", false, "RolloutInProgress", "2/3"),
            1,
            at(20),
        ));
        assert_eq!(conditions[0].last_transition_time, Time(at(10)));
        assert_eq!(conditions[0].message, "2/3");

        set_condition(
            &mut conditions,
            StatusCondition::new("RolloutComplete", true, "AllNodesUpgraded", "3/3"),
            2,
            at(30),
        );
        assert_eq!(conditions[0].last_transition_time, Time(at(30)));
        assert!(is_condition_true(&conditions, "RolloutComplete"));
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn test_conditions_keyed_by_type() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            StatusCondition::new("Valid", true, "SpecValid", ""),
            1,
            at(10),
        );
        set_condition(
            &mut conditions,
            StatusCondition::new("Terminating", true, "CleanupPending", ""),
            1,
            at(10),
        );
        assert_eq!(conditions.len(), 2);
        assert!(find_condition(&conditions, "Terminating").is_some());
        assert!(!is_condition_true(&conditions, "NodeInstallFailed"));
    }
}
