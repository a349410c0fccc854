//! Condition engine for DataVolumes
//!
//! Derives the Bound, Ready and Running conditions from the DataVolume phase
//! and the PVC the worker pods annotate. All functions are pure; the caller
//! supplies the timestamp.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use std::collections::BTreeMap;

use crate::crd::{DataVolumeCondition, DataVolumePhase};

use super::annotations::*;

/// Condition types tracked on a DataVolume
pub const CONDITION_TYPE_READY: &str = "Ready";
pub const CONDITION_TYPE_BOUND: &str = "Bound";
pub const CONDITION_TYPE_RUNNING: &str = "Running";

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

/// Ready reason while a transfer pod is working
pub const REASON_TRANSFER_RUNNING: &str = "TransferRunning";
pub const REASON_BOUND: &str = "Bound";
pub const REASON_PENDING: &str = "Pending";
pub const REASON_CLAIM_LOST: &str = "ClaimLost";
pub const REASON_NOT_FOUND: &str = "NotFound";
/// Running reason reported while scratch space is provisioned; not a failure
pub const REASON_SCRATCH_SPACE_REQUIRED: &str = "ScratchSpaceRequired";

/// Update or add a condition.
///
/// The transition time moves only when the status changes; the heartbeat
/// moves whenever status, reason or message changes. A freshly added
/// condition always counts as a transition.
pub fn set_condition(
    conditions: &mut Vec<DataVolumeCondition>,
    type_: &str,
    status: &str,
    message: &str,
    reason: &str,
    now: DateTime<Utc>,
) {
    let idx = match conditions.iter().position(|c| c.type_ == type_) {
        Some(idx) => idx,
        None => {
            conditions.push(DataVolumeCondition {
                type_: type_.to_string(),
                ..Default::default()
            });
            conditions.len() - 1
        }
    };
    let condition = &mut conditions[idx];

    if condition.status != status {
        condition.last_transition_time = Some(Time(now));
        condition.last_heartbeat_time = Some(Time(now));
        condition.message = message.to_string();
        condition.reason = reason.to_string();
    } else if condition.message != message || condition.reason != reason {
        condition.message = message.to_string();
        condition.reason = reason.to_string();
        condition.last_heartbeat_time = Some(Time(now));
    }
    condition.status = status.to_string();
}

/// Find a condition by type
pub fn find_condition<'a>(
    conditions: &'a [DataVolumeCondition],
    type_: &str,
) -> Option<&'a DataVolumeCondition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[DataVolumeCondition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

pub fn set_ready_condition(
    conditions: &mut Vec<DataVolumeCondition>,
    status: &str,
    message: &str,
    reason: &str,
    now: DateTime<Utc>,
) {
    set_condition(conditions, CONDITION_TYPE_READY, status, message, reason, now);
}

/// Ready status implied by a phase
pub fn ready_status_for_phase(phase: DataVolumePhase) -> &'static str {
    match phase {
        DataVolumePhase::Succeeded => CONDITION_STATUS_TRUE,
        DataVolumePhase::Unknown => CONDITION_STATUS_UNKNOWN,
        _ => CONDITION_STATUS_FALSE,
    }
}

/// Condition the worker reported on the PVC through the bound annotations
struct PvcBoundCondition {
    status: &'static str,
    message: String,
    reason: String,
}

fn pvc_bound_condition(anno: &BTreeMap<String, String>) -> Option<PvcBoundCondition> {
    let value = anno.get(ANN_BOUND_CONDITION)?;
    let status = match value.to_lowercase().as_str() {
        "true" => CONDITION_STATUS_TRUE,
        "false" => CONDITION_STATUS_FALSE,
        _ => CONDITION_STATUS_UNKNOWN,
    };
    Some(PvcBoundCondition {
        status,
        message: anno.get(ANN_BOUND_CONDITION_MESSAGE).cloned().unwrap_or_default(),
        reason: anno.get(ANN_BOUND_CONDITION_REASON).cloned().unwrap_or_default(),
    })
}

/// Derive the Bound condition from the PVC, forcing Ready=False unless bound
pub fn update_bound_condition(
    conditions: &mut Vec<DataVolumeCondition>,
    pvc: Option<&PersistentVolumeClaim>,
    reason: &str,
    now: DateTime<Utc>,
) {
    let Some(pvc) = pvc else {
        let reason = if reason.is_empty() { REASON_NOT_FOUND } else { reason };
        set_condition(
            conditions,
            CONDITION_TYPE_BOUND,
            CONDITION_STATUS_UNKNOWN,
            "No PVC found",
            reason,
            now,
        );
        set_ready_condition(conditions, CONDITION_STATUS_FALSE, "", "", now);
        return;
    };

    let name = pvc.name_any();
    let reported = pvc_bound_condition(pvc.annotations());
    let reported_not_true = reported
        .as_ref()
        .filter(|c| c.status != CONDITION_STATUS_TRUE);
    let phase = pvc.status.as_ref().and_then(|s| s.phase.as_deref());

    match phase {
        Some("Bound") => match reported_not_true {
            None => set_condition(
                conditions,
                CONDITION_TYPE_BOUND,
                CONDITION_STATUS_TRUE,
                &format!("PVC {} Bound", name),
                REASON_BOUND,
                now,
            ),
            Some(c) => {
                set_condition(
                    conditions,
                    CONDITION_TYPE_BOUND,
                    CONDITION_STATUS_FALSE,
                    &c.message,
                    &c.reason,
                    now,
                );
                set_ready_condition(conditions, CONDITION_STATUS_FALSE, "", "", now);
            }
        },
        Some("Pending") => {
            match reported_not_true {
                None => set_condition(
                    conditions,
                    CONDITION_TYPE_BOUND,
                    CONDITION_STATUS_FALSE,
                    &format!("PVC {} Pending", name),
                    REASON_PENDING,
                    now,
                ),
                Some(c) => set_condition(
                    conditions,
                    CONDITION_TYPE_BOUND,
                    CONDITION_STATUS_FALSE,
                    &format!("target PVC {} Pending and {}", name, c.message),
                    &c.reason,
                    now,
                ),
            }
            set_ready_condition(conditions, CONDITION_STATUS_FALSE, "", "", now);
        }
        Some("Lost") => {
            set_condition(
                conditions,
                CONDITION_TYPE_BOUND,
                CONDITION_STATUS_FALSE,
                "Claim Lost",
                REASON_CLAIM_LOST,
                now,
            );
            set_ready_condition(conditions, CONDITION_STATUS_FALSE, "", "", now);
        }
        _ => {
            set_condition(
                conditions,
                CONDITION_TYPE_BOUND,
                CONDITION_STATUS_UNKNOWN,
                &format!("PVC {} phase unknown", name),
                CONDITION_STATUS_UNKNOWN,
                now,
            );
            set_ready_condition(conditions, CONDITION_STATUS_FALSE, "", "", now);
        }
    }
}

fn ann<'a>(anno: &'a BTreeMap<String, String>, key: &str) -> &'a str {
    anno.get(key).map(String::as_str).unwrap_or("")
}

/// Derive the Running condition from the target and source running annotations
pub fn update_running_condition(
    conditions: &mut Vec<DataVolumeCondition>,
    anno: &BTreeMap<String, String>,
    now: DateTime<Utc>,
) {
    let target_msg = ann(anno, ANN_RUNNING_CONDITION_MESSAGE);
    let target_reason = ann(anno, ANN_RUNNING_CONDITION_REASON);
    let source_msg = ann(anno, ANN_SOURCE_RUNNING_CONDITION_MESSAGE);
    let source_reason = ann(anno, ANN_SOURCE_RUNNING_CONDITION_REASON);
    let source = anno
        .get(ANN_SOURCE_RUNNING_CONDITION)
        .map(|v| v.to_lowercase());

    let Some(target) = anno.get(ANN_RUNNING_CONDITION).map(|v| v.to_lowercase()) else {
        set_condition(
            conditions,
            CONDITION_TYPE_RUNNING,
            CONDITION_STATUS_FALSE,
            target_msg,
            target_reason,
            now,
        );
        return;
    };

    match target.as_str() {
        "true" => match source.as_deref() {
            None | Some("true") => {
                set_condition(
                    conditions,
                    CONDITION_TYPE_RUNNING,
                    CONDITION_STATUS_TRUE,
                    target_msg,
                    target_reason,
                    now,
                );
                set_ready_condition(
                    conditions,
                    CONDITION_STATUS_FALSE,
                    "",
                    REASON_TRANSFER_RUNNING,
                    now,
                );
            }
            // Source not running wins over a running target
            Some("false") => set_condition(
                conditions,
                CONDITION_TYPE_RUNNING,
                CONDITION_STATUS_FALSE,
                source_msg,
                source_reason,
                now,
            ),
            Some(_) => set_condition(
                conditions,
                CONDITION_TYPE_RUNNING,
                CONDITION_STATUS_UNKNOWN,
                source_msg,
                source_reason,
                now,
            ),
        },
        "false" => match source.as_deref() {
            None | Some("true") => set_condition(
                conditions,
                CONDITION_TYPE_RUNNING,
                CONDITION_STATUS_FALSE,
                target_msg,
                target_reason,
                now,
            ),
            Some(other) => {
                let status = if other == "false" {
                    CONDITION_STATUS_FALSE
                } else {
                    CONDITION_STATUS_UNKNOWN
                };
                set_condition(
                    conditions,
                    CONDITION_TYPE_RUNNING,
                    status,
                    &format!("{} and {}", target_msg, source_msg),
                    &format!("{} and {}", target_reason, source_reason),
                    now,
                );
            }
        },
        _ => set_condition(
            conditions,
            CONDITION_TYPE_RUNNING,
            CONDITION_STATUS_UNKNOWN,
            target_msg,
            target_reason,
            now,
        ),
    }
}

/// Recompute all three conditions.
///
/// Order matters: Bound may force Ready=False, then Ready follows the phase
/// with the given message and reason, then Running may override Ready again
/// while a transfer is in flight.
pub fn update_conditions(
    conditions: &mut Vec<DataVolumeCondition>,
    phase: DataVolumePhase,
    pvc: Option<&PersistentVolumeClaim>,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    let empty = BTreeMap::new();
    let anno = pvc.map(|p| p.annotations()).unwrap_or(&empty);

    update_bound_condition(conditions, pvc, reason, now);
    set_ready_condition(conditions, ready_status_for_phase(phase), message, reason, now);
    update_running_condition(conditions, anno, now);
}

/// Event to emit for a condition change
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConditionEvent {
    pub warning: bool,
    pub reason: String,
    pub message: String,
}

/// Events implied by the difference between two condition lists.
///
/// A Bound change always produces a Normal event. A Warning carrying the
/// Running message is produced when the volume is not ready, not running,
/// and either bound or still being populated.
pub fn condition_events(
    current: &[DataVolumeCondition],
    original: &[DataVolumeCondition],
    population_in_progress: bool,
) -> Vec<ConditionEvent> {
    let mut events = Vec::new();

    if let Some(bound) = find_condition(current, CONDITION_TYPE_BOUND) {
        let changed = match find_condition(original, CONDITION_TYPE_BOUND) {
            None => true,
            Some(orig) => {
                orig.status != bound.status
                    || orig.reason != bound.reason
                    || orig.message != bound.message
            }
        };
        if changed {
            events.push(ConditionEvent {
                warning: false,
                reason: bound.reason.clone(),
                message: bound.message.clone(),
            });
        }
    }

    let (Some(ready), Some(bound), Some(running)) = (
        find_condition(current, CONDITION_TYPE_READY),
        find_condition(current, CONDITION_TYPE_BOUND),
        find_condition(current, CONDITION_TYPE_RUNNING),
    ) else {
        return events;
    };

    let bound_or_populating = bound.status == CONDITION_STATUS_TRUE || population_in_progress;
    if ready.status == CONDITION_STATUS_FALSE
        && running.status == CONDITION_STATUS_FALSE
        && bound_or_populating
    {
        let original_message = find_condition(original, CONDITION_TYPE_RUNNING)
            .map(|c| c.message.as_str())
            .unwrap_or("");
        if !running.message.is_empty()
            && running.message != original_message
            && running.reason != REASON_SCRATCH_SPACE_REQUIRED
        {
            events.push(ConditionEvent {
                warning: true,
                reason: running.reason.clone(),
                message: running.message.clone(),
            });
        }
    }

    events
}
