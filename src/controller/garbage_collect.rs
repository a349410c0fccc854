//! Garbage collection of succeeded DataVolumes
//!
//! After the TTL the DataVolume is deleted and its claim inherits the
//! DataVolume's owners, so whatever owned the DataVolume now reaps the claim.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::crd::{DataVolume, DataVolumePhase};
use crate::error::Result;

use super::annotations::{
    annotation_is_true, remove_annotation, set_annotation, ANN_DELETE_AFTER_COMPLETION,
    ANN_GARBAGE_COLLECTED, ANN_POPULATED_FOR,
};
use super::conditions::{find_condition, CONDITION_TYPE_READY};
use super::ownership::merge_owner_references;
use super::reconciler::ReconcilerBase;
use super::store::ObjectKey;
use super::sync::{ReconcileResult, SyncState};

/// Time left before a succeeded DataVolume may be collected.
///
/// Measured from the Ready condition's last transition; `None` once expired.
pub fn ttl_remaining(dv: &DataVolume, ttl_seconds: i32, now: DateTime<Utc>) -> Option<Duration> {
    let mut remaining = chrono::Duration::seconds(i64::from(ttl_seconds));
    let ready = dv
        .status
        .as_ref()
        .and_then(|s| find_condition(&s.conditions, CONDITION_TYPE_READY))
        .and_then(|c| c.last_transition_time.as_ref());
    if let Some(since) = ready {
        remaining = remaining - (now - since.0);
    }
    remaining.to_std().ok().filter(|d| !d.is_zero())
}

impl ReconcilerBase {
    /// Collect the DataVolume when it succeeded, opted in and outlived its TTL
    pub(crate) async fn garbage_collect(&self, state: &mut SyncState) -> Result<()> {
        if state.dv.phase() != DataVolumePhase::Succeeded {
            return Ok(());
        }
        let Some(pvc) = state.pvc.clone() else {
            return Ok(());
        };
        let key = state.key();
        if state.settings.gc_disabled() {
            debug!("Garbage collection is disabled");
            return Ok(());
        }
        if !self.is_garbage_collection_allowed(&state.dv).await? {
            return Ok(());
        }

        if let Some(remaining) = ttl_remaining(&state.dv, state.settings.ttl_seconds, Utc::now()) {
            state.result = Some(ReconcileResult::requeue_after(remaining));
            return Ok(());
        }

        let dv_uid = state.dv.metadata.uid.clone().unwrap_or_default();
        let mut detached = pvc;
        detached.metadata.owner_references = Some(merge_owner_references(
            detached.owner_references(),
            state.dv.owner_references(),
            &dv_uid,
        ));
        remove_annotation(&mut detached, ANN_POPULATED_FOR);
        set_annotation(&mut detached, ANN_GARBAGE_COLLECTED, "true");
        state.pvc = Some(self.store.update_pvc(&detached).await?);

        self.store.delete_data_volume(&key).await?;
        info!("Garbage collected DataVolume {}", key);
        state.dv_deleted = true;
        state.result = Some(ReconcileResult::done());
        Ok(())
    }

    async fn is_garbage_collection_allowed(&self, dv: &DataVolume) -> Result<bool> {
        if !annotation_is_true(dv, ANN_DELETE_AFTER_COMPLETION) {
            debug!("DataVolume is not annotated to be garbage collected");
            return Ok(false);
        }
        let namespace = dv.namespace().unwrap_or_default();
        for owner in dv.owner_references() {
            if owner.block_owner_deletion != Some(true) {
                continue;
            }
            if !self.store.can_update_finalizers(&namespace, owner).await? {
                info!(
                    "DataVolume {} cannot be garbage collected, owner {} finalizers are not updatable",
                    ObjectKey::from_resource(dv),
                    owner.name
                );
                return Ok(false);
            }
        }
        Ok(true)
    }
}
