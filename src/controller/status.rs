//! Status stage
//!
//! Re-reads the DataVolume and its claim and derives phase, progress and
//! conditions from what the worker pods reported. Metadata is read-only
//! here; the status subresource is written only when it changed.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::crd::{
    DataVolume, DataVolumeCondition, DataVolumePhase, DataVolumeSource, DataVolumeStatus,
};
use crate::error::{Error, Result};

use super::annotations::{
    annotation, has_annotation, ANN_CHECK_STATIC_VOLUME, ANN_IMMEDIATE_BINDING,
    ANN_PERSISTENT_VOLUME_LIST, ANN_POD_PHASE, ANN_POD_RESTARTS, ANN_POPULATOR_PROGRESS,
    ANN_SELECTED_NODE,
};
use super::conditions::{condition_events, update_conditions};
use super::config::ClusterSettings;
use super::events::{data_volume_ref, EventType, REASON_ERR_CLAIM_LOST};
use super::operation::{resolve_data_source, source_ref_key};
use super::ownership::{dv_is_pre_populated, pvc_is_populated_for, pvc_populator_kind};
use super::progress::{fetch_progress, find_worker_pod, metrics_url, pod_is_running};
use super::reconciler::{DataVolumeController, ReconcilerBase};
use super::render::storage_class_by_name;
use super::store::ObjectKey;
use super::sync::{PhaseSync, ReconcileResult, StatusEvent};

/// Progress reported when nothing can be measured
pub const PROGRESS_NOT_AVAILABLE: &str = "N/A";

/// Requeue interval while a transfer is being tracked
pub const PROGRESS_REQUEUE_INTERVAL: Duration = Duration::from_secs(2);

const VOLUME_BINDING_WAIT_FOR_FIRST_CONSUMER: &str = "WaitForFirstConsumer";

fn pvc_phase(pvc: &PersistentVolumeClaim) -> &str {
    pvc.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
}

/// The DataVolume has nothing to observe yet
pub fn should_set_pending(pvc: Option<&PersistentVolumeClaim>, dv: &DataVolume) -> bool {
    match pvc {
        Some(pvc) => {
            has_annotation(dv, ANN_CHECK_STATIC_VOLUME)
                && has_annotation(pvc, ANN_PERSISTENT_VOLUME_LIST)
        }
        None => dv_is_pre_populated(dv) || dv.phase() == DataVolumePhase::Unset,
    }
}

/// Phases in which a populator may still be filling the claim
fn population_in_progress(phase: DataVolumePhase) -> bool {
    matches!(
        phase,
        DataVolumePhase::ImportScheduled
            | DataVolumePhase::ImportInProgress
            | DataVolumePhase::CloneScheduled
            | DataVolumePhase::CloneInProgress
            | DataVolumePhase::UploadScheduled
            | DataVolumePhase::UploadReady
            | DataVolumePhase::PendingPopulation
            | DataVolumePhase::Paused
    )
}

/// Run the status stage for one key
pub async fn update_status(
    ctrl: &dyn DataVolumeController,
    key: &ObjectKey,
    phase_sync: Option<PhaseSync>,
) -> Result<ReconcileResult> {
    let base = ctrl.base();
    let mut result = ReconcileResult::done();

    let Some(dv) = base.store.get_data_volume(key).await? else {
        return Ok(result);
    };
    let pvc = base.store.get_pvc(key).await?;
    let mut dv_copy = dv.clone();
    let original_conditions = dv
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    let use_populator = pvc.as_ref().and_then(pvc_populator_kind).is_some();

    if let Some(phase_sync) = phase_sync {
        base.apply_phase_sync(phase_sync, &dv, dv_copy, pvc.as_ref(), use_populator)
            .await?;
        return Ok(result);
    }

    let cur_phase = dv.phase();
    let mut event = StatusEvent::default();
    let status = dv_copy.status.get_or_insert_with(DataVolumeStatus::default);

    if should_set_pending(pvc.as_ref(), &dv) {
        status.phase = DataVolumePhase::Pending;
    } else if let Some(pvc) = &pvc {
        status.claim_name = Some(pvc.name_any());

        if annotation(pvc, ANN_POD_PHASE) == Some("Succeeded") {
            ctrl.update_status_phase(pvc, &mut dv_copy, &mut event).await?;
        } else {
            match pvc_phase(pvc) {
                "Pending" => {
                    if base.should_be_marked_wffc(pvc, &dv_copy).await? {
                        set_phase(&mut dv_copy, DataVolumePhase::WaitForFirstConsumer);
                    } else if use_populator {
                        let consumer_scheduled = has_annotation(pvc, ANN_SELECTED_NODE)
                            || has_annotation(pvc, ANN_IMMEDIATE_BINDING);
                        if consumer_scheduled {
                            ctrl.update_status_phase(pvc, &mut dv_copy, &mut event).await?;
                        } else {
                            set_phase(&mut dv_copy, DataVolumePhase::PendingPopulation);
                        }
                    } else if pvc_is_populated_for(pvc, &dv_copy) {
                        set_phase(&mut dv_copy, DataVolumePhase::Succeeded);
                    } else {
                        set_phase(&mut dv_copy, DataVolumePhase::Pending);
                    }
                }
                "Bound" => {
                    if matches!(
                        dv_copy.phase(),
                        DataVolumePhase::Pending
                            | DataVolumePhase::WaitForFirstConsumer
                            | DataVolumePhase::Unknown
                    ) {
                        set_phase(&mut dv_copy, DataVolumePhase::PVCBound);
                    }
                    if pvc_is_populated_for(pvc, &dv_copy) {
                        set_phase(&mut dv_copy, DataVolumePhase::Succeeded);
                    } else {
                        ctrl.update_status_phase(pvc, &mut dv_copy, &mut event).await?;
                    }
                }
                "Lost" => {
                    set_phase(&mut dv_copy, DataVolumePhase::Failed);
                    event = StatusEvent::warning(
                        REASON_ERR_CLAIM_LOST,
                        format!("PVC {} lost", pvc.name_any()),
                    );
                }
                "" => {}
                _ => set_phase(&mut dv_copy, DataVolumePhase::Unknown),
            }
        }

        if let Some(restarts) = annotation(pvc, ANN_POD_RESTARTS)
            .and_then(|r| r.parse::<i32>().ok())
            .filter(|r| *r >= 0)
        {
            status_mut(&mut dv_copy).restart_count = restarts;
        }

        if use_populator {
            status_mut(&mut dv_copy).progress = Some(
                annotation(pvc, ANN_POPULATOR_PROGRESS)
                    .unwrap_or(PROGRESS_NOT_AVAILABLE)
                    .to_string(),
            );
        } else if let Some(requeue) = base.reconcile_progress(&mut dv_copy, pvc).await {
            result = requeue;
        }
    }

    let in_progress = use_populator && population_in_progress(dv_copy.phase());
    let phase = dv_copy.phase();
    let status = status_mut(&mut dv_copy);
    update_conditions(&mut status.conditions, phase, pvc.as_ref(), "", "", Utc::now());

    base.write_status(&dv, dv_copy, cur_phase, &original_conditions, event, in_progress)
        .await?;
    Ok(result)
}

pub(crate) fn status_mut(dv: &mut DataVolume) -> &mut DataVolumeStatus {
    dv.status.get_or_insert_with(DataVolumeStatus::default)
}

pub(crate) fn set_phase(dv: &mut DataVolume, phase: DataVolumePhase) {
    status_mut(dv).phase = phase;
}

impl ReconcilerBase {
    async fn apply_phase_sync(
        &self,
        phase_sync: PhaseSync,
        dv: &DataVolume,
        mut dv_copy: DataVolume,
        pvc: Option<&PersistentVolumeClaim>,
        use_populator: bool,
    ) -> Result<()> {
        let cond_pvc = match &phase_sync.pvc_key {
            None => None,
            Some(key) if pvc.map(ObjectKey::from_resource).as_ref() == Some(key) => pvc.cloned(),
            Some(key) => self.store.get_pvc(key).await?,
        };

        let cur_phase = dv.phase();
        let original_conditions = dv
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();
        set_phase(&mut dv_copy, phase_sync.phase);

        let (reason, message) = match cond_pvc {
            None => (
                phase_sync.event.reason.as_str(),
                phase_sync.event.message.as_str(),
            ),
            Some(_) => ("", ""),
        };
        let status = status_mut(&mut dv_copy);
        update_conditions(
            &mut status.conditions,
            phase_sync.phase,
            cond_pvc.as_ref(),
            reason,
            message,
            Utc::now(),
        );

        let in_progress = use_populator && population_in_progress(phase_sync.phase);
        self.write_status(
            dv,
            dv_copy,
            cur_phase,
            &original_conditions,
            phase_sync.event.clone(),
            in_progress,
        )
        .await
    }

    /// Persist status when it changed and emit the implied events
    async fn write_status(
        &self,
        dv: &DataVolume,
        dv_copy: DataVolume,
        cur_phase: DataVolumePhase,
        original_conditions: &[DataVolumeCondition],
        event: StatusEvent,
        population_in_progress: bool,
    ) -> Result<()> {
        if dv.metadata != dv_copy.metadata {
            return Err(Error::InvariantViolation(
                "meta update is not allowed in updateStatus phase".to_string(),
            ));
        }
        if dv.status == dv_copy.status {
            return Ok(());
        }

        let updated = self
            .store
            .update_data_volume_status(&dv_copy)
            .await
            .map_err(|e| {
                warn!(
                    "Unable to update datavolume status for {}: {}",
                    dv_copy.name_any(),
                    e
                );
                e
            })?;

        let object = data_volume_ref(&updated);
        if let Some(event_type) = event.event_type {
            if cur_phase != updated.phase() {
                self.recorder
                    .record(&object, event_type, &event.reason, &event.message);
            }
        }

        let conditions = updated
            .status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default();
        for e in condition_events(conditions, original_conditions, population_in_progress) {
            let event_type = if e.warning {
                EventType::Warning
            } else {
                EventType::Normal
            };
            self.recorder.record(&object, event_type, &e.reason, &e.message);
        }
        Ok(())
    }

    /// Whether a pending claim waits for its consumer to be scheduled
    pub(crate) async fn should_be_marked_wffc(
        &self,
        pvc: &PersistentVolumeClaim,
        dv: &DataVolume,
    ) -> Result<bool> {
        if pvc_phase(pvc) != "Pending" {
            return Ok(false);
        }
        let settings = ClusterSettings::resolve(&self.config, self.store.get_cdi_config().await?);
        if !settings.honor_wffc {
            return Ok(false);
        }
        let class_name = pvc
            .spec
            .as_ref()
            .and_then(|s| s.storage_class_name.as_deref())
            .or_else(|| dv.storage_class_name());
        let binding_mode = storage_class_by_name(self.store.as_ref(), class_name)
            .await?
            .and_then(|sc| sc.volume_binding_mode);
        Ok(binding_mode.as_deref() == Some(VOLUME_BINDING_WAIT_FOR_FIRST_CONSUMER))
    }

    /// Namespace of the worker pod reporting progress for a DataVolume
    fn worker_namespace(&self, dv: &DataVolume) -> String {
        if let Some(DataVolumeSource::Pvc(source)) = &dv.spec.source {
            return source.namespace.clone();
        }
        if let Some(ds_key) = source_ref_key(dv) {
            if let Some(pvc) = resolve_data_source(ds_key, |k| self.store.data_source(k))
                .and_then(|ds| ds.spec.source.pvc)
            {
                return pvc.namespace;
            }
        }
        dv.namespace().unwrap_or_default()
    }

    /// Refresh progress from the worker pod. Returns a requeue while tracking.
    async fn reconcile_progress(
        &self,
        dv: &mut DataVolume,
        pvc: &PersistentVolumeClaim,
    ) -> Option<ReconcileResult> {
        let status = status_mut(dv);
        if status.progress.as_deref().unwrap_or_default().is_empty() {
            status.progress = Some(PROGRESS_NOT_AVAILABLE.to_string());
        }
        if dv.phase().is_terminal() {
            debug!(
                "DataVolume {} finished, no longer updating progress",
                ObjectKey::from_resource(dv)
            );
            return None;
        }

        let namespace = self.worker_namespace(dv);
        let pods = match self.store.list_worker_pods(&namespace).await {
            Ok(pods) => pods,
            Err(e) => {
                debug!("Unable to list worker pods in {}: {}", namespace, e);
                return Some(ReconcileResult::requeue_after(PROGRESS_REQUEUE_INTERVAL));
            }
        };

        if let Some(pod) = find_worker_pod(&pods, pvc) {
            // A worker that is not running has nothing to scrape
            if !pod_is_running(pod) {
                return None;
            }
            if let Some(url) = metrics_url(pod) {
                let uid = dv.metadata.uid.clone().unwrap_or_default();
                match fetch_progress(&url, &uid).await {
                    Ok(Some(progress)) => status_mut(dv).progress = Some(progress),
                    Ok(None) => {}
                    Err(e) => debug!("Unable to scrape progress from {}: {}", url, e),
                }
            }
        }
        Some(ReconcileResult::requeue_after(PROGRESS_REQUEUE_INTERVAL))
    }
}
