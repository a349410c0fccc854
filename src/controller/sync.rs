//! Sync stage
//!
//! Works on a deep copy of the DataVolume (`dv_mutated`). Only metadata and
//! spec may change here; the status stage owns `.status`. Targeted status
//! outcomes are handed to the status stage through [`PhaseSync`].

use std::time::Duration;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::crd::{DataVolume, DataVolumePhase, DataVolumeSource};
use crate::error::{Error, Result};

use super::annotations::{
    annotation, annotation_is_true, has_annotation, set_annotation, ANN_CHECK_STATIC_VOLUME,
    ANN_POD_RETAIN_AFTER_COMPLETION, ANN_PRE_POPULATED, ANN_USE_POPULATOR,
    DEFAULT_INSTANCETYPE_LABELS, DELAYED_ANNOTATIONS,
};
use super::config::ClusterSettings;
use super::events::{EventType, REASON_ERR_CLAIM_NOT_VALID};
use super::operation::{resolve_data_source, source_ref_key};
use super::ownership::{pvc_is_populated_for, pvc_populator_kind};
use super::reconciler::{DataVolumeController, ReconcilerBase};
use super::render::{render_pvc_spec, storage_class_by_name};
use super::store::ObjectKey;

/// Outcome of a reconcile that does not come from an error
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// Stop and wait for the next watch event
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue_after(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }

    pub fn into_action(self) -> Action {
        match self.requeue_after {
            Some(after) => Action::requeue(after),
            None => Action::await_change(),
        }
    }
}

/// Event attached to a phase change. An empty type means no event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusEvent {
    pub event_type: Option<EventType>,
    pub reason: String,
    pub message: String,
}

impl StatusEvent {
    pub fn normal(reason: &str, message: impl Into<String>) -> Self {
        Self {
            event_type: Some(EventType::Normal),
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn warning(reason: &str, message: impl Into<String>) -> Self {
        Self {
            event_type: Some(EventType::Warning),
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

/// Status outcome decided during sync, applied verbatim by the status stage
#[derive(Clone, Debug, PartialEq)]
pub struct PhaseSync {
    pub phase: DataVolumePhase,
    pub event: StatusEvent,
    /// Claim used for the Bound condition
    pub pvc_key: Option<ObjectKey>,
}

/// What the sync stage hands to the status stage
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncResult {
    pub result: Option<ReconcileResult>,
    pub phase_sync: Option<PhaseSync>,
}

impl SyncResult {
    fn done() -> Self {
        Self {
            result: Some(ReconcileResult::done()),
            phase_sync: None,
        }
    }
}

/// Per-reconcile working set
#[derive(Clone, Debug)]
pub struct SyncState {
    /// DataVolume as last read or written
    pub dv: DataVolume,
    /// Copy that sync steps mutate; persisted when its metadata differs
    pub dv_mutated: DataVolume,
    pub pvc: Option<PersistentVolumeClaim>,
    pub pvc_spec: Option<PersistentVolumeClaimSpec>,
    pub use_populator: bool,
    pub settings: ClusterSettings,
    pub result: Option<ReconcileResult>,
    pub phase_sync: Option<PhaseSync>,
    pub dv_deleted: bool,
}

impl SyncState {
    pub fn new(dv: DataVolume, settings: ClusterSettings) -> Self {
        Self {
            dv_mutated: dv.clone(),
            dv,
            pvc: None,
            pvc_spec: None,
            use_populator: false,
            settings,
            result: None,
            phase_sync: None,
            dv_deleted: false,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::from_resource(&self.dv)
    }

    /// Register the status outcome of this reconcile. Only one may be set.
    pub fn set_phase_sync(
        &mut self,
        phase: DataVolumePhase,
        pvc: Option<&PersistentVolumeClaim>,
        event: StatusEvent,
    ) -> Result<()> {
        if self.phase_sync.is_some() {
            return Err(Error::InvariantViolation(
                "phaseSync is already set".to_string(),
            ));
        }
        self.phase_sync = Some(PhaseSync {
            phase,
            event,
            pvc_key: pvc.map(ObjectKey::from_resource),
        });
        Ok(())
    }

    fn into_result(self) -> SyncResult {
        SyncResult {
            result: self.result,
            phase_sync: self.phase_sync,
        }
    }
}

// ============================================================================
// Sync entry point
// ============================================================================

/// Run the sync stage for one key.
///
/// The sync result is returned even on error so the status stage can still
/// report a targeted phase.
pub async fn sync(ctrl: &dyn DataVolumeController, key: &ObjectKey) -> (SyncResult, Result<()>) {
    let base = ctrl.base();

    let dv = match base.store.get_data_volume(key).await {
        Ok(Some(dv)) => dv,
        Ok(None) => return (SyncResult::done(), Ok(())),
        Err(e) => return (SyncResult::done(), Err(e)),
    };
    let settings = match base.store.get_cdi_config().await {
        Ok(cdi_config) => ClusterSettings::resolve(&base.config, cdi_config),
        Err(e) => return (SyncResult::done(), Err(e)),
    };

    let mut state = SyncState::new(dv, settings);
    let res = sync_common(ctrl, &mut state).await;
    if res.is_err() || state.result.is_some() || state.dv_deleted {
        return (state.into_result(), res);
    }

    let mut res = ctrl.sync_body(&mut state).await;
    if res.is_ok() {
        res = base.sync_update(&mut state).await;
    }
    (state.into_result(), res)
}

async fn sync_common(ctrl: &dyn DataVolumeController, state: &mut SyncState) -> Result<()> {
    sync_dv_pvc_state(ctrl, state).await?;
    ctrl.base().sync_update(state).await
}

async fn sync_dv_pvc_state(ctrl: &dyn DataVolumeController, state: &mut SyncState) -> Result<()> {
    let base = ctrl.base();
    let key = state.key();
    state.pvc = base.store.get_pvc(&key).await?;

    base.garbage_collect(state).await?;
    if state.result.is_some() || state.dv_deleted {
        return Ok(());
    }
    ctrl.cleanup(state).await?;

    if state.dv.metadata.deletion_timestamp.is_some() {
        info!("DataVolume {} marked for deletion, cleaning up", key);
        state.result = Some(ReconcileResult::done());
        return Ok(());
    }

    ctrl.prepare(state).await?;

    match render_pvc_spec(base.store.as_ref(), &state.dv_mutated, &state.settings).await {
        Ok(spec) => state.pvc_spec = Some(spec),
        Err(e) => {
            state.set_phase_sync(
                DataVolumePhase::Unset,
                None,
                StatusEvent::warning(REASON_ERR_CLAIM_NOT_VALID, e.to_string()),
            )?;
            if e.waits_for_storage_class() {
                debug!("DataVolume {} waits for a storage class: {}", key, e);
                state.result = Some(ReconcileResult::done());
                return Ok(());
            }
            return Err(e);
        }
    }

    if let Some(use_populator) = ctrl.use_populator(state).await? {
        state.use_populator = use_populator;
        set_annotation(
            &mut state.dv_mutated,
            ANN_USE_POPULATOR,
            use_populator.to_string(),
        );
    }

    base.handle_static_volume(state).await?;
    if state.result.is_some() {
        return Ok(());
    }

    base.handle_delayed_annotations(state).await?;
    if state.result.is_some() {
        return Ok(());
    }

    base.update_instancetype_labels(state).await?;

    if let Some(pvc) = state.pvc.clone() {
        base.validate_pvc(state, &pvc).await?;
    }
    // Adoption may have just marked the claim populated
    if let Some(pvc) = &state.pvc {
        handle_pre_population(&mut state.dv_mutated, pvc);
    }
    Ok(())
}

/// Mark the DataVolume pre-populated when its bound claim was filled for it
fn handle_pre_population(dv: &mut DataVolume, pvc: &PersistentVolumeClaim) {
    let bound = pvc.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound");
    if bound && pvc_is_populated_for(pvc, dv) {
        set_annotation(dv, ANN_PRE_POPULATED, pvc.name_any());
    }
}

impl ReconcilerBase {
    /// Persist metadata and spec changes made to `dv_mutated`
    pub(crate) async fn sync_update(&self, state: &mut SyncState) -> Result<()> {
        if state.dv_deleted {
            return Ok(());
        }
        if state.dv.status != state.dv_mutated.status {
            return Err(Error::InvariantViolation(
                "status update is not allowed in sync phase".to_string(),
            ));
        }
        if state.dv.metadata == state.dv_mutated.metadata {
            return Ok(());
        }

        let updated = self.update_data_volume(&state.dv_mutated).await.map_err(|e| {
            warn!(
                "Unable to sync update dv meta for {}: {}",
                state.dv_mutated.name_any(),
                e
            );
            e
        })?;
        state.dv = updated.clone();
        state.dv_mutated = updated;
        Ok(())
    }

    /// Write a DataVolume with a populated-in-memory source stripped
    pub(crate) async fn update_data_volume(&self, dv: &DataVolume) -> Result<DataVolume> {
        let strip = dv.spec.source_ref.is_some() || dv.uses_external_populator();
        if !strip {
            return self.store.update_data_volume(dv).await;
        }

        let mut persisted = dv.clone();
        let source = persisted.spec.source.take();
        let mut updated = self.store.update_data_volume(&persisted).await?;
        updated.spec.source = source;
        Ok(updated)
    }

    /// Default populator decision for import and upload
    pub(crate) async fn should_use_cdi_populator(&self, state: &SyncState) -> Result<bool> {
        let dv = &state.dv_mutated;
        if let Some(value) = annotation(dv, ANN_USE_POPULATOR) {
            return value.parse::<bool>().map_err(|_| {
                Error::InvalidSpec(format!("invalid {} value {:?}", ANN_USE_POPULATOR, value))
            });
        }
        if annotation_is_true(dv, ANN_POD_RETAIN_AFTER_COMPLETION) {
            return Ok(false);
        }
        if matches!(
            dv.spec.source,
            Some(DataVolumeSource::Imageio(_) | DataVolumeSource::Vddk(_))
        ) {
            return Ok(false);
        }
        if has_annotation(dv, ANN_CHECK_STATIC_VOLUME) || !dv.spec.checkpoints.is_empty() {
            return Ok(false);
        }

        if let Some(pvc) = &state.pvc {
            return Ok(pvc_populator_kind(pvc).is_some());
        }
        self.storage_class_csi_driver_exists(state).await
    }

    /// Whether the provisioner of the target storage class is a CSI driver
    pub(crate) async fn storage_class_csi_driver_exists(&self, state: &SyncState) -> Result<bool> {
        let class_name = state
            .pvc_spec
            .as_ref()
            .and_then(|s| s.storage_class_name.as_deref());
        self.csi_driver_exists_for_class(class_name).await
    }

    /// Same check for a named class, the default class when unnamed
    pub(crate) async fn csi_driver_exists_for_class(&self, class_name: Option<&str>) -> Result<bool> {
        let Some(class) = storage_class_by_name(self.store.as_ref(), class_name).await? else {
            return Ok(false);
        };
        let exists = self.store.csi_driver_exists(&class.provisioner).await?;
        if !exists {
            debug!(
                "No CSI driver {} for storage class {}",
                class.provisioner,
                class.name_any()
            );
        }
        Ok(exists)
    }

    /// Copy annotations that may only reach the claim once the volume succeeded
    pub(crate) async fn handle_delayed_annotations(&self, state: &mut SyncState) -> Result<()> {
        if state.dv.phase() != DataVolumePhase::Succeeded {
            return Ok(());
        }
        let Some(pvc) = &state.pvc else {
            return Ok(());
        };

        let mut updated = pvc.clone();
        for key in DELAYED_ANNOTATIONS {
            if let Some(value) = annotation(&state.dv, key) {
                if !has_annotation(&updated, key) {
                    set_annotation(&mut updated, key, value);
                }
            }
        }
        if &updated == pvc {
            return Ok(());
        }

        state.pvc = Some(self.store.update_pvc(&updated).await?);
        state.result = Some(ReconcileResult::done());
        Ok(())
    }

    /// Copy default instancetype labels from the clone source when absent
    pub(crate) async fn update_instancetype_labels(&self, state: &mut SyncState) -> Result<()> {
        let source_labels = if let Some(ds_key) = source_ref_key(&state.dv_mutated) {
            resolve_data_source(ds_key, |k| self.store.data_source(k)).map(|ds| ds.labels().clone())
        } else if let Some(DataVolumeSource::Pvc(source)) = &state.dv_mutated.spec.source {
            self.store
                .get_pvc(&ObjectKey::new(&source.namespace, &source.name))
                .await?
                .map(|pvc| pvc.labels().clone())
        } else {
            None
        };
        let Some(source_labels) = source_labels else {
            return Ok(());
        };

        let labels = state.dv_mutated.labels_mut();
        for key in DEFAULT_INSTANCETYPE_LABELS {
            if labels.contains_key(key) {
                continue;
            }
            if let Some(value) = source_labels.get(key) {
                labels.insert(key.to_string(), value.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::annotations::ANN_POPULATED_FOR;
    use k8s_openapi::api::core::v1::PersistentVolumeClaimStatus;
    use kube::api::ObjectMeta;

    #[test]
    fn test_phase_sync_set_once() {
        let mut state = SyncState::new(DataVolume::new("dv", Default::default()), Default::default());
        state
            .set_phase_sync(DataVolumePhase::Pending, None, StatusEvent::default())
            .unwrap();
        let err = state
            .set_phase_sync(DataVolumePhase::Failed, None, StatusEvent::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
        assert_eq!(
            state.phase_sync.as_ref().map(|p| p.phase),
            Some(DataVolumePhase::Pending)
        );
    }

    #[test]
    fn test_pre_population_requires_bound_claim() {
        let mut dv = DataVolume::new("dv", Default::default());
        let mut pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("dv".to_string()),
                annotations: Some([(ANN_POPULATED_FOR.to_string(), "dv".to_string())].into()),
                ..Default::default()
            },
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Pending".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        handle_pre_population(&mut dv, &pvc);
        assert!(!has_annotation(&dv, ANN_PRE_POPULATED));

        pvc.status.as_mut().unwrap().phase = Some("Bound".to_string());
        handle_pre_population(&mut dv, &pvc);
        assert_eq!(annotation(&dv, ANN_PRE_POPULATED), Some("dv"));
    }

    #[test]
    fn test_reconcile_result_action() {
        assert_eq!(ReconcileResult::done().into_action(), Action::await_change());
        assert_eq!(
            ReconcileResult::requeue_after(Duration::from_secs(2)).into_action(),
            Action::requeue(Duration::from_secs(2))
        );
    }
}
