//! Clone DataVolumes, from a PVC or from a VolumeSnapshot
//!
//! The source may be given directly or through a `sourceRef` DataSource; the
//! resolved source lives on the in-memory copy only. Same-namespace clones
//! onto a CSI storage class go through a `VolumeCloneSource` populator;
//! other PVC clones fall back to a clone request on the target claim.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, TypedLocalObjectReference};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::crd::{
    DataVolume, DataVolumePhase, DataVolumeSource, VolumeCloneSource, VolumeCloneSourceSpec,
};
use crate::error::{Error, Result};

use super::annotations::{
    annotation, has_annotation, set_annotation, ANN_CHECK_STATIC_VOLUME, ANN_CLONE_REQUEST,
    ANN_PERSISTENT_VOLUME_LIST, ANN_POD_PHASE, ANN_USE_POPULATOR,
};
use super::operation::{resolve_data_source, source_ref_key, DataVolumeOp};
use super::ownership::{dv_is_pre_populated, pvc_is_populated_for, pvc_populator_kind};
use super::populator_source::{set_populator_data_source_ref, source_metadata};
use super::reconciler::{DataVolumeController, ReconcilerBase};
use super::render::{requested_storage, set_requested_storage};
use super::status::{set_phase, status_mut};
use super::store::{ObjectKey, PopulatorKind, PopulatorSource};
use super::sync::{StatusEvent, SyncState};

pub const CLONE_SCHEDULED: &str = "CloneScheduled";
pub const CLONE_IN_PROGRESS: &str = "CloneInProgress";
pub const CLONE_FAILED: &str = "CloneFailed";
pub const CLONE_SUCCEEDED: &str = "CloneSucceeded";
pub const CLONE_WITHOUT_SOURCE: &str = "CloneWithoutSource";
pub const ERR_UNABLE_TO_CLONE: &str = "ErrUnableToClone";

const DATA_SOURCE_KIND: &str = "DataSource";
const SNAPSHOT_API_GROUP: &str = "snapshot.storage.k8s.io";

/// Kind of object a clone reads from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloneSourceKind {
    Pvc,
    Snapshot,
}

impl CloneSourceKind {
    fn noun(&self) -> &'static str {
        match self {
            CloneSourceKind::Pvc => "pvc",
            CloneSourceKind::Snapshot => "snapshot",
        }
    }
}

/// Clone source of a DataVolume; an empty namespace means the DataVolume's
pub fn clone_source(dv: &DataVolume) -> Option<(CloneSourceKind, ObjectKey)> {
    let (kind, namespace, name) = match dv.spec.source.as_ref()? {
        DataVolumeSource::Pvc(pvc) => (CloneSourceKind::Pvc, &pvc.namespace, &pvc.name),
        DataVolumeSource::Snapshot(s) => (CloneSourceKind::Snapshot, &s.namespace, &s.name),
        _ => return None,
    };
    let namespace = if namespace.is_empty() {
        dv.namespace().unwrap_or_default()
    } else {
        namespace.clone()
    };
    Some((kind, ObjectKey::new(namespace, name)))
}

fn is_cross_namespace(dv: &DataVolume, source: &ObjectKey) -> bool {
    dv.namespace().as_deref() != Some(source.namespace.as_str())
}

/// `VolumeCloneSource` reading from the DataVolume's own namespace
pub fn volume_clone_source(dv: &DataVolume, kind: CloneSourceKind, name: &str) -> VolumeCloneSource {
    let source = match kind {
        CloneSourceKind::Pvc => TypedLocalObjectReference {
            api_group: None,
            kind: "PersistentVolumeClaim".to_string(),
            name: name.to_string(),
        },
        CloneSourceKind::Snapshot => TypedLocalObjectReference {
            api_group: Some(SNAPSHOT_API_GROUP.to_string()),
            kind: "VolumeSnapshot".to_string(),
            name: name.to_string(),
        },
    };
    VolumeCloneSource {
        metadata: source_metadata(PopulatorKind::Clone, dv),
        spec: VolumeCloneSourceSpec {
            source,
            preallocation: dv.spec.preallocation,
            priority_class_name: dv.spec.priority_class_name.clone(),
        },
    }
}

fn static_provision_pending(pvc: Option<&PersistentVolumeClaim>, dv: &DataVolume) -> bool {
    pvc.is_some_and(|pvc| {
        has_annotation(dv, ANN_CHECK_STATIC_VOLUME) && has_annotation(pvc, ANN_PERSISTENT_VOLUME_LIST)
    })
}

/// Reconciler for PVC and snapshot clones
pub struct CloneController {
    base: ReconcilerBase,
    op: DataVolumeOp,
}

impl CloneController {
    /// `op` must be [`DataVolumeOp::PvcClone`] or [`DataVolumeOp::SnapshotClone`]
    pub fn new(base: ReconcilerBase, op: DataVolumeOp) -> Self {
        Self { base, op }
    }

    /// Fill `spec.source` from the DataSource chain behind `sourceRef`
    fn populate_source_if_source_ref(&self, dv: &mut DataVolume) -> Result<()> {
        let Some(source_ref) = &dv.spec.source_ref else {
            return Ok(());
        };
        if source_ref.kind != DATA_SOURCE_KIND {
            return Err(Error::InvalidSpec(format!(
                "Unsupported sourceRef kind {}, currently only {} is supported",
                source_ref.kind, DATA_SOURCE_KIND
            )));
        }
        let Some(key) = source_ref_key(dv) else {
            return Ok(());
        };
        let data_source = resolve_data_source(key.clone(), |k| self.base.store.data_source(k))
            .ok_or_else(|| Error::InvalidSpec(format!("DataSource {} cannot be resolved", key)))?;

        let source = &data_source.spec.source;
        dv.spec.source = match (&source.pvc, &source.snapshot) {
            (Some(pvc), _) => Some(DataVolumeSource::Pvc(pvc.clone())),
            (None, Some(snapshot)) => Some(DataVolumeSource::Snapshot(snapshot.clone())),
            (None, None) => None,
        };
        Ok(())
    }

    /// Take the size of the source claim when the target does not name one
    fn detect_clone_size(state: &mut SyncState, source_pvc: &PersistentVolumeClaim) {
        let Some(spec) = state.pvc_spec.as_mut() else {
            return;
        };
        let missing = requested_storage(spec).map_or(true, |q| q.0.is_empty() || q.0 == "0");
        if !missing {
            return;
        }
        let source_size = source_pvc
            .status
            .as_ref()
            .and_then(|s| s.capacity.as_ref())
            .and_then(|c| c.get("storage"))
            .or_else(|| source_pvc.spec.as_ref().and_then(requested_storage));
        if let Some(size) = source_size {
            debug!("Using source PVC size {} for clone target", size.0);
            set_requested_storage(spec, size.clone());
        }
    }
}

#[async_trait]
impl DataVolumeController for CloneController {
    fn op(&self) -> DataVolumeOp {
        self.op
    }

    fn base(&self) -> &ReconcilerBase {
        &self.base
    }

    async fn use_populator(&self, state: &SyncState) -> Result<Option<bool>> {
        let dv = &state.dv_mutated;
        if let Some(value) = annotation(dv, ANN_USE_POPULATOR) {
            return value.parse::<bool>().map(Some).map_err(|_| {
                Error::InvalidSpec(format!("invalid {} value {:?}", ANN_USE_POPULATOR, value))
            });
        }
        if let Some(pvc) = &state.pvc {
            return Ok(Some(pvc_populator_kind(pvc).is_some()));
        }
        let Some((_, source)) = clone_source(dv) else {
            return Ok(Some(false));
        };
        if is_cross_namespace(dv, &source) {
            return Ok(Some(false));
        }
        self.base.storage_class_csi_driver_exists(state).await.map(Some)
    }

    async fn prepare(&self, state: &mut SyncState) -> Result<()> {
        self.populate_source_if_source_ref(&mut state.dv_mutated)?;
        if state.dv_mutated.phase() == DataVolumePhase::Succeeded {
            self.base
                .delete_populator_source(PopulatorKind::Clone, &state.dv_mutated)
                .await?;
        }
        Ok(())
    }

    async fn sync_body(&self, state: &mut SyncState) -> Result<()> {
        let dv = state.dv_mutated.clone();
        let populated = state
            .pvc
            .as_ref()
            .is_some_and(|pvc| pvc_is_populated_for(pvc, &dv));
        if populated || dv_is_pre_populated(&dv) || static_provision_pending(state.pvc.as_ref(), &dv)
        {
            return Ok(());
        }

        let (kind, source) = clone_source(&dv).ok_or_else(|| {
            Error::InvalidSpec("no source set for clone datavolume".to_string())
        })?;

        if kind == CloneSourceKind::Pvc {
            let Some(source_pvc) = self.base.store.get_pvc(&source).await? else {
                state.set_phase_sync(
                    dv.phase(),
                    None,
                    StatusEvent::warning(
                        CLONE_WITHOUT_SOURCE,
                        format!("The source {} {} doesn't exist", kind.noun(), source.name),
                    ),
                )?;
                return Ok(());
            };
            Self::detect_clone_size(state, &source_pvc);
        }

        if state.pvc.is_some() {
            return Ok(());
        }

        if state.use_populator {
            if dv.phase() != DataVolumePhase::Succeeded {
                let clone_source = volume_clone_source(&dv, kind, &source.name);
                self.base
                    .ensure_populator_source(PopulatorSource::Clone(clone_source))
                    .await?;
            }
            let settings = state.settings.clone();
            return self
                .base
                .handle_pvc_creation(state, |dv, pvc| {
                    set_populator_data_source_ref(pvc, PopulatorKind::Clone, dv, &settings);
                    Ok(())
                })
                .await;
        }

        match kind {
            CloneSourceKind::Pvc => {
                info!("Requesting host-assisted clone from {}", source);
                let request = source.to_string();
                self.base
                    .handle_pvc_creation(state, |_, pvc| {
                        set_annotation(pvc, ANN_CLONE_REQUEST, request);
                        Ok(())
                    })
                    .await
            }
            CloneSourceKind::Snapshot => {
                let message = if is_cross_namespace(&dv, &source) {
                    format!(
                        "Cloning snapshot {} into namespace {} is not supported",
                        source,
                        dv.namespace().unwrap_or_default()
                    )
                } else {
                    "Snapshot clone requires a CSI driver for the target storage class".to_string()
                };
                state.set_phase_sync(
                    DataVolumePhase::CloneScheduled,
                    None,
                    StatusEvent::warning(ERR_UNABLE_TO_CLONE, message),
                )
            }
        }
    }

    async fn update_status_phase(
        &self,
        pvc: &PersistentVolumeClaim,
        dv: &mut DataVolume,
        event: &mut StatusEvent,
    ) -> Result<()> {
        let pod_phase = annotation(pvc, ANN_POD_PHASE);
        if pod_phase != Some("Succeeded") {
            let clone_population = pvc_populator_kind(pvc) == Some(PopulatorKind::Clone);
            let bound = pvc.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound");
            let clone_target = has_annotation(pvc, ANN_CLONE_REQUEST) || clone_population;
            if !clone_target || !(bound || clone_population) || pvc_is_populated_for(pvc, dv) {
                return Ok(());
            }
            set_phase(dv, DataVolumePhase::CloneScheduled);
        }
        let Some(pod_phase) = pod_phase else {
            return Ok(());
        };

        // The status copy was read from the cluster, so its sourceRef is unresolved
        let mut resolved = dv.clone();
        self.populate_source_if_source_ref(&mut resolved)?;
        let source = clone_source(&resolved)
            .map(|(_, key)| key)
            .unwrap_or_default();
        let target = ObjectKey::from_resource(pvc);
        let clone_message = |what: &str| {
            format!(
                "Cloning from {}/{} into {}/{} {}",
                source.namespace, source.name, target.namespace, target.name, what
            )
        };

        match pod_phase {
            "Pending" => {
                set_phase(dv, DataVolumePhase::CloneScheduled);
                *event = StatusEvent::normal(CLONE_SCHEDULED, clone_message("scheduled"));
            }
            "Running" => {
                set_phase(dv, DataVolumePhase::CloneInProgress);
                *event = StatusEvent::normal(CLONE_IN_PROGRESS, clone_message("in progress"));
            }
            "Failed" => {
                *event = StatusEvent::warning(CLONE_FAILED, clone_message("failed"));
            }
            "Succeeded" => {
                set_phase(dv, DataVolumePhase::Succeeded);
                status_mut(dv).progress = Some("100.0%".to_string());
                *event = StatusEvent::normal(
                    CLONE_SUCCEEDED,
                    format!(
                        "Successfully cloned from {}/{} into {}/{}",
                        source.namespace, source.name, target.namespace, target.name
                    ),
                );
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::controller::config::ControllerConfig;
    use crate::controller::fake::{FakeStore, RecordingRecorder};
    use crate::crd::{
        DataSource, DataSourceSource, DataSourceSpec, DataVolumeSourcePvc, DataVolumeSourceRef,
        DataVolumeSpec,
    };
    use k8s_openapi::api::core::v1::PersistentVolumeClaimStatus;
    use kube::api::ObjectMeta;

    fn controller(store: Arc<FakeStore>) -> CloneController {
        CloneController::new(
            ReconcilerBase::new(
                store,
                Arc::new(RecordingRecorder::new()),
                ControllerConfig::default(),
            ),
            DataVolumeOp::PvcClone,
        )
    }

    fn pvc_clone_dv(source_namespace: &str) -> DataVolume {
        let mut dv = DataVolume::new(
            "target",
            DataVolumeSpec {
                source: Some(DataVolumeSource::Pvc(DataVolumeSourcePvc {
                    namespace: source_namespace.to_string(),
                    name: "golden".to_string(),
                })),
                ..Default::default()
            },
        );
        dv.metadata.namespace = Some("default".to_string());
        dv
    }

    fn clone_target(pod_phase: &str) -> PersistentVolumeClaim {
        let mut pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("target".to_string()),
                ..Default::default()
            },
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        set_annotation(&mut pvc, ANN_CLONE_REQUEST, "images/golden");
        set_annotation(&mut pvc, ANN_POD_PHASE, pod_phase);
        pvc
    }

    #[test]
    fn test_clone_source_defaults_namespace() {
        let (kind, key) = clone_source(&pvc_clone_dv("")).unwrap();
        assert_eq!(kind, CloneSourceKind::Pvc);
        assert_eq!(key, ObjectKey::new("default", "golden"));

        let (_, key) = clone_source(&pvc_clone_dv("images")).unwrap();
        assert_eq!(key, ObjectKey::new("images", "golden"));
        assert!(is_cross_namespace(&pvc_clone_dv("images"), &key));
    }

    #[test]
    fn test_volume_clone_source_for_snapshot() {
        let mut dv = pvc_clone_dv("");
        dv.metadata.uid = Some("u1".to_string());
        let source = volume_clone_source(&dv, CloneSourceKind::Snapshot, "snap");
        assert_eq!(source.name_any(), "volume-clone-source-u1");
        assert_eq!(source.spec.source.kind, "VolumeSnapshot");
        assert_eq!(
            source.spec.source.api_group.as_deref(),
            Some(SNAPSHOT_API_GROUP)
        );
    }

    #[tokio::test]
    async fn test_clone_status_messages() {
        let ctrl = controller(Arc::new(FakeStore::new()));
        let mut dv = pvc_clone_dv("images");
        let mut event = StatusEvent::default();

        ctrl.update_status_phase(&clone_target("Running"), &mut dv, &mut event)
            .await
            .unwrap();
        assert_eq!(dv.phase(), DataVolumePhase::CloneInProgress);
        assert_eq!(
            event.message,
            "Cloning from images/golden into default/target in progress"
        );

        ctrl.update_status_phase(&clone_target("Succeeded"), &mut dv, &mut event)
            .await
            .unwrap();
        assert_eq!(dv.phase(), DataVolumePhase::Succeeded);
        assert_eq!(dv.status.as_ref().unwrap().progress.as_deref(), Some("100.0%"));
        assert_eq!(event.reason, CLONE_SUCCEEDED);
        assert_eq!(
            event.message,
            "Successfully cloned from images/golden into default/target"
        );
    }

    #[tokio::test]
    async fn test_source_ref_resolved_for_messages() {
        let store = Arc::new(FakeStore::new());
        let mut ds = DataSource::new(
            "fedora",
            DataSourceSpec {
                source: DataSourceSource {
                    pvc: Some(DataVolumeSourcePvc {
                        namespace: "images".to_string(),
                        name: "fedora-39".to_string(),
                    }),
                    ..Default::default()
                },
            },
        );
        ds.metadata.namespace = Some("default".to_string());
        store.insert_data_source(ds);
        let ctrl = controller(store);

        let mut dv = DataVolume::new(
            "target",
            DataVolumeSpec {
                source_ref: Some(DataVolumeSourceRef {
                    kind: "DataSource".to_string(),
                    namespace: None,
                    name: "fedora".to_string(),
                }),
                ..Default::default()
            },
        );
        dv.metadata.namespace = Some("default".to_string());
        let mut event = StatusEvent::default();

        ctrl.update_status_phase(&clone_target("Pending"), &mut dv, &mut event)
            .await
            .unwrap();
        assert_eq!(dv.phase(), DataVolumePhase::CloneScheduled);
        assert_eq!(
            event.message,
            "Cloning from images/fedora-39 into default/target scheduled"
        );
        assert!(dv.spec.source.is_none());
    }
}
