//! Upload DataVolumes
//!
//! The claim is marked as an upload target; the upload server reports its
//! pod state back through claim annotations.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;

use crate::crd::{
    DataVolume, DataVolumePhase, DataVolumeSource, VolumeUploadSource, VolumeUploadSourceSpec,
};
use crate::error::{Error, Result};

use super::annotations::{
    annotation, annotation_is_true, has_annotation, set_annotation, ANN_POD_PHASE, ANN_POD_READY,
    ANN_UPLOAD_REQUEST, ANN_USE_POPULATOR,
};
use super::operation::DataVolumeOp;
use super::ownership::{pvc_is_populated_for, pvc_populator_kind};
use super::populator_source::{set_populator_data_source_ref, source_metadata};
use super::reconciler::{DataVolumeController, ReconcilerBase};
use super::status::set_phase;
use super::store::{PopulatorKind, PopulatorSource};
use super::sync::{StatusEvent, SyncState};

pub const UPLOAD_SCHEDULED: &str = "UploadScheduled";
pub const UPLOAD_READY: &str = "UploadReady";
pub const UPLOAD_FAILED: &str = "UploadFailed";
pub const UPLOAD_SUCCEEDED: &str = "UploadSucceeded";

fn require_upload_source(dv: &DataVolume) -> Result<()> {
    match dv.spec.source {
        Some(DataVolumeSource::Upload(_)) => Ok(()),
        _ => Err(Error::InvalidSpec(
            "no source set for upload datavolume".to_string(),
        )),
    }
}

pub fn volume_upload_source(dv: &DataVolume) -> VolumeUploadSource {
    VolumeUploadSource {
        metadata: source_metadata(PopulatorKind::Upload, dv),
        spec: VolumeUploadSourceSpec {
            content_type: dv.spec.content_type,
            preallocation: dv.spec.preallocation,
        },
    }
}

/// Reconciler for upload DataVolumes
pub struct UploadController {
    base: ReconcilerBase,
}

impl UploadController {
    pub fn new(base: ReconcilerBase) -> Self {
        Self { base }
    }
}

#[async_trait]
impl DataVolumeController for UploadController {
    fn op(&self) -> DataVolumeOp {
        DataVolumeOp::Upload
    }

    fn base(&self) -> &ReconcilerBase {
        &self.base
    }

    async fn use_populator(&self, state: &SyncState) -> Result<Option<bool>> {
        self.base.should_use_cdi_populator(state).await.map(Some)
    }

    async fn cleanup(&self, state: &mut SyncState) -> Result<()> {
        let dv = &state.dv_mutated;
        if annotation_is_true(dv, ANN_USE_POPULATOR) && dv.phase() == DataVolumePhase::Succeeded {
            self.base
                .delete_populator_source(PopulatorKind::Upload, dv)
                .await?;
        }
        Ok(())
    }

    async fn sync_body(&self, state: &mut SyncState) -> Result<()> {
        if !state.use_populator {
            return self
                .base
                .handle_pvc_creation(state, |dv, pvc| {
                    require_upload_source(dv)?;
                    set_annotation(pvc, ANN_UPLOAD_REQUEST, "");
                    Ok(())
                })
                .await;
        }

        if state.dv_mutated.phase() != DataVolumePhase::Succeeded {
            let source = volume_upload_source(&state.dv_mutated);
            self.base
                .ensure_populator_source(PopulatorSource::Upload(source))
                .await?;
        }
        let settings = state.settings.clone();
        self.base
            .handle_pvc_creation(state, |dv, pvc| {
                require_upload_source(dv)?;
                set_populator_data_source_ref(pvc, PopulatorKind::Upload, dv, &settings);
                Ok(())
            })
            .await
    }

    async fn update_status_phase(
        &self,
        pvc: &PersistentVolumeClaim,
        dv: &mut DataVolume,
        event: &mut StatusEvent,
    ) -> Result<()> {
        let pod_phase = annotation(pvc, ANN_POD_PHASE);
        if pod_phase != Some("Succeeded") {
            let upload_population = pvc_populator_kind(pvc) == Some(PopulatorKind::Upload);
            let bound = pvc.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound");
            let upload_target = has_annotation(pvc, ANN_UPLOAD_REQUEST) || upload_population;
            if !upload_target || !(bound || upload_population) || pvc_is_populated_for(pvc, dv) {
                return Ok(());
            }
            set_phase(dv, DataVolumePhase::UploadScheduled);
        }
        let Some(pod_phase) = pod_phase else {
            return Ok(());
        };

        let name = pvc.name_any();
        match pod_phase {
            "Pending" => {
                set_phase(dv, DataVolumePhase::UploadScheduled);
                *event = StatusEvent::normal(UPLOAD_SCHEDULED, format!("Upload into {} scheduled", name));
            }
            "Running" => {
                if annotation_is_true(pvc, ANN_POD_READY) {
                    set_phase(dv, DataVolumePhase::UploadReady);
                    *event = StatusEvent::normal(UPLOAD_READY, format!("Upload into {} ready", name));
                }
            }
            "Failed" => {
                *event = StatusEvent::warning(UPLOAD_FAILED, format!("Upload into {} failed", name));
            }
            "Succeeded" => {
                set_phase(dv, DataVolumePhase::Succeeded);
                *event = StatusEvent::normal(
                    UPLOAD_SUCCEEDED,
                    format!("Successfully uploaded into {}", name),
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
    use k8s_openapi::api::core::v1::PersistentVolumeClaimStatus;
    use kube::api::ObjectMeta;

    fn controller() -> UploadController {
        UploadController::new(ReconcilerBase::new(
            Arc::new(FakeStore::new()),
            Arc::new(RecordingRecorder::new()),
            ControllerConfig::default(),
        ))
    }

    fn upload_pvc(pod_phase: Option<&str>, ready: bool) -> PersistentVolumeClaim {
        let mut pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("test".to_string()),
                ..Default::default()
            },
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        set_annotation(&mut pvc, ANN_UPLOAD_REQUEST, "");
        if let Some(phase) = pod_phase {
            set_annotation(&mut pvc, ANN_POD_PHASE, phase);
        }
        if ready {
            set_annotation(&mut pvc, ANN_POD_READY, "true");
        }
        pvc
    }

    #[tokio::test]
    async fn test_upload_ready_requires_pod_ready() {
        let ctrl = controller();
        let mut dv = DataVolume::new("test", Default::default());
        let mut event = StatusEvent::default();

        ctrl.update_status_phase(&upload_pvc(Some("Running"), false), &mut dv, &mut event)
            .await
            .unwrap();
        assert_eq!(dv.phase(), DataVolumePhase::UploadScheduled);
        assert_eq!(event, StatusEvent::default());

        ctrl.update_status_phase(&upload_pvc(Some("Running"), true), &mut dv, &mut event)
            .await
            .unwrap();
        assert_eq!(dv.phase(), DataVolumePhase::UploadReady);
        assert_eq!(event.reason, UPLOAD_READY);
        assert_eq!(event.message, "Upload into test ready");
    }

    #[tokio::test]
    async fn test_upload_succeeded() {
        let ctrl = controller();
        let mut dv = DataVolume::new("test", Default::default());
        let mut event = StatusEvent::default();

        ctrl.update_status_phase(&upload_pvc(Some("Succeeded"), false), &mut dv, &mut event)
            .await
            .unwrap();
        assert_eq!(dv.phase(), DataVolumePhase::Succeeded);
        assert_eq!(event.message, "Successfully uploaded into test");
    }

    #[tokio::test]
    async fn test_not_an_upload_target() {
        let ctrl = controller();
        let mut dv = DataVolume::new("test", Default::default());
        let mut pvc = upload_pvc(Some("Running"), true);
        pvc.annotations_mut().remove(ANN_UPLOAD_REQUEST);
        let mut event = StatusEvent::default();

        ctrl.update_status_phase(&pvc, &mut dv, &mut event).await.unwrap();
        assert_eq!(dv.phase(), DataVolumePhase::Unset);
    }
}
