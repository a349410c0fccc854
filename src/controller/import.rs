//! Import DataVolumes
//!
//! Sources: http, s3, gcs, registry, imageio, vddk and blank. Without a
//! populator the importer reads its instructions from claim annotations; with
//! one, the claim points at a `VolumeImportSource`.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::crd::{
    DataVolume, DataVolumePhase, DataVolumeSource, VolumeImportSource, VolumeImportSourceSpec,
};
use crate::error::{Error, Result};

use super::annotations::{
    annotation, annotation_is_true, checkpoint_copied_key, has_annotation, remove_annotation,
    set_annotation, ANN_BACKING_FILE, ANN_CERT_CONFIG_MAP, ANN_CHECKPOINTS_COPIED,
    ANN_CURRENT_CHECKPOINT, ANN_CURRENT_POD_ID, ANN_DISK_ID, ANN_ENDPOINT, ANN_EXTRA_HEADERS,
    ANN_FINAL_CHECKPOINT, ANN_IMPORT_POD, ANN_MULTI_STAGE_IMPORT_DONE, ANN_POD_PHASE,
    ANN_PREVIOUS_CHECKPOINT, ANN_REGISTRY_IMAGE_STREAM, ANN_REGISTRY_IMPORT_METHOD, ANN_SECRET,
    ANN_SECRET_EXTRA_HEADERS, ANN_SOURCE, ANN_THUMBPRINT, ANN_USE_POPULATOR, ANN_UUID,
    ANN_VDDK_HOST_CONNECTION, ANN_VDDK_INIT_IMAGE_URL, ANN_VDDK_VERSION,
};
use super::operation::DataVolumeOp;
use super::ownership::{pvc_is_populated_for, pvc_populator_kind};
use super::populator_source::{set_populator_data_source_ref, source_metadata};
use super::progress::find_worker_pod;
use super::reconciler::{DataVolumeController, ReconcilerBase};
use super::status::{set_phase, status_mut};
use super::store::{PopulatorKind, PopulatorSource};
use super::sync::{StatusEvent, SyncState};

pub const IMPORT_SCHEDULED: &str = "ImportScheduled";
pub const IMPORT_IN_PROGRESS: &str = "ImportInProgress";
pub const IMPORT_FAILED: &str = "ImportFailed";
pub const IMPORT_SUCCEEDED: &str = "ImportSucceeded";
pub const IMPORT_PAUSED: &str = "ImportPaused";

const SOURCE_VDDK: &str = "vddk";

/// Checkpoint the importer should copy next
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub current: String,
    pub previous: String,
    pub is_final: bool,
}

/// First checkpoint of the DataVolume not yet marked copied on the claim
pub fn next_checkpoint(dv: &DataVolume, pvc: &PersistentVolumeClaim) -> Option<CheckpointRecord> {
    let checkpoints = &dv.spec.checkpoints;
    let final_checkpoint = dv.spec.final_checkpoint.unwrap_or(false);
    let first = checkpoints.first()?;

    if annotation(pvc, ANN_CURRENT_CHECKPOINT).unwrap_or_default().is_empty() {
        return Some(CheckpointRecord {
            current: first.current.clone(),
            previous: first.previous.clone(),
            is_final: checkpoints.len() == 1 && final_checkpoint,
        });
    }

    for (count, checkpoint) in checkpoints.iter().enumerate() {
        if checkpoint.current.is_empty() {
            info!("DataVolume spec has a blank 'current' entry in checkpoint {}", count);
            continue;
        }
        if !has_annotation(pvc, &checkpoint_copied_key(&checkpoint.current)) {
            return Some(CheckpointRecord {
                current: checkpoint.current.clone(),
                previous: checkpoint.previous.clone(),
                is_final: checkpoints.len() == count + 1 && final_checkpoint,
            });
        }
    }
    None
}

fn set_checkpoint_annotations(pvc: &mut PersistentVolumeClaim, checkpoint: &CheckpointRecord) {
    set_annotation(pvc, ANN_CURRENT_CHECKPOINT, checkpoint.current.clone());
    set_annotation(pvc, ANN_PREVIOUS_CHECKPOINT, checkpoint.previous.clone());
    set_annotation(pvc, ANN_FINAL_CHECKPOINT, checkpoint.is_final.to_string());
}

fn set_optional(pvc: &mut PersistentVolumeClaim, key: &str, value: Option<&String>) {
    if let Some(value) = value.filter(|v| !v.is_empty()) {
        set_annotation(pvc, key, value.clone());
    }
}

fn set_indexed(pvc: &mut PersistentVolumeClaim, prefix: &str, values: &[String]) {
    for (index, value) in values.iter().enumerate() {
        set_annotation(pvc, &format!("{}.{}", prefix, index), value.clone());
    }
}

/// Write the importer's source instructions onto the claim
pub fn set_import_source_annotations(
    pvc: &mut PersistentVolumeClaim,
    source: &DataVolumeSource,
) -> Result<()> {
    let Some(name) = source.import_source_name() else {
        return Err(Error::InvalidSpec(
            "no source set for import datavolume".to_string(),
        ));
    };
    set_annotation(pvc, ANN_SOURCE, name);

    match source {
        DataVolumeSource::Http(http) => {
            set_annotation(pvc, ANN_ENDPOINT, http.url.clone());
            set_optional(pvc, ANN_SECRET, http.secret_ref.as_ref());
            set_optional(pvc, ANN_CERT_CONFIG_MAP, http.cert_config_map.as_ref());
            set_indexed(pvc, ANN_EXTRA_HEADERS, &http.extra_headers);
            set_indexed(pvc, ANN_SECRET_EXTRA_HEADERS, &http.secret_extra_headers);
        }
        DataVolumeSource::S3(s3) => {
            set_annotation(pvc, ANN_ENDPOINT, s3.url.clone());
            set_optional(pvc, ANN_SECRET, s3.secret_ref.as_ref());
            set_optional(pvc, ANN_CERT_CONFIG_MAP, s3.cert_config_map.as_ref());
        }
        DataVolumeSource::Gcs(gcs) => {
            set_annotation(pvc, ANN_ENDPOINT, gcs.url.clone());
            set_optional(pvc, ANN_SECRET, gcs.secret_ref.as_ref());
        }
        DataVolumeSource::Registry(registry) => {
            set_optional(pvc, ANN_REGISTRY_IMPORT_METHOD, registry.pull_method.as_ref());
            set_optional(pvc, ANN_ENDPOINT, registry.url.as_ref());
            if let Some(image_stream) = &registry.image_stream {
                set_annotation(pvc, ANN_ENDPOINT, image_stream.clone());
                set_annotation(pvc, ANN_REGISTRY_IMAGE_STREAM, "true");
            }
            set_optional(pvc, ANN_SECRET, registry.secret_ref.as_ref());
            set_optional(pvc, ANN_CERT_CONFIG_MAP, registry.cert_config_map.as_ref());
        }
        DataVolumeSource::Imageio(imageio) => {
            set_annotation(pvc, ANN_ENDPOINT, imageio.url.clone());
            set_annotation(pvc, ANN_DISK_ID, imageio.disk_id.clone());
            set_optional(pvc, ANN_SECRET, imageio.secret_ref.as_ref());
            set_optional(pvc, ANN_CERT_CONFIG_MAP, imageio.cert_config_map.as_ref());
        }
        DataVolumeSource::Vddk(vddk) => {
            set_optional(pvc, ANN_ENDPOINT, vddk.url.as_ref());
            set_optional(pvc, ANN_UUID, vddk.uuid.as_ref());
            set_optional(pvc, ANN_BACKING_FILE, vddk.backing_file.as_ref());
            set_optional(pvc, ANN_THUMBPRINT, vddk.thumbprint.as_ref());
            set_optional(pvc, ANN_SECRET, vddk.secret_ref.as_ref());
            set_optional(pvc, ANN_VDDK_INIT_IMAGE_URL, vddk.init_image_url.as_ref());
        }
        _ => {}
    }
    Ok(())
}

/// `VolumeImportSource` for a DataVolume, defaulting to a blank image
pub fn volume_import_source(dv: &DataVolume) -> VolumeImportSource {
    let source = match &dv.spec.source {
        Some(s) if s.import_source_name().is_some() => s.clone(),
        _ => DataVolumeSource::Blank(Default::default()),
    };
    VolumeImportSource {
        metadata: source_metadata(PopulatorKind::Import, dv),
        spec: VolumeImportSourceSpec {
            source: Some(source),
            content_type: dv.spec.content_type,
            preallocation: dv.spec.preallocation,
            ..Default::default()
        },
    }
}

/// Reconciler for import DataVolumes
pub struct ImportController {
    base: ReconcilerBase,
}

impl ImportController {
    pub fn new(base: ReconcilerBase) -> Self {
        Self { base }
    }

    /// Record the current checkpoint as copied and advance to the next one
    async fn set_multistage_import_annotations(
        &self,
        dv: &DataVolume,
        pvc: &PersistentVolumeClaim,
    ) -> Result<()> {
        let mut updated = pvc.clone();
        let current_pod_id = annotation(pvc, ANN_CURRENT_POD_ID).unwrap_or_default();

        // A pod only ever completes one checkpoint
        let copied_prefix = format!("{}.", ANN_CHECKPOINTS_COPIED);
        let pod_already_used = pvc
            .annotations()
            .iter()
            .any(|(k, v)| k.starts_with(&copied_prefix) && v == current_pod_id);
        if !pod_already_used {
            match annotation(pvc, ANN_CURRENT_CHECKPOINT).filter(|c| !c.is_empty()) {
                Some(current) => {
                    debug!(
                        "Marking checkpoint {} completed by pod {}",
                        current, current_pod_id
                    );
                    set_annotation(&mut updated, &checkpoint_copied_key(current), current_pod_id);
                }
                None => info!("Cannot mark empty checkpoint complete"),
            }
        }

        if let Some(checkpoint) = next_checkpoint(dv, &updated) {
            set_checkpoint_annotations(&mut updated, &checkpoint);

            // No pod is left to copy the next checkpoint; reset so one is started
            let pods = self
                .base
                .store
                .list_worker_pods(&dv.namespace().unwrap_or_default())
                .await?;
            let pod_phase = annotation(&updated, ANN_POD_PHASE);
            if find_worker_pod(&pods, &updated).is_none() && pod_phase == Some("Succeeded") {
                set_annotation(&mut updated, ANN_POD_PHASE, "Unknown");
                remove_annotation(&mut updated, ANN_IMPORT_POD);
            }
        }

        if &updated != pvc {
            self.base.store.update_pvc(&updated).await?;
        }
        Ok(())
    }

    /// Clean up the checkpoint bookkeeping once the final checkpoint landed
    async fn delete_multistage_import_annotations(&self, pvc: &PersistentVolumeClaim) -> Result<()> {
        let mut updated = pvc.clone();
        for key in [
            ANN_CURRENT_CHECKPOINT,
            ANN_PREVIOUS_CHECKPOINT,
            ANN_FINAL_CHECKPOINT,
            ANN_CURRENT_POD_ID,
        ] {
            remove_annotation(&mut updated, key);
        }
        let copied_prefix = format!("{}.", ANN_CHECKPOINTS_COPIED);
        updated
            .annotations_mut()
            .retain(|k, _| !k.starts_with(&copied_prefix));
        set_annotation(&mut updated, ANN_MULTI_STAGE_IMPORT_DONE, "true");

        if &updated != pvc {
            self.base.store.update_pvc(&updated).await?;
        }
        Ok(())
    }

    async fn update_multistage_import_succeeded(
        &self,
        pvc: &PersistentVolumeClaim,
        dv: &mut DataVolume,
    ) -> Result<()> {
        let Some(current) = annotation(pvc, ANN_CURRENT_CHECKPOINT) else {
            return Ok(());
        };
        let already_copied = has_annotation(pvc, &checkpoint_copied_key(current));
        let final_checkpoint = annotation_is_true(pvc, ANN_FINAL_CHECKPOINT);

        if final_checkpoint && already_copied {
            set_phase(dv, DataVolumePhase::Succeeded);
            self.delete_multistage_import_annotations(pvc).await
        } else {
            set_phase(dv, DataVolumePhase::Paused);
            self.set_multistage_import_annotations(dv, pvc).await
        }
    }

    /// Start a multi-stage import on a bound claim that has not begun one
    async fn maybe_set_multistage_annotations(
        &self,
        pvc: &PersistentVolumeClaim,
        dv: &DataVolume,
    ) -> Result<()> {
        let bound = pvc.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound");
        if !bound || dv.spec.checkpoints.is_empty() {
            return Ok(());
        }
        if has_annotation(pvc, ANN_CURRENT_CHECKPOINT)
            || has_annotation(pvc, ANN_MULTI_STAGE_IMPORT_DONE)
        {
            return Ok(());
        }
        self.set_multistage_import_annotations(dv, pvc).await
    }
}

/// Surface the vddk host and version the importer reported
fn copy_vddk_annotations(pvc: &PersistentVolumeClaim, dv: &mut DataVolume) {
    if annotation(pvc, ANN_SOURCE) != Some(SOURCE_VDDK) {
        return;
    }
    for key in [ANN_VDDK_HOST_CONNECTION, ANN_VDDK_VERSION] {
        if let Some(value) = annotation(pvc, key).filter(|v| !v.is_empty()) {
            set_annotation(dv, key, value);
        }
    }
}

#[async_trait]
impl DataVolumeController for ImportController {
    fn op(&self) -> DataVolumeOp {
        DataVolumeOp::Import
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
                .delete_populator_source(PopulatorKind::Import, dv)
                .await?;
        }
        Ok(())
    }

    async fn sync_body(&self, state: &mut SyncState) -> Result<()> {
        if state.use_populator {
            if state.dv_mutated.phase() != DataVolumePhase::Succeeded {
                let source = volume_import_source(&state.dv_mutated);
                self.base
                    .ensure_populator_source(PopulatorSource::Import(source))
                    .await?;
            }
            let settings = state.settings.clone();
            self.base
                .handle_pvc_creation(state, |dv, pvc| {
                    match &dv.spec.source {
                        Some(source) if source.import_source_name().is_some() => {}
                        _ => {
                            return Err(Error::InvalidSpec(
                                "no source set for import datavolume".to_string(),
                            ))
                        }
                    }
                    set_populator_data_source_ref(pvc, PopulatorKind::Import, dv, &settings);
                    Ok(())
                })
                .await?;
        } else {
            self.base
                .handle_pvc_creation(state, |dv, pvc| {
                    if let Some(checkpoint) = next_checkpoint(dv, pvc) {
                        set_checkpoint_annotations(pvc, &checkpoint);
                    }
                    let source = dv.spec.source.as_ref().ok_or_else(|| {
                        Error::InvalidSpec("no source set for import datavolume".to_string())
                    })?;
                    set_import_source_annotations(pvc, source)
                })
                .await?;
        }

        if let Some(pvc) = state.pvc.clone() {
            copy_vddk_annotations(&pvc, &mut state.dv_mutated);
            self.maybe_set_multistage_annotations(&pvc, &state.dv_mutated)
                .await?;
        }
        Ok(())
    }

    async fn update_status_phase(
        &self,
        pvc: &PersistentVolumeClaim,
        dv: &mut DataVolume,
        event: &mut StatusEvent,
    ) -> Result<()> {
        let pod_phase = annotation(pvc, ANN_POD_PHASE);
        let import_population = pvc_populator_kind(pvc) == Some(PopulatorKind::Import);
        if pod_phase != Some("Succeeded") && !import_population {
            let bound = pvc.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound");
            if !has_annotation(pvc, ANN_IMPORT_POD) || !bound || pvc_is_populated_for(pvc, dv) {
                return Ok(());
            }
        }
        set_phase(dv, DataVolumePhase::ImportScheduled);
        let Some(pod_phase) = pod_phase else {
            return Ok(());
        };

        let name = pvc.name_any();
        match pod_phase {
            "Pending" => {
                *event = StatusEvent::normal(IMPORT_SCHEDULED, format!("Import into {} scheduled", name));
            }
            "Running" => {
                set_phase(dv, DataVolumePhase::ImportInProgress);
                *event = StatusEvent::normal(
                    IMPORT_IN_PROGRESS,
                    format!("Import into {} in progress", name),
                );
            }
            "Failed" => {
                *event =
                    StatusEvent::warning(IMPORT_FAILED, format!("Failed to import into PVC {}", name));
            }
            "Succeeded" => {
                if has_annotation(pvc, ANN_CURRENT_CHECKPOINT) {
                    self.update_multistage_import_succeeded(pvc, dv).await?;
                    set_phase(dv, DataVolumePhase::Paused);
                    *event = StatusEvent::normal(
                        IMPORT_PAUSED,
                        format!("Multistage import into PVC {} is paused", name),
                    );
                } else {
                    set_phase(dv, DataVolumePhase::Succeeded);
                    status_mut(dv).progress = Some("100.0%".to_string());
                    *event = StatusEvent::normal(
                        IMPORT_SUCCEEDED,
                        format!("Successfully imported into PVC {}", name),
                    );
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        DataVolumeCheckpoint, DataVolumeSourceHttp, DataVolumeSourceRegistry, DataVolumeSpec,
    };

    fn multistage_dv(final_checkpoint: bool) -> DataVolume {
        DataVolume::new(
            "disk",
            DataVolumeSpec {
                checkpoints: vec![
                    DataVolumeCheckpoint {
                        previous: String::new(),
                        current: "snap-1".to_string(),
                    },
                    DataVolumeCheckpoint {
                        previous: "snap-1".to_string(),
                        current: "snap-2".to_string(),
                    },
                ],
                final_checkpoint: Some(final_checkpoint),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_next_checkpoint_starts_at_first() {
        let dv = multistage_dv(true);
        let pvc = PersistentVolumeClaim::default();
        assert_eq!(
            next_checkpoint(&dv, &pvc),
            Some(CheckpointRecord {
                current: "snap-1".to_string(),
                previous: String::new(),
                is_final: false,
            })
        );
    }

    #[test]
    fn test_next_checkpoint_skips_copied() {
        let dv = multistage_dv(true);
        let mut pvc = PersistentVolumeClaim::default();
        set_annotation(&mut pvc, ANN_CURRENT_CHECKPOINT, "snap-1");
        set_annotation(&mut pvc, &checkpoint_copied_key("snap-1"), "pod-a");

        let next = next_checkpoint(&dv, &pvc).unwrap();
        assert_eq!(next.current, "snap-2");
        assert!(next.is_final);

        set_annotation(&mut pvc, &checkpoint_copied_key("snap-2"), "pod-b");
        assert_eq!(next_checkpoint(&dv, &pvc), None);
    }

    #[test]
    fn test_http_source_annotations() {
        let mut pvc = PersistentVolumeClaim::default();
        let source = DataVolumeSource::Http(DataVolumeSourceHttp {
            url: "http://example.com/disk.img".to_string(),
            secret_ref: Some("creds".to_string()),
            cert_config_map: None,
            extra_headers: vec!["X-A: 1".to_string()],
            secret_extra_headers: vec![],
        });

        set_import_source_annotations(&mut pvc, &source).unwrap();
        assert_eq!(annotation(&pvc, ANN_SOURCE), Some("http"));
        assert_eq!(annotation(&pvc, ANN_ENDPOINT), Some("http://example.com/disk.img"));
        assert_eq!(annotation(&pvc, ANN_SECRET), Some("creds"));
        assert!(!has_annotation(&pvc, ANN_CERT_CONFIG_MAP));
        assert_eq!(
            annotation(&pvc, &format!("{}.0", ANN_EXTRA_HEADERS)),
            Some("X-A: 1")
        );
    }

    #[test]
    fn test_registry_image_stream_annotations() {
        let mut pvc = PersistentVolumeClaim::default();
        let source = DataVolumeSource::Registry(DataVolumeSourceRegistry {
            image_stream: Some("fedora".to_string()),
            pull_method: Some("node".to_string()),
            ..Default::default()
        });

        set_import_source_annotations(&mut pvc, &source).unwrap();
        assert_eq!(annotation(&pvc, ANN_SOURCE), Some("registry"));
        assert_eq!(annotation(&pvc, ANN_ENDPOINT), Some("fedora"));
        assert_eq!(annotation(&pvc, ANN_REGISTRY_IMAGE_STREAM), Some("true"));
        assert_eq!(annotation(&pvc, ANN_REGISTRY_IMPORT_METHOD), Some("node"));
    }

    #[test]
    fn test_non_import_source_rejected() {
        let mut pvc = PersistentVolumeClaim::default();
        let err = set_import_source_annotations(
            &mut pvc,
            &DataVolumeSource::Upload(Default::default()),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[test]
    fn test_volume_import_source_defaults_to_blank() {
        let mut dv = DataVolume::new("disk", Default::default());
        dv.metadata.namespace = Some("default".to_string());
        dv.metadata.uid = Some("abc".to_string());

        let source = volume_import_source(&dv);
        assert_eq!(source.name_any(), "volume-import-source-abc");
        assert!(matches!(
            source.spec.source,
            Some(DataVolumeSource::Blank(_))
        ));
    }
}
