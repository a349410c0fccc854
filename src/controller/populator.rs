//! DataVolumes filled by an external volume populator
//!
//! The claim is created with the DataVolume's `dataSource`/`dataSourceRef`
//! and Kubernetes hands it to whichever populator serves that kind. Only CSI
//! storage supports this.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::{Resource, ResourceExt};

use crate::crd::{DataVolume, DataVolumePhase};
use crate::error::{Error, Result};

use super::annotations::{set_annotation, ANN_EXTERNAL_POPULATION};
use super::events::EventType;
use super::operation::DataVolumeOp;
use super::reconciler::{DataVolumeController, ReconcilerBase};
use super::status::set_phase;
use super::sync::{StatusEvent, SyncState};

pub const EXTERNAL_POPULATION_SUCCEEDED: &str = "ExternalPopulationSucceeded";
pub const NO_ANY_VOLUME_DATA_SOURCE: &str = "NoAnyVolumeDataSource";
pub const NO_CSI_DRIVER_FOR_EXTERNAL_POPULATION: &str = "NoCSIDriverForExternalPopulation";

const MESSAGE_NO_ANY_VOLUME_DATA_SOURCE: &str =
    "AnyVolumeDataSource feature gate is not enabled: External population not supported";
const MESSAGE_NO_CSI_DRIVER: &str = "No CSI drivers were found: External population not supported";

fn undefined_population_source() -> Error {
    Error::InvalidSpec("undefined population source".to_string())
}

/// Reconciler for externally populated DataVolumes
pub struct PopulatorController {
    base: ReconcilerBase,
}

impl PopulatorController {
    pub fn new(base: ReconcilerBase) -> Self {
        Self { base }
    }

    /// Warn on both the claim and, through `event`, the DataVolume
    fn warn_on_claim(&self, pvc: &PersistentVolumeClaim, event: &mut StatusEvent, reason: &str, message: &str) {
        self.base
            .recorder
            .record(&pvc.object_ref(&()), EventType::Warning, reason, message);
        *event = StatusEvent::warning(reason, message);
    }
}

#[async_trait]
impl DataVolumeController for PopulatorController {
    fn op(&self) -> DataVolumeOp {
        DataVolumeOp::Populator
    }

    fn base(&self) -> &ReconcilerBase {
        &self.base
    }

    async fn prepare(&self, state: &mut SyncState) -> Result<()> {
        if !state.dv.uses_external_populator() {
            return Err(undefined_population_source());
        }
        state.dv_mutated.spec.source = None;
        Ok(())
    }

    async fn sync_body(&self, state: &mut SyncState) -> Result<()> {
        self.base
            .handle_pvc_creation(state, |dv, pvc| {
                if !dv.uses_external_populator() {
                    return Err(undefined_population_source());
                }
                set_annotation(pvc, ANN_EXTERNAL_POPULATION, "true");
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
        let class_name = pvc.spec.as_ref().and_then(|s| s.storage_class_name.as_deref());
        if !self.base.csi_driver_exists_for_class(class_name).await? {
            self.warn_on_claim(pvc, event, NO_CSI_DRIVER_FOR_EXTERNAL_POPULATION, MESSAGE_NO_CSI_DRIVER);
            return Ok(());
        }

        // Without AnyVolumeDataSource the apiserver drops dataSourceRef
        let data_source_ref = pvc.spec.as_ref().and_then(|s| s.data_source_ref.as_ref());
        match data_source_ref {
            None => {
                self.warn_on_claim(
                    pvc,
                    event,
                    NO_ANY_VOLUME_DATA_SOURCE,
                    MESSAGE_NO_ANY_VOLUME_DATA_SOURCE,
                );
            }
            Some(data_source_ref) => {
                set_phase(dv, DataVolumePhase::Succeeded);
                *event = StatusEvent::normal(
                    EXTERNAL_POPULATION_SUCCEEDED,
                    format!(
                        "PVC {} successfully populated by {}",
                        pvc.name_any(),
                        data_source_ref.name
                    ),
                );
            }
        }
        Ok(())
    }
}
