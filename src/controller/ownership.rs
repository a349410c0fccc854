//! PVC ownership, construction and adoption

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use tracing::{info, instrument};

use crate::crd::{DataVolume, DataVolumeContentType, DataVolumePhase, CDI_API_GROUP};
use crate::error::{Error, Result};

use super::annotations::{
    annotation, has_annotation, set_annotation, ANN_ALLOW_CLAIM_ADOPTION, ANN_CONTENT_TYPE,
    ANN_CREATED_FOR_DATA_VOLUME, ANN_OWNED_BY_DATA_VOLUME, ANN_OWNER_UID, ANN_POD_RESTARTS,
    ANN_POPULATED_FOR, ANN_PREALLOCATION_REQUESTED, ANN_PRE_POPULATED, ANN_PRIORITY_CLASS_NAME,
    LABEL_APP, LABEL_APP_VALUE, LABEL_COMPONENT, LABEL_FILLING_UP_ALERT, LABEL_MANAGED_BY,
};
use super::events::{
    data_volume_ref, EventType, REASON_ERR_EXCEEDED_QUOTA, REASON_ERR_RESOURCE_EXISTS,
    REASON_ERR_RESOURCE_MARKED_FOR_DELETION,
};
use super::reconciler::ReconcilerBase;
use super::render::{resolve_volume_mode, VOLUME_MODE_FILESYSTEM};
use super::store::{ObjectKey, PopulatorKind};
use super::sync::{StatusEvent, SyncState};

/// Name stamped in the managed-by label of created claims
pub const CONTROLLER_NAME: &str = "cdi-controller";

const COMPONENT_STORAGE: &str = "storage";

/// Controller owner reference pointing at a DataVolume
pub fn owner_reference(dv: &DataVolume) -> OwnerReference {
    OwnerReference {
        api_version: DataVolume::api_version(&()).to_string(),
        kind: DataVolume::kind(&()).to_string(),
        name: dv.name_any(),
        uid: dv.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Whether `obj` has a controller reference with this UID
pub fn is_controlled_by<K: ResourceExt>(obj: &K, uid: Option<&str>) -> bool {
    let Some(uid) = uid else {
        return false;
    };
    obj.owner_references()
        .iter()
        .any(|r| r.controller == Some(true) && r.uid == uid)
}

pub fn set_owned_by_data_volume<K: ResourceExt>(obj: &mut K, dv: &DataVolume) {
    let owner = ObjectKey::from_resource(dv);
    set_annotation(obj, ANN_OWNED_BY_DATA_VOLUME, owner.to_string());
}

/// DataVolume key from the `ownedByDataVolume` annotation
pub fn owned_by_data_volume<K: ResourceExt>(obj: &K) -> Option<ObjectKey> {
    annotation(obj, ANN_OWNED_BY_DATA_VOLUME).and_then(ObjectKey::parse)
}

/// The claim was populated for this DataVolume
pub fn pvc_is_populated_for(pvc: &PersistentVolumeClaim, dv: &DataVolume) -> bool {
    annotation(pvc, ANN_POPULATED_FOR) == Some(dv.name_any().as_str())
}

pub fn dv_is_pre_populated(dv: &DataVolume) -> bool {
    has_annotation(dv, ANN_PRE_POPULATED)
}

/// CDI populator kind referenced by the claim's `dataSourceRef`
pub fn pvc_populator_kind(pvc: &PersistentVolumeClaim) -> Option<PopulatorKind> {
    let data_source_ref = pvc.spec.as_ref()?.data_source_ref.as_ref()?;
    if data_source_ref.api_group.as_deref() != Some(CDI_API_GROUP) {
        return None;
    }
    PopulatorKind::from_kind(&data_source_ref.kind)
}

/// Build the claim for a DataVolume.
///
/// The claim is controlled by the DataVolume in the same namespace; across
/// namespaces the `ownedByDataVolume` and `ownerUID` annotations stand in.
pub fn new_persistent_volume_claim(
    dv: &DataVolume,
    spec: &PersistentVolumeClaimSpec,
    namespace: &str,
    name: &str,
    installer_labels: &BTreeMap<String, String>,
) -> PersistentVolumeClaim {
    let mut labels = BTreeMap::from([(LABEL_APP.to_string(), LABEL_APP_VALUE.to_string())]);
    if resolve_volume_mode(spec.volume_mode.as_deref()) == VOLUME_MODE_FILESYSTEM {
        labels.insert(LABEL_FILLING_UP_ALERT.to_string(), "disabled".to_string());
    }
    labels.extend(dv.labels().clone());
    labels.extend(installer_labels.clone());
    labels.insert(LABEL_COMPONENT.to_string(), COMPONENT_STORAGE.to_string());
    labels.insert(LABEL_MANAGED_BY.to_string(), CONTROLLER_NAME.to_string());

    let mut annotations = dv.annotations().clone();
    annotations.insert(ANN_POD_RESTARTS.to_string(), "0".to_string());
    annotations.insert(
        ANN_CONTENT_TYPE.to_string(),
        dv.spec
            .content_type
            .unwrap_or(DataVolumeContentType::Kubevirt)
            .as_str()
            .to_string(),
    );
    if let Some(priority_class) = dv.spec.priority_class_name.as_ref().filter(|p| !p.is_empty()) {
        annotations.insert(ANN_PRIORITY_CLASS_NAME.to_string(), priority_class.clone());
    }
    annotations.insert(
        ANN_PREALLOCATION_REQUESTED.to_string(),
        dv.spec.preallocation.unwrap_or(false).to_string(),
    );
    annotations.insert(
        ANN_CREATED_FOR_DATA_VOLUME.to_string(),
        dv.metadata.uid.clone().unwrap_or_default(),
    );

    let mut pvc = PersistentVolumeClaim {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(spec.clone()),
        status: None,
    };

    if dv.namespace().as_deref() == Some(namespace) {
        pvc.metadata.owner_references = Some(vec![owner_reference(dv)]);
    } else {
        set_owned_by_data_volume(&mut pvc, dv);
        set_annotation(
            &mut pvc,
            ANN_OWNER_UID,
            dv.metadata.uid.clone().unwrap_or_default(),
        );
    }
    pvc
}

/// Owner references the claim keeps once the DataVolume is gone
pub fn merge_owner_references(
    pvc_refs: &[OwnerReference],
    dv_refs: &[OwnerReference],
    dv_uid: &str,
) -> Vec<OwnerReference> {
    let mut merged: Vec<OwnerReference> = Vec::new();
    for r in pvc_refs.iter().chain(dv_refs) {
        if r.uid == dv_uid || merged.iter().any(|m| m.uid == r.uid) {
            continue;
        }
        merged.push(r.clone());
    }
    merged
}

impl ReconcilerBase {
    /// Create the claim if it does not exist yet.
    ///
    /// `modifier` adjusts the claim before it is sent, e.g. to add the
    /// source annotations or a populator `dataSourceRef`.
    pub(crate) async fn handle_pvc_creation<F>(
        &self,
        state: &mut SyncState,
        modifier: F,
    ) -> Result<()>
    where
        F: FnOnce(&DataVolume, &mut PersistentVolumeClaim) -> Result<()> + Send,
    {
        if state.pvc.is_some() || dv_is_pre_populated(&state.dv_mutated) {
            return Ok(());
        }
        let spec = state
            .pvc_spec
            .as_ref()
            .ok_or_else(|| Error::InvariantViolation("missing pvc spec".to_string()))?;

        let dv = &state.dv_mutated;
        let mut pvc = new_persistent_volume_claim(
            dv,
            spec,
            &dv.namespace().unwrap_or_default(),
            &dv.name_any(),
            &self.config.installer_labels,
        );
        modifier(dv, &mut pvc)?;

        match self.store.create_pvc(&pvc).await {
            Ok(created) => {
                info!("Created PVC {}", ObjectKey::from_resource(&created));
                state.pvc = Some(created);
                Ok(())
            }
            Err(e) => {
                if e.is_quota_exceeded() {
                    state.set_phase_sync(
                        DataVolumePhase::Pending,
                        None,
                        StatusEvent::warning(REASON_ERR_EXCEEDED_QUOTA, e.to_string()),
                    )?;
                }
                Err(e)
            }
        }
    }

    /// Check the existing claim belongs to the DataVolume, adopting it when allowed
    #[instrument(skip(self, state, pvc), fields(pvc = %pvc.name_any()))]
    pub(crate) async fn validate_pvc(
        &self,
        state: &mut SyncState,
        pvc: &PersistentVolumeClaim,
    ) -> Result<()> {
        let dv = &state.dv_mutated;
        if pvc.metadata.deletion_timestamp.is_some() {
            let err = Error::ResourceMarkedForDeletion(pvc.name_any());
            self.recorder.record(
                &data_volume_ref(dv),
                EventType::Warning,
                REASON_ERR_RESOURCE_MARKED_FOR_DELETION,
                &err.to_string(),
            );
            return Err(err);
        }
        if is_controlled_by(pvc, dv.metadata.uid.as_deref()) {
            return Ok(());
        }

        if pvc_is_populated_for(pvc, dv) || self.allow_claim_adoption(state)? {
            info!("Adopting PVC {}", pvc.name_any());
            let mut adopted = pvc.clone();
            let mut refs = adopted.owner_references().to_vec();
            for r in refs.iter_mut() {
                r.controller = None;
            }
            refs.push(owner_reference(dv));
            adopted.metadata.owner_references = Some(refs);
            set_annotation(&mut adopted, ANN_POPULATED_FOR, dv.name_any());
            state.pvc = Some(self.store.update_pvc(&adopted).await?);
            return Ok(());
        }

        let err = Error::ResourceExists(pvc.name_any());
        self.recorder.record(
            &data_volume_ref(dv),
            EventType::Warning,
            REASON_ERR_RESOURCE_EXISTS,
            &err.to_string(),
        );
        Err(err)
    }

    fn allow_claim_adoption(&self, state: &SyncState) -> Result<bool> {
        match annotation(&state.dv_mutated, ANN_ALLOW_CLAIM_ADOPTION) {
            Some(value) => value.parse::<bool>().map_err(|_| {
                Error::InvalidSpec(format!(
                    "invalid {} value {:?}",
                    ANN_ALLOW_CLAIM_ADOPTION, value
                ))
            }),
            None => Ok(state.settings.claim_adoption),
        }
    }
}
