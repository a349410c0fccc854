//! Watch mappers: which DataVolumes to enqueue when a related object changes

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};

use crate::crd::{DataVolume, DataVolumePhase, ObjectTransfer};

use super::annotations::{annotation, ANN_POPULATED_FOR};
use super::ownership::owned_by_data_volume;
use super::store::{available_pv_index_key, ObjectKey, ObjectStore};

fn object_ref(key: ObjectKey) -> ObjectRef<DataVolume> {
    ObjectRef::new(&key.name).within(&key.namespace)
}

/// DataVolume named by the object's controller reference, same namespace
fn controlling_data_volume<K: ResourceExt>(obj: &K) -> Option<ObjectRef<DataVolume>> {
    let owner = obj.owner_references().iter().find(|r| {
        r.controller == Some(true)
            && r.kind == DataVolume::kind(&())
            && r.api_version == DataVolume::api_version(&())
    })?;
    Some(ObjectRef::new(&owner.name).within(&obj.namespace()?))
}

/// Owner, `populatedFor` and cross-namespace `ownedByDataVolume` links
pub fn data_volumes_for_pvc(pvc: &PersistentVolumeClaim) -> Vec<ObjectRef<DataVolume>> {
    let mut refs = Vec::new();
    refs.extend(controlling_data_volume(pvc));
    if let (Some(name), Some(namespace)) = (annotation(pvc, ANN_POPULATED_FOR), pvc.namespace()) {
        refs.push(ObjectRef::new(name).within(&namespace));
    }
    refs.extend(owned_by_data_volume(pvc).map(object_ref));
    refs.dedup();
    refs
}

pub fn data_volumes_for_pod(pod: &Pod) -> Vec<ObjectRef<DataVolume>> {
    let mut refs = Vec::new();
    refs.extend(controlling_data_volume(pod));
    refs.extend(owned_by_data_volume(pod).map(object_ref));
    refs.dedup();
    refs
}

pub fn data_volumes_for_transfer(transfer: &ObjectTransfer) -> Vec<ObjectRef<DataVolume>> {
    owned_by_data_volume(transfer).map(object_ref).into_iter().collect()
}

/// Every DataVolume still waiting for its first reconcile to get past
/// storage class resolution
pub fn unset_phase_data_volumes(store: &dyn ObjectStore) -> Vec<ObjectRef<DataVolume>> {
    store
        .data_volumes_by_phase(DataVolumePhase::Unset)
        .iter()
        .map(|dv| ObjectRef::from_obj(dv))
        .collect()
}

/// Pending DataVolumes that could bind to a newly Available PV
pub fn data_volumes_for_available_pv(
    pv: &PersistentVolume,
    pending: &[DataVolume],
) -> Vec<ObjectRef<DataVolume>> {
    let Some(class) = available_pv_index_key(pv) else {
        return Vec::new();
    };
    pending
        .iter()
        .filter(|dv| dv.storage_class_name() == Some(class.as_str()))
        .map(ObjectRef::from_obj)
        .collect()
}
