//! Target PVC spec rendering
//!
//! `spec.pvc` is used verbatim. `spec.storage` is completed from the storage
//! class (the cluster default when none is named) and its StorageProfile,
//! and filesystem volumes are grown to leave room for filesystem overhead.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, VolumeResourceRequirements};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use tracing::debug;

use crate::crd::{DataVolume, DataVolumeContentType, DataVolumeSource, StorageProfile};
use crate::error::{Error, Result};

use super::annotations::{annotation_is_true, ANN_DEFAULT_STORAGE_CLASS};
use super::config::ClusterSettings;
use super::quantity::{format_bytes, inflate_for_overhead, QuantityParser};
use super::store::ObjectStore;

pub const VOLUME_MODE_FILESYSTEM: &str = "Filesystem";
pub const VOLUME_MODE_BLOCK: &str = "Block";
pub const RESOURCE_STORAGE: &str = "storage";

/// Volume mode with the Kubernetes default applied
pub fn resolve_volume_mode(mode: Option<&str>) -> &str {
    match mode {
        Some(m) if !m.is_empty() => m,
        _ => VOLUME_MODE_FILESYSTEM,
    }
}

/// Requested storage of a claim spec
pub fn requested_storage(
    spec: &PersistentVolumeClaimSpec,
) -> Option<&k8s_openapi::apimachinery::pkg::api::resource::Quantity> {
    spec.resources
        .as_ref()?
        .requests
        .as_ref()?
        .get(RESOURCE_STORAGE)
}

pub fn set_requested_storage(
    spec: &mut PersistentVolumeClaimSpec,
    size: k8s_openapi::apimachinery::pkg::api::resource::Quantity,
) {
    spec.resources
        .get_or_insert_with(VolumeResourceRequirements::default)
        .requests
        .get_or_insert_with(BTreeMap::new)
        .insert(RESOURCE_STORAGE.to_string(), size);
}

/// Look up a storage class by name, or the default class when unnamed.
///
/// Returns `None` when no name is given and the cluster has no default.
pub async fn storage_class_by_name(
    store: &dyn ObjectStore,
    name: Option<&str>,
) -> Result<Option<StorageClass>> {
    if let Some(name) = name.filter(|n| !n.is_empty()) {
        return store.get_storage_class(name).await;
    }
    Ok(default_storage_class(store.list_storage_classes().await?))
}

/// Newest class annotated as the default, as the admission plugin picks it
pub fn default_storage_class(classes: Vec<StorageClass>) -> Option<StorageClass> {
    classes
        .into_iter()
        .filter(|sc| annotation_is_true(sc, ANN_DEFAULT_STORAGE_CLASS))
        .max_by(|a, b| {
            a.creation_timestamp()
                .map(|t| t.0)
                .cmp(&b.creation_timestamp().map(|t| t.0))
                .then_with(|| b.name_any().cmp(&a.name_any()))
        })
}

/// Render the claim spec for a DataVolume
pub async fn render_pvc_spec(
    store: &dyn ObjectStore,
    dv: &DataVolume,
    settings: &ClusterSettings,
) -> Result<PersistentVolumeClaimSpec> {
    if let Some(pvc) = &dv.spec.pvc {
        return Ok(pvc.clone());
    }
    let Some(storage) = &dv.spec.storage else {
        return Err(Error::InvalidSpec(
            "datavolume one of {pvc, storage} field is required".to_string(),
        ));
    };

    let mut spec = PersistentVolumeClaimSpec {
        access_modes: storage.access_modes.clone().filter(|m| !m.is_empty()),
        selector: storage.selector.clone(),
        resources: storage.resources.clone(),
        volume_name: storage.volume_name.clone(),
        storage_class_name: storage.storage_class_name.clone(),
        volume_mode: storage.volume_mode.clone().filter(|m| !m.is_empty()),
        data_source: storage.data_source.clone(),
        data_source_ref: storage.data_source_ref.clone(),
        ..Default::default()
    };

    if dv.spec.content_type == Some(DataVolumeContentType::Archive) {
        if spec.volume_mode.as_deref() == Some(VOLUME_MODE_BLOCK) {
            return Err(Error::InvalidSpec(
                "DataVolume with ContentType Archive cannot have block volumeMode".to_string(),
            ));
        }
        spec.volume_mode = Some(VOLUME_MODE_FILESYSTEM.to_string());
    }

    let requested_class = storage.storage_class_name.as_deref();
    match storage_class_by_name(store, requested_class).await? {
        Some(class) => {
            let class_name = class.name_any();
            spec.storage_class_name = Some(class_name.clone());
            let profile = store.get_storage_profile(&class_name).await?;
            apply_profile_defaults(&mut spec, &class_name, profile.as_ref())?;
        }
        None => {
            if let Some(name) = requested_class.filter(|n| !n.is_empty()) {
                return Err(Error::StorageClassNotFound(name.to_string()));
            }
            if spec.access_modes.is_none() {
                debug!(
                    "No storage class for {}/{} and no access modes",
                    dv.namespace().unwrap_or_default(),
                    dv.name_any()
                );
                return Err(Error::NoDefaultStorageClass);
            }
        }
    }

    match requested_storage(&spec).cloned() {
        Some(size) => {
            let bytes = size.to_bytes()?;
            if resolve_volume_mode(spec.volume_mode.as_deref()) == VOLUME_MODE_FILESYSTEM {
                let overhead = settings.filesystem_overhead(spec.storage_class_name.as_deref());
                set_requested_storage(&mut spec, format_bytes(inflate_for_overhead(bytes, overhead)));
            }
        }
        None if is_clone_source(dv) => {}
        None => {
            return Err(Error::InvalidSpec(
                "Datavolume Spec is not valid - missing storage size".to_string(),
            ))
        }
    }

    Ok(spec)
}

fn is_clone_source(dv: &DataVolume) -> bool {
    dv.spec.source_ref.is_some()
        || matches!(
            dv.spec.source,
            Some(DataVolumeSource::Pvc(_) | DataVolumeSource::Snapshot(_))
        )
}

/// Fill access modes and volume mode from the profile's claim property sets
fn apply_profile_defaults(
    spec: &mut PersistentVolumeClaimSpec,
    class_name: &str,
    profile: Option<&StorageProfile>,
) -> Result<()> {
    let sets = profile
        .and_then(|p| p.status.as_ref())
        .map(|s| s.claim_property_sets.as_slice())
        .unwrap_or_default();
    let no_access_modes = || {
        Error::InvalidSpec(format!(
            "no accessMode defined on DV nor on StorageProfile for {} StorageClass",
            class_name
        ))
    };

    match (spec.access_modes.is_some(), spec.volume_mode.is_some()) {
        (false, false) => {
            let first = sets
                .first()
                .filter(|s| !s.access_modes.is_empty())
                .ok_or_else(no_access_modes)?;
            spec.access_modes = Some(first.access_modes.clone());
            spec.volume_mode = first.volume_mode.clone();
        }
        (false, true) => {
            let wanted = spec.volume_mode.as_deref();
            let matching = sets
                .iter()
                .find(|s| s.volume_mode.as_deref() == wanted && !s.access_modes.is_empty())
                .or_else(|| sets.iter().find(|s| !s.access_modes.is_empty()))
                .ok_or_else(no_access_modes)?;
            spec.access_modes = Some(matching.access_modes.clone());
        }
        (true, false) => {
            let requested = spec.access_modes.clone().unwrap_or_default();
            spec.volume_mode = sets
                .iter()
                .find(|s| s.access_modes.iter().any(|m| requested.contains(m)))
                .or_else(|| sets.first())
                .and_then(|s| s.volume_mode.clone());
        }
        (true, true) => {}
    }
    Ok(())
}
