//! Static PV adoption
//!
//! A DataVolume annotated with `checkStaticVolume` first looks for
//! Available PVs whose claimRef already names its claim. The PVC is created
//! listing the candidates and is accepted once it binds to one of them.

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::info;

use crate::error::{Error, Result};

use super::annotations::{
    annotation, has_annotation, remove_annotation, set_annotation, ANN_CHECK_STATIC_VOLUME,
    ANN_PERSISTENT_VOLUME_LIST, ANN_POPULATED_FOR,
};
use super::quantity::QuantityParser;
use super::reconciler::ReconcilerBase;
use super::render::{requested_storage, resolve_volume_mode, RESOURCE_STORAGE};
use super::store::ObjectKey;
use super::sync::{ReconcileResult, SyncState};

/// Whether the claim is still waiting for its PV
pub fn is_unbound(pvc: &PersistentVolumeClaim) -> bool {
    let bound = pvc.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound");
    let volume = pvc
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.as_deref())
        .unwrap_or_default();
    !bound || volume.is_empty()
}

/// Check a PV against a claim spec the way the binder would
pub fn volume_satisfies_claim(
    pv: &PersistentVolume,
    claim: &PersistentVolumeClaimSpec,
) -> std::result::Result<(), String> {
    let name = pv.name_any();
    if pv.metadata.deletion_timestamp.is_some() {
        return Err(format!("volume {} is being deleted", name));
    }
    let Some(spec) = pv.spec.as_ref() else {
        return Err(format!("volume {} has no spec", name));
    };

    let requested = match requested_storage(claim) {
        Some(q) => q.to_bytes().map_err(|e| e.to_string())?,
        None => 0,
    };
    let capacity = match spec.capacity.as_ref().and_then(|c| c.get(RESOURCE_STORAGE)) {
        Some(q) => q.to_bytes().map_err(|e| e.to_string())?,
        None => 0,
    };
    if capacity < requested {
        return Err(format!(
            "requested {} bytes but volume {} has {}",
            requested, name, capacity
        ));
    }

    let claim_class = claim.storage_class_name.as_deref().unwrap_or_default();
    let volume_class = spec.storage_class_name.as_deref().unwrap_or_default();
    if claim_class != volume_class {
        return Err(format!(
            "storage class {:?} does not match volume class {:?}",
            claim_class, volume_class
        ));
    }

    if resolve_volume_mode(claim.volume_mode.as_deref())
        != resolve_volume_mode(spec.volume_mode.as_deref())
    {
        return Err(format!("volume mode of {} does not match", name));
    }

    let offered = spec.access_modes.as_deref().unwrap_or_default();
    let wanted = claim.access_modes.as_deref().unwrap_or_default();
    if !wanted.iter().all(|m| offered.contains(m)) {
        return Err(format!("access modes {:?} not offered by {}", wanted, name));
    }

    if let Some(selector) = &claim.selector {
        if !selector_matches(selector, pv.labels()) {
            return Err(format!("volume {} does not match claim selector", name));
        }
    }
    Ok(())
}

/// Evaluate a label selector
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let labels_match = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));
    labels_match
        && selector
            .match_expressions
            .iter()
            .flatten()
            .all(|req| requirement_matches(req, labels))
}

fn requirement_matches(req: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let value = labels.get(&req.key);
    let values = req.values.as_deref().unwrap_or_default();
    match req.operator.as_str() {
        "In" => value.is_some_and(|v| values.contains(v)),
        "NotIn" => value.map_or(true, |v| !values.contains(v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        _ => false,
    }
}

/// Names of the Available PVs reserved for the claim that fit its spec
pub fn matching_volumes(
    volumes: &[PersistentVolume],
    claim: &PersistentVolumeClaimSpec,
) -> Vec<String> {
    volumes
        .iter()
        .filter(|pv| pv.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Available"))
        .filter(|pv| volume_satisfies_claim(pv, claim).is_ok())
        .map(|pv| pv.name_any())
        .collect()
}

impl ReconcilerBase {
    /// Drive static PV adoption. Sets `state.result` to stop the sync when
    /// the claim was just created or is still unbound.
    pub(crate) async fn handle_static_volume(&self, state: &mut SyncState) -> Result<()> {
        if !has_annotation(&state.dv_mutated, ANN_CHECK_STATIC_VOLUME) {
            return Ok(());
        }
        let key = state.key();

        let Some(pvc) = state.pvc.clone() else {
            let spec = state
                .pvc_spec
                .as_ref()
                .ok_or_else(|| Error::InvariantViolation("missing pvc spec".to_string()))?;
            let volumes = matching_volumes(&self.store.persistent_volumes_for_claim(&key), spec);
            if volumes.is_empty() {
                info!("No PVs for DataVolume {}", key);
                return Ok(());
            }
            for pv in &volumes {
                info!("Found matching volume {} for DataVolume {}", pv, key);
            }

            let list = serde_json::to_string(&volumes)?;
            self.handle_pvc_creation(state, move |_, pvc| {
                set_annotation(pvc, ANN_PERSISTENT_VOLUME_LIST, list);
                Ok(())
            })
            .await?;
            state.result = Some(ReconcileResult::done());
            return Ok(());
        };

        let Some(list) = annotation(&pvc, ANN_PERSISTENT_VOLUME_LIST) else {
            return Ok(());
        };
        if is_unbound(&pvc) {
            state.result = Some(ReconcileResult::done());
            return Ok(());
        }

        let volumes: Vec<String> = serde_json::from_str(list)?;
        let bound_to = pvc
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.clone())
            .unwrap_or_default();

        if volumes.contains(&bound_to) {
            let mut updated = pvc.clone();
            set_annotation(&mut updated, ANN_POPULATED_FOR, state.dv_mutated.name_any());
            remove_annotation(&mut updated, ANN_PERSISTENT_VOLUME_LIST);
            state.pvc = Some(self.store.update_pvc(&updated).await?);
            return Ok(());
        }

        self.store.delete_pvc(&ObjectKey::from_resource(&pvc)).await?;
        Err(Error::UnexpectedPersistentVolume {
            pvc: pvc.name_any(),
            pv: bound_to,
        })
    }
}
