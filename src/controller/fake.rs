//! In-memory object store and event recorder
//!
//! Mirrors the API server behaviour the reconciler depends on: resource
//! version conflicts, the status subresource split, AlreadyExists on create
//! and quota rejections. Used by the unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use kube::ResourceExt;

use crate::crd::{CDIConfig, DataSource, DataVolume, DataVolumePhase, StorageProfile};
use crate::error::{api_error, Result};

use super::events::{EventRecorder, EventType};
use super::store::{claim_ref_index_key, ObjectKey, ObjectStore, PopulatorKind, PopulatorSource};

#[derive(Default)]
struct FakeState {
    data_volumes: BTreeMap<ObjectKey, DataVolume>,
    pvcs: BTreeMap<ObjectKey, PersistentVolumeClaim>,
    pvs: Vec<PersistentVolume>,
    storage_classes: BTreeMap<String, StorageClass>,
    storage_profiles: BTreeMap<String, StorageProfile>,
    csi_drivers: BTreeSet<String>,
    data_sources: BTreeMap<ObjectKey, DataSource>,
    cdi_config: Option<CDIConfig>,
    denied_finalizer_owners: BTreeSet<String>,
    pods: Vec<Pod>,
    populator_sources: HashMap<(PopulatorKind, ObjectKey), PopulatorSource>,
    quota_exceeded: bool,
    resource_version: u64,
    uid: u64,
    data_volume_updates: usize,
    status_updates: usize,
    pvc_updates: usize,
}

impl FakeState {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn stamp<K: ResourceExt>(&mut self, obj: &mut K) {
        if obj.meta().uid.is_none() {
            self.uid += 1;
            obj.meta_mut().uid = Some(format!("uid-{}", self.uid));
        }
        if obj.meta().creation_timestamp.is_none() {
            obj.meta_mut().creation_timestamp = Some(Time(Utc::now()));
        }
        obj.meta_mut().resource_version = Some(self.next_version());
    }
}

fn check_version<K: ResourceExt>(stored: &K, incoming: &K) -> Result<()> {
    if stored.resource_version() != incoming.resource_version() {
        return Err(api_error(
            409,
            "Conflict",
            format!(
                "Operation cannot be fulfilled on \"{}\": the object has been modified",
                incoming.name_any()
            ),
        ));
    }
    Ok(())
}

fn not_found(kind: &str, key: &ObjectKey) -> crate::error::Error {
    api_error(404, "NotFound", format!("{} \"{}\" not found", kind, key))
}

/// In-memory [`ObjectStore`]
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<FakeState>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    pub fn insert_data_volume(&self, mut dv: DataVolume) -> DataVolume {
        let mut state = self.state();
        state.stamp(&mut dv);
        state
            .data_volumes
            .insert(ObjectKey::from_resource(&dv), dv.clone());
        dv
    }

    pub fn insert_pvc(&self, mut pvc: PersistentVolumeClaim) -> PersistentVolumeClaim {
        let mut state = self.state();
        state.stamp(&mut pvc);
        state.pvcs.insert(ObjectKey::from_resource(&pvc), pvc.clone());
        pvc
    }

    pub fn insert_pv(&self, pv: PersistentVolume) {
        self.state().pvs.push(pv);
    }

    pub fn insert_storage_class(&self, sc: StorageClass) {
        self.state().storage_classes.insert(sc.name_any(), sc);
    }

    pub fn insert_storage_profile(&self, profile: StorageProfile) {
        self.state()
            .storage_profiles
            .insert(profile.name_any(), profile);
    }

    pub fn insert_csi_driver(&self, name: &str) {
        self.state().csi_drivers.insert(name.to_string());
    }

    pub fn insert_data_source(&self, ds: DataSource) {
        self.state()
            .data_sources
            .insert(ObjectKey::from_resource(&ds), ds);
    }

    pub fn set_cdi_config(&self, config: CDIConfig) {
        self.state().cdi_config = Some(config);
    }

    pub fn insert_pod(&self, pod: Pod) {
        self.state().pods.push(pod);
    }

    /// Deny finalizer updates on the owner with this UID
    pub fn deny_finalizer_updates(&self, owner_uid: &str) {
        self.state()
            .denied_finalizer_owners
            .insert(owner_uid.to_string());
    }

    /// Reject PVC creation as a resource quota would
    pub fn set_quota_exceeded(&self, exceeded: bool) {
        self.state().quota_exceeded = exceeded;
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn data_volume(&self, key: &ObjectKey) -> Option<DataVolume> {
        self.state().data_volumes.get(key).cloned()
    }

    pub fn pvc(&self, key: &ObjectKey) -> Option<PersistentVolumeClaim> {
        self.state().pvcs.get(key).cloned()
    }

    pub fn populator_source(&self, kind: PopulatorKind, key: &ObjectKey) -> Option<PopulatorSource> {
        self.state()
            .populator_sources
            .get(&(kind, key.clone()))
            .cloned()
    }

    pub fn data_volume_update_count(&self) -> usize {
        self.state().data_volume_updates
    }

    pub fn status_update_count(&self) -> usize {
        self.state().status_updates
    }

    pub fn pvc_update_count(&self) -> usize {
        self.state().pvc_updates
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get_data_volume(&self, key: &ObjectKey) -> Result<Option<DataVolume>> {
        Ok(self.state().data_volumes.get(key).cloned())
    }

    async fn update_data_volume(&self, dv: &DataVolume) -> Result<DataVolume> {
        let key = ObjectKey::from_resource(dv);
        let mut state = self.state();
        let stored = state
            .data_volumes
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found("datavolumes", &key))?;
        check_version(&stored, dv)?;

        let mut updated = dv.clone();
        updated.status = stored.status;
        updated.metadata.resource_version = Some(state.next_version());
        state.data_volume_updates += 1;
        state.data_volumes.insert(key, updated.clone());
        Ok(updated)
    }

    async fn update_data_volume_status(&self, dv: &DataVolume) -> Result<DataVolume> {
        let key = ObjectKey::from_resource(dv);
        let mut state = self.state();
        let mut stored = state
            .data_volumes
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found("datavolumes", &key))?;
        check_version(&stored, dv)?;

        stored.status = dv.status.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.status_updates += 1;
        state.data_volumes.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete_data_volume(&self, key: &ObjectKey) -> Result<()> {
        self.state().data_volumes.remove(key);
        Ok(())
    }

    fn data_volumes_by_phase(&self, phase: DataVolumePhase) -> Vec<DataVolume> {
        self.state()
            .data_volumes
            .values()
            .filter(|dv| dv.phase() == phase)
            .cloned()
            .collect()
    }

    async fn get_pvc(&self, key: &ObjectKey) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.state().pvcs.get(key).cloned())
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let key = ObjectKey::from_resource(pvc);
        let mut state = self.state();
        if state.quota_exceeded {
            return Err(api_error(
                403,
                "Forbidden",
                format!(
                    "persistentvolumeclaims \"{}\" is forbidden: exceeded quota: storage-quota",
                    key.name
                ),
            ));
        }
        if state.pvcs.contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("persistentvolumeclaims \"{}\" already exists", key.name),
            ));
        }
        let mut created = pvc.clone();
        state.stamp(&mut created);
        state.pvcs.insert(key, created.clone());
        Ok(created)
    }

    async fn update_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let key = ObjectKey::from_resource(pvc);
        let mut state = self.state();
        let stored = state
            .pvcs
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found("persistentvolumeclaims", &key))?;
        check_version(&stored, pvc)?;

        let mut updated = pvc.clone();
        updated.status = stored.status;
        updated.metadata.resource_version = Some(state.next_version());
        state.pvc_updates += 1;
        state.pvcs.insert(key, updated.clone());
        Ok(updated)
    }

    async fn delete_pvc(&self, key: &ObjectKey) -> Result<()> {
        self.state().pvcs.remove(key);
        Ok(())
    }

    fn persistent_volumes_for_claim(&self, claim: &ObjectKey) -> Vec<PersistentVolume> {
        let wanted = claim.to_string();
        self.state()
            .pvs
            .iter()
            .filter(|pv| claim_ref_index_key(pv).as_deref() == Some(wanted.as_str()))
            .cloned()
            .collect()
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        Ok(self.state().storage_classes.get(name).cloned())
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        Ok(self.state().storage_classes.values().cloned().collect())
    }

    async fn get_storage_profile(&self, name: &str) -> Result<Option<StorageProfile>> {
        Ok(self.state().storage_profiles.get(name).cloned())
    }

    async fn csi_driver_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state().csi_drivers.contains(name))
    }

    fn data_source(&self, key: &ObjectKey) -> Option<DataSource> {
        self.state().data_sources.get(key).cloned()
    }

    async fn get_cdi_config(&self) -> Result<Option<CDIConfig>> {
        Ok(self.state().cdi_config.clone())
    }

    async fn can_update_finalizers(
        &self,
        _namespace: &str,
        owner: &OwnerReference,
    ) -> Result<bool> {
        Ok(!self.state().denied_finalizer_owners.contains(&owner.uid))
    }

    async fn list_worker_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        Ok(self
            .state()
            .pods
            .iter()
            .filter(|p| p.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    async fn populator_source_exists(
        &self,
        kind: PopulatorKind,
        key: &ObjectKey,
    ) -> Result<bool> {
        Ok(self
            .state()
            .populator_sources
            .contains_key(&(kind, key.clone())))
    }

    async fn create_populator_source(&self, source: &PopulatorSource) -> Result<()> {
        self.state()
            .populator_sources
            .entry((source.kind(), source.key()))
            .or_insert_with(|| source.clone());
        Ok(())
    }

    async fn delete_populator_source(&self, kind: PopulatorKind, key: &ObjectKey) -> Result<()> {
        self.state().populator_sources.remove(&(kind, key.clone()));
        Ok(())
    }
}

/// An event captured by [`RecordingRecorder`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: String,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

/// Recorder that keeps events in memory
#[derive(Default)]
pub struct RecordingRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    pub fn count(&self, reason: &str) -> usize {
        self.events().iter().filter(|e| e.reason == reason).count()
    }

    pub fn find(&self, reason: &str) -> Option<RecordedEvent> {
        self.events().into_iter().find(|e| e.reason == reason)
    }
}

impl EventRecorder for RecordingRecorder {
    fn record(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        let object = format!(
            "{}/{}",
            object.namespace.as_deref().unwrap_or_default(),
            object.name.as_deref().unwrap_or_default()
        );
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedEvent {
                object,
                event_type,
                reason: reason.to_string(),
                message: message.to_string(),
            });
    }
}
