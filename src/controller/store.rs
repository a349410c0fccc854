//! Object store seam
//!
//! The reconciler talks to the cluster only through [`ObjectStore`]. The
//! production implementation wraps a `kube::Client` and kube-runtime
//! reflector caches; tests use the in-memory store in `fake`.

use std::fmt;
use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::{CSIDriver, StorageClass};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    client::Client,
    core::GroupVersionKind,
    runtime::{reflector, watcher, WatchStreamExt},
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::crd::{
    CDIConfig, DataSource, DataVolume, DataVolumePhase, StorageProfile, VolumeCloneSource,
    VolumeImportSource, VolumeUploadSource, CDI_CONFIG_NAME,
};
use crate::error::{Error, Result};

use super::annotations::LABEL_PROMETHEUS;

/// Namespace/name pair identifying a namespaced object
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_resource<K: ResourceExt>(obj: &K) -> Self {
        Self::new(obj.namespace().unwrap_or_default(), obj.name_any())
    }

    /// Parse a "namespace/name" string
    pub fn parse(s: &str) -> Option<Self> {
        let (namespace, name) = s.split_once('/')?;
        if namespace.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(namespace, name))
    }
}

/// Formats as "namespace/name", the claim-ref index key
impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Kinds of populator source objects
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PopulatorKind {
    Import,
    Upload,
    Clone,
}

impl PopulatorKind {
    pub fn kind(&self) -> &'static str {
        match self {
            PopulatorKind::Import => "VolumeImportSource",
            PopulatorKind::Upload => "VolumeUploadSource",
            PopulatorKind::Clone => "VolumeCloneSource",
        }
    }

    /// Name prefix; the DataVolume UID is appended
    pub fn name_prefix(&self) -> &'static str {
        match self {
            PopulatorKind::Import => "volume-import-source",
            PopulatorKind::Upload => "volume-upload-source",
            PopulatorKind::Clone => "volume-clone-source",
        }
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "VolumeImportSource" => Some(PopulatorKind::Import),
            "VolumeUploadSource" => Some(PopulatorKind::Upload),
            "VolumeCloneSource" => Some(PopulatorKind::Clone),
            _ => None,
        }
    }
}

/// A populator source object to create
#[derive(Clone, Debug, PartialEq)]
pub enum PopulatorSource {
    Import(VolumeImportSource),
    Upload(VolumeUploadSource),
    Clone(VolumeCloneSource),
}

impl PopulatorSource {
    pub fn kind(&self) -> PopulatorKind {
        match self {
            PopulatorSource::Import(_) => PopulatorKind::Import,
            PopulatorSource::Upload(_) => PopulatorKind::Upload,
            PopulatorSource::Clone(_) => PopulatorKind::Clone,
        }
    }

    pub fn key(&self) -> ObjectKey {
        match self {
            PopulatorSource::Import(s) => ObjectKey::from_resource(s),
            PopulatorSource::Upload(s) => ObjectKey::from_resource(s),
            PopulatorSource::Clone(s) => ObjectKey::from_resource(s),
        }
    }
}

/// Cluster object store used by the reconciler.
///
/// Updates carry the object's resourceVersion; a stale write fails with a
/// conflict and the work queue reruns the key. Methods without `async` read
/// from informer caches.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_data_volume(&self, key: &ObjectKey) -> Result<Option<DataVolume>>;
    /// Write metadata and spec
    async fn update_data_volume(&self, dv: &DataVolume) -> Result<DataVolume>;
    /// Write the status subresource
    async fn update_data_volume_status(&self, dv: &DataVolume) -> Result<DataVolume>;
    async fn delete_data_volume(&self, key: &ObjectKey) -> Result<()>;
    fn data_volumes_by_phase(&self, phase: DataVolumePhase) -> Vec<DataVolume>;

    async fn get_pvc(&self, key: &ObjectKey) -> Result<Option<PersistentVolumeClaim>>;
    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;
    async fn update_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;
    async fn delete_pvc(&self, key: &ObjectKey) -> Result<()>;

    /// PVs whose claimRef names the given claim
    fn persistent_volumes_for_claim(&self, claim: &ObjectKey) -> Vec<PersistentVolume>;

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>>;
    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>>;
    async fn get_storage_profile(&self, name: &str) -> Result<Option<StorageProfile>>;
    async fn csi_driver_exists(&self, name: &str) -> Result<bool>;

    fn data_source(&self, key: &ObjectKey) -> Option<DataSource>;
    async fn get_cdi_config(&self) -> Result<Option<CDIConfig>>;

    /// Whether the controller may update the owner's finalizers
    async fn can_update_finalizers(&self, namespace: &str, owner: &OwnerReference)
        -> Result<bool>;

    /// Pods labelled for progress scraping in a namespace
    async fn list_worker_pods(&self, namespace: &str) -> Result<Vec<Pod>>;

    async fn populator_source_exists(&self, kind: PopulatorKind, key: &ObjectKey)
        -> Result<bool>;
    /// Create a populator source; an existing object is not an error
    async fn create_populator_source(&self, source: &PopulatorSource) -> Result<()>;
    /// Delete a populator source; a missing object is not an error
    async fn delete_populator_source(&self, kind: PopulatorKind, key: &ObjectKey) -> Result<()>;
}

// ============================================================================
// Kubernetes-backed store
// ============================================================================

/// Store backed by the Kubernetes API and reflector caches
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    data_volumes: reflector::Store<DataVolume>,
    persistent_volumes: reflector::Store<PersistentVolume>,
    data_sources: reflector::Store<DataSource>,
}

impl KubeStore {
    /// Start the reflectors backing the cached views and wait for their first sync
    pub async fn start(client: Client) -> Result<Self> {
        let data_volumes = spawn_reflector(Api::<DataVolume>::all(client.clone()));
        let persistent_volumes = spawn_reflector(Api::<PersistentVolume>::all(client.clone()));
        let data_sources = spawn_reflector(Api::<DataSource>::all(client.clone()));

        for (name, ready) in [
            ("DataVolume", data_volumes.wait_until_ready().await),
            ("PersistentVolume", persistent_volumes.wait_until_ready().await),
            ("DataSource", data_sources.wait_until_ready().await),
        ] {
            ready.map_err(|e| {
                Error::ConfigError(format!("{} cache never became ready: {}", name, e))
            })?;
        }

        Ok(Self {
            client,
            data_volumes,
            persistent_volumes,
            data_sources,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn data_volume_cache(&self) -> reflector::Store<DataVolume> {
        self.data_volumes.clone()
    }
}

fn spawn_reflector<K>(api: Api<K>) -> reflector::Store<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .touched_objects();
    tokio::spawn(async move {
        stream
            .for_each(|res| async move {
                if let Err(e) = res {
                    warn!("Reflector watch error: {}", e);
                }
            })
            .await;
    });
    reader
}

async fn create_ignoring_exists<K>(api: Api<K>, obj: &K) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            debug!("{} already exists", obj.name_any());
            Ok(())
        }
        Err(e) => Err(Error::KubeError(e)),
    }
}

async fn delete_ignoring_missing<K>(api: Api<K>, name: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(Error::KubeError(e)),
    }
}

fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_data_volume(&self, key: &ObjectKey) -> Result<Option<DataVolume>> {
        let api: Api<DataVolume> = Api::namespaced(self.client.clone(), &key.namespace);
        api.get_opt(&key.name).await.map_err(Error::KubeError)
    }

    async fn update_data_volume(&self, dv: &DataVolume) -> Result<DataVolume> {
        let key = ObjectKey::from_resource(dv);
        let api: Api<DataVolume> = Api::namespaced(self.client.clone(), &key.namespace);
        api.replace(&key.name, &PostParams::default(), dv)
            .await
            .map_err(Error::KubeError)
    }

    async fn update_data_volume_status(&self, dv: &DataVolume) -> Result<DataVolume> {
        let key = ObjectKey::from_resource(dv);
        let api: Api<DataVolume> = Api::namespaced(self.client.clone(), &key.namespace);
        api.replace_status(&key.name, &PostParams::default(), serde_json::to_vec(dv)?)
            .await
            .map_err(Error::KubeError)
    }

    async fn delete_data_volume(&self, key: &ObjectKey) -> Result<()> {
        let api: Api<DataVolume> = Api::namespaced(self.client.clone(), &key.namespace);
        delete_ignoring_missing(api, &key.name).await
    }

    fn data_volumes_by_phase(&self, phase: DataVolumePhase) -> Vec<DataVolume> {
        self.data_volumes
            .state()
            .into_iter()
            .filter(|dv| dv.phase() == phase)
            .map(|dv| (*dv).clone())
            .collect()
    }

    async fn get_pvc(&self, key: &ObjectKey) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &key.namespace);
        api.get_opt(&key.name).await.map_err(Error::KubeError)
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let namespace = pvc.namespace().unwrap_or_default();
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), pvc)
            .await
            .map_err(Error::KubeError)
    }

    async fn update_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let key = ObjectKey::from_resource(pvc);
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &key.namespace);
        api.replace(&key.name, &PostParams::default(), pvc)
            .await
            .map_err(Error::KubeError)
    }

    async fn delete_pvc(&self, key: &ObjectKey) -> Result<()> {
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &key.namespace);
        delete_ignoring_missing(api, &key.name).await
    }

    fn persistent_volumes_for_claim(&self, claim: &ObjectKey) -> Vec<PersistentVolume> {
        let wanted = claim.to_string();
        self.persistent_volumes
            .state()
            .into_iter()
            .filter(|pv| claim_ref_index_key(pv).as_deref() == Some(wanted.as_str()))
            .map(|pv| (*pv).clone())
            .collect()
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        api.get_opt(name).await.map_err(Error::KubeError)
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?
            .items)
    }

    async fn get_storage_profile(&self, name: &str) -> Result<Option<StorageProfile>> {
        let api: Api<StorageProfile> = Api::all(self.client.clone());
        api.get_opt(name).await.map_err(Error::KubeError)
    }

    async fn csi_driver_exists(&self, name: &str) -> Result<bool> {
        let api: Api<CSIDriver> = Api::all(self.client.clone());
        Ok(api
            .get_opt(name)
            .await
            .map_err(Error::KubeError)?
            .is_some())
    }

    fn data_source(&self, key: &ObjectKey) -> Option<DataSource> {
        let obj_ref = reflector::ObjectRef::new(&key.name).within(&key.namespace);
        self.data_sources.get(&obj_ref).map(|ds| (*ds).clone())
    }

    async fn get_cdi_config(&self) -> Result<Option<CDIConfig>> {
        let api: Api<CDIConfig> = Api::all(self.client.clone());
        api.get_opt(CDI_CONFIG_NAME).await.map_err(Error::KubeError)
    }

    async fn can_update_finalizers(
        &self,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Result<bool> {
        let (group, version) = split_api_version(&owner.api_version);
        let gvk = GroupVersionKind::gvk(group, version, &owner.kind);
        let (resource, _) = kube::discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(Error::KubeError)?;

        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    namespace: Some(namespace.to_string()),
                    verb: Some("update".to_string()),
                    group: Some(group.to_string()),
                    version: Some(version.to_string()),
                    resource: Some(resource.plural),
                    subresource: Some("finalizers".to_string()),
                    name: Some(owner.name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let response = api
            .create(&PostParams::default(), &review)
            .await
            .map_err(Error::KubeError)?;
        Ok(response.status.map(|s| s.allowed).unwrap_or(false))
    }

    async fn list_worker_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .list(&ListParams::default().labels(LABEL_PROMETHEUS))
            .await
            .map_err(Error::KubeError)?
            .items)
    }

    async fn populator_source_exists(
        &self,
        kind: PopulatorKind,
        key: &ObjectKey,
    ) -> Result<bool> {
        let client = self.client.clone();
        let found = match kind {
            PopulatorKind::Import => Api::<VolumeImportSource>::namespaced(client, &key.namespace)
                .get_opt(&key.name)
                .await
                .map(|o| o.is_some()),
            PopulatorKind::Upload => Api::<VolumeUploadSource>::namespaced(client, &key.namespace)
                .get_opt(&key.name)
                .await
                .map(|o| o.is_some()),
            PopulatorKind::Clone => Api::<VolumeCloneSource>::namespaced(client, &key.namespace)
                .get_opt(&key.name)
                .await
                .map(|o| o.is_some()),
        };
        found.map_err(Error::KubeError)
    }

    async fn create_populator_source(&self, source: &PopulatorSource) -> Result<()> {
        let client = self.client.clone();
        let namespace = source.key().namespace;
        match source {
            PopulatorSource::Import(s) => {
                create_ignoring_exists(Api::namespaced(client, &namespace), s).await
            }
            PopulatorSource::Upload(s) => {
                create_ignoring_exists(Api::namespaced(client, &namespace), s).await
            }
            PopulatorSource::Clone(s) => {
                create_ignoring_exists(Api::namespaced(client, &namespace), s).await
            }
        }
    }

    async fn delete_populator_source(&self, kind: PopulatorKind, key: &ObjectKey) -> Result<()> {
        let client = self.client.clone();
        match kind {
            PopulatorKind::Import => {
                delete_ignoring_missing(
                    Api::<VolumeImportSource>::namespaced(client, &key.namespace),
                    &key.name,
                )
                .await
            }
            PopulatorKind::Upload => {
                delete_ignoring_missing(
                    Api::<VolumeUploadSource>::namespaced(client, &key.namespace),
                    &key.name,
                )
                .await
            }
            PopulatorKind::Clone => {
                delete_ignoring_missing(
                    Api::<VolumeCloneSource>::namespaced(client, &key.namespace),
                    &key.name,
                )
                .await
            }
        }
    }
}

// ============================================================================
// Index keys
// ============================================================================

/// "namespace/name" of the claim a PV is reserved for
pub fn claim_ref_index_key(pv: &PersistentVolume) -> Option<String> {
    let claim_ref = pv.spec.as_ref()?.claim_ref.as_ref()?;
    Some(format!(
        "{}/{}",
        claim_ref.namespace.as_deref()?,
        claim_ref.name.as_deref()?
    ))
}

/// Storage class of a PV, only while the PV is Available
pub fn available_pv_index_key(pv: &PersistentVolume) -> Option<String> {
    let available = pv.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Available");
    if !available {
        return None;
    }
    pv.spec.as_ref()?.storage_class_name.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ObjectReference, PersistentVolumeSpec, PersistentVolumeStatus,
    };

    fn pv(claim: Option<(&str, &str)>, class: &str, phase: &str) -> PersistentVolume {
        PersistentVolume {
            spec: Some(PersistentVolumeSpec {
                claim_ref: claim.map(|(ns, name)| ObjectReference {
                    namespace: Some(ns.to_string()),
                    name: Some(name.to_string()),
                    ..Default::default()
                }),
                storage_class_name: Some(class.to_string()),
                ..Default::default()
            }),
            status: Some(PersistentVolumeStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_object_key_parse_and_display() {
        let key = ObjectKey::parse("default/test").unwrap();
        assert_eq!(key, ObjectKey::new("default", "test"));
        assert_eq!(key.to_string(), "default/test");
        assert!(ObjectKey::parse("no-slash").is_none());
        assert!(ObjectKey::parse("/name").is_none());
    }

    #[test]
    fn test_index_keys() {
        let bound = pv(Some(("default", "test")), "local", "Bound");
        assert_eq!(claim_ref_index_key(&bound).as_deref(), Some("default/test"));
        assert_eq!(available_pv_index_key(&bound), None);

        let free = pv(None, "local", "Available");
        assert_eq!(claim_ref_index_key(&free), None);
        assert_eq!(available_pv_index_key(&free).as_deref(), Some("local"));
    }

    #[test]
    fn test_split_api_version() {
        assert_eq!(split_api_version("v1"), ("", "v1"));
        assert_eq!(
            split_api_version("kubevirt.io/v1"),
            ("kubevirt.io", "v1")
        );
    }

    #[test]
    fn test_populator_kind_names() {
        for kind in [
            PopulatorKind::Import,
            PopulatorKind::Upload,
            PopulatorKind::Clone,
        ] {
            assert_eq!(PopulatorKind::from_kind(kind.kind()), Some(kind));
        }
        assert_eq!(PopulatorKind::from_kind("Pod"), None);
    }
}
