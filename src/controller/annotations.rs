//! Annotation and label keys shared with worker pods, populators and users
//!
//! PVC annotations written by the worker pods are the authoritative source
//! of transfer state; everything here is bit-significant on the wire.

use kube::ResourceExt;

// ============================================================================
// DataVolume behaviour toggles
// ============================================================================

pub const ANN_PRE_POPULATED: &str = "cdi.kubevirt.io/storage.prePopulated";
pub const ANN_POPULATED_FOR: &str = "cdi.kubevirt.io/storage.populatedFor";
pub const ANN_CHECK_STATIC_VOLUME: &str = "cdi.kubevirt.io/storage.checkStaticVolume";
pub const ANN_PERSISTENT_VOLUME_LIST: &str = "cdi.kubevirt.io/storage.persistentVolumeList";
pub const ANN_DELETE_AFTER_COMPLETION: &str = "cdi.kubevirt.io/storage.deleteAfterCompletion";
pub const ANN_USE_POPULATOR: &str = "cdi.kubevirt.io/storage.usePopulator";
pub const ANN_EXTENDED_CLONE_TOKEN: &str = "cdi.kubevirt.io/storage.extended.clone.token";
pub const ANN_ALLOW_CLAIM_ADOPTION: &str = "cdi.kubevirt.io/allowClaimAdoption";
pub const ANN_IMMEDIATE_BINDING: &str = "cdi.kubevirt.io/storage.bind.immediate.requested";
pub const ANN_POD_RETAIN_AFTER_COMPLETION: &str =
    "cdi.kubevirt.io/storage.pod.retainAfterCompletion";

// ============================================================================
// Ownership
// ============================================================================

pub const ANN_OWNED_BY_DATA_VOLUME: &str = "cdi.kubevirt.io/ownedByDataVolume";
pub const ANN_OWNER_UID: &str = "cdi.kubevirt.io/ownerUID";
pub const ANN_CREATED_FOR_DATA_VOLUME: &str = "cdi.kubevirt.io/createdForDataVolume";
pub const ANN_GARBAGE_COLLECTED: &str = "cdi.kubevirt.io/garbageCollected";

// ============================================================================
// Worker pod state reported on the PVC
// ============================================================================

pub const ANN_POD_PHASE: &str = "cdi.kubevirt.io/storage.pod.phase";
pub const ANN_POD_READY: &str = "cdi.kubevirt.io/storage.pod.ready";
pub const ANN_POD_RESTARTS: &str = "cdi.kubevirt.io/storage.pod.restarts";
pub const ANN_POPULATOR_PROGRESS: &str = "cdi.kubevirt.io/storage.populator.progress";
pub const ANN_SELECTED_NODE: &str = "volume.kubernetes.io/selected-node";

pub const ANN_BOUND_CONDITION: &str = "cdi.kubevirt.io/storage.condition.bound";
pub const ANN_BOUND_CONDITION_MESSAGE: &str = "cdi.kubevirt.io/storage.condition.bound.message";
pub const ANN_BOUND_CONDITION_REASON: &str = "cdi.kubevirt.io/storage.condition.bound.reason";
pub const ANN_RUNNING_CONDITION: &str = "cdi.kubevirt.io/storage.condition.running";
pub const ANN_RUNNING_CONDITION_MESSAGE: &str = "cdi.kubevirt.io/storage.condition.running.message";
pub const ANN_RUNNING_CONDITION_REASON: &str = "cdi.kubevirt.io/storage.condition.running.reason";
pub const ANN_SOURCE_RUNNING_CONDITION: &str = "cdi.kubevirt.io/storage.condition.source.running";
pub const ANN_SOURCE_RUNNING_CONDITION_MESSAGE: &str =
    "cdi.kubevirt.io/storage.condition.source.running.message";
pub const ANN_SOURCE_RUNNING_CONDITION_REASON: &str =
    "cdi.kubevirt.io/storage.condition.source.running.reason";

// ============================================================================
// Claim creation
// ============================================================================

pub const ANN_CONTENT_TYPE: &str = "cdi.kubevirt.io/storage.contentType";
pub const ANN_PREALLOCATION_REQUESTED: &str = "cdi.kubevirt.io/storage.preallocation.requested";
pub const ANN_PRIORITY_CLASS_NAME: &str = "cdi.kubevirt.io/storage.pod.priorityclassname";
pub const ANN_DEFAULT_STORAGE_CLASS: &str = "storageclass.kubernetes.io/is-default-class";

// ============================================================================
// Import
// ============================================================================

pub const ANN_IMPORT_POD: &str = "cdi.kubevirt.io/storage.import.importPodName";
pub const ANN_SOURCE: &str = "cdi.kubevirt.io/storage.import.source";
pub const ANN_ENDPOINT: &str = "cdi.kubevirt.io/storage.import.endpoint";
pub const ANN_SECRET: &str = "cdi.kubevirt.io/storage.import.secretName";
pub const ANN_CERT_CONFIG_MAP: &str = "cdi.kubevirt.io/storage.import.certConfigMap";
pub const ANN_REGISTRY_IMPORT_METHOD: &str = "cdi.kubevirt.io/storage.import.registryImportMethod";
pub const ANN_REGISTRY_IMAGE_STREAM: &str = "cdi.kubevirt.io/storage.import.registryImageStream";
pub const ANN_DISK_ID: &str = "cdi.kubevirt.io/storage.import.diskId";
pub const ANN_UUID: &str = "cdi.kubevirt.io/storage.import.uuid";
pub const ANN_BACKING_FILE: &str = "cdi.kubevirt.io/storage.import.backingFile";
pub const ANN_THUMBPRINT: &str = "cdi.kubevirt.io/storage.import.vddk.thumbprint";
pub const ANN_VDDK_INIT_IMAGE_URL: &str = "cdi.kubevirt.io/storage.pod.vddk.initimageurl";
pub const ANN_VDDK_HOST_CONNECTION: &str = "cdi.kubevirt.io/storage.pod.vddk.host";
pub const ANN_VDDK_VERSION: &str = "cdi.kubevirt.io/storage.pod.vddk.version";
pub const ANN_EXTRA_HEADERS: &str = "cdi.kubevirt.io/storage.import.extraHeaders";
pub const ANN_SECRET_EXTRA_HEADERS: &str = "cdi.kubevirt.io/storage.import.secretExtraHeaders";

pub const ANN_CURRENT_CHECKPOINT: &str = "cdi.kubevirt.io/storage.checkpoint.current";
pub const ANN_PREVIOUS_CHECKPOINT: &str = "cdi.kubevirt.io/storage.checkpoint.previous";
pub const ANN_FINAL_CHECKPOINT: &str = "cdi.kubevirt.io/storage.checkpoint.final";
pub const ANN_CHECKPOINTS_COPIED: &str = "cdi.kubevirt.io/storage.checkpoint.copied";
pub const ANN_CURRENT_POD_ID: &str = "cdi.kubevirt.io/storage.checkpoint.pod.id";
pub const ANN_MULTI_STAGE_IMPORT_DONE: &str = "cdi.kubevirt.io/storage.checkpoint.done";

// ============================================================================
// Upload, clone and external population
// ============================================================================

pub const ANN_UPLOAD_REQUEST: &str = "cdi.kubevirt.io/storage.upload.target";
pub const ANN_CLONE_REQUEST: &str = "k8s.io/CloneRequest";
pub const ANN_EXTERNAL_POPULATION: &str = "cdi.kubevirt.io/externalPopulation";

// ============================================================================
// Labels
// ============================================================================

pub const LABEL_APP: &str = "app";
pub const LABEL_APP_VALUE: &str = "containerized-data-importer";
pub const LABEL_PROMETHEUS: &str = "prometheus.cdi.kubevirt.io";
pub const LABEL_CLONE_UNIQUE_ID: &str = "cdi.kubevirt.io/storage.clone.cloneUniqeId";
pub const LABEL_FILLING_UP_ALERT: &str = "alerts.k8s.io/KubePersistentVolumeFillingUp";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

pub const LABEL_DEFAULT_INSTANCETYPE: &str = "instancetype.kubevirt.io/default-instancetype";
pub const LABEL_DEFAULT_INSTANCETYPE_KIND: &str =
    "instancetype.kubevirt.io/default-instancetype-kind";
pub const LABEL_DEFAULT_PREFERENCE: &str = "instancetype.kubevirt.io/default-preference";
pub const LABEL_DEFAULT_PREFERENCE_KIND: &str = "instancetype.kubevirt.io/default-preference-kind";

/// Labels copied from a clone source to the DataVolume when absent
pub const DEFAULT_INSTANCETYPE_LABELS: [&str; 4] = [
    LABEL_DEFAULT_INSTANCETYPE,
    LABEL_DEFAULT_INSTANCETYPE_KIND,
    LABEL_DEFAULT_PREFERENCE,
    LABEL_DEFAULT_PREFERENCE_KIND,
];

/// Annotations copied onto the PVC only once the DataVolume has succeeded
pub const DELAYED_ANNOTATIONS: [&str; 1] = [ANN_POPULATED_FOR];

/// Read an annotation value
pub fn annotation<'a, K: ResourceExt>(obj: &'a K, key: &str) -> Option<&'a str> {
    obj.annotations().get(key).map(String::as_str)
}

pub fn has_annotation<K: ResourceExt>(obj: &K, key: &str) -> bool {
    obj.annotations().contains_key(key)
}

/// True when the annotation is present and equals "true"
pub fn annotation_is_true<K: ResourceExt>(obj: &K, key: &str) -> bool {
    annotation(obj, key) == Some("true")
}

pub fn set_annotation<K: ResourceExt>(obj: &mut K, key: &str, value: impl Into<String>) {
    obj.annotations_mut().insert(key.to_string(), value.into());
}

pub fn remove_annotation<K: ResourceExt>(obj: &mut K, key: &str) -> Option<String> {
    obj.annotations_mut().remove(key)
}

/// Checkpoint-specific "copied" marker key
pub fn checkpoint_copied_key(checkpoint: &str) -> String {
    format!("{}.{}", ANN_CHECKPOINTS_COPIED, checkpoint)
}
